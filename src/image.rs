//! Local agent image store.
//!
//! Images are agent definitions stored as YAML under a content directory,
//! one file per `name:tag` at `<root>/<name>_<tag>.yaml`. Resolution is
//! pure: no network, no side effects. The engine only reads; registration
//! tooling writes through [`ImageStore::save`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AgentDefinition, ImageRef};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image not found: {0}")]
    NotFound(ImageRefDisplay),
    #[error("malformed image {reference}: {message}")]
    Malformed {
        reference: ImageRefDisplay,
        message: String,
    },
    #[error("image store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owned `name:tag` string for error payloads.
#[derive(Debug, Clone)]
pub struct ImageRefDisplay(pub String);

impl std::fmt::Display for ImageRefDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&ImageRef> for ImageRefDisplay {
    fn from(reference: &ImageRef) -> Self {
        Self(reference.to_string())
    }
}

/// Summary row returned by [`ImageStore::list`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub name: String,
    pub tag: String,
    pub description: String,
    pub base_model: String,
    pub size_bytes: u64,
}

pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        std::fs::create_dir_all(&root).unwrap_or_default();
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn image_path(&self, reference: &ImageRef) -> PathBuf {
        self.root
            .join(format!("{}_{}.yaml", reference.name, reference.tag))
    }

    pub async fn resolve(&self, reference: &ImageRef) -> Result<AgentDefinition, ImageError> {
        let path = self.image_path(reference);
        if !tokio::fs::try_exists(&path).await? {
            return Err(ImageError::NotFound(reference.into()));
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        let definition: AgentDefinition =
            serde_yaml::from_str(&contents).map_err(|e| ImageError::Malformed {
                reference: reference.into(),
                message: e.to_string(),
            })?;
        Ok(definition)
    }

    pub async fn list(&self) -> anyhow::Result<Vec<ImageInfo>> {
        let mut images = Vec::new();
        let mut listing = tokio::fs::read_dir(&self.root).await?;
        while let Some(file) = listing.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // `<name>_<tag>`; ImageRef::parse rejects '_' in tags, so the
            // rightmost underscore is always the separator. Names may
            // contain underscores freely.
            let Some((name, tag)) = stem.rsplit_once('_') else {
                continue;
            };

            let contents = tokio::fs::read_to_string(&path).await?;
            let definition: AgentDefinition = match serde_yaml::from_str(&contents) {
                Ok(definition) => definition,
                Err(e) => {
                    tracing::warn!("skipping malformed image file {:?}: {}", path, e);
                    continue;
                }
            };
            images.push(ImageInfo {
                name: name.to_string(),
                tag: tag.to_string(),
                description: definition.description,
                base_model: definition.base_model,
                size_bytes: file.metadata().await?.len(),
            });
        }
        images.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tag.cmp(&b.tag)));
        Ok(images)
    }

    /// Write a definition under `reference`, replacing any existing image.
    /// The write is atomic (temp file + rename).
    pub async fn save(
        &self,
        definition: &AgentDefinition,
        reference: &ImageRef,
    ) -> anyhow::Result<()> {
        let serialized = serde_yaml::to_string(definition)?;
        let path = self.image_path(reference);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serialized.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!("saved image {} to {:?}", reference, path);
        Ok(())
    }

    pub async fn delete(&self, reference: &ImageRef) -> Result<(), ImageError> {
        let path = self.image_path(reference);
        if !tokio::fs::try_exists(&path).await? {
            return Err(ImageError::NotFound(reference.into()));
        }
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }
}
