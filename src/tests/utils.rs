use std::sync::Arc;

use tokio::sync::broadcast;

use crate::engine::RunEvent;
use crate::image::ImageStore;
use crate::memory::LocalMemoryStore;
use crate::shim::MockShim;
use crate::state::{InMemoryStateStore, StateStore};
use crate::types::{AgentDefinition, AgentSpec, ImageRef, StackSpec};
use crate::StackEngine;

pub fn test_definition(name: &str, model: &str) -> AgentDefinition {
    AgentDefinition {
        name: name.to_string(),
        description: format!("{} test agent", name),
        base_model: model.to_string(),
        prompt_template: "{input}".to_string(),
        ..Default::default()
    }
}

/// Seed one image per mock behavior, tagged `latest`.
pub async fn seed_behavior_images(images: &ImageStore) {
    for behavior in ["upper", "reverse", "echo", "fail"] {
        let definition = test_definition(behavior, &format!("mock/{}", behavior));
        images
            .save(&definition, &ImageRef::parse(behavior).unwrap())
            .await
            .unwrap();
    }
}

pub struct TestHarness {
    pub engine: StackEngine,
    pub shim: MockShim,
    _dir: tempfile::TempDir,
}

pub async fn harness() -> TestHarness {
    harness_with(MockShim::new()).await
}

pub async fn harness_with(shim: MockShim) -> TestHarness {
    harness_with_state(shim, Arc::new(InMemoryStateStore::new())).await
}

pub async fn harness_with_state(shim: MockShim, state: Arc<dyn StateStore>) -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let images = Arc::new(ImageStore::new(dir.path().join("images")));
    seed_behavior_images(&images).await;

    let engine = StackEngine::builder()
        .with_image_store(images)
        .with_state_store(state)
        .with_memory_store(Arc::new(LocalMemoryStore::new()))
        .with_shim(Arc::new(shim.clone()))
        .build()
        .unwrap();
    TestHarness {
        engine,
        shim,
        _dir: dir,
    }
}

pub fn agent(id: &str, uses: &str, input_from: &[&str]) -> AgentSpec {
    AgentSpec {
        id: id.to_string(),
        uses: uses.to_string(),
        input_from: input_from.iter().map(|s| s.to_string()).collect(),
        input_key: None,
        output_key: None,
        params: Default::default(),
        depends: Vec::new(),
    }
}

pub fn stack(name: &str, agents: Vec<AgentSpec>) -> StackSpec {
    StackSpec {
        name: name.to_string(),
        description: String::new(),
        version: "0.1.0".to_string(),
        agents,
    }
}

/// Drain everything the run published so far without blocking.
pub fn drain_events(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
