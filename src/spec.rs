//! Loading and validation of declarative stack specifications.
//!
//! Specs are YAML documents with the shape of [`StackSpec`]. Parsing rejects
//! unknown fields; semantic validation collects every problem before
//! reporting, so a user fixes one round of errors instead of five.

use std::collections::HashSet;

use thiserror::Error;

use crate::types::{ImageRef, StackSpec};

/// One problem found in a stack spec, naming the offending field.
#[derive(Debug, Clone)]
pub struct SpecIssue {
    pub field: String,
    pub message: String,
}

impl SpecIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum SpecError {
    /// The document is not parseable; the message carries the YAML location.
    #[error("failed to parse stack spec: {0}")]
    Parse(String),
    /// The document parsed but failed semantic validation.
    #[error("{}", format_issues(.0))]
    Invalid(Vec<SpecIssue>),
}

fn format_issues(issues: &[SpecIssue]) -> String {
    let lines: Vec<String> = issues.iter().map(|i| format!("  - {}", i)).collect();
    format!("stack spec has {} problem(s):\n{}", issues.len(), lines.join("\n"))
}

/// Parse and validate a stack spec from raw bytes.
pub fn load_stack_spec(bytes: &[u8]) -> Result<StackSpec, SpecError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| SpecError::Parse(format!("spec is not valid UTF-8: {}", e)))?;
    parse_stack_spec(text)
}

/// Parse and validate a stack spec from a YAML string.
pub fn parse_stack_spec(text: &str) -> Result<StackSpec, SpecError> {
    let spec: StackSpec = serde_yaml::from_str(text).map_err(|e| {
        let location = e
            .location()
            .map(|l| format!(" (line {}, column {})", l.line(), l.column()))
            .unwrap_or_default();
        SpecError::Parse(format!("{}{}", e, location))
    })?;
    validate_stack_spec(&spec)?;
    Ok(spec)
}

/// Serialize a spec back to YAML. Round-trips for all legal specs.
pub fn to_yaml(spec: &StackSpec) -> anyhow::Result<String> {
    Ok(serde_yaml::to_string(spec)?)
}

/// Run every semantic validation and report all failures together.
pub fn validate_stack_spec(spec: &StackSpec) -> Result<(), SpecError> {
    let mut issues = Vec::new();

    if spec.name.trim().is_empty() {
        issues.push(SpecIssue::new("name", "must be non-empty"));
    }
    if !is_semver(&spec.version) {
        issues.push(SpecIssue::new(
            "version",
            format!("{:?} is not of the form major.minor.patch", spec.version),
        ));
    }
    if spec.agents.is_empty() {
        issues.push(SpecIssue::new("agents", "stack declares no agents"));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for (index, agent) in spec.agents.iter().enumerate() {
        let field = |suffix: &str| format!("agents[{}].{}", index, suffix);

        if agent.id.trim().is_empty() {
            issues.push(SpecIssue::new(field("id"), "must be non-empty"));
        } else if !seen.insert(agent.id.as_str()) {
            issues.push(SpecIssue::new(
                field("id"),
                format!("duplicate id {:?}", agent.id),
            ));
        }

        if let Err(e) = ImageRef::parse(&agent.uses) {
            issues.push(SpecIssue::new(field("uses"), e.to_string()));
        }
    }

    // Reference checks run against the full id set, so forward references
    // are legal and only genuinely unknown ids are reported.
    let ids: HashSet<&str> = spec.agents.iter().map(|a| a.id.as_str()).collect();
    for (index, agent) in spec.agents.iter().enumerate() {
        for (list, name) in [(&agent.input_from, "inputFrom"), (&agent.depends, "depends")] {
            let field = format!("agents[{}].{}", index, name);
            for reference in list.iter() {
                if reference == &agent.id {
                    issues.push(SpecIssue::new(
                        field.clone(),
                        format!("agent {:?} references itself", agent.id),
                    ));
                } else if !ids.contains(reference.as_str()) {
                    issues.push(SpecIssue::new(
                        field.clone(),
                        format!("unknown agent id {:?}", reference),
                    ));
                }
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(SpecError::Invalid(issues))
    }
}

fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
