//! Pipeline file loading.
//!
//! The YAML pipeline file is the configuration collaborator: by the time a
//! definition leaves this module, job and step conditions are plain
//! booleans (`enabled`) and the scheduler never evaluates expressions.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use zephyr_core::pipeline::PipelineDefinition;
use zephyr_core::run::Project;
use zephyr_core::{Error, Result};
use zephyr_scheduler::PipelineSource;

pub const DEFAULT_PIPELINE_FILE: &str = "zephyr.yaml";

pub fn load_pipeline(path: &Path) -> Result<PipelineDefinition> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::PipelineNotFound(format!("{}: {e}", path.display())))?;
    parse_pipeline(&raw)
}

pub fn parse_pipeline(raw: &str) -> Result<PipelineDefinition> {
    serde_yaml::from_str(raw).map_err(|e| Error::InvalidPipeline(e.to_string()))
}

/// Resolves pipeline definitions from each project's `config_path`,
/// relative to a projects root.
pub struct YamlPipelineSource {
    root: PathBuf,
}

impl YamlPipelineSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PipelineSource for YamlPipelineSource {
    async fn resolve(&self, project: &Project, _pipeline_name: &str) -> Result<PipelineDefinition> {
        let path = self.root.join(&project.config_path);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::PipelineNotFound(format!("{}: {e}", path.display())))?;
        parse_pipeline(&raw)
    }
}

pub const PIPELINE_TEMPLATE: &str = r#"name: default

on:
  - type: push
    branches: [main]
  - type: pull_request

env:
  CI: "true"

jobs:
  - name: build
    runner:
      image: ubuntu-22.04
      vcpus: 2
      memory_mib: 1024
    steps:
      - name: compile
        run: make build

  - name: test
    depends_on: [build]
    matrix:
      values:
        suite: [unit, integration]
    steps:
      - name: run tests
        run: make test-${{ matrix.suite }}
        timeout_secs: 1800
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses() {
        let definition = parse_pipeline(PIPELINE_TEMPLATE).unwrap();
        assert_eq!(definition.name, "default");
        assert_eq!(definition.jobs.len(), 2);
        assert_eq!(definition.triggers.len(), 2);
        assert!(definition.jobs[1].matrix.is_some());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = parse_pipeline("jobs: [").unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline(_)));
    }
}
