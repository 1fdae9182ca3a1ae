//! Pipeline definition types.
//!
//! These types represent a resolved pipeline: what the configuration
//! collaborator hands to the scheduler after parsing the user's YAML and
//! evaluating all condition expressions down to booleans. The core never
//! evaluates user-supplied expressions itself.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "on")]
    pub triggers: Vec<TriggerRule>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub jobs: Vec<JobDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_runner")]
    pub runner: RunnerSpec,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub matrix: Option<MatrixSpec>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    /// Pre-resolved job condition. `false` means the job is skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    pub run: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Pre-resolved step condition. `false` means the step is skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// MicroVM sizing and image selection for a job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunnerSpec {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default = "default_memory")]
    pub memory_mib: u32,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default)]
    pub rootfs: Option<String>,
}

fn default_runner() -> RunnerSpec {
    RunnerSpec {
        image: default_image(),
        vcpus: default_vcpus(),
        memory_mib: default_memory(),
        kernel: None,
        rootfs: None,
    }
}

fn default_image() -> String {
    "ubuntu-22.04".to_string()
}

fn default_vcpus() -> u32 {
    2
}

fn default_memory() -> u32 {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixSpec {
    /// Axis name to list of values.
    pub values: HashMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub include: Vec<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetrySpec {
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_secs: u64,
    /// Retry only these exit codes; empty means any non-zero exit.
    #[serde(default)]
    pub on_exit_codes: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerRule {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branches_ignore: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub paths_ignore: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pr_events: Vec<String>,
    #[serde(default)]
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    PullRequest,
    Tag,
    Schedule,
    Manual,
}

impl TriggerRule {
    /// PR actions that trigger a rule when `pr_events` is left empty.
    pub fn effective_pr_events(&self) -> Vec<&str> {
        if self.pr_events.is_empty() {
            vec!["opened", "synchronize", "reopened"]
        } else {
            self.pr_events.iter().map(String::as_str).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_defaults() {
        let yaml_equiv = serde_json::json!({
            "name": "build",
            "steps": [{"name": "compile", "run": "make"}]
        });
        let job: JobDefinition = serde_json::from_value(yaml_equiv).unwrap();
        assert!(job.enabled);
        assert_eq!(job.runner.vcpus, 2);
        assert_eq!(job.runner.memory_mib, 1024);
        assert!(job.steps[0].enabled);
        assert!(!job.steps[0].continue_on_error);
    }

    #[test]
    fn test_default_pr_events() {
        let rule = TriggerRule {
            trigger_type: TriggerType::PullRequest,
            branches: vec![],
            branches_ignore: vec![],
            paths: vec![],
            paths_ignore: vec![],
            tags: vec![],
            pr_events: vec![],
            schedule: None,
        };
        assert_eq!(
            rule.effective_pr_events(),
            vec!["opened", "synchronize", "reopened"]
        );
    }
}
