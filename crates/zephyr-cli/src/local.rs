//! Local pipeline execution for `zephyr run`.
//!
//! Runs the job DAG on the host with plain processes instead of microVMs:
//! quick feedback while editing a pipeline, no isolation guarantees. Steps
//! run sequentially; jobs run in DAG order.

use std::collections::HashMap;
use std::process::Stdio;

use console::style;
use tokio::process::Command;
use zephyr_core::pipeline::{JobDefinition, PipelineDefinition, StepDefinition};
use zephyr_core::run::Status;
use zephyr_core::{Error, Result};
use zephyr_scheduler::{expand_pipeline, JobDag};

pub struct LocalRunSummary {
    pub jobs: Vec<(String, Status)>,
}

impl LocalRunSummary {
    pub fn failed(&self) -> bool {
        self.jobs.iter().any(|(_, s)| *s == Status::Failure)
    }
}

pub async fn run_pipeline(definition: &PipelineDefinition) -> Result<LocalRunSummary> {
    let expanded = expand_pipeline(definition);
    let mut dag = JobDag::build(expanded.jobs.iter().map(|job| {
        (
            job.name.as_str(),
            job.depends_on.iter().map(String::as_str).collect(),
        )
    }))
    .map_err(|e| Error::InvalidPipeline(e.to_string()))?;

    let specs: HashMap<&str, &JobDefinition> = expanded
        .jobs
        .iter()
        .map(|job| (job.name.as_str(), job))
        .collect();

    let mut results = Vec::new();
    while !dag.is_complete() {
        let ready = dag.ready();
        if ready.is_empty() {
            break;
        }
        for name in ready {
            let spec = specs[name.as_str()];
            dag.mark_running(&name);

            let status = if spec.enabled {
                run_job(definition, spec).await
            } else {
                Status::Skipped
            };

            println!("{} {}", status_tag(status), name);
            let effect = dag.mark_completed(&name, status != Status::Failure);
            for skipped in &effect.skipped {
                println!("{} {}", status_tag(Status::Skipped), skipped);
                results.push((skipped.clone(), Status::Skipped));
            }
            results.push((name, status));
        }
    }

    Ok(LocalRunSummary { jobs: results })
}

async fn run_job(definition: &PipelineDefinition, spec: &JobDefinition) -> Status {
    let mut env = definition.env.clone();
    env.extend(spec.env.clone());

    let mut failed = false;
    for step in &spec.steps {
        if !step.enabled {
            continue;
        }
        if failed && !step.continue_on_error {
            continue;
        }

        let exit_code = run_step(step, &env).await;
        if exit_code != 0 {
            eprintln!(
                "  {} step '{}' exited {}",
                style("✗").red(),
                step.name,
                exit_code
            );
            if !step.continue_on_error {
                failed = true;
            }
        }
    }

    if failed {
        Status::Failure
    } else {
        Status::Success
    }
}

async fn run_step(step: &StepDefinition, env: &HashMap<String, String>) -> i32 {
    let mut step_env = env.clone();
    step_env.extend(step.env.clone());

    let mut cmd = if step.args.is_empty() {
        let mut sh = Command::new("sh");
        sh.arg("-c").arg(&step.run);
        sh
    } else {
        let mut direct = Command::new(&step.run);
        direct.args(&step.args);
        direct
    };
    cmd.envs(&step_env)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(cwd) = &step.cwd {
        cmd.current_dir(cwd);
    }

    let run = async {
        match cmd.status().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        }
    };

    match step.timeout_secs {
        Some(secs) => {
            match tokio::time::timeout(std::time::Duration::from_secs(secs), run).await {
                Ok(code) => code,
                Err(_) => 124,
            }
        }
        None => run.await,
    }
}

fn status_tag(status: Status) -> String {
    match status {
        Status::Success => style("✓").green().to_string(),
        Status::Failure => style("✗").red().to_string(),
        Status::Skipped => style("-").dim().to_string(),
        other => style(other.as_str()).dim().to_string(),
    }
}
