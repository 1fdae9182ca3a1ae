//! Matrix expansion.
//!
//! One job definition with a matrix becomes many concrete jobs: the
//! cartesian product of the axes, minus exclusions, plus explicit includes.
//! Axis values are substituted into the runner image, env values and step
//! commands via `${{ matrix.<axis> }}`, and the expanded job names carry
//! the axis values in a stable, lexicographic order.

use std::collections::{BTreeMap, HashMap};

use zephyr_core::interpolation::InterpolationContext;
use zephyr_core::pipeline::{JobDefinition, MatrixSpec, PipelineDefinition};

/// Scheduling hints shared by all jobs expanded from one matrix.
#[derive(Debug, Clone)]
pub struct MatrixGroup {
    pub base_name: String,
    pub job_names: Vec<String>,
    pub fail_fast: bool,
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ExpandedPipeline {
    pub jobs: Vec<JobDefinition>,
    pub groups: Vec<MatrixGroup>,
}

/// Expand every matrix job in the pipeline. Dependencies that point at a
/// matrix job are rewritten to depend on all of its expansions.
pub fn expand_pipeline(definition: &PipelineDefinition) -> ExpandedPipeline {
    let mut jobs = Vec::new();
    let mut groups = Vec::new();
    let mut expansion_names: HashMap<String, Vec<String>> = HashMap::new();

    for job in &definition.jobs {
        match &job.matrix {
            None => {
                expansion_names.insert(job.name.clone(), vec![job.name.clone()]);
                jobs.push(job.clone());
            }
            Some(matrix) => {
                let combinations = combinations(matrix);
                let mut names = Vec::new();
                for combo in &combinations {
                    let expanded = instantiate(job, combo);
                    names.push(expanded.name.clone());
                    jobs.push(expanded);
                }
                groups.push(MatrixGroup {
                    base_name: job.name.clone(),
                    job_names: names.clone(),
                    fail_fast: matrix.fail_fast,
                    max_parallel: matrix.max_parallel,
                });
                expansion_names.insert(job.name.clone(), names);
            }
        }
    }

    for job in &mut jobs {
        job.depends_on = job
            .depends_on
            .iter()
            .flat_map(|dep| {
                expansion_names
                    .get(dep)
                    .cloned()
                    .unwrap_or_else(|| vec![dep.clone()])
            })
            .collect();
    }

    ExpandedPipeline { jobs, groups }
}

/// Cartesian product over the axes, minus exclusions, plus includes.
fn combinations(matrix: &MatrixSpec) -> Vec<BTreeMap<String, serde_json::Value>> {
    // Sorted axis order keeps both expansion order and naming stable.
    let axes: BTreeMap<&String, &Vec<serde_json::Value>> = matrix.values.iter().collect();

    let mut result: Vec<BTreeMap<String, serde_json::Value>> = vec![BTreeMap::new()];
    for (axis, values) in axes {
        let mut next = Vec::with_capacity(result.len() * values.len());
        for combo in &result {
            for value in values {
                let mut combo = combo.clone();
                combo.insert(axis.clone(), value.clone());
                next.push(combo);
            }
        }
        result = next;
    }

    result.retain(|combo| {
        !matrix.exclude.iter().any(|exclude| {
            !exclude.is_empty()
                && exclude
                    .iter()
                    .all(|(key, value)| combo.get(key) == Some(value))
        })
    });

    for include in &matrix.include {
        result.push(include.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    }

    result
}

/// Clone the base job with axis values substituted and the stable name.
fn instantiate(
    base: &JobDefinition,
    combo: &BTreeMap<String, serde_json::Value>,
) -> JobDefinition {
    let mut ctx = InterpolationContext::new();
    for (axis, value) in combo {
        ctx.matrix.insert(axis.clone(), render_value(value));
    }

    let mut job = base.clone();
    job.name = matrix_job_name(&base.name, combo);
    job.runner.image = ctx.interpolate(&job.runner.image);
    if let Some(kernel) = &job.runner.kernel {
        job.runner.kernel = Some(ctx.interpolate(kernel));
    }
    if let Some(rootfs) = &job.runner.rootfs {
        job.runner.rootfs = Some(ctx.interpolate(rootfs));
    }
    for value in job.env.values_mut() {
        *value = ctx.interpolate(value);
    }
    for step in &mut job.steps {
        step.run = ctx.interpolate(&step.run);
        for arg in &mut step.args {
            *arg = ctx.interpolate(arg);
        }
        for value in step.env.values_mut() {
            *value = ctx.interpolate(value);
        }
    }
    // A single concrete job carries no matrix of its own.
    job.matrix = None;
    job
}

/// `base(axis1=v1,axis2=v2)` with axes in lexicographic order.
fn matrix_job_name(base: &str, combo: &BTreeMap<String, serde_json::Value>) -> String {
    if combo.is_empty() {
        return base.to_string();
    }
    let parts: Vec<String> = combo
        .iter()
        .map(|(axis, value)| format!("{axis}={}", render_value(value)))
        .collect();
    format!("{base}({})", parts.join(","))
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zephyr_core::pipeline::{RunnerSpec, StepDefinition};

    fn step(run: &str) -> StepDefinition {
        StepDefinition {
            name: "run".to_string(),
            run: run.to_string(),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            timeout_secs: None,
            continue_on_error: false,
            enabled: true,
        }
    }

    fn matrix_job(name: &str, matrix: MatrixSpec) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            depends_on: vec![],
            runner: RunnerSpec {
                image: "node-${{ matrix.node }}-${{ matrix.os }}".to_string(),
                vcpus: 1,
                memory_mib: 512,
                kernel: None,
                rootfs: None,
            },
            env: HashMap::new(),
            matrix: Some(matrix),
            retry: None,
            enabled: true,
            steps: vec![step("node --version # ${{ matrix.node }}")],
        }
    }

    fn pipeline(jobs: Vec<JobDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            name: "ci".to_string(),
            description: None,
            triggers: vec![],
            env: HashMap::new(),
            jobs,
        }
    }

    #[test]
    fn test_expansion_with_exclude() {
        // 3 nodes x 2 images, minus one exclusion.
        let matrix = MatrixSpec {
            values: HashMap::from([
                (
                    "node".to_string(),
                    vec![18.into(), 20.into(), 22.into()],
                ),
                (
                    "os".to_string(),
                    vec!["u22".into(), "alpine".into()],
                ),
            ]),
            include: vec![],
            exclude: vec![HashMap::from([
                ("node".to_string(), 18.into()),
                ("os".to_string(), "alpine".into()),
            ])],
            max_parallel: None,
            fail_fast: false,
        };

        let expanded = expand_pipeline(&pipeline(vec![matrix_job("test", matrix)]));
        let names: Vec<&str> = expanded.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "test(node=18,os=u22)",
                "test(node=20,os=alpine)",
                "test(node=20,os=u22)",
                "test(node=22,os=alpine)",
                "test(node=22,os=u22)",
            ]
        );
    }

    #[test]
    fn test_cardinality() {
        // |expand| = prod(axes) - excluded + included
        let matrix = MatrixSpec {
            values: HashMap::from([
                ("a".to_string(), vec![1.into(), 2.into()]),
                ("b".to_string(), vec!["x".into(), "y".into()]),
            ]),
            include: vec![HashMap::from([
                ("a".to_string(), 9.into()),
                ("c".to_string(), "extra-axis".into()),
            ])],
            exclude: vec![HashMap::from([
                ("a".to_string(), 1.into()),
                ("b".to_string(), "y".into()),
            ])],
            max_parallel: Some(2),
            fail_fast: true,
        };

        let expanded = expand_pipeline(&pipeline(vec![matrix_job("m", matrix)]));
        assert_eq!(expanded.jobs.len(), 2 * 2 - 1 + 1);

        let group = &expanded.groups[0];
        assert_eq!(group.base_name, "m");
        assert_eq!(group.job_names.len(), 4);
        assert!(group.fail_fast);
        assert_eq!(group.max_parallel, Some(2));

        // The include row introduced an axis absent from `values`.
        assert!(expanded
            .jobs
            .iter()
            .any(|j| j.name == "m(a=9,c=extra-axis)"));
    }

    #[test]
    fn test_substitution() {
        let matrix = MatrixSpec {
            values: HashMap::from([(
                "node".to_string(),
                vec![20.into()],
            ), (
                "os".to_string(),
                vec!["alpine".into()],
            )]),
            include: vec![],
            exclude: vec![],
            max_parallel: None,
            fail_fast: false,
        };

        let expanded = expand_pipeline(&pipeline(vec![matrix_job("test", matrix)]));
        let job = &expanded.jobs[0];
        assert_eq!(job.runner.image, "node-20-alpine");
        assert_eq!(job.steps[0].run, "node --version # 20");
        assert!(job.matrix.is_none());
    }

    #[test]
    fn test_dependency_fanout_to_expansions() {
        let matrix = MatrixSpec {
            values: HashMap::from([(
                "os".to_string(),
                vec!["a".into(), "b".into()],
            )]),
            include: vec![],
            exclude: vec![],
            max_parallel: None,
            fail_fast: false,
        };

        let mut dependent = matrix_job("deploy", matrix.clone());
        dependent.matrix = None;
        dependent.depends_on = vec!["build".to_string()];

        let expanded = expand_pipeline(&pipeline(vec![matrix_job("build", matrix), dependent]));
        let deploy = expanded.jobs.iter().find(|j| j.name == "deploy").unwrap();
        assert_eq!(
            deploy.depends_on,
            vec!["build(os=a)".to_string(), "build(os=b)".to_string()]
        );
    }
}
