//! Trigger matching.
//!
//! A pure predicate from (event, rules) to bool. Glob patterns match the
//! entire string: `*` becomes `.*`, `?` becomes `.`, every other character
//! is literal. Ignore lists always win over their positive counterparts.

use regex::Regex;
use zephyr_core::pipeline::{TriggerRule, TriggerType};

#[derive(Debug, Clone)]
pub enum TriggerEvent {
    Push {
        branch: String,
        changed_paths: Vec<String>,
    },
    PullRequest {
        action: String,
        target_branch: String,
        changed_paths: Vec<String>,
    },
    Tag {
        name: String,
    },
    Schedule {
        cron: String,
    },
    Manual,
}

impl TriggerEvent {
    fn kind(&self) -> TriggerType {
        match self {
            TriggerEvent::Push { .. } => TriggerType::Push,
            TriggerEvent::PullRequest { .. } => TriggerType::PullRequest,
            TriggerEvent::Tag { .. } => TriggerType::Tag,
            TriggerEvent::Schedule { .. } => TriggerType::Schedule,
            TriggerEvent::Manual => TriggerType::Manual,
        }
    }
}

/// True if any rule matches the event.
pub fn event_matches(event: &TriggerEvent, rules: &[TriggerRule]) -> bool {
    rules.iter().any(|rule| rule_matches(rule, event))
}

fn rule_matches(rule: &TriggerRule, event: &TriggerEvent) -> bool {
    if rule.trigger_type != event.kind() {
        return false;
    }

    match event {
        TriggerEvent::Push {
            branch,
            changed_paths,
        } => {
            branch_matches(rule, branch) && paths_match(&rule.paths, &rule.paths_ignore, changed_paths)
        }
        TriggerEvent::PullRequest {
            action,
            target_branch,
            changed_paths,
        } => {
            rule.effective_pr_events().contains(&action.as_str())
                && branch_matches(rule, target_branch)
                && paths_match(&rule.paths, &rule.paths_ignore, changed_paths)
        }
        TriggerEvent::Tag { name } => {
            rule.tags.is_empty() || rule.tags.iter().any(|p| glob_match(p, name))
        }
        TriggerEvent::Schedule { cron } => match &rule.schedule {
            Some(expr) => expr == cron,
            None => true,
        },
        TriggerEvent::Manual => true,
    }
}

/// `branches_ignore` strictly dominates `branches`.
fn branch_matches(rule: &TriggerRule, branch: &str) -> bool {
    let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);

    if rule
        .branches_ignore
        .iter()
        .any(|p| glob_match(p, branch))
    {
        return false;
    }
    rule.branches.is_empty() || rule.branches.iter().any(|p| glob_match(p, branch))
}

/// A rule's path filter passes when at least one changed file is selected
/// by `paths` (or `paths` is empty) and not rejected by `paths_ignore`.
fn paths_match(paths: &[String], paths_ignore: &[String], changed: &[String]) -> bool {
    if paths.is_empty() && paths_ignore.is_empty() {
        return true;
    }

    changed.iter().any(|file| {
        let ignored = paths_ignore.iter().any(|p| glob_match(p, file));
        let included = paths.is_empty() || paths.iter().any(|p| glob_match(p, file));
        included && !ignored
    })
}

/// Anchored glob: `*` -> `.*`, `?` -> `.`, everything else literal.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');

    // The pattern alphabet above can only produce valid regexes.
    Regex::new(&regex).map(|re| re.is_match(text)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(trigger_type: TriggerType) -> TriggerRule {
        TriggerRule {
            trigger_type,
            branches: vec![],
            branches_ignore: vec![],
            paths: vec![],
            paths_ignore: vec![],
            tags: vec![],
            pr_events: vec![],
            schedule: None,
        }
    }

    #[test]
    fn test_glob_star_crosses_slashes() {
        assert!(glob_match("src/*", "src/a/b/c.ts"));
        assert!(glob_match("*.md", "docs/notes/README.md"));
        assert!(glob_match("release/*", "release/v1/hotfix"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_match("v?", "v1"));
        assert!(!glob_match("v?", "v12"));
    }

    #[test]
    fn test_glob_metacharacters_are_literal() {
        assert!(glob_match("a.b", "a.b"));
        assert!(!glob_match("a.b", "aXb"));
        assert!(glob_match("fix(scope)", "fix(scope)"));
    }

    #[test]
    fn test_push_branch_and_paths() {
        let mut r = rule(TriggerType::Push);
        r.branches = vec!["main".to_string(), "develop".to_string()];
        r.paths = vec!["src/*".to_string()];
        r.paths_ignore = vec!["*.md".to_string()];

        let push = TriggerEvent::Push {
            branch: "refs/heads/main".to_string(),
            changed_paths: vec!["src/x.ts".to_string()],
        };
        assert!(event_matches(&push, &[r.clone()]));

        let docs_only = TriggerEvent::Push {
            branch: "refs/heads/main".to_string(),
            changed_paths: vec!["docs/README.md".to_string()],
        };
        assert!(!event_matches(&docs_only, &[r]));
    }

    #[test]
    fn test_branches_ignore_dominates() {
        let mut r = rule(TriggerType::Push);
        r.branches = vec!["*".to_string()];
        r.branches_ignore = vec!["wip/*".to_string()];

        let wip = TriggerEvent::Push {
            branch: "wip/spike".to_string(),
            changed_paths: vec![],
        };
        assert!(!event_matches(&wip, &[r.clone()]));

        let main = TriggerEvent::Push {
            branch: "main".to_string(),
            changed_paths: vec![],
        };
        assert!(event_matches(&main, &[r]));
    }

    #[test]
    fn test_paths_ignore_dominates() {
        let mut r = rule(TriggerType::Push);
        r.paths = vec!["*".to_string()];
        r.paths_ignore = vec!["*.md".to_string()];

        let md_only = TriggerEvent::Push {
            branch: "main".to_string(),
            changed_paths: vec!["CHANGELOG.md".to_string()],
        };
        assert!(!event_matches(&md_only, &[r.clone()]));

        let mixed = TriggerEvent::Push {
            branch: "main".to_string(),
            changed_paths: vec!["CHANGELOG.md".to_string(), "src/lib.rs".to_string()],
        };
        assert!(event_matches(&mixed, &[r]));
    }

    #[test]
    fn test_pr_default_actions() {
        let r = rule(TriggerType::PullRequest);

        let opened = TriggerEvent::PullRequest {
            action: "opened".to_string(),
            target_branch: "main".to_string(),
            changed_paths: vec![],
        };
        assert!(event_matches(&opened, &[r.clone()]));

        let labeled = TriggerEvent::PullRequest {
            action: "labeled".to_string(),
            target_branch: "main".to_string(),
            changed_paths: vec![],
        };
        assert!(!event_matches(&labeled, &[r]));
    }

    #[test]
    fn test_type_mismatch_never_matches() {
        let r = rule(TriggerType::Push);
        assert!(!event_matches(
            &TriggerEvent::Tag {
                name: "v1.0".to_string()
            },
            &[r]
        ));
    }

    #[test]
    fn test_tag_patterns() {
        let mut r = rule(TriggerType::Tag);
        r.tags = vec!["v*".to_string()];
        assert!(event_matches(
            &TriggerEvent::Tag {
                name: "v2.1.0".to_string()
            },
            &[r.clone()]
        ));
        assert!(!event_matches(
            &TriggerEvent::Tag {
                name: "nightly".to_string()
            },
            &[r]
        ));
    }
}
