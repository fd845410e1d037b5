//! Read-only evaluation of qrexec policy files.
//!
//! Two formats are understood, matching what ships on disk:
//!
//! * `*.policy` files in a `policy.d` directory, scanned in lexical
//!   order, each line `<service> <argument> <source> <dest> <action>`
//! * legacy per-service files named after the method, each line
//!   `<source> <dest> <action> [params]`
//!
//! The first matching line decides. No match means deny; `ask` without
//! an interactive agent also denies. dom0 bypasses policy entirely.

use qubesd_common::{QubesError, QubesResult};
use qubesd_model::QubesStore;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Allow,
    Deny,
    Ask,
}

impl PolicyAction {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "ask" => Some(Self::Ask),
            _ => None,
        }
    }
}

/// One parsed policy line.
#[derive(Debug, Clone)]
struct PolicyLine {
    source: String,
    dest: String,
    action: PolicyAction,
}

fn token_matches(store: &QubesStore, token: &str, name: &str) -> bool {
    match token {
        "*" | "@anyvm" | "$anyvm" => name != "dom0",
        "@adminvm" | "$adminvm" | "dom0" => name == "dom0",
        _ => {
            if let Some(tag) = token
                .strip_prefix("@tag:")
                .or_else(|| token.strip_prefix("$tag:"))
            {
                store
                    .domain(name)
                    .map(|d| d.tags.contains(tag))
                    .unwrap_or(false)
            } else {
                token == name
            }
        }
    }
}

fn sorted_files(dir: &Path, extension: Option<&str>) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| match extension {
                    Some(ext) => p.extension().map(|e| e == ext).unwrap_or(false),
                    None => p.is_file(),
                })
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn parse_policy_d_line(line: &str, method: &str, argument: &str) -> Option<PolicyLine> {
    let mut parts = line.split_whitespace();
    let service = parts.next()?;
    let arg = parts.next()?;
    let source = parts.next()?;
    let dest = parts.next()?;
    let action = PolicyAction::parse(parts.next()?)?;

    if service != "*" && service != method {
        return None;
    }
    if arg != "*" && arg != "+" && arg.trim_start_matches('+') != argument {
        return None;
    }
    Some(PolicyLine {
        source: source.to_string(),
        dest: dest.to_string(),
        action,
    })
}

fn parse_legacy_line(line: &str) -> Option<PolicyLine> {
    let mut parts = line.split_whitespace();
    let source = parts.next()?;
    let dest = parts.next()?;
    let action = PolicyAction::parse(parts.next()?)?;
    Some(PolicyLine {
        source: source.to_string(),
        dest: dest.to_string(),
        action,
    })
}

fn decide(
    store: &QubesStore,
    lines: impl Iterator<Item = PolicyLine>,
    source: &str,
    dest: &str,
) -> Option<PolicyAction> {
    for line in lines {
        if token_matches(store, &line.source, source) && token_matches(store, &line.dest, dest) {
            return Some(line.action);
        }
    }
    None
}

/// Check whether `source` may invoke `method` (with `argument`) against
/// `dest`.
pub fn check(
    store: &QubesStore,
    policy_dirs: &[PathBuf],
    method: &str,
    argument: &str,
    source: &str,
    dest: &str,
) -> QubesResult<()> {
    if source == "dom0" {
        return Ok(());
    }

    let mut decision = None;
    for dir in policy_dirs {
        if dir.ends_with("policy.d") {
            for file in sorted_files(dir, Some("policy")) {
                let content = std::fs::read_to_string(&file).unwrap_or_default();
                let lines = content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .filter_map(|l| parse_policy_d_line(l, method, argument));
                decision = decide(store, lines, source, dest);
                if decision.is_some() {
                    break;
                }
            }
        } else {
            for candidate in [format!("{}+{}", method, argument), method.to_string()] {
                let file = dir.join(&candidate);
                if !file.is_file() {
                    continue;
                }
                let content = std::fs::read_to_string(&file).unwrap_or_default();
                let lines = content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .filter_map(parse_legacy_line);
                decision = decide(store, lines, source, dest);
                if decision.is_some() {
                    break;
                }
            }
        }
        if decision.is_some() {
            break;
        }
    }

    match decision {
        Some(PolicyAction::Allow) => Ok(()),
        Some(PolicyAction::Ask) => Err(QubesError::not_allowed(format!(
            "{} from {} to {} requires confirmation and no agent is available",
            method, source, dest
        ))),
        Some(PolicyAction::Deny) | None => Err(QubesError::not_allowed(format!(
            "{} from {} to {} denied by policy",
            method, source, dest
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qubesd_model::{Domain, PropertyValue, VmClass};

    fn store() -> QubesStore {
        let mut store = QubesStore::new();
        for (qid, name) in [(1u16, "work"), (2, "vault")] {
            let mut d = Domain::new(qid, name, VmClass::AppVM).unwrap();
            d.properties
                .set("label", PropertyValue::LabelRef("red".to_string()));
            store.add_domain(d).unwrap();
        }
        store.tag_add("work", "managed").unwrap();
        store
    }

    #[test]
    fn dom0_bypasses_policy() {
        let store = store();
        assert!(check(&store, &[], "admin.vm.List", "", "dom0", "dom0").is_ok());
    }

    #[test]
    fn unmatched_is_denied() {
        let store = store();
        let err = check(&store, &[], "admin.vm.List", "", "work", "dom0").unwrap_err();
        assert!(matches!(err, QubesError::NotAllowed { .. }));
    }

    #[test]
    fn policy_d_first_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        let policy_d = dir.path().join("policy.d");
        std::fs::create_dir_all(&policy_d).unwrap();
        std::fs::write(
            policy_d.join("30-admin.policy"),
            "# admin api\n\
             admin.vm.List * @tag:managed dom0 allow\n\
             admin.vm.List * @anyvm dom0 deny\n",
        )
        .unwrap();

        let store = store();
        let dirs = vec![policy_d];
        assert!(check(&store, &dirs, "admin.vm.List", "", "work", "dom0").is_ok());
        assert!(check(&store, &dirs, "admin.vm.List", "", "vault", "dom0").is_err());
    }

    #[test]
    fn legacy_per_service_file() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("policy");
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(legacy.join("admin.vm.property.Get"), "work dom0 allow\n").unwrap();

        let store = store();
        let dirs = vec![legacy];
        assert!(check(&store, &dirs, "admin.vm.property.Get", "netvm", "work", "dom0").is_ok());
        assert!(check(&store, &dirs, "admin.vm.property.Set", "netvm", "work", "dom0").is_err());
    }

    #[test]
    fn ask_without_agent_denies() {
        let dir = tempfile::tempdir().unwrap();
        let policy_d = dir.path().join("policy.d");
        std::fs::create_dir_all(&policy_d).unwrap();
        std::fs::write(policy_d.join("10.policy"), "admin.vm.List * @anyvm dom0 ask\n").unwrap();

        let store = store();
        assert!(check(&store, &[policy_d], "admin.vm.List", "", "work", "dom0").is_err());
    }
}
