//! Argument vector construction for `ansible-playbook`.
//!
//! [`build_command`] is a pure function of its inputs: no filesystem
//! access, no environment lookups.

use std::path::PathBuf;

use crate::target::RunOptions;

/// Default automation binary.
pub const DEFAULT_PLAYBOOK_BIN: &str = "ansible-playbook";

/// Resolved on-disk locations for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookPaths {
    pub playbook: PathBuf,
    pub inventory: Option<PathBuf>,
}

/// Build the full argv (program first) for a playbook run.
pub fn build_command(binary: &str, paths: &PlaybookPaths, options: &RunOptions) -> Vec<String> {
    let mut argv = vec![
        binary.to_string(),
        paths.playbook.display().to_string(),
    ];

    if let Some(inventory) = &paths.inventory {
        argv.push("-i".to_string());
        argv.push(inventory.display().to_string());
    }

    if let Some(limit) = options.limit.as_deref().filter(|l| !l.is_empty()) {
        argv.push("--limit".to_string());
        argv.push(limit.to_string());
    }

    push_list(&mut argv, "--tags", &options.tags);
    push_list(&mut argv, "--skip-tags", &options.skip_tags);

    if let Some(vars) = options.extra_vars.as_ref().filter(|v| !v.is_empty()) {
        argv.push("--extra-vars".to_string());
        argv.push(serde_json::Value::Object(vars.clone()).to_string());
    }

    if let Some(forks) = options.forks {
        argv.push("--forks".to_string());
        argv.push(forks.to_string());
    }

    if let Some(timeout) = options.timeout {
        argv.push("--timeout".to_string());
        argv.push(timeout.to_string());
    }

    if options.check {
        argv.push("--check".to_string());
    }
    if options.diff {
        argv.push("--diff".to_string());
    }

    match options.verbosity.unwrap_or(0).min(4) {
        0 => {}
        n => argv.push(format!("-{}", "v".repeat(n as usize))),
    }

    if options.privilege_escalation {
        argv.push("--become".to_string());
    }
    if let Some(user) = options.become_user.as_deref().filter(|u| !u.is_empty()) {
        argv.push("--become-user".to_string());
        argv.push(user.to_string());
    }

    argv
}

fn push_list(argv: &mut Vec<String>, flag: &str, values: &[String]) {
    let joined = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join(",");
    if !joined.is_empty() {
        argv.push(flag.to_string());
        argv.push(joined);
    }
}
