//! Target descriptor: what a job runs and against which hosts.
//!
//! Stored verbatim in [`Job::target_descriptor`](crate::job::Job) and
//! validated by the orchestrator before anything is materialized.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::error::CoreError;

/// Structured options for a playbook run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct RunOptions {
    /// Host pattern passed to `--limit`.
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub skip_tags: Vec<String>,
    #[serde(default)]
    pub extra_vars: Option<Map<String, Value>>,
    /// Parallel host connections.
    #[serde(default)]
    #[validate(range(min = 1, max = 500))]
    pub forks: Option<u32>,
    /// Connection timeout in seconds.
    #[serde(default)]
    #[validate(range(min = 1, max = 3600))]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub check: bool,
    #[serde(default)]
    pub diff: bool,
    #[serde(default)]
    #[validate(range(max = 4))]
    pub verbosity: Option<u8>,
    #[serde(default, rename = "become")]
    pub privilege_escalation: bool,
    #[serde(default)]
    pub become_user: Option<String>,
    /// Wall-clock limit for the whole run, overriding the worker default.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub job_timeout_secs: Option<u64>,
}

/// Playbook plus targets plus options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct TargetDescriptor {
    /// Playbook file, relative to the playbook directory.
    #[validate(length(min = 1, max = 255))]
    pub playbook: String,
    /// Hosts to write into a generated inventory.
    #[serde(default)]
    #[validate(length(max = 10000))]
    pub hosts: Vec<String>,
    /// Existing inventory file, relative to the playbook directory.
    #[serde(default)]
    pub inventory: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub options: RunOptions,
}

impl TargetDescriptor {
    /// Parse a stored descriptor and validate it.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        let descriptor: TargetDescriptor = serde_json::from_value(value.clone())
            .map_err(|e| CoreError::Validation(format!("Invalid target descriptor: {e}")))?;
        descriptor.check()?;
        Ok(descriptor)
    }

    /// Run the derived field validation plus the path and host rules.
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        if !is_safe_relative_path(&self.playbook) {
            return Err(CoreError::Validation(format!(
                "Unsafe playbook path '{}'",
                self.playbook
            )));
        }
        if !has_playbook_extension(&self.playbook) {
            return Err(CoreError::Validation(format!(
                "Playbook '{}' must be a .yml or .yaml file",
                self.playbook
            )));
        }

        if let Some(inventory) = &self.inventory {
            if !is_safe_relative_path(inventory) {
                return Err(CoreError::Validation(format!(
                    "Unsafe inventory path '{inventory}'"
                )));
            }
        }

        if self.hosts.is_empty() && self.inventory.is_none() {
            return Err(CoreError::Validation(
                "At least one host or an inventory file is required".to_string(),
            ));
        }

        if let Some(bad) = self.hosts.iter().find(|h| !is_valid_host(h)) {
            return Err(CoreError::Validation(format!("Invalid host '{bad}'")));
        }

        Ok(())
    }
}

/// Relative path made of safe components: no absolute paths, no `..`,
/// only alphanumerics, `-`, `_`, `.` and `/`.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && path.len() <= 255
        && !path.starts_with('/')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn has_playbook_extension(path: &str) -> bool {
    path.ends_with(".yml") || path.ends_with(".yaml")
}

/// Host names, addresses and inventory-style patterns; no whitespace,
/// separators or control characters.
pub fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '[' | ']'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
