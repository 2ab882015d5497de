//! Progress estimation from playbook output.
//!
//! Each line that starts a new phase (play, task, handler) advances the
//! estimate by a fixed step. The estimate is capped below 100; only a
//! successful completion reports 100.

use std::sync::atomic::{AtomicU8, Ordering};

/// Highest value the estimator reports on its own.
pub const PROGRESS_CEILING: u8 = 95;

/// Default advance per phase line.
pub const PROGRESS_STEP: u8 = 5;

/// Value reported on successful completion.
pub const PROGRESS_COMPLETE: u8 = 100;

const PHASE_PREFIXES: [&str; 3] = ["PLAY [", "TASK [", "RUNNING HANDLER ["];

/// Whether a line marks the start of a new execution phase.
pub fn is_phase_line(line: &str) -> bool {
    let line = line.trim_start();
    PHASE_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Short human-readable name of a phase line, e.g. `TASK [install nginx]`.
pub fn phase_label(line: &str) -> Option<String> {
    let line = line.trim_start();
    if !is_phase_line(line) {
        return None;
    }
    let end = line.find(']')?;
    Some(line[..=end].to_string())
}

/// Shared, monotonic progress estimate.
///
/// Safe to feed from the stdout and stderr sinks at the same time.
#[derive(Debug)]
pub struct ProgressEstimator {
    current: AtomicU8,
    step: u8,
    ceiling: u8,
}

impl ProgressEstimator {
    pub fn new(step: u8, ceiling: u8) -> Self {
        Self {
            current: AtomicU8::new(0),
            step,
            ceiling: ceiling.min(PROGRESS_COMPLETE - 1),
        }
    }

    pub fn current(&self) -> u8 {
        self.current.load(Ordering::Acquire)
    }

    /// Feed one output line. Returns the new estimate when it advanced.
    pub fn observe(&self, line: &str) -> Option<u8> {
        if !is_phase_line(line) {
            return None;
        }

        let ceiling = self.ceiling;
        let step = self.step;
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.saturating_add(step).min(ceiling);
                (next > current).then_some(next)
            })
            .ok()
            .map(|previous| previous.saturating_add(step).min(ceiling))
    }
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new(PROGRESS_STEP, PROGRESS_CEILING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_phase_lines() {
        assert!(is_phase_line("PLAY [webservers] ******"));
        assert!(is_phase_line("TASK [Gathering Facts] ***"));
        assert!(is_phase_line("RUNNING HANDLER [restart nginx] ***"));
        assert!(!is_phase_line("ok: [web1]"));
        assert!(!is_phase_line("PLAY RECAP ******"));
    }

    #[test]
    fn labels() {
        assert_eq!(
            phase_label("TASK [install nginx] *****").as_deref(),
            Some("TASK [install nginx]")
        );
        assert_eq!(phase_label("changed: [web1]"), None);
    }

    #[test]
    fn advances_by_step() {
        let p = ProgressEstimator::default();
        assert_eq!(p.observe("PLAY [all] ***"), Some(5));
        assert_eq!(p.observe("ok: [web1]"), None);
        assert_eq!(p.observe("TASK [a] ***"), Some(10));
        assert_eq!(p.current(), 10);
    }

    #[test]
    fn never_reaches_completion() {
        let p = ProgressEstimator::new(40, 95);
        assert_eq!(p.observe("TASK [a]"), Some(40));
        assert_eq!(p.observe("TASK [b]"), Some(80));
        assert_eq!(p.observe("TASK [c]"), Some(95));
        assert_eq!(p.observe("TASK [d]"), None);
        assert_eq!(p.current(), 95);
    }

    #[test]
    fn ceiling_is_kept_below_complete() {
        let p = ProgressEstimator::new(60, 200);
        p.observe("TASK [a]");
        p.observe("TASK [b]");
        assert_eq!(p.current(), 99);
    }
}
