//! Best-effort parsing of the `PLAY RECAP` block printed at the end of a
//! playbook run.
//!
//! Parsing never fails: output without a recap, or with lines that do not
//! look like recap entries, yields an empty [`RunSummary`].

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static RECAP_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<host>\S+)\s*:\s*(?P<stats>(?:\w+=\d+\s*)+)$").expect("valid regex")
});

static STAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)=(\d+)").expect("valid regex"));

/// ANSI CSI sequences (`ESC [ ... <letter>`), which ansible emits when
/// forced to color output.
static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[^A-Za-z]*[A-Za-z]").expect("valid regex"));

/// Per-host counters from the recap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    pub ok: u32,
    pub changed: u32,
    pub unreachable: u32,
    pub failed: u32,
    pub skipped: u32,
    pub rescued: u32,
    pub ignored: u32,
}

impl HostStats {
    fn set(&mut self, key: &str, value: u32) {
        match key {
            "ok" => self.ok = value,
            "changed" => self.changed = value,
            "unreachable" => self.unreachable = value,
            "failed" => self.failed = value,
            "skipped" => self.skipped = value,
            "rescued" => self.rescued = value,
            "ignored" => self.ignored = value,
            _ => {}
        }
    }

    /// Counter-wise sum, saturating at `u32::MAX`.
    fn add(&mut self, other: &HostStats) {
        self.ok = self.ok.saturating_add(other.ok);
        self.changed = self.changed.saturating_add(other.changed);
        self.unreachable = self.unreachable.saturating_add(other.unreachable);
        self.failed = self.failed.saturating_add(other.failed);
        self.skipped = self.skipped.saturating_add(other.skipped);
        self.rescued = self.rescued.saturating_add(other.rescued);
        self.ignored = self.ignored.saturating_add(other.ignored);
    }
}

/// Machine-readable summary of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub hosts: BTreeMap<String, HostStats>,
    pub totals: HostStats,
}

impl RunSummary {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Extract the recap from captured stdout.
///
/// Only the last `PLAY RECAP` block is considered (a run may contain
/// several plays but prints one recap at the end).
pub fn parse_recap(stdout: &str) -> RunSummary {
    let Some(start) = stdout.rfind("PLAY RECAP") else {
        return RunSummary::default();
    };

    let mut summary = RunSummary::default();
    let mut seen_entry = false;

    for line in stdout[start..].lines().skip(1) {
        let line = strip_ansi(line);
        if line.trim().is_empty() {
            if seen_entry {
                break;
            }
            continue;
        }

        let Some(caps) = RECAP_LINE_RE.captures(&line) else {
            if seen_entry {
                break;
            }
            continue;
        };

        let mut stats = HostStats::default();
        for stat in STAT_RE.captures_iter(&caps["stats"]) {
            if let Ok(value) = stat[2].parse::<u32>() {
                stats.set(&stat[1], value);
            }
        }

        summary.totals.add(&stats);
        summary.hosts.insert(caps["host"].to_string(), stats);
        seen_entry = true;
    }

    summary
}

fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_RE.replace_all(line, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN_OUTPUT: &str = "\
PLAY [all] *********************************************************************

TASK [Gathering Facts] *********************************************************
ok: [web1]
ok: [db1]

TASK [install nginx] ***********************************************************
changed: [web1]
skipping: [db1]

PLAY RECAP *********************************************************************
web1                       : ok=2    changed=1    unreachable=0    failed=0    skipped=0    rescued=0    ignored=0
db1                        : ok=1    changed=0    unreachable=0    failed=1    skipped=1    rescued=0    ignored=0

";

    #[test]
    fn parses_recap_block() {
        let summary = parse_recap(RUN_OUTPUT);
        assert_eq!(summary.hosts.len(), 2);

        let web = summary.hosts["web1"];
        assert_eq!(web.ok, 2);
        assert_eq!(web.changed, 1);

        let db = summary.hosts["db1"];
        assert_eq!(db.failed, 1);
        assert_eq!(db.skipped, 1);

        assert_eq!(summary.totals.ok, 3);
        assert_eq!(summary.totals.changed, 1);
        assert_eq!(summary.totals.failed, 1);
    }

    #[test]
    fn missing_recap_is_empty() {
        let summary = parse_recap("ERROR! the playbook: site.yml could not be found");
        assert!(summary.is_empty());
        assert_eq!(summary.totals, HostStats::default());
    }

    #[test]
    fn garbage_after_header_is_empty() {
        let summary = parse_recap("PLAY RECAP ***\nthis is not a recap line\n");
        assert!(summary.is_empty());
    }

    #[test]
    fn stops_at_first_non_entry_after_entries() {
        let out = "PLAY RECAP ***\nweb1 : ok=1 changed=0\nPlaybook run took 0 days, 0 hours\nother : ok=9\n";
        let summary = parse_recap(out);
        assert_eq!(summary.hosts.len(), 1);
        assert_eq!(summary.hosts["web1"].ok, 1);
    }

    #[test]
    fn huge_counters_saturate_totals() {
        let out = "PLAY RECAP ***\nweb1 : ok=4294967295 changed=0\nweb2 : ok=1 changed=0\n";
        let summary = parse_recap(out);
        assert_eq!(summary.hosts.len(), 2);
        assert_eq!(summary.hosts["web1"].ok, u32::MAX);
        assert_eq!(summary.totals.ok, u32::MAX);
    }

    #[test]
    fn out_of_range_counter_is_ignored() {
        let out = "PLAY RECAP ***\nweb1 : ok=99999999999 changed=2\n";
        let summary = parse_recap(out);
        assert_eq!(summary.hosts["web1"].ok, 0);
        assert_eq!(summary.hosts["web1"].changed, 2);
    }

    #[test]
    fn strips_color_codes() {
        let out = "PLAY RECAP ***\n\u{1b}[0;33mweb1\u{1b}[0m : \u{1b}[0;32mok=3\u{1b}[0m changed=2\n";
        let summary = parse_recap(out);
        assert_eq!(summary.hosts["web1"].ok, 3);
        assert_eq!(summary.hosts["web1"].changed, 2);
    }
}
