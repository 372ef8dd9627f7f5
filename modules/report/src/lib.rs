//! Violation reports, manifest projection and manifest audit over a fleet snapshot.

pub mod audit;
pub mod manifest;
pub mod render;
pub mod rules;
pub mod show;

pub use manifest::{Manifest, ManifestPort, ManifestProcess, ManifestSpec};
pub use render::{render, OutputFormat};
pub use rules::TlsPolicy;

use fleetaudit_core::Snapshot;
use serde::Serialize;

/// Generic result table shared by every rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationReport {
    pub title: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ViolationReport {
    pub fn new(title: &str, header: &[&str]) -> Self {
        ViolationReport {
            title: title.to_string(),
            header: header.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
            note: None,
        }
    }

    /// Remediation hint printed under the table when it has rows.
    pub fn with_note(mut self, note: &str) -> Self {
        self.note = Some(note.to_string());
        self
    }

    pub fn push(&mut self, row: Vec<String>) {
        debug_assert_eq!(row.len(), self.header.len());
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Every rule, in report order.
pub fn build_reports(snapshot: &Snapshot, policy: &TlsPolicy) -> Vec<ViolationReport> {
    vec![
        rules::root_processes(snapshot),
        rules::tls_violations(snapshot, policy),
        rules::world_readable_files(snapshot),
        rules::duplicate_ssh_keys(snapshot),
    ]
}

pub fn has_violations(reports: &[ViolationReport]) -> bool {
    reports.iter().any(|r| !r.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetaudit_core::{HostResult, SshHostKey};

    #[test]
    fn reports_come_in_fixed_order() {
        let reports = build_reports(&Snapshot::new(vec![]), &TlsPolicy::default());
        let titles: Vec<&str> = reports.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                rules::ROOT_PROCESSES_TITLE,
                rules::TLS_VIOLATIONS_TITLE,
                rules::WORLD_READABLE_TITLE,
                rules::DUPLICATE_KEYS_TITLE
            ]
        );
        assert!(!has_violations(&reports));
    }

    #[test]
    fn any_row_is_a_violation() {
        let key = SshHostKey { key_type: "ssh-ed25519".into(), key: "AAAAC3".into() };
        let mut a = HostResult::new("a/0", "10.0.0.1");
        let mut b = HostResult::new("b/0", "10.0.0.2");
        a.ssh_keys.push(key.clone());
        b.ssh_keys.push(key);
        let reports = build_reports(&Snapshot::new(vec![a, b]), &TlsPolicy::default());
        assert!(has_violations(&reports));
    }
}
