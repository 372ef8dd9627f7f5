//! Compliance rules evaluated against one snapshot.

use crate::ViolationReport;
use fleetaudit_core::{AcceptedCipher, Snapshot};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub const ROOT_PROCESSES_TITLE: &str = "Externally-accessible processes running as root:";
pub const TLS_VIOLATIONS_TITLE: &str = "Processes using non-approved SSL/TLS settings:";
pub const TLS_VIOLATIONS_NOTE: &str = "If this is not an internal endpoint then please check with your PM and the security team before applying this change. This change is not backwards compatible.";
pub const WORLD_READABLE_TITLE: &str = "World-readable files:";
pub const DUPLICATE_KEYS_TITLE: &str = "Duplicate SSH keys:";

/// Which protocol versions and ciphers count as approved.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsPolicy {
    pub approved_protocols: BTreeSet<String>,
    /// When set, ciphers outside this list are flagged even if their quality is acceptable.
    pub approved_ciphers: Option<BTreeSet<String>>,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        TlsPolicy {
            approved_protocols: ["VersionTLS12", "VersionTLS13"].into_iter().map(String::from).collect(),
            approved_ciphers: None,
        }
    }
}

impl TlsPolicy {
    pub fn protocol_approved(&self, label: &str) -> bool {
        self.approved_protocols.contains(label)
    }

    pub fn cipher_approved(&self, cipher: &AcceptedCipher) -> bool {
        cipher.quality.is_acceptable()
            && self.approved_ciphers.as_ref().map(|list| list.contains(&cipher.name)).unwrap_or(true)
    }
}

pub fn root_processes(snapshot: &Snapshot) -> ViolationReport {
    let mut report = ViolationReport::new(ROOT_PROCESSES_TITLE, &["Identity", "Port", "Process Name"]);
    let mut seen = HashSet::new();
    for host in &snapshot.hosts {
        for process in host.processes.iter().filter(|p| p.is_privileged()) {
            for port in process.listening_ports().filter(|p| !p.is_loopback()) {
                if seen.insert((host.identity(), port.number, process.command_name.as_str())) {
                    report.push(vec![host.identity().to_string(), port.number.to_string(), process.command_name.clone()]);
                }
            }
        }
    }
    report
}

/// One row per non-approved protocol with no flagged cipher under it, and one per flagged
/// cipher, carrying its protocol when that protocol is non-approved too.
pub fn tls_violations(snapshot: &Snapshot, policy: &TlsPolicy) -> ViolationReport {
    let mut report = ViolationReport::new(
        TLS_VIOLATIONS_TITLE,
        &["Identity", "Port", "Process Name", "Non-approved Protocol(s)", "Non-approved Cipher(s)"],
    )
    .with_note(TLS_VIOLATIONS_NOTE);
    let mut seen = HashSet::new();
    for host in &snapshot.hosts {
        for process in &host.processes {
            for port in process.listening_ports() {
                let Some(tls) = port.tls.as_ref().filter(|t| t.presence) else { continue };
                if !seen.insert((host.identity(), port.number, process.command_name.as_str())) {
                    continue;
                }
                for (protocol, ciphers) in &tls.ciphers {
                    let protocol_bad = !policy.protocol_approved(protocol);
                    let flagged: Vec<&AcceptedCipher> = ciphers.iter().filter(|c| !policy.cipher_approved(c)).collect();
                    let row = |protocol: &str, cipher: &str| {
                        vec![
                            host.identity().to_string(),
                            port.number.to_string(),
                            process.command_name.clone(),
                            protocol.to_string(),
                            cipher.to_string(),
                        ]
                    };
                    if protocol_bad && flagged.is_empty() {
                        report.push(row(protocol, ""));
                    }
                    for cipher in flagged {
                        report.push(row(if protocol_bad { protocol } else { "" }, &cipher.name));
                    }
                }
            }
        }
    }
    report
}

pub fn world_readable_files(snapshot: &Snapshot) -> ViolationReport {
    let mut report = ViolationReport::new(WORLD_READABLE_TITLE, &["Identity", "Path"]);
    for host in &snapshot.hosts {
        for file in host.files.iter().filter(|f| f.is_world_readable()) {
            report.push(vec![host.identity().to_string(), file.path.clone()]);
        }
    }
    report
}

/// Hosts sharing a host key, grouped by key; each identity appears once per key it shares.
/// Two results with the same identity are one machine, not a shared key.
pub fn duplicate_ssh_keys(snapshot: &Snapshot) -> ViolationReport {
    let mut report = ViolationReport::new(DUPLICATE_KEYS_TITLE, &["Identity"]);
    let mut by_key: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for host in &snapshot.hosts {
        for key in &host.ssh_keys {
            let identities = by_key.entry(key.key.as_str()).or_default();
            if !identities.contains(&host.identity()) {
                identities.push(host.identity());
            }
        }
    }
    for identities in by_key.values().filter(|ids| ids.len() > 1) {
        for identity in identities {
            report.push(vec![identity.to_string()]);
        }
    }
    report
}
