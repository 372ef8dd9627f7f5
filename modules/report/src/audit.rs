//! Compare a hand-maintained manifest with what the latest snapshot actually saw listening.

use crate::manifest::{Manifest, ManifestProcess};
use crate::ViolationReport;
use fleetaudit_core::Snapshot;
use std::collections::BTreeSet;

pub const AUDIT_TITLE: &str = "Manifest audit:";

pub fn audit(manifest: &Manifest, snapshot: &Snapshot) -> ViolationReport {
    let mut report = ViolationReport::new(AUDIT_TITLE, &["Identity", "Process", "Finding"]);
    let observed = Manifest::from_snapshot(snapshot);

    for host in &observed.specs {
        let identity = host.prefix.as_str();
        let mut row = |process: &str, finding: String| {
            report.push(vec![identity.to_string(), process.to_string(), finding]);
        };
        let Some(expected) = manifest.spec_for(identity) else {
            row("", "host not in manifest".to_string());
            continue;
        };
        let ignored: BTreeSet<u16> = expected.ignore_ports.iter().copied().collect();

        for actual in &host.processes {
            let Some(want) = find(&expected.processes, &actual.command) else {
                if actual.ports.iter().any(|p| !ignored.contains(p)) {
                    row(&actual.command, format!("unexpected process listening on {}", join(&actual.ports)));
                }
                continue;
            };
            if want.user != actual.user {
                row(&actual.command, format!("runs as {}, expected {}", actual.user, want.user));
            }
            for port in actual.ports.iter().filter(|p| !want.ports.contains(p) && !ignored.contains(p)) {
                row(&actual.command, format!("unexpected port {port}"));
            }
            for port in want.ports.iter().filter(|p| !actual.ports.contains(p)) {
                row(&actual.command, format!("expected port {port} not listening"));
            }
        }

        // a process expected on no (or only ignored) ports never shows up as listening
        for want in expected.processes.iter().filter(|w| w.ports.iter().any(|p| !ignored.contains(p))) {
            if find(&host.processes, &want.command).is_none() {
                row(&want.command, "expected process not listening".to_string());
            }
        }
    }
    report
}

fn find<'a>(processes: &'a [ManifestProcess], command: &str) -> Option<&'a ManifestProcess> {
    processes.iter().find(|p| p.command == command)
}

fn join(ports: &[u16]) -> String {
    ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
}
