//! Deployment-manifest view of a snapshot: which processes listen on which ports, per host.

use anyhow::{Context, Result};
use fleetaudit_core::Snapshot;
use serde::{Deserialize, Serialize};

pub type ManifestPort = u16;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub specs: Vec<ManifestSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSpec {
    /// Host identity, or a prefix of identities (`router` covers `router/0`, `router/1`).
    pub prefix: String,
    #[serde(default)]
    pub processes: Vec<ManifestProcess>,
    /// Ports the audit tolerates on any process of matching hosts. Read, never written.
    #[serde(default, skip_serializing)]
    pub ignore_ports: Vec<ManifestPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestProcess {
    pub command: String,
    pub user: String,
    #[serde(default)]
    pub ports: Vec<ManifestPort>,
}

impl ManifestSpec {
    pub fn matches(&self, identity: &str) -> bool {
        identity.starts_with(&self.prefix)
    }
}

impl Manifest {
    /// One entry per host; per process, the sorted distinct LISTEN ports. Processes without a
    /// listening port are left out.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let specs = snapshot
            .hosts
            .iter()
            .map(|host| ManifestSpec {
                prefix: host.identity().to_string(),
                processes: host
                    .processes
                    .iter()
                    .filter_map(|p| {
                        let mut ports: Vec<ManifestPort> = p.listening_ports().map(|port| port.number).collect();
                        ports.sort_unstable();
                        ports.dedup();
                        (!ports.is_empty()).then(|| ManifestProcess {
                            command: p.command_name.clone(),
                            user: p.user.clone(),
                            ports,
                        })
                    })
                    .collect(),
                ignore_ports: Vec::new(),
            })
            .collect();
        Manifest { specs }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing manifest")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serializing manifest")
    }

    /// Most specific entry covering `identity`.
    pub fn spec_for(&self, identity: &str) -> Option<&ManifestSpec> {
        self.specs.iter().filter(|s| s.matches(identity)).max_by_key(|s| s.prefix.len())
    }
}
