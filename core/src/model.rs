//! Fleet snapshot data model: hosts, processes, ports and their TLS annotations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Socket state reported for ports accepting inbound connections.
pub const LISTEN: &str = "LISTEN";

/// One fleet-wide scan run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub hosts: Vec<HostResult>,
}

impl Snapshot {
    pub fn new(hosts: Vec<HostResult>) -> Self {
        Snapshot { id: Uuid::now_v7(), created_at: OffsetDateTime::now_utc(), hosts }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostResult {
    /// Job/instance name, e.g. `router/0`.
    pub name: String,
    pub address: String,
    pub processes: Vec<Process>,
    pub files: Vec<FileEntry>,
    pub ssh_keys: Vec<SshHostKey>,
}

impl HostResult {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        HostResult { name: name.into(), address: address.into(), ..Default::default() }
    }

    /// Identity used in reports; falls back to the address for unnamed hosts.
    pub fn identity(&self) -> &str {
        if self.name.is_empty() { &self.address } else { &self.name }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub command_name: String,
    pub pid: u32,
    pub user: String,
    pub cmdline: Vec<String>,
    pub env: Vec<String>,
    pub ports: Vec<Port>,
}

impl Process {
    pub fn listening_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(|p| p.is_listening())
    }

    pub fn has_port(&self, number: u16) -> bool {
        self.ports.iter().any(|p| p.number == number)
    }

    pub fn is_privileged(&self) -> bool {
        self.user == "root" || self.user == "0"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    /// Accepts the spellings used by lsof and netstat (`TCP`, `tcp6`, `udp`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Transport::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Transport::Udp),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub protocol: Transport,
    pub address: String,
    pub number: u16,
    /// LISTEN, ESTABLISHED, CLOSE_WAIT, ... Empty for stateless sockets.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsInformation>,
}

impl Port {
    pub fn new(protocol: Transport, address: impl Into<String>, number: u16, state: impl Into<String>) -> Self {
        Port { protocol, address: address.into(), number, state: state.into(), tls: None }
    }

    pub fn is_listening(&self) -> bool {
        self.state == LISTEN
    }

    pub fn is_loopback(&self) -> bool {
        let host = self.address.trim_start_matches('[').trim_end_matches(']');
        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
    }

    /// Copy of this port carrying the given TLS annotation.
    pub fn with_tls(&self, tls: TlsInformation) -> Self {
        Port { tls: Some(tls), ..self.clone() }
    }
}

/// Protocol-version label (e.g. `VersionTLS12`) to the ciphers accepted under it.
pub type CipherInformation = BTreeMap<String, Vec<AcceptedCipher>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsInformation {
    pub presence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
    #[serde(default)]
    pub ciphers: CipherInformation,
    #[serde(default)]
    pub mutual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_error: Option<String>,
}

impl TlsInformation {
    pub fn failed(error: impl fmt::Display) -> Self {
        TlsInformation { scan_error: Some(error.to_string()), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedCipher {
    pub name: String,
    pub quality: CipherQuality,
}

impl AcceptedCipher {
    pub fn new(name: impl Into<String>, quality: CipherQuality) -> Self {
        AcceptedCipher { name: name.into(), quality }
    }
}

/// Static judgment of a cipher suite, independent of negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherQuality {
    Acceptable,
    Weak,
    Broken,
}

impl CipherQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherQuality::Acceptable => "acceptable",
            CipherQuality::Weak => "weak",
            CipherQuality::Broken => "broken",
        }
    }

    pub fn is_acceptable(&self) -> bool {
        matches!(self, CipherQuality::Acceptable)
    }
}

impl FromStr for CipherQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acceptable" => Ok(CipherQuality::Acceptable),
            "weak" => Ok(CipherQuality::Weak),
            "broken" => Ok(CipherQuality::Broken),
            other => Err(format!("unknown cipher quality: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub bits: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub expiration: OffsetDateTime,
    pub subject: CertificateSubject,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSubject {
    pub country: String,
    pub province: String,
    pub locality: String,
    pub organization: String,
    pub common_name: String,
}

impl fmt::Display for CertificateSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/C={}/ST={}/L={}/O={}/CN={}",
            self.country, self.province, self.locality, self.organization, self.common_name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    /// Unix permission bits (`0o644`).
    pub permissions: u32,
}

impl FileEntry {
    pub fn is_world_readable(&self) -> bool {
        self.permissions & 0o004 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SshHostKey {
    pub key_type: String,
    /// Base64-encoded public key blob.
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_displays_in_familiar_format() {
        let subject = CertificateSubject {
            country: "US".into(),
            province: "California".into(),
            locality: "San Francisco".into(),
            organization: "Pivotal".into(),
            common_name: "*.not-real.example.com".into(),
        };
        assert_eq!(subject.to_string(), "/C=US/ST=California/L=San Francisco/O=Pivotal/CN=*.not-real.example.com");
    }

    #[test]
    fn loopback_detection() {
        assert!(Port::new(Transport::Tcp, "127.0.0.1", 80, LISTEN).is_loopback());
        assert!(Port::new(Transport::Tcp, "[::1]", 80, LISTEN).is_loopback());
        assert!(Port::new(Transport::Tcp, "localhost", 80, LISTEN).is_loopback());
        assert!(!Port::new(Transport::Tcp, "*", 80, LISTEN).is_loopback());
        assert!(!Port::new(Transport::Tcp, "10.0.5.21", 80, LISTEN).is_loopback());
    }

    #[test]
    fn transport_accepts_tool_spellings() {
        assert_eq!("TCP".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!("udp6".parse::<Transport>().unwrap(), Transport::Udp);
        assert!("sctp".parse::<Transport>().is_err());
    }

    #[test]
    fn world_readable_bit() {
        assert!(FileEntry { path: "/etc/passwd".into(), permissions: 0o644 }.is_world_readable());
        assert!(!FileEntry { path: "/etc/shadow".into(), permissions: 0o640 }.is_world_readable());
    }

    #[test]
    fn snapshot_serializes_timestamps_as_rfc3339() {
        let snap = Snapshot::new(vec![HostResult::new("host1", "10.0.0.1")]);
        let json = serde_json::to_string(&snap).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hosts, snap.hosts);
        assert_eq!(back.created_at.unix_timestamp(), snap.created_at.unix_timestamp());
    }
}
