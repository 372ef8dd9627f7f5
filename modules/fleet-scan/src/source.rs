//! Host enumeration strategies: where the hosts come from and how to reach each one.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use inventory::{RemoteSession, SshCommandSession, SshOptions};
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::warn;

/// One fleet member as reported by its source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostTarget {
    pub job: String,
    pub index: Option<u32>,
    pub instance_id: String,
    pub addresses: Vec<String>,
}

impl HostTarget {
    pub fn address(address: impl Into<String>) -> Self {
        HostTarget { addresses: vec![address.into()], ..Default::default() }
    }

    /// `job/index`, else `job/instance_id`, else empty.
    pub fn name(&self) -> String {
        match (self.job.is_empty(), self.index) {
            (true, _) => String::new(),
            (false, Some(i)) => format!("{}/{}", self.job, i),
            (false, None) if self.instance_id.is_empty() => self.job.clone(),
            (false, None) => format!("{}/{}", self.job, self.instance_id),
        }
    }
}

/// Where a TCP port of a host is dialled from the scanning machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint { host: host.into(), port }
    }
}

#[async_trait]
pub trait HostSource: Send + Sync {
    /// Shared context every host depends on. Failure aborts the run.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn hosts(&self) -> Result<Vec<HostTarget>>;

    async fn open(&self, target: &HostTarget, address: &str) -> Result<Box<dyn RemoteSession>>;

    /// How to dial `address:port` directly from here (host-key and TLS checks). Sources whose
    /// hosts sit behind a gateway hand out a local forward instead.
    async fn endpoint(&self, address: &str, port: u16) -> Result<Endpoint> {
        Ok(Endpoint::new(address, port))
    }

    /// Give back an endpoint from [`HostSource::endpoint`] once it is no longer dialled.
    async fn release(&self, _endpoint: &Endpoint) {}

    /// Runs once after every host finished, whatever happened.
    async fn cleanup(&self) {}
}

/// A single machine.
pub struct DirectSource {
    target: HostTarget,
    ssh: SshOptions,
}

impl DirectSource {
    pub fn new(address: impl Into<String>, ssh: SshOptions) -> Self {
        DirectSource { target: HostTarget::address(address), ssh }
    }
}

#[async_trait]
impl HostSource for DirectSource {
    async fn hosts(&self) -> Result<Vec<HostTarget>> {
        Ok(vec![self.target.clone()])
    }

    async fn open(&self, _target: &HostTarget, address: &str) -> Result<Box<dyn RemoteSession>> {
        Ok(Box::new(SshCommandSession::new(address, self.ssh.clone())))
    }
}

/// An explicit inventory, one host per line: `address` or `name address`.
pub struct ListSource {
    targets: Vec<HostTarget>,
    ssh: SshOptions,
}

impl ListSource {
    pub fn new(targets: Vec<HostTarget>, ssh: SshOptions) -> Self {
        ListSource { targets, ssh }
    }

    /// Blank lines and `#` comments are ignored. A host listed again is scanned once.
    pub fn parse(text: &str, ssh: SshOptions) -> Result<Self> {
        let mut targets: Vec<HostTarget> = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let target = match fields.as_slice() {
                [address] => HostTarget::address(*address),
                [name, address] => HostTarget { job: name.to_string(), ..HostTarget::address(*address) },
                _ => return Err(anyhow!("line {}: expected `address` or `name address`", n + 1)),
            };
            if targets.contains(&target) {
                warn!(line = n + 1, host = line, "host listed twice, skipping");
                continue;
            }
            targets.push(target);
        }
        Ok(ListSource::new(targets, ssh))
    }
}

#[async_trait]
impl HostSource for ListSource {
    async fn hosts(&self) -> Result<Vec<HostTarget>> {
        Ok(self.targets.clone())
    }

    async fn open(&self, _target: &HostTarget, address: &str) -> Result<Box<dyn RemoteSession>> {
        Ok(Box::new(SshCommandSession::new(address, self.ssh.clone())))
    }
}

/// Best address to reach a host: inside `preferred` if given, else the first routable one.
pub fn pick_address(candidates: &[String], preferred: Option<&IpNet>) -> Option<String> {
    let parsed: Vec<(&String, Option<IpAddr>)> = candidates.iter().map(|c| (c, c.parse().ok())).collect();
    if let Some(net) = preferred {
        if let Some((c, _)) = parsed.iter().find(|(_, ip)| ip.map(|ip| net.contains(&ip)).unwrap_or(false)) {
            return Some(c.to_string());
        }
    }
    parsed
        .iter()
        .find(|(_, ip)| ip.map(is_routable).unwrap_or(true))
        .or_else(|| parsed.first())
        .map(|(c, _)| c.to_string())
}

fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
        IpAddr::V6(v6) => !v6.is_loopback() && !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn skips_link_local_candidates() {
        let c = strings(&["169.254.0.7", "fe80::1", "10.0.16.4"]);
        assert_eq!(pick_address(&c, None).as_deref(), Some("10.0.16.4"));
    }

    #[test]
    fn preferred_network_wins() {
        let c = strings(&["10.0.16.4", "192.168.50.9"]);
        let net: IpNet = "192.168.0.0/16".parse().unwrap();
        assert_eq!(pick_address(&c, Some(&net)).as_deref(), Some("192.168.50.9"));
    }

    #[test]
    fn falls_back_to_first_candidate() {
        let c = strings(&["169.254.0.7"]);
        assert_eq!(pick_address(&c, None).as_deref(), Some("169.254.0.7"));
        assert_eq!(pick_address(&[], None), None);
    }

    #[test]
    fn host_names() {
        let mut t = HostTarget { job: "router".into(), index: Some(0), instance_id: "abc".into(), ..Default::default() };
        assert_eq!(t.name(), "router/0");
        t.index = None;
        assert_eq!(t.name(), "router/abc");
        assert_eq!(HostTarget::address("10.0.0.1").name(), "");
    }

    #[test]
    fn parses_host_list() {
        let text = "# fleet\n10.0.0.1\n\nweb-1 10.0.0.2  # frontend\n";
        let source = ListSource::parse(text, SshOptions::default()).unwrap();
        assert_eq!(source.targets.len(), 2);
        assert_eq!(source.targets[1].name(), "web-1");
        assert_eq!(source.targets[1].addresses, vec!["10.0.0.2"]);
        assert!(ListSource::parse("a b c\n", SshOptions::default()).is_err());
    }

    #[test]
    fn repeated_list_entries_collapse() {
        let text = "10.0.0.1\nweb-1 10.0.0.2\n10.0.0.1\nweb-1   10.0.0.2\nweb-2 10.0.0.2\n";
        let source = ListSource::parse(text, SshOptions::default()).unwrap();
        let names: Vec<String> = source.targets.iter().map(|t| format!("{} {}", t.name(), t.addresses[0])).collect();
        assert_eq!(names, vec![" 10.0.0.1", "web-1 10.0.0.2", "web-2 10.0.0.2"]);
    }

    #[tokio::test]
    async fn direct_sources_dial_hosts_as_given() {
        let source = DirectSource::new("10.0.0.9", SshOptions::default());
        let endpoint = source.endpoint("10.0.0.9", 443).await.unwrap();
        assert_eq!(endpoint, Endpoint::new("10.0.0.9", 443));
        source.release(&endpoint).await;
    }
}
