//! Fleet-wide scan: one task per host collecting inventory, then TLS probing of every
//! listening port, gathered into a single snapshot.

pub mod directory;
pub mod source;

pub use directory::{DirectoryOptions, FleetDirectorySource, Gateway};
pub use source::{pick_address, DirectSource, Endpoint, HostSource, HostTarget, ListSource};

use fleetaudit_core::{HostResult, Snapshot, TlsInformation, Transport};
use inventory::Collector;
use ipnet::IpNet;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tls_probe::Prober;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument, Span};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scan setup failed: {0:#}")]
    Setup(anyhow::Error),
    #[error("failed to enumerate hosts: {0:#}")]
    Enumerate(anyhow::Error),
    #[error("{identity}: {source:#}")]
    Host {
        identity: String,
        #[source]
        source: anyhow::Error,
    },
}

pub struct FleetScanner {
    source: Arc<dyn HostSource>,
    collector: Arc<Collector>,
    prober: Arc<dyn Prober>,
    preferred_network: Option<IpNet>,
}

impl FleetScanner {
    pub fn new(source: Arc<dyn HostSource>, collector: Collector, prober: Arc<dyn Prober>) -> Self {
        FleetScanner { source, collector: Arc::new(collector), prober, preferred_network: None }
    }

    pub fn preferred_network(mut self, net: Option<IpNet>) -> Self {
        self.preferred_network = net;
        self
    }

    /// Scan every host the source yields. Hosts that fail are logged and left out; only
    /// setup and enumeration failures abort the run. Cleanup always runs once setup succeeded.
    pub async fn scan(&self) -> Result<Snapshot, ScanError> {
        self.source.setup().await.map_err(ScanError::Setup)?;
        let hosts = self.fan_out().await;
        self.source.cleanup().await;
        let hosts = hosts?;
        info!(hosts = hosts.len(), "fleet scan complete");
        Ok(Snapshot::new(hosts))
    }

    async fn fan_out(&self) -> Result<Vec<HostResult>, ScanError> {
        let listed = self.source.hosts().await.map_err(ScanError::Enumerate)?;
        let mut seen = HashSet::new();
        let targets: Vec<HostTarget> = listed
            .into_iter()
            .filter(|t| {
                let first = seen.insert((t.name(), t.addresses.clone()));
                if !first {
                    debug!(identity = %identity(t), "host listed twice, scanning once");
                }
                first
            })
            .collect();
        info!(hosts = targets.len(), "scanning fleet");
        let (tx, mut rx) = mpsc::channel::<HostResult>(targets.len().max(1));

        for target in targets {
            let tx = tx.clone();
            let source = self.source.clone();
            let collector = self.collector.clone();
            let prober = self.prober.clone();
            let preferred = self.preferred_network;
            let span = info_span!("host", identity = %identity(&target), address = tracing::field::Empty);
            tokio::spawn(
                async move {
                    match scan_host(&target, source.as_ref(), &collector, prober.as_ref(), preferred.as_ref()).await {
                        Ok(host) => {
                            let _ = tx.send(host).await;
                        }
                        Err(e) => warn!(error = %e, "host scan failed, omitting host"),
                    }
                }
                .instrument(span),
            );
        }
        drop(tx);

        // one result per (name, address) even when differently listed targets resolve alike
        let mut hosts = Vec::new();
        let mut kept = HashSet::new();
        while let Some(host) = rx.recv().await {
            if kept.insert((host.name.clone(), host.address.clone())) {
                hosts.push(host);
            } else {
                warn!(identity = %host.identity(), "duplicate host result dropped");
            }
        }
        Ok(hosts)
    }
}

async fn scan_host(
    target: &HostTarget,
    source: &dyn HostSource,
    collector: &Collector,
    prober: &dyn Prober,
    preferred: Option<&IpNet>,
) -> Result<HostResult, ScanError> {
    let host_error = |source: anyhow::Error| ScanError::Host { identity: identity(target), source };
    let address = pick_address(&target.addresses, preferred)
        .ok_or_else(|| host_error(anyhow::anyhow!("no address to connect to")))?;
    Span::current().record("address", address.as_str());

    let session = source.open(target, &address).await.map_err(host_error)?;
    let collected = match source.endpoint(&address, collector.ssh_port()).await {
        Ok(ssh) => {
            let res = collector
                .collect_with_keys_from(session.as_ref(), &target.name(), &address, &ssh.host, ssh.port)
                .await;
            source.release(&ssh).await;
            res
        }
        Err(e) => Err(e.context("reaching the ssh port")),
    };
    session.close().await;
    let mut host = collected.map_err(host_error)?;

    annotate_tls(&mut host, source, prober).await;
    Ok(host)
}

fn identity(target: &HostTarget) -> String {
    let name = target.name();
    if name.is_empty() { target.addresses.join(",") } else { name }
}

/// Attach a TLS probe result to every listening TCP port, replacing each port value.
/// A port number shared by several sockets of the host is probed once, dialled through
/// whatever endpoint the source hands out for it.
async fn annotate_tls(host: &mut HostResult, source: &dyn HostSource, prober: &dyn Prober) {
    let mut probed = HashMap::new();
    for process in &mut host.processes {
        let ports = std::mem::take(&mut process.ports);
        let mut annotated = Vec::with_capacity(ports.len());
        for port in ports {
            if !port.is_listening() || port.protocol != Transport::Tcp {
                annotated.push(port);
                continue;
            }
            if !probed.contains_key(&port.number) {
                let info = match source.endpoint(&host.address, port.number).await {
                    Ok(endpoint) => {
                        let info = prober.probe(&endpoint.host, endpoint.port).await;
                        source.release(&endpoint).await;
                        info
                    }
                    Err(e) => TlsInformation::failed(format!("{e:#}")),
                };
                probed.insert(port.number, info);
            }
            match probed.get(&port.number) {
                Some(info) => annotated.push(port.with_tls(info.clone())),
                None => annotated.push(port),
            }
        }
        process.ports = annotated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use fleetaudit_core::{Port, LISTEN};
    use inventory::{CollectorOptions, CommandOutput, RemoteSession};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        setup: AtomicUsize,
        cleanup: AtomicUsize,
        released: AtomicUsize,
    }

    struct FakeSession {
        fail: bool,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl RemoteSession for FakeSession {
        async fn run(&self, command: &str) -> Result<CommandOutput> {
            if self.fail {
                return Err(anyhow!("connection reset"));
            }
            let stdout = if command.starts_with("for d in /proc") {
                "10\troot\tnginx\t\t\n"
            } else if command.starts_with("find") {
                "644\t/etc/passwd\n"
            } else if command.starts_with("lsof") {
                "p10\ncnginx\nf3\nPTCP\nn*:443\nTST=LISTEN\nf4\nPTCP\nn[::]:443\nTST=LISTEN\nf5\nPTCP\nn10.0.0.1:443->10.0.0.9:5555\nTST=ESTABLISHED\n"
            } else {
                ""
            };
            Ok(CommandOutput { stdout: stdout.into(), ..Default::default() })
        }

        async fn close(&self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeSource {
        targets: Vec<HostTarget>,
        fail_hosts: Vec<&'static str>,
        fail_setup: bool,
        counters: Arc<Counters>,
        /// Gateway-style forwarding: ssh goes to this local port, other ports to port + 10000.
        forward_ssh_to: Option<u16>,
    }

    #[async_trait]
    impl HostSource for FakeSource {
        async fn setup(&self) -> Result<()> {
            self.counters.setup.fetch_add(1, Ordering::SeqCst);
            if self.fail_setup {
                return Err(anyhow!("gateway unreachable"));
            }
            Ok(())
        }

        async fn hosts(&self) -> Result<Vec<HostTarget>> {
            Ok(self.targets.clone())
        }

        async fn open(&self, target: &HostTarget, _address: &str) -> Result<Box<dyn RemoteSession>> {
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail_hosts.contains(&target.job.as_str());
            Ok(Box::new(FakeSession { fail, counters: self.counters.clone() }))
        }

        async fn endpoint(&self, address: &str, port: u16) -> Result<Endpoint> {
            match self.forward_ssh_to {
                Some(ssh) if port == 22 => Ok(Endpoint::new("127.0.0.1", ssh)),
                Some(_) => Ok(Endpoint::new("127.0.0.1", port + 10000)),
                None => Ok(Endpoint::new(address, port)),
            }
        }

        async fn release(&self, _endpoint: &Endpoint) {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }

        async fn cleanup(&self) {
            self.counters.cleanup.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeProber {
        calls: Mutex<Vec<(String, u16)>>,
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, host: &str, port: u16) -> TlsInformation {
            self.calls.lock().unwrap().push((host.to_string(), port));
            TlsInformation { presence: true, ..Default::default() }
        }
    }

    fn target(job: &str, ip: &str) -> HostTarget {
        HostTarget { job: job.into(), index: Some(0), instance_id: String::new(), addresses: vec![ip.into()] }
    }

    /// Speaks just enough SSH to advertise no host-key algorithms we know.
    async fn keyless_ssh_server() -> u16 {
        use tokio::io::AsyncWriteExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut payload = vec![20u8];
        payload.extend_from_slice(&[0u8; 16]);
        for list in ["curve25519-sha256", "x-unknown", "aes128-ctr", "aes128-ctr", "hmac-sha2-256", "hmac-sha2-256", "none", "none", "", ""] {
            payload.extend_from_slice(&(list.len() as u32).to_be_bytes());
            payload.extend_from_slice(list.as_bytes());
        }
        payload.extend_from_slice(&[0u8; 5]);
        let mut padding = 8 - (5 + payload.len()) % 8;
        if padding < 4 {
            padding += 8;
        }
        let mut packet = ((1 + payload.len() + padding) as u32).to_be_bytes().to_vec();
        packet.push(padding as u8);
        packet.extend_from_slice(&payload);
        packet.resize(packet.len() + padding, 0);
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"SSH-2.0-Fake\r\n").await;
                let _ = sock.write_all(&packet).await;
            }
        });
        port
    }

    async fn scanner(source: FakeSource, prober: Arc<FakeProber>) -> FleetScanner {
        let collector = Collector::new(CollectorOptions { ssh_port: keyless_ssh_server().await, ..Default::default() });
        FleetScanner::new(Arc::new(source), collector, prober)
    }

    #[tokio::test]
    async fn failing_hosts_are_omitted_and_sessions_released() {
        let counters = Arc::new(Counters::default());
        let source = FakeSource {
            targets: vec![target("router", "127.0.0.1"), target("uaa", "127.0.0.1")],
            fail_hosts: vec!["uaa"],
            counters: counters.clone(),
            ..Default::default()
        };
        let prober = Arc::new(FakeProber::default());
        let snapshot = scanner(source, prober.clone()).await.scan().await.unwrap();

        assert_eq!(snapshot.hosts.len(), 1);
        let host = &snapshot.hosts[0];
        assert_eq!(host.name, "router/0");
        assert_eq!(host.files.len(), 1);
        assert!(host.ssh_keys.is_empty());
        let ports = &host.processes[0].ports;
        assert_eq!(ports.len(), 3);
        assert!(ports[0].tls.as_ref().unwrap().presence);
        assert!(ports[2].tls.is_none());
        assert_eq!(prober.calls.lock().unwrap().len(), 1);

        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
        assert_eq!(counters.cleanup.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn setup_failure_aborts_before_any_host() {
        let counters = Arc::new(Counters::default());
        let source = FakeSource {
            targets: vec![target("router", "127.0.0.1")],
            fail_setup: true,
            counters: counters.clone(),
            ..Default::default()
        };
        let err = scanner(source, Arc::new(FakeProber::default())).await.scan().await.unwrap_err();
        assert!(matches!(err, ScanError::Setup(_)));
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
        assert_eq!(counters.cleanup.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_fleet_gives_empty_snapshot() {
        let counters = Arc::new(Counters::default());
        let source = FakeSource { counters: counters.clone(), ..Default::default() };
        let snapshot = scanner(source, Arc::new(FakeProber::default())).await.scan().await.unwrap();
        assert!(snapshot.hosts.is_empty());
        assert_eq!(counters.cleanup.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn only_listening_tcp_ports_are_probed_once_per_number() {
        let mut host = HostResult::new("router/0", "10.0.0.1");
        host.processes = vec![fleetaudit_core::Process {
            command_name: "nginx".into(),
            pid: 10,
            user: "root".into(),
            ports: vec![
                Port::new(Transport::Tcp, "*", 443, LISTEN),
                Port::new(Transport::Tcp, "::", 443, LISTEN),
                Port::new(Transport::Tcp, "10.0.0.1", 443, "ESTABLISHED"),
                Port::new(Transport::Udp, "*", 53, ""),
            ],
            ..Default::default()
        }];
        let prober = FakeProber::default();
        annotate_tls(&mut host, &FakeSource::default(), &prober).await;

        assert_eq!(*prober.calls.lock().unwrap(), vec![("10.0.0.1".to_string(), 443)]);
        let ports = &host.processes[0].ports;
        assert!(ports[0].tls.as_ref().unwrap().presence);
        assert!(ports[1].tls.is_some());
        assert!(ports[2].tls.is_none());
        assert!(ports[3].tls.is_none());
    }

    #[tokio::test]
    async fn hosts_listed_twice_are_scanned_once() {
        let counters = Arc::new(Counters::default());
        let source = FakeSource {
            targets: vec![
                target("router", "127.0.0.1"),
                target("router", "127.0.0.1"),
                HostTarget::address("127.0.0.1"),
                HostTarget::address("127.0.0.1"),
            ],
            counters: counters.clone(),
            ..Default::default()
        };
        let snapshot = scanner(source, Arc::new(FakeProber::default())).await.scan().await.unwrap();

        let mut identities: Vec<&str> = snapshot.hosts.iter().map(|h| h.identity()).collect();
        identities.sort_unstable();
        assert_eq!(identities, vec!["127.0.0.1", "router/0"]);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gateway_endpoints_carry_key_and_tls_checks() {
        let counters = Arc::new(Counters::default());
        let source = FakeSource {
            // documentation range: nothing answers there directly
            targets: vec![target("router", "192.0.2.10")],
            counters: counters.clone(),
            forward_ssh_to: Some(keyless_ssh_server().await),
            ..Default::default()
        };
        let prober = Arc::new(FakeProber::default());
        let collector = Collector::new(CollectorOptions {
            ssh_port: 22,
            hostkey_timeout: std::time::Duration::from_secs(2),
            ..Default::default()
        });
        let scanner = FleetScanner::new(Arc::new(source), collector, prober.clone());
        let snapshot = scanner.scan().await.unwrap();

        assert_eq!(snapshot.hosts.len(), 1);
        assert_eq!(snapshot.hosts[0].address, "192.0.2.10");
        assert_eq!(*prober.calls.lock().unwrap(), vec![("127.0.0.1".to_string(), 10443)]);
        // one for the ssh port, one for the probed TLS port
        assert_eq!(counters.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn identity_falls_back_to_addresses() {
        assert_eq!(identity(&HostTarget::address("10.0.0.1")), "10.0.0.1");
        assert_eq!(identity(&target("router", "10.0.0.1")), "router/0");
    }
}
