//! Per-host inventory: processes with their sockets, regular files, SSH host keys.

pub mod hostkeys;
pub mod ssh;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fleetaudit_core::{HostResult, Process};
use parsers::{parse_file_listing, parse_lsof_output, parse_netstat_output, parse_process_table, ports_by_pid};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

pub use ssh::{SshCommandSession, SshOptions};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command channel to one host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput>;
    /// Safe to call more than once.
    async fn close(&self);
}

/// Pseudo-filesystems and runtime trees never walked by the file scan.
pub const DEFAULT_EXCLUDED_PATHS: &[&str] = &["/proc", "/sys", "/dev", "/run", "/var/run", "/var/lib/docker/overlay2"];

/// Prints `pid user comm cmdline environ`, the last two base64-encoded, one process per line.
/// A process that vanishes between reads is skipped by `continue`.
const PROCESS_TABLE: &str = r#"for d in /proc/[0-9]*; do pid=${d#/proc/}; user=$(stat -c %U "$d" 2>/dev/null) || continue; comm=$(cat "$d/comm" 2>/dev/null) || continue; cmd=$(base64 -w0 "$d/cmdline" 2>/dev/null) || continue; env=$(base64 -w0 "$d/environ" 2>/dev/null); printf '%s\t%s\t%s\t%s\t%s\n' "$pid" "$user" "$comm" "$cmd" "$env"; done"#;

const LSOF: &str = "lsof -nP -i -FpcPnT";
const NETSTAT: &str = "netstat -tunap";

/// Exit status of a shell that could not find the program.
const COMMAND_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub ssh_port: u16,
    pub hostkey_timeout: Duration,
    pub extra_exclusions: Vec<String>,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        CollectorOptions { ssh_port: 22, hostkey_timeout: Duration::from_secs(5), extra_exclusions: Vec::new() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Collector {
    options: CollectorOptions,
}

impl Collector {
    pub fn new(options: CollectorOptions) -> Self {
        Collector { options }
    }

    pub fn ssh_port(&self) -> u16 {
        self.options.ssh_port
    }

    /// Gather the full inventory of the host behind `session`. Any failing step fails the host.
    pub async fn collect(&self, session: &dyn RemoteSession, name: &str, address: &str) -> Result<HostResult> {
        self.collect_with_keys_from(session, name, address, address, self.options.ssh_port).await
    }

    /// Like [`Collector::collect`], with the host's SSH server reached at `key_host:key_port`
    /// (a local forward when the host sits behind a gateway).
    pub async fn collect_with_keys_from(
        &self,
        session: &dyn RemoteSession,
        name: &str,
        address: &str,
        key_host: &str,
        key_port: u16,
    ) -> Result<HostResult> {
        let mut host = HostResult::new(name, address);

        host.processes = self.processes(session).await?;

        let find = session.run(&self.find_command()).await.context("listing files")?;
        // find exits non-zero on any unreadable directory; what it did print is still valid
        if !find.success() {
            debug!(exit_code = find.exit_code, "file listing incomplete");
        }
        host.files = parse_file_listing(&find.stdout);

        let addr = resolve(key_host, key_port)?;
        host.ssh_keys = hostkeys::scan_host_keys(addr, self.options.hostkey_timeout)
            .await
            .context("collecting ssh host keys")?;

        info!(
            processes = host.processes.len(),
            files = host.files.len(),
            ssh_keys = host.ssh_keys.len(),
            "inventory collected"
        );
        Ok(host)
    }

    /// Process table with each process's sockets attached.
    pub async fn processes(&self, session: &dyn RemoteSession) -> Result<Vec<Process>> {
        let table = session.run(PROCESS_TABLE).await.context("listing processes")?;
        if !table.success() {
            bail!("process listing exited with {}: {}", table.exit_code, table.stderr.trim());
        }
        let mut processes = parse_process_table(&table.stdout);

        let mut by_pid = ports_by_pid(self.sockets(session).await?);
        for process in &mut processes {
            if let Some(ports) = by_pid.remove(&process.pid) {
                process.ports = ports;
            }
        }
        if !by_pid.is_empty() {
            debug!(pids = ?by_pid.keys().collect::<Vec<_>>(), "sockets owned by processes no longer listed");
        }
        Ok(processes)
    }

    async fn sockets(&self, session: &dyn RemoteSession) -> Result<Vec<parsers::SocketEntry>> {
        let lsof = session.run(LSOF).await.context("listing sockets")?;
        // lsof exits 1 when it matched nothing
        if lsof.success() || (lsof.exit_code == 1 && lsof.stderr.trim().is_empty()) {
            return Ok(parse_lsof_output(&lsof.stdout));
        }
        debug!(exit_code = lsof.exit_code, "lsof unavailable, falling back to netstat");
        let netstat = session.run(NETSTAT).await.context("listing sockets with netstat")?;
        if netstat.exit_code == COMMAND_NOT_FOUND || (!netstat.success() && netstat.stdout.trim().is_empty()) {
            bail!("neither lsof nor netstat usable: {}", netstat.stderr.trim());
        }
        Ok(parse_netstat_output(&netstat.stdout))
    }

    fn find_command(&self) -> String {
        let prunes: Vec<String> = DEFAULT_EXCLUDED_PATHS
            .iter()
            .map(|p| p.to_string())
            .chain(self.options.extra_exclusions.iter().cloned())
            .map(|p| format!("-path {}", ssh::shell_quote(&p)))
            .collect();
        format!(r"find / \( {} \) -prune -o -type f -printf '%m\t%p\n' 2>/dev/null", prunes.join(" -o "))
    }
}

fn resolve(address: &str, port: u16) -> Result<SocketAddr> {
    let host = address.trim_start_matches('[').trim_end_matches(']');
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {address}"))?
        .next()
        .with_context(|| format!("no address for {address}"))
}
