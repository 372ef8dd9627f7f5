//! Fleet directory: a director-style HTTP API listing the VMs of a deployment, reached
//! optionally through one shared SSH gateway.

use crate::source::{Endpoint, HostSource, HostTarget};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use inventory::{RemoteSession, SshCommandSession, SshOptions};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    pub url: String,
    pub deployment: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Gateway {
    pub host: String,
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    job: String,
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: String,
    #[serde(default)]
    ips: Vec<String>,
}

pub struct FleetDirectorySource {
    options: DirectoryOptions,
    ssh: SshOptions,
    gateway: Option<Gateway>,
    client: Client,
    /// Control socket of the gateway master connection, once established.
    control: Mutex<Option<PathBuf>>,
    /// Open `-L` forwards through the gateway, by local port.
    forwards: Mutex<HashMap<u16, String>>,
}

const LOOPBACK: &str = "127.0.0.1";

impl FleetDirectorySource {
    pub fn new(options: DirectoryOptions, ssh: SshOptions, gateway: Option<Gateway>) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .user_agent(concat!("fleetaudit/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        Ok(FleetDirectorySource {
            options,
            ssh,
            gateway,
            client,
            control: Mutex::new(None),
            forwards: Mutex::new(HashMap::new()),
        })
    }

    fn vms_url(&self) -> Result<Url> {
        let base = Url::parse(&self.options.url).with_context(|| format!("invalid directory url {}", self.options.url))?;
        base.join(&format!("deployments/{}/vms", self.options.deployment))
            .context("building vms url")
    }

    fn control_path(&self) -> Option<PathBuf> {
        self.control.lock().ok().and_then(|c| c.clone())
    }

    fn gateway_args(gateway: &Gateway, control: &Path) -> Vec<String> {
        let mut args = vec!["-S".to_string(), control.display().to_string(), "-l".to_string(), gateway.user.clone()];
        if let Some(identity) = &gateway.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    /// `-L` spec binding `local_port` on loopback to `address:port` beyond the gateway.
    fn forward_spec(local_port: u16, address: &str, port: u16) -> String {
        if address.contains(':') {
            format!("{LOOPBACK}:{local_port}:[{address}]:{port}")
        } else {
            format!("{LOOPBACK}:{local_port}:{address}:{port}")
        }
    }

    /// `ssh -O forward|cancel` against the running master connection.
    async fn control_forward(&self, gateway: &Gateway, control: &Path, op: &str, spec: &str) -> Result<()> {
        let output = Command::new("ssh")
            .args(["-O", op, "-L", spec])
            .args(Self::gateway_args(gateway, control))
            .arg(&gateway.host)
            .output()
            .await
            .with_context(|| format!("running ssh -O {op}"))?;
        if !output.status.success() {
            bail!("ssh -O {op} {spec} via {}: {}", gateway.host, String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }
}

#[async_trait]
impl HostSource for FleetDirectorySource {
    /// Opens the gateway master connection all host sessions are tunnelled through.
    async fn setup(&self) -> Result<()> {
        let Some(gateway) = &self.gateway else { return Ok(()) };
        let control = std::env::temp_dir().join(format!("fleetaudit-{}.sock", std::process::id()));
        let status = Command::new("ssh")
            .args(["-M", "-f", "-N", "-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no", "-o", "ControlPersist=yes"])
            .args(Self::gateway_args(gateway, &control))
            .arg(&gateway.host)
            .status()
            .await
            .context("starting gateway ssh")?;
        if !status.success() {
            bail!("gateway connection to {} failed with {status}", gateway.host);
        }
        info!(gateway = %gateway.host, "gateway connection established");
        if let Ok(mut c) = self.control.lock() {
            *c = Some(control);
        }
        Ok(())
    }

    async fn hosts(&self) -> Result<Vec<HostTarget>> {
        let url = self.vms_url()?;
        let mut req = self.client.get(url.clone());
        if let Some(user) = &self.options.username {
            req = req.basic_auth(user, self.options.password.as_ref());
        }
        let resp = req.send().await.with_context(|| format!("GET {url}"))?;
        if !resp.status().is_success() {
            return Err(anyhow!("GET {url}: {}", resp.status()));
        }
        let vms: Vec<VmInfo> = resp.json().await.context("decoding vm list")?;
        debug!(count = vms.len(), deployment = %self.options.deployment, "directory listed vms");
        Ok(vms
            .into_iter()
            .map(|vm| HostTarget { job: vm.job, index: vm.index, instance_id: vm.id, addresses: vm.ips })
            .collect())
    }

    async fn open(&self, _target: &HostTarget, address: &str) -> Result<Box<dyn RemoteSession>> {
        let mut ssh = self.ssh.clone();
        if let (Some(gateway), Some(control)) = (&self.gateway, self.control_path()) {
            ssh.proxy_command = Some(format!("ssh -S {} -W %h:%p {}", control.display(), gateway.host));
        }
        Ok(Box::new(SshCommandSession::new(address, ssh)))
    }

    /// Behind a gateway every direct dial goes through a fresh local forward on the master
    /// connection; without one the host is dialled as is.
    async fn endpoint(&self, address: &str, port: u16) -> Result<Endpoint> {
        let Some(gateway) = &self.gateway else { return Ok(Endpoint::new(address, port)) };
        let control = self
            .control_path()
            .ok_or_else(|| anyhow!("gateway connection to {} is not established", gateway.host))?;
        let local = TcpListener::bind((LOOPBACK, 0))
            .await
            .context("reserving a local port")?
            .local_addr()
            .context("reserving a local port")?
            .port();
        let spec = Self::forward_spec(local, address, port);
        self.control_forward(gateway, &control, "forward", &spec).await?;
        debug!(%spec, "forward opened");
        if let Ok(mut forwards) = self.forwards.lock() {
            forwards.insert(local, spec);
        }
        Ok(Endpoint::new(LOOPBACK, local))
    }

    async fn release(&self, endpoint: &Endpoint) {
        let spec = self.forwards.lock().ok().and_then(|mut f| f.remove(&endpoint.port));
        let (Some(gateway), Some(control), Some(spec)) = (&self.gateway, self.control_path(), spec) else {
            return;
        };
        if let Err(e) = self.control_forward(gateway, &control, "cancel", &spec).await {
            warn!(%spec, error = %e, "closing forward failed");
        }
    }

    async fn cleanup(&self) {
        let (Some(gateway), Some(control)) = (&self.gateway, self.control.lock().ok().and_then(|mut c| c.take())) else {
            return;
        };
        let res = Command::new("ssh")
            .args(["-O", "exit"])
            .args(Self::gateway_args(gateway, &control))
            .arg(&gateway.host)
            .status()
            .await;
        match res {
            Ok(status) if status.success() => debug!(gateway = %gateway.host, "gateway connection closed"),
            Ok(status) => warn!(gateway = %gateway.host, %status, "closing gateway connection failed"),
            Err(e) => warn!(gateway = %gateway.host, error = %e, "closing gateway connection failed"),
        }
    }
}
