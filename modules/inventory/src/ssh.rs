//! Remote execution through the system `ssh` client.

use crate::{CommandOutput, RemoteSession};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub use_sudo: bool,
    /// Value for `-o ProxyCommand=`, used to hop through a gateway.
    pub proxy_command: Option<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        SshOptions {
            user: "root".into(),
            identity_file: None,
            port: 22,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
            use_sudo: false,
            proxy_command: None,
        }
    }
}

/// One host. Every `run` is a separate non-interactive `ssh` invocation.
pub struct SshCommandSession {
    address: String,
    options: SshOptions,
    closed: AtomicBool,
}

impl SshCommandSession {
    pub fn new(address: impl Into<String>, options: SshOptions) -> Self {
        SshCommandSession { address: address.into(), options, closed: AtomicBool::new(false) }
    }

    fn args(&self, remote: &str) -> Vec<String> {
        let o = &self.options;
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", o.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            o.port.to_string(),
            "-l".to_string(),
            o.user.clone(),
        ];
        if let Some(identity) = &o.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if let Some(proxy) = &o.proxy_command {
            args.push("-o".to_string());
            args.push(format!("ProxyCommand={proxy}"));
        }
        args.push(self.address.clone());
        args.push(self.remote_command(remote));
        args
    }

    fn remote_command(&self, cmd: &str) -> String {
        if self.options.use_sudo {
            format!("sudo -n sh -c {}", shell_quote(cmd))
        } else {
            cmd.to_string()
        }
    }
}

#[async_trait]
impl RemoteSession for SshCommandSession {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("session to {} already closed", self.address));
        }
        let mut cmd = Command::new("ssh");
        cmd.args(self.args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let out = timeout(self.options.command_timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("command on {} timed out", self.address))??;
        let exit_code = out.status.code().unwrap_or(-1);
        // 255 is ssh's own failure, not the remote command's
        if exit_code == 255 {
            return Err(anyhow!(
                "ssh to {} failed: {}",
                self.address,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            exit_code,
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(address = %self.address, "ssh session closed");
        }
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
