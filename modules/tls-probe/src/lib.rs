//! TLS posture of a single endpoint: which protocol versions and cipher suites it accepts,
//! the certificate it serves, and whether it asks clients for a certificate.
//!
//! Every (version, suite) pair is tried on its own connection with a hand-built ClientHello,
//! since no maintained TLS stack will still offer SSLv3 or export ciphers. The certificate is
//! then fetched with rustls, falling back to the plaintext flight of a legacy handshake.

mod cert;
mod hello;
pub mod suites;

pub use cert::parse_certificate;

use async_trait::async_trait;
use fleetaudit_core::{AcceptedCipher, CipherInformation, TlsInformation};
use hello::Reply;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use suites::ProtocolVersion;
use tracing::{debug, warn};

/// Consecutive non-TLS answers after which the endpoint is written off.
const NOT_TLS_CUTOFF: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to resolve {0}")]
    Resolve(String),
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("tls handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions { connect_timeout: Duration::from_secs(2), handshake_timeout: Duration::from_secs(3) }
    }
}

/// Anything that can produce a TLS annotation for `host:port`.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Never fails: problems are reported through `TlsInformation::scan_error`.
    async fn probe(&self, host: &str, port: u16) -> TlsInformation;
}

#[derive(Debug, Clone, Default)]
pub struct TlsProber {
    options: ProbeOptions,
}

impl TlsProber {
    pub fn new(options: ProbeOptions) -> Self {
        TlsProber { options }
    }

    pub async fn try_probe(&self, host: &str, port: u16) -> Result<TlsInformation, ProbeError> {
        let addr = resolve_first(host, port)?;
        let server_name = match host.parse::<IpAddr>() {
            Ok(_) => None,
            Err(_) => Some(host),
        };

        let mut ciphers = CipherInformation::new();
        let mut legacy = None;
        let mut attempts = 0usize;
        let mut saw_tls = false;
        for version in ProtocolVersion::PROBE_ORDER {
            for suite in suites::suites_for(version) {
                let want_details = legacy.is_none() && version <= ProtocolVersion::Tls12;
                let reply = hello::attempt(
                    addr,
                    version,
                    suite.id,
                    server_name,
                    want_details,
                    self.options.connect_timeout,
                    self.options.handshake_timeout,
                )
                .await
                .map_err(|source| ProbeError::Connect { addr, source })?;
                attempts += 1;
                match reply {
                    Reply::Accepted(details) => {
                        saw_tls = true;
                        debug!(%addr, version = version.label(), suite = suite.name, "accepted");
                        ciphers
                            .entry(version.label().to_string())
                            .or_default()
                            .push(AcceptedCipher::new(suite.name, suite.quality));
                        if want_details {
                            legacy = Some(details);
                        }
                    }
                    Reply::Refused => saw_tls = true,
                    Reply::NotTls => {}
                }
                if !saw_tls && attempts >= NOT_TLS_CUTOFF {
                    debug!(%addr, "no TLS answer, giving up");
                    return Ok(TlsInformation::default());
                }
            }
        }

        if ciphers.is_empty() {
            return Ok(TlsInformation::default());
        }

        let mut info = TlsInformation { presence: true, ciphers, ..Default::default() };
        let legacy = legacy.unwrap_or_default();
        match cert::fetch(addr, host, self.options.connect_timeout, self.options.handshake_timeout).await {
            Ok(fetched) => {
                info.mutual = fetched.client_cert_requested;
                info.certificate = fetched.leaf.as_deref().and_then(parse_certificate);
            }
            Err(e) => {
                debug!(%addr, error = %e, "rustls handshake failed, using legacy flight");
                info.mutual = legacy.client_cert_requested;
                if legacy.certificate.is_none() {
                    info.scan_error = Some(e.to_string());
                }
            }
        }
        if info.certificate.is_none() {
            info.certificate = legacy.certificate.as_deref().and_then(parse_certificate);
        }
        Ok(info)
    }
}

#[async_trait]
impl Prober for TlsProber {
    async fn probe(&self, host: &str, port: u16) -> TlsInformation {
        match self.try_probe(host, port).await {
            Ok(info) => info,
            Err(e) => {
                warn!(host, port, error = %e, "tls probe failed");
                TlsInformation::failed(e)
            }
        }
    }
}

fn resolve_first(host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (host, port)
        .to_socket_addrs()
        .map_err(|_| ProbeError::Resolve(host.to_string()))?
        .next()
        .ok_or_else(|| ProbeError::Resolve(host.to_string()))
}
