//! Certificate retrieval through a real rustls handshake that trusts everything and
//! records what the server presented.

use crate::ProbeError;
use fleetaudit_core::{Certificate, CertificateSubject};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ::time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

/// Outcome of the rustls handshake: whatever was seen before it finished or failed.
#[derive(Debug, Default)]
pub(crate) struct Fetched {
    pub leaf: Option<Vec<u8>>,
    pub client_cert_requested: bool,
}

/// Accepts any server certificate and notes whether a client certificate was asked for.
#[derive(Debug)]
struct Recorder {
    provider: Arc<CryptoProvider>,
    leaf: Mutex<Option<Vec<u8>>>,
    asked_for_client_cert: AtomicBool,
}

impl ServerCertVerifier for Recorder {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Ok(mut leaf) = self.leaf.lock() {
            *leaf = Some(end_entity.as_ref().to_vec());
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

impl ResolvesClientCert for Recorder {
    fn resolve(&self, _root_hint_subjects: &[&[u8]], _sigschemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        self.asked_for_client_cert.store(true, Ordering::SeqCst);
        None
    }

    // must claim certificates or rustls never consults the resolver
    fn has_certs(&self) -> bool {
        true
    }
}

pub(crate) async fn fetch(
    addr: SocketAddr,
    host: &str,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<Fetched, ProbeError> {
    let provider = Arc::new(ring::default_provider());
    let recorder = Arc::new(Recorder {
        provider: provider.clone(),
        leaf: Mutex::new(None),
        asked_for_client_cert: AtomicBool::new(false),
    });
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ProbeError::Handshake(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(recorder.clone())
        .with_client_cert_resolver(recorder.clone());
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = match host.parse::<std::net::IpAddr>() {
        Ok(ip) => ServerName::IpAddress(ip.into()),
        Err(_) => ServerName::try_from(host.to_owned()).map_err(|_| ProbeError::Handshake(format!("invalid server name: {host}")))?,
    };

    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(ProbeError::Connect { addr, source: e }),
        Err(_) => return Err(ProbeError::Connect { addr, source: std::io::ErrorKind::TimedOut.into() }),
    };
    let handshake = timeout(handshake_timeout, connector.connect(server_name, stream)).await;

    let leaf = recorder.leaf.lock().ok().and_then(|mut l| l.take());
    let client_cert_requested = recorder.asked_for_client_cert.load(Ordering::SeqCst);
    match handshake {
        Ok(Ok(_)) => {}
        // a rejected (empty) client certificate still leaves us with the server's leaf
        Ok(Err(_)) | Err(_) if leaf.is_some() => {}
        Ok(Err(e)) => return Err(ProbeError::Handshake(e.to_string())),
        Err(_) => return Err(ProbeError::Handshake("handshake timed out".into())),
    }
    Ok(Fetched { leaf, client_cert_requested })
}

/// Key size, expiry and subject of a DER certificate.
pub fn parse_certificate(der: &[u8]) -> Option<Certificate> {
    let (_, x509) = X509Certificate::from_der(der).ok()?;
    let name = x509.subject();
    let subject = CertificateSubject {
        country: first(name.iter_country()),
        province: first(name.iter_state_or_province()),
        locality: first(name.iter_locality()),
        organization: first(name.iter_organization()),
        common_name: first(name.iter_common_name()),
    };
    let expiration = OffsetDateTime::from_unix_timestamp(x509.validity().not_after.timestamp()).ok()?;
    Some(Certificate { bits: key_bits(x509.public_key()), expiration, subject })
}

fn first<'a>(mut values: impl Iterator<Item = &'a AttributeTypeAndValue<'a>>) -> String {
    values.next().and_then(|v| v.as_str().ok()).unwrap_or_default().to_string()
}

fn key_bits(spki: &SubjectPublicKeyInfo<'_>) -> u32 {
    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => rsa.key_size() as u32,
        // uncompressed point: 0x04 || X || Y
        Ok(PublicKey::EC(point)) => (point.data().len().saturating_sub(1) / 2 * 8) as u32,
        _ => (spki.subject_public_key.data.len() * 8) as u32,
    }
}
