//! Single-suite handshakes: one ClientHello offering exactly one version and one cipher,
//! then just enough of the server flight to tell whether that pair was accepted.

use crate::suites::ProtocolVersion;
use rand::RngCore;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const CONTENT_ALERT: u8 = 0x15;
const CONTENT_HANDSHAKE: u8 = 0x16;

const HS_CLIENT_HELLO: u8 = 1;
const HS_SERVER_HELLO: u8 = 2;
const HS_CERTIFICATE: u8 = 11;
const HS_CERTIFICATE_REQUEST: u8 = 13;
const HS_SERVER_HELLO_DONE: u8 = 14;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;
const EXT_KEY_SHARE: u16 = 0x0033;
const EXT_RENEGOTIATION_INFO: u16 = 0xff01;

const GROUP_X25519: u16 = 0x001d;
const GROUPS: [u16; 6] = [GROUP_X25519, 0x0017, 0x0018, 0x0019, 0x0100, 0x0101];
const SIGNATURE_ALGORITHMS: [u16; 11] = [0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601, 0x0203, 0x0201];

const MAX_RECORD: usize = 16384 + 2048;
const MAX_FLIGHT: usize = 256 * 1024;

/// How the server answered a single-suite ClientHello.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    Accepted(Negotiated),
    /// Spoke TLS but turned the pair down (alert, different version/suite, or hang-up).
    Refused,
    /// Answered with something other than TLS records, or not at all.
    NotTls,
}

/// Plaintext details of the server flight, only visible up to TLS 1.2.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub certificate: Option<Vec<u8>>,
    pub client_cert_requested: bool,
}

#[derive(Default)]
struct Flight {
    accepted: bool,
    details: Negotiated,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ServerHello {
    pub version: u16,
    pub cipher: u16,
}

/// Offer `suite` under `version` only. With `want_details` the rest of a ≤ TLS 1.2 flight is read
/// to capture the certificate and any client-certificate request.
///
/// Only a failed TCP connect is an error; anything after that is a verdict on the pair.
pub(crate) async fn attempt(
    addr: SocketAddr,
    version: ProtocolVersion,
    suite: u16,
    server_name: Option<&str>,
    want_details: bool,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> io::Result<Reply> {
    let mut stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(res) => res?,
        Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))),
    };
    let hello = client_hello(version, suite, server_name);
    let mut flight = Flight::default();
    let outcome = timeout(handshake_timeout, exchange(&mut stream, &hello, version, suite, want_details, &mut flight)).await;
    Ok(match outcome {
        Ok(Ok(reply)) => reply,
        _ if flight.accepted => Reply::Accepted(flight.details),
        Ok(Err(_)) => Reply::Refused,
        Err(_) => Reply::NotTls,
    })
}

async fn exchange(
    stream: &mut TcpStream,
    hello: &[u8],
    version: ProtocolVersion,
    suite: u16,
    want_details: bool,
    flight: &mut Flight,
) -> io::Result<Reply> {
    stream.write_all(hello).await?;
    let mut messages = HandshakeBuffer::default();
    loop {
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await?;
        match header[0] {
            CONTENT_HANDSHAKE => {}
            CONTENT_ALERT if !flight.accepted => return Ok(Reply::Refused),
            CONTENT_ALERT => return Ok(Reply::Accepted(std::mem::take(&mut flight.details))),
            _ => return Ok(Reply::NotTls),
        }
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if header[1] != 3 || len == 0 || len > MAX_RECORD {
            return Ok(Reply::NotTls);
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        messages.push(&body);
        if messages.buf.len() > MAX_FLIGHT {
            return Ok(Reply::NotTls);
        }

        while let Some((kind, msg)) = messages.next_message() {
            match kind {
                HS_SERVER_HELLO => {
                    let Some(sh) = parse_server_hello(&msg) else { return Ok(Reply::NotTls) };
                    if sh.version != version.wire() || sh.cipher != suite {
                        return Ok(Reply::Refused);
                    }
                    flight.accepted = true;
                    if !want_details || version == ProtocolVersion::Tls13 {
                        return Ok(Reply::Accepted(std::mem::take(&mut flight.details)));
                    }
                }
                HS_CERTIFICATE => flight.details.certificate = first_certificate(&msg),
                HS_CERTIFICATE_REQUEST => flight.details.client_cert_requested = true,
                HS_SERVER_HELLO_DONE => return Ok(Reply::Accepted(std::mem::take(&mut flight.details))),
                _ => {}
            }
        }
    }
}

#[derive(Default)]
struct HandshakeBuffer {
    buf: Vec<u8>,
}

impl HandshakeBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_message(&mut self) -> Option<(u8, Vec<u8>)> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = read_u24(&self.buf[1..4]);
        if self.buf.len() < 4 + len {
            return None;
        }
        let kind = self.buf[0];
        let body = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Some((kind, body))
    }
}

pub(crate) fn client_hello(version: ProtocolVersion, suite: u16, server_name: Option<&str>) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut body = Vec::with_capacity(256);
    body.extend_from_slice(&version.legacy_wire().to_be_bytes());
    let mut random = [0u8; 32];
    rng.fill_bytes(&mut random);
    body.extend_from_slice(&random);
    if version == ProtocolVersion::Tls13 {
        let mut session_id = [0u8; 32];
        rng.fill_bytes(&mut session_id);
        body.push(32);
        body.extend_from_slice(&session_id);
    } else {
        body.push(0);
    }
    push_u16(&mut body, 2);
    body.extend_from_slice(&suite.to_be_bytes());
    body.extend_from_slice(&[1, 0]);
    if version != ProtocolVersion::Ssl30 {
        let ext = extensions(version, server_name, &mut rng);
        push_u16(&mut body, ext.len());
        body.extend_from_slice(&ext);
    }

    let mut handshake = vec![HS_CLIENT_HELLO];
    push_u24(&mut handshake, body.len());
    handshake.extend_from_slice(&body);

    let record_version: u16 = if version == ProtocolVersion::Ssl30 { 0x0300 } else { 0x0301 };
    let mut record = vec![CONTENT_HANDSHAKE];
    record.extend_from_slice(&record_version.to_be_bytes());
    push_u16(&mut record, handshake.len());
    record.extend_from_slice(&handshake);
    record
}

fn extensions(version: ProtocolVersion, server_name: Option<&str>, rng: &mut impl RngCore) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(name) = server_name {
        let mut entry = vec![0u8];
        push_u16(&mut entry, name.len());
        entry.extend_from_slice(name.as_bytes());
        let mut list = Vec::new();
        push_u16(&mut list, entry.len());
        list.extend_from_slice(&entry);
        push_extension(&mut out, EXT_SERVER_NAME, &list);
    }
    push_extension(&mut out, EXT_SUPPORTED_GROUPS, &u16_list(&GROUPS));
    push_extension(&mut out, EXT_EC_POINT_FORMATS, &[1, 0]);
    if version >= ProtocolVersion::Tls12 {
        push_extension(&mut out, EXT_SIGNATURE_ALGORITHMS, &u16_list(&SIGNATURE_ALGORITHMS));
    }
    push_extension(&mut out, EXT_RENEGOTIATION_INFO, &[0]);
    if version == ProtocolVersion::Tls13 {
        push_extension(&mut out, EXT_SUPPORTED_VERSIONS, &[2, 0x03, 0x04]);
        // any 32 bytes form a valid x25519 share; the handshake is never completed
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);
        let mut share = GROUP_X25519.to_be_bytes().to_vec();
        push_u16(&mut share, key.len());
        share.extend_from_slice(&key);
        let mut shares = Vec::new();
        push_u16(&mut shares, share.len());
        shares.extend_from_slice(&share);
        push_extension(&mut out, EXT_KEY_SHARE, &shares);
    }
    out
}

/// Negotiated version (honouring `supported_versions`) and cipher from a ServerHello body.
pub(crate) fn parse_server_hello(msg: &[u8]) -> Option<ServerHello> {
    let mut version = read_u16(msg.get(0..2)?);
    let sid_len = *msg.get(34)? as usize;
    let mut pos = 35 + sid_len;
    let cipher = read_u16(msg.get(pos..pos + 2)?);
    pos += 3;
    if let Some(len) = msg.get(pos..pos + 2) {
        let len = read_u16(len) as usize;
        let mut exts = msg.get(pos + 2..pos + 2 + len)?;
        while exts.len() >= 4 {
            let kind = read_u16(&exts[0..2]);
            let len = read_u16(&exts[2..4]) as usize;
            let data = exts.get(4..4 + len)?;
            if kind == EXT_SUPPORTED_VERSIONS && len == 2 {
                version = read_u16(data);
            }
            exts = &exts[4 + len..];
        }
    }
    Some(ServerHello { version, cipher })
}

/// Leaf certificate DER from a ≤ TLS 1.2 Certificate message.
fn first_certificate(msg: &[u8]) -> Option<Vec<u8>> {
    let len = read_u24(msg.get(3..6)?);
    msg.get(6..6 + len).filter(|der| !der.is_empty()).map(|der| der.to_vec())
}

fn push_extension(out: &mut Vec<u8>, kind: u16, data: &[u8]) {
    out.extend_from_slice(&kind.to_be_bytes());
    push_u16(out, data.len());
    out.extend_from_slice(data);
}

fn u16_list(items: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + items.len() * 2);
    push_u16(&mut out, items.len() * 2);
    for item in items {
        out.extend_from_slice(&item.to_be_bytes());
    }
    out
}

fn push_u16(out: &mut Vec<u8>, n: usize) {
    out.extend_from_slice(&(n as u16).to_be_bytes());
}

fn push_u24(out: &mut Vec<u8>, n: usize) {
    out.extend_from_slice(&(n as u32).to_be_bytes()[1..]);
}

fn read_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn read_u24(b: &[u8]) -> usize {
    ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize
}
