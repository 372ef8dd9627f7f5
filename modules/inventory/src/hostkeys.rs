//! SSH host-key collection without authenticating.
//!
//! Each connection runs the transport handshake only as far as the server's key-exchange
//! reply, which carries the host key for the one algorithm family we offered. One connection
//! per family yields every key the server holds.

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use fleetaudit_core::SshHostKey;
use rand::RngCore;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const CLIENT_VERSION: &str = "SSH-2.0-fleetaudit_0.1";

const MSG_DISCONNECT: u8 = 1;
const MSG_KEXINIT: u8 = 20;
const MSG_KEX_INIT: u8 = 30;
const MSG_KEX_REPLY: u8 = 31;

const MAX_PACKET: usize = 256 * 1024;
const MAX_PREAMBLE_LINES: usize = 32;

/// Host-key algorithms grouped by the key type they produce.
const KEY_FAMILIES: &[&[&str]] = &[
    &["ssh-ed25519"],
    &["ecdsa-sha2-nistp256"],
    &["ecdsa-sha2-nistp384"],
    &["ecdsa-sha2-nistp521"],
    &["rsa-sha2-512", "rsa-sha2-256", "ssh-rsa"],
    &["ssh-dss"],
];

const CURVE25519: &[&str] = &["curve25519-sha256", "curve25519-sha256@libssh.org"];
const DH_GROUP14: &[&str] = &["diffie-hellman-group14-sha256", "diffie-hellman-group14-sha1"];

/// Every host key offered by the SSH server at `addr`.
pub async fn scan_host_keys(addr: SocketAddr, io_timeout: Duration) -> Result<Vec<SshHostKey>> {
    let first = timeout(io_timeout, exchange(addr, None))
        .await
        .map_err(|_| anyhow!("ssh key exchange with {addr} timed out"))??;

    let families: Vec<&[&str]> = KEY_FAMILIES
        .iter()
        .copied()
        .filter(|family| family.iter().any(|alg| first.server_host_key_algorithms.iter().any(|s| s == alg)))
        .collect();

    let mut keys = Vec::new();
    for family in families {
        match timeout(io_timeout, exchange(addr, Some(family))).await {
            Ok(Ok(Exchange { key: Some(key), .. })) => {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(%addr, family = family[0], error = %e, "host key not retrieved"),
            Err(_) => debug!(%addr, family = family[0], "host key exchange timed out"),
        }
    }
    Ok(keys)
}

struct Exchange {
    server_host_key_algorithms: Vec<String>,
    key: Option<SshHostKey>,
}

/// One connection. Without a family only the server's algorithm lists are read.
async fn exchange(addr: SocketAddr, family: Option<&[&str]>) -> Result<Exchange> {
    let stream = TcpStream::connect(addr).await.with_context(|| format!("connect to {addr}"))?;
    let mut conn = BufReader::new(stream);
    conn.get_mut().write_all(format!("{CLIENT_VERSION}\r\n").as_bytes()).await?;
    read_server_version(&mut conn).await?;

    let server = loop {
        let payload = read_packet(&mut conn).await?;
        match payload.first() {
            Some(&MSG_KEXINIT) => break KexInit::parse(&payload).ok_or_else(|| anyhow!("malformed KEXINIT"))?,
            Some(&MSG_DISCONNECT) => bail!("server disconnected"),
            _ => continue,
        }
    };
    let Some(family) = family else {
        return Ok(Exchange { server_host_key_algorithms: server.host_key_algorithms, key: None });
    };

    let offered: Vec<&str> = family
        .iter()
        .copied()
        .filter(|alg| server.host_key_algorithms.iter().any(|s| s == alg))
        .collect();
    let (kex, init) = if let Some(kex) = pick(&server.kex_algorithms, CURVE25519) {
        (kex, curve25519_init())
    } else if let Some(kex) = pick(&server.kex_algorithms, DH_GROUP14) {
        (kex, dh_group14_init())
    } else {
        bail!("no supported key exchange among {:?}", server.kex_algorithms);
    };

    let client = server.answer(&kex, &offered);
    let stream = conn.get_mut();
    stream.write_all(&frame(&client)).await?;
    stream.write_all(&frame(&init)).await?;

    loop {
        let payload = read_packet(&mut conn).await?;
        match payload.first() {
            Some(&MSG_KEX_REPLY) => {
                let mut r = Reader::new(&payload[1..]);
                let blob = r.string().ok_or_else(|| anyhow!("malformed key exchange reply"))?;
                let key_type = Reader::new(blob)
                    .string()
                    .map(|t| String::from_utf8_lossy(t).into_owned())
                    .ok_or_else(|| anyhow!("malformed host key blob"))?;
                let key = SshHostKey { key_type, key: STANDARD.encode(blob) };
                return Ok(Exchange { server_host_key_algorithms: server.host_key_algorithms, key: Some(key) });
            }
            Some(&MSG_DISCONNECT) => bail!("server disconnected during key exchange"),
            _ => continue,
        }
    }
}

async fn read_server_version<R: AsyncRead + Unpin>(conn: &mut BufReader<R>) -> Result<String> {
    for _ in 0..MAX_PREAMBLE_LINES {
        let mut line = String::new();
        if conn.read_line(&mut line).await? == 0 {
            bail!("connection closed before version exchange");
        }
        if line.starts_with("SSH-") {
            return Ok(line.trim_end().to_string());
        }
    }
    bail!("no SSH version line")
}

fn pick(server: &[String], ours: &[&str]) -> Option<String> {
    ours.iter().find(|alg| server.iter().any(|s| s == *alg)).map(|s| s.to_string())
}

fn curve25519_init() -> Vec<u8> {
    let mut q_c = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut q_c);
    let mut payload = vec![MSG_KEX_INIT];
    put_string(&mut payload, &q_c);
    payload
}

fn dh_group14_init() -> Vec<u8> {
    // 2048-bit e with the top bit clear: below the group prime, no mpint sign byte needed
    let mut e = [0u8; 256];
    rand::thread_rng().fill_bytes(&mut e);
    e[0] = (e[0] & 0x7f).max(1);
    let mut payload = vec![MSG_KEX_INIT];
    put_string(&mut payload, &e);
    payload
}

/// The algorithm name-lists of a KEXINIT message.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KexInit {
    kex_algorithms: Vec<String>,
    host_key_algorithms: Vec<String>,
    /// encryption, mac, compression and language lists, both directions
    rest: Vec<Vec<String>>,
}

impl KexInit {
    fn parse(payload: &[u8]) -> Option<KexInit> {
        let mut r = Reader::new(payload.get(17..)?);
        let kex_algorithms = r.name_list()?;
        let host_key_algorithms = r.name_list()?;
        let mut rest = Vec::with_capacity(8);
        for _ in 0..8 {
            rest.push(r.name_list()?);
        }
        Some(KexInit { kex_algorithms, host_key_algorithms, rest })
    }

    /// Our KEXINIT: the chosen kex and host-key family, echoing the server's remaining lists
    /// so negotiation cannot fail on ciphers we never use.
    fn answer(&self, kex: &str, host_keys: &[&str]) -> Vec<u8> {
        let mut payload = vec![MSG_KEXINIT];
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        payload.extend_from_slice(&cookie);
        put_string(&mut payload, kex.as_bytes());
        put_string(&mut payload, host_keys.join(",").as_bytes());
        for list in &self.rest {
            put_string(&mut payload, list.join(",").as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn string(&mut self) -> Option<&'a [u8]> {
        let len = u32::from_be_bytes(self.buf.get(..4)?.try_into().ok()?) as usize;
        let s = self.buf.get(4..4 + len)?;
        self.buf = &self.buf[4 + len..];
        Some(s)
    }

    fn name_list(&mut self) -> Option<Vec<String>> {
        let raw = std::str::from_utf8(self.string()?).ok()?;
        Some(raw.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
    }
}

fn put_string(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s);
}

/// Unencrypted binary packet with zero padding to an 8-byte boundary.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut padding = 8 - (5 + payload.len()) % 8;
    if padding < 4 {
        padding += 8;
    }
    let mut out = Vec::with_capacity(5 + payload.len() + padding);
    out.extend_from_slice(&((1 + payload.len() + padding) as u32).to_be_bytes());
    out.push(padding as u8);
    out.extend_from_slice(payload);
    out.resize(out.len() + padding, 0);
    out
}

async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let len = r.read_u32().await? as usize;
    if len < 2 || len > MAX_PACKET {
        bail!("bad packet length {len}");
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    let padding = body[0] as usize;
    if padding + 1 > len {
        bail!("bad padding length {padding}");
    }
    Ok(body[1..len - padding].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fake_blob(key_type: &str) -> Vec<u8> {
        let mut blob = Vec::new();
        put_string(&mut blob, key_type.as_bytes());
        put_string(&mut blob, &[0x42; 32]);
        blob
    }

    fn server_kexinit(host_keys: &str) -> Vec<u8> {
        let mut payload = vec![MSG_KEXINIT];
        payload.extend_from_slice(&[0u8; 16]);
        for list in [
            "curve25519-sha256,diffie-hellman-group14-sha256",
            host_keys,
            "aes128-ctr",
            "aes128-ctr",
            "hmac-sha2-256",
            "hmac-sha2-256",
            "none",
            "none",
            "",
            "",
        ] {
            put_string(&mut payload, list.as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(&[0u8; 4]);
        payload
    }

    /// Minimal SSH server: answers each key exchange with a blob of the first offered family.
    async fn fake_ssh_server(host_keys: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut conn = BufReader::new(sock);
                    conn.get_mut().write_all(b"SSH-2.0-FakeSSH_1.0\r\n").await.unwrap();
                    conn.get_mut().write_all(&frame(&server_kexinit(host_keys))).await.unwrap();
                    let mut version = String::new();
                    conn.read_line(&mut version).await.unwrap();
                    assert!(version.starts_with("SSH-2.0-"));
                    let Ok(client) = read_packet(&mut conn).await else { return };
                    let client = KexInit::parse(&client).unwrap();
                    let init = read_packet(&mut conn).await.unwrap();
                    assert_eq!(init[0], MSG_KEX_INIT);
                    let key_type = match client.host_key_algorithms[0].as_str() {
                        "rsa-sha2-512" | "rsa-sha2-256" => "ssh-rsa",
                        other => other,
                    }
                    .to_string();
                    let mut reply = vec![MSG_KEX_REPLY];
                    put_string(&mut reply, &fake_blob(&key_type));
                    put_string(&mut reply, &[1u8; 32]);
                    put_string(&mut reply, &[2u8; 64]);
                    conn.get_mut().write_all(&frame(&reply)).await.unwrap();
                });
            }
        });
        addr
    }

    #[test]
    fn frames_are_block_aligned() {
        for n in 0..40 {
            let framed = frame(&vec![7u8; n]);
            assert_eq!(framed.len() % 8, 0);
            assert!(framed[4] >= 4);
        }
    }

    #[tokio::test]
    async fn packet_framing_survives_a_read() {
        let framed = frame(b"\x14hello");
        let mut cursor = std::io::Cursor::new(framed);
        assert_eq!(read_packet(&mut cursor).await.unwrap(), b"\x14hello".to_vec());
    }

    #[test]
    fn answer_echoes_server_lists() {
        let server = KexInit::parse(&server_kexinit("ssh-ed25519,ssh-rsa")).unwrap();
        assert_eq!(server.host_key_algorithms, vec!["ssh-ed25519", "ssh-rsa"]);
        let ours = KexInit::parse(&server.answer("curve25519-sha256", &["ssh-rsa"])).unwrap();
        assert_eq!(ours.kex_algorithms, vec!["curve25519-sha256"]);
        assert_eq!(ours.host_key_algorithms, vec!["ssh-rsa"]);
        assert_eq!(ours.rest, server.rest);
    }

    #[tokio::test]
    async fn collects_one_key_per_family() {
        let addr = fake_ssh_server("ssh-ed25519,ecdsa-sha2-nistp256,rsa-sha2-512,ssh-rsa").await;
        let keys = scan_host_keys(addr, Duration::from_secs(2)).await.unwrap();
        let types: Vec<&str> = keys.iter().map(|k| k.key_type.as_str()).collect();
        assert_eq!(types, vec!["ssh-ed25519", "ecdsa-sha2-nistp256", "ssh-rsa"]);
        assert!(keys.iter().all(|k| k.key.starts_with("AAAA")));
    }

    #[tokio::test]
    async fn non_ssh_service_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = sock.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });
        assert!(scan_host_keys(addr, Duration::from_millis(500)).await.is_err());
    }
}
