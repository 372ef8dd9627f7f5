use crate::Db;
use anyhow::{Context, Result};
use fleetaudit_core::{
    AcceptedCipher, Certificate, CertificateSubject, CipherQuality, FileEntry, HostResult, Port, Process, Snapshot,
    SshHostKey, TlsInformation, Transport,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

impl Db {
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let cnt: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |r| r.get(0),
        )?;
        Ok(cnt > 0)
    }

    pub fn snapshot_count(&self) -> Result<i64> {
        Ok(self.conn.query_row("SELECT COUNT(1) FROM snapshots", [], |r| r.get(0))?)
    }

    /// Most recently saved snapshot, `None` on an empty database.
    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        let row = self
            .conn
            .query_row("SELECT seq, snapshot_id, created_at FROM snapshots ORDER BY seq DESC LIMIT 1", [], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
            })
            .optional()?;
        let Some((seq, id, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Snapshot {
            id: Uuid::parse_str(&id).with_context(|| format!("snapshot {seq} has a malformed id"))?,
            created_at: OffsetDateTime::parse(&created_at, &Rfc3339)?,
            hosts: load_hosts(&self.conn, seq)?,
        }))
    }
}

fn load_hosts(conn: &Connection, seq: i64) -> Result<Vec<HostResult>> {
    let mut stmt = conn.prepare("SELECT host_id, name, address FROM hosts WHERE seq=? ORDER BY host_id")?;
    let rows = stmt
        .query_map([seq], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut hosts = Vec::with_capacity(rows.len());
    for (host_id, name, address) in rows {
        let mut host = HostResult::new(name, address);
        host.processes = load_processes(conn, host_id)?;
        host.files = conn
            .prepare_cached("SELECT path, permissions FROM files WHERE host_id=? ORDER BY file_id")?
            .query_map([host_id], |r| Ok(FileEntry { path: r.get(0)?, permissions: r.get(1)? }))?
            .collect::<rusqlite::Result<_>>()?;
        host.ssh_keys = conn
            .prepare_cached("SELECT key_type, key FROM ssh_keys WHERE host_id=? ORDER BY key_id")?
            .query_map([host_id], |r| Ok(SshHostKey { key_type: r.get(0)?, key: r.get(1)? }))?
            .collect::<rusqlite::Result<_>>()?;
        hosts.push(host);
    }
    Ok(hosts)
}

fn load_processes(conn: &Connection, host_id: i64) -> Result<Vec<Process>> {
    let mut stmt = conn.prepare_cached(
        "SELECT process_id, command_name, pid, user, cmdline_json, env_json FROM processes WHERE host_id=? ORDER BY process_id",
    )?;
    let rows = stmt
        .query_map([host_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, u32>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut processes = Vec::with_capacity(rows.len());
    for (process_id, command_name, pid, user, cmdline, env) in rows {
        processes.push(Process {
            command_name,
            pid,
            user,
            cmdline: serde_json::from_str(&cmdline)?,
            env: serde_json::from_str(&env)?,
            ports: load_ports(conn, process_id)?,
        });
    }
    Ok(processes)
}

fn load_ports(conn: &Connection, process_id: i64) -> Result<Vec<Port>> {
    let mut stmt = conn
        .prepare_cached("SELECT port_id, transport, address, port, state FROM ports WHERE process_id=? ORDER BY port_id")?;
    let rows = stmt
        .query_map([process_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, u16>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut ports = Vec::with_capacity(rows.len());
    for (port_id, transport, address, number, state) in rows {
        let protocol: Transport = transport.parse().map_err(anyhow::Error::msg)?;
        let mut port = Port::new(protocol, address, number, state);
        port.tls = load_tls(conn, port_id)?;
        ports.push(port);
    }
    Ok(ports)
}

struct TlsRow {
    presence: bool,
    mutual: bool,
    scan_error: Option<String>,
    bits: Option<u32>,
    expiration: Option<String>,
    subject: [Option<String>; 5],
}

fn load_tls(conn: &Connection, port_id: i64) -> Result<Option<TlsInformation>> {
    let row = conn
        .prepare_cached(
            "SELECT presence, mutual, scan_error, cert_bits, cert_expiration, cert_country, cert_province, cert_locality, cert_org, cert_cn
             FROM tls_informations WHERE port_id=?",
        )?
        .query_row([port_id], |r| {
            Ok(TlsRow {
                presence: r.get(0)?,
                mutual: r.get(1)?,
                scan_error: r.get(2)?,
                bits: r.get(3)?,
                expiration: r.get(4)?,
                subject: [r.get(5)?, r.get(6)?, r.get(7)?, r.get(8)?, r.get(9)?],
            })
        })
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };

    let certificate = match (row.bits, row.expiration) {
        (Some(bits), Some(expiration)) => {
            let [country, province, locality, organization, common_name] = row.subject.map(Option::unwrap_or_default);
            Some(Certificate {
                bits,
                expiration: OffsetDateTime::parse(&expiration, &Rfc3339)?,
                subject: CertificateSubject { country, province, locality, organization, common_name },
            })
        }
        _ => None,
    };

    let mut info = TlsInformation {
        presence: row.presence,
        certificate,
        mutual: row.mutual,
        scan_error: row.scan_error,
        ..Default::default()
    };
    let mut stmt =
        conn.prepare_cached("SELECT version, name, quality FROM tls_ciphers WHERE port_id=? ORDER BY cipher_id")?;
    let mut rows = stmt.query(params![port_id])?;
    while let Some(r) = rows.next()? {
        let version: String = r.get(0)?;
        let quality: CipherQuality = r.get::<_, String>(2)?.parse().map_err(anyhow::Error::msg)?;
        info.ciphers.entry(version).or_default().push(AcceptedCipher::new(r.get::<_, String>(1)?, quality));
    }
    Ok(Some(info))
}
