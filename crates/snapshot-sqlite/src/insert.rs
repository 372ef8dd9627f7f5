use crate::Db;
use anyhow::Result;
use fleetaudit_core::{HostResult, Port, Snapshot, TlsInformation};
use rusqlite::{params, Connection};
use time::format_description::well_known::Rfc3339;

impl Db {
    /// Writes the whole snapshot in one transaction and returns its sequence number.
    pub fn insert_snapshot(&mut self, snapshot: &Snapshot) -> Result<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO snapshots(snapshot_id, created_at, host_count) VALUES (?,?,?)",
            params![snapshot.id.to_string(), snapshot.created_at.format(&Rfc3339)?, snapshot.hosts.len() as i64],
        )?;
        let seq = tx.last_insert_rowid();
        for host in &snapshot.hosts {
            insert_host(&tx, seq, host)?;
        }
        tx.commit()?;
        tracing::debug!(seq, hosts = snapshot.hosts.len(), "snapshot saved");
        Ok(seq)
    }
}

fn insert_host(conn: &Connection, seq: i64, host: &HostResult) -> Result<()> {
    conn.execute("INSERT INTO hosts(seq,name,address) VALUES (?,?,?)", params![seq, host.name, host.address])?;
    let host_id = conn.last_insert_rowid();

    for process in &host.processes {
        conn.execute(
            "INSERT INTO processes(host_id,command_name,pid,user,cmdline_json,env_json) VALUES (?,?,?,?,?,?)",
            params![
                host_id,
                process.command_name,
                process.pid,
                process.user,
                serde_json::to_string(&process.cmdline)?,
                serde_json::to_string(&process.env)?
            ],
        )?;
        let process_id = conn.last_insert_rowid();
        for port in &process.ports {
            insert_port(conn, process_id, port)?;
        }
    }
    for file in &host.files {
        conn.execute(
            "INSERT INTO files(host_id,path,permissions) VALUES (?,?,?)",
            params![host_id, file.path, file.permissions],
        )?;
    }
    for key in &host.ssh_keys {
        conn.execute(
            "INSERT INTO ssh_keys(host_id,key_type,key) VALUES (?,?,?)",
            params![host_id, key.key_type, key.key],
        )?;
    }
    Ok(())
}

fn insert_port(conn: &Connection, process_id: i64, port: &Port) -> Result<()> {
    conn.execute(
        "INSERT INTO ports(process_id,transport,address,port,state) VALUES (?,?,?,?,?)",
        params![process_id, port.protocol.as_str(), port.address, port.number, port.state],
    )?;
    let port_id = conn.last_insert_rowid();
    if let Some(tls) = &port.tls {
        insert_tls(conn, port_id, tls)?;
    }
    Ok(())
}

fn insert_tls(conn: &Connection, port_id: i64, tls: &TlsInformation) -> Result<()> {
    let cert = tls.certificate.as_ref();
    let expiration = cert.map(|c| c.expiration.format(&Rfc3339)).transpose()?;
    conn.execute(
        "INSERT INTO tls_informations(port_id,presence,mutual,scan_error,cert_bits,cert_expiration,cert_country,cert_province,cert_locality,cert_org,cert_cn)
         VALUES (?,?,?,?,?,?,?,?,?,?,?)",
        params![
            port_id,
            tls.presence,
            tls.mutual,
            tls.scan_error,
            cert.map(|c| c.bits),
            expiration,
            cert.map(|c| c.subject.country.as_str()),
            cert.map(|c| c.subject.province.as_str()),
            cert.map(|c| c.subject.locality.as_str()),
            cert.map(|c| c.subject.organization.as_str()),
            cert.map(|c| c.subject.common_name.as_str()),
        ],
    )?;
    let mut stmt = conn.prepare_cached("INSERT INTO tls_ciphers(port_id,version,name,quality) VALUES (?,?,?,?)")?;
    for (version, ciphers) in &tls.ciphers {
        for cipher in ciphers {
            stmt.execute(params![port_id, version, cipher.name, cipher.quality.as_str()])?;
        }
    }
    Ok(())
}
