//! Parsers for the text emitted by remote inventory tools (lsof, netstat, ps-style tables, find).
//!
//! Every parser is line-tolerant: a malformed or irrelevant line is skipped, never fatal.

mod files;
mod lsof;
mod netstat;
mod procs;

pub use files::parse_file_listing;
pub use lsof::parse_lsof_output;
pub use netstat::parse_netstat_output;
pub use procs::parse_process_table;

use fleetaudit_core::Port;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("failed to split address {0:?}")]
    Address(String),
    #[error("invalid number {0:?}")]
    Number(String),
}

/// A socket observed bound to a process.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketEntry {
    pub pid: u32,
    pub command: String,
    pub port: Port,
}

/// Group socket entries by owning process id, keeping each process's ports in input order.
pub fn ports_by_pid(entries: Vec<SocketEntry>) -> HashMap<u32, Vec<Port>> {
    let mut out: HashMap<u32, Vec<Port>> = HashMap::new();
    for e in entries {
        out.entry(e.pid).or_default().push(e.port);
    }
    out
}

/// Split `host:port`, accepting `[v6]:port`, `*:port` and the abbreviated `:::port` form.
pub fn split_host_port(addr: &str) -> Result<(String, u16), ParseError> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| ParseError::Address(addr.to_string()))?;
        let port = tail.strip_prefix(':').ok_or_else(|| ParseError::Address(addr.to_string()))?;
        (host, port)
    } else {
        addr.rsplit_once(':').ok_or_else(|| ParseError::Address(addr.to_string()))?
    };
    if host.is_empty() {
        return Err(ParseError::Address(addr.to_string()));
    }
    let number = port.parse::<u16>().map_err(|_| ParseError::Number(port.to_string()))?;
    Ok((host.to_string(), number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetaudit_core::Transport;

    #[test]
    fn split_forms() {
        assert_eq!(split_host_port("0.0.0.0:22").unwrap(), ("0.0.0.0".to_string(), 22));
        assert_eq!(split_host_port("*:80").unwrap(), ("*".to_string(), 80));
        assert_eq!(split_host_port("[::1]:631").unwrap(), ("::1".to_string(), 631));
        assert_eq!(split_host_port(":::22").unwrap(), ("::".to_string(), 22));
        assert_eq!(split_host_port("fe80::1:8080").unwrap(), ("fe80::1".to_string(), 8080));
    }

    #[test]
    fn split_rejects_garbage() {
        assert!(split_host_port("0.0.0.0:*").is_err());
        assert!(split_host_port("nocolon").is_err());
        assert!(split_host_port(":22").is_err());
        assert!(split_host_port("[::1]631").is_err());
    }

    #[test]
    fn groups_ports_per_pid() {
        let entries = vec![
            SocketEntry { pid: 7, command: "nginx".into(), port: Port::new(Transport::Tcp, "*", 80, "LISTEN") },
            SocketEntry { pid: 9, command: "sshd".into(), port: Port::new(Transport::Tcp, "*", 22, "LISTEN") },
            SocketEntry { pid: 7, command: "nginx".into(), port: Port::new(Transport::Tcp, "*", 443, "LISTEN") },
        ];
        let grouped = ports_by_pid(entries);
        let nginx: Vec<u16> = grouped[&7].iter().map(|p| p.number).collect();
        assert_eq!(nginx, vec![80, 443]);
        assert_eq!(grouped[&9].len(), 1);
    }
}
