//! Line-oriented connection tables as printed by `netstat -tunap`.
//!
//! ```text
//! Proto Recv-Q Send-Q Local Address   Foreign Address  State   PID/Program name
//! tcp        0      0 0.0.0.0:22      0.0.0.0:*        LISTEN  812/sshd
//! udp        0      0 0.0.0.0:68      0.0.0.0:*                601/dhclient
//! ```

use crate::{split_host_port, ParseError, SocketEntry};
use fleetaudit_core::{Port, Transport};
use tracing::{debug, warn};

struct NetstatLine<'a> {
    protocol: Transport,
    local: &'a str,
    state: &'a str,
    pid: u32,
    command: &'a str,
}

pub fn parse_netstat_output(output: &str) -> Vec<SocketEntry> {
    let mut out = Vec::new();
    for line in output.lines() {
        let info = match parse_line(line) {
            Ok(info) => info,
            Err(e) => {
                debug!(line, error = %e, "skipping netstat line");
                continue;
            }
        };
        match split_host_port(info.local) {
            Ok((address, number)) => out.push(SocketEntry {
                pid: info.pid,
                command: info.command.to_string(),
                port: Port::new(info.protocol, address, number, info.state),
            }),
            Err(e) => warn!(address = info.local, error = %e, "failed to split local address"),
        }
    }
    out
}

fn parse_line(line: &str) -> Result<NetstatLine<'_>, ParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return Err(ParseError::MissingField("pid/command"));
    }
    let protocol = match fields[0] {
        "tcp" | "tcp6" | "udp" | "udp6" => fields[0].parse().map_err(|_| ParseError::UnsupportedProtocol(fields[0].to_string()))?,
        other => return Err(ParseError::UnsupportedProtocol(other.to_string())),
    };
    // udp rows carry no state column
    let (state, process) = if fields.len() == 6 { ("", fields[5]) } else { (fields[5], fields[6]) };
    let (pid, command) = process.split_once('/').ok_or(ParseError::MissingField("pid/command"))?;
    let pid = pid.parse().map_err(|_| ParseError::Number(pid.to_string()))?;
    Ok(NetstatLine { protocol, local: fields[3], state, pid, command })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Active Internet connections (servers and established)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN      812/sshd
tcp        0      0 127.0.0.1:5432          0.0.0.0:*               LISTEN      930/postgres
tcp        0     36 10.0.0.4:22             10.0.0.9:50022          ESTABLISHED 1402/sshd: vcap
tcp6       0      0 :::22                   :::*                    LISTEN      812/sshd
udp        0      0 0.0.0.0:68              0.0.0.0:*                           601/dhclient
tcp        0      0 0.0.0.0:111             0.0.0.0:*               LISTEN      -
";

    #[test]
    fn parses_rows_with_pid_and_command() {
        let entries = parse_netstat_output(SAMPLE);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].pid, 812);
        assert_eq!(entries[0].command, "sshd");
        assert_eq!(entries[0].port, Port::new(Transport::Tcp, "0.0.0.0", 22, "LISTEN"));
        assert_eq!(entries[2].port.state, "ESTABLISHED");
        assert_eq!(entries[2].command, "sshd:");
    }

    #[test]
    fn normalises_abbreviated_ipv6() {
        let entries = parse_netstat_output(SAMPLE);
        assert_eq!(entries[3].port, Port::new(Transport::Tcp, "::", 22, "LISTEN"));
    }

    #[test]
    fn udp_rows_have_empty_state() {
        let entries = parse_netstat_output(SAMPLE);
        assert_eq!(entries[4].port, Port::new(Transport::Udp, "0.0.0.0", 68, ""));
        assert_eq!(entries[4].pid, 601);
    }

    #[test]
    fn rejects_other_protocols_and_missing_process() {
        assert!(parse_line("unix  2      [ ACC ]     STREAM     LISTENING     17633    1/init").is_err());
        assert!(parse_line("tcp 0 0 0.0.0.0:111 0.0.0.0:* LISTEN -").is_err());
        assert!(parse_line("tcp 0 0").is_err());
    }

    #[test]
    fn bad_local_address_skips_only_that_entry() {
        let text = "tcp 0 0 garbage 0.0.0.0:* LISTEN 1/a\ntcp 0 0 0.0.0.0:80 0.0.0.0:* LISTEN 2/b\n";
        let entries = parse_netstat_output(text);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pid, 2);
    }
}
