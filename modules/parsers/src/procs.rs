//! Tab-separated process table: `pid user comm base64(cmdline) base64(environ)`.
//!
//! cmdline and environ are the raw NUL-separated `/proc` contents, base64 encoded so that
//! arguments containing whitespace survive the trip. A process that exited while the table
//! was being produced leaves a short row behind; such rows are dropped.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use fleetaudit_core::Process;
use tracing::debug;

pub fn parse_process_table(output: &str) -> Vec<Process> {
    output
        .lines()
        .filter_map(|line| {
            let p = parse_row(line);
            if p.is_none() && !line.trim().is_empty() {
                debug!(line, "skipping process row");
            }
            p
        })
        .collect()
}

fn parse_row(line: &str) -> Option<Process> {
    let fields: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
    if fields.len() != 5 {
        return None;
    }
    let pid = fields[0].trim().parse().ok()?;
    let user = fields[1].trim();
    let command_name = fields[2].trim();
    if user.is_empty() || command_name.is_empty() {
        return None;
    }
    Some(Process {
        command_name: command_name.to_string(),
        pid,
        user: user.to_string(),
        cmdline: decode_nul_list(fields[3])?,
        env: decode_nul_list(fields[4])?,
        ports: Vec::new(),
    })
}

fn decode_nul_list(field: &str) -> Option<Vec<String>> {
    let raw = STANDARD.decode(field.trim()).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        STANDARD.encode(s.as_bytes())
    }

    #[test]
    fn parses_rows_and_splits_nul_lists() {
        let text = format!(
            "1\troot\tsystemd\t{}\t{}\n812\tvcap\tnginx\t{}\t{}\n",
            b64("/sbin/init\0splash\0"),
            b64(""),
            b64("nginx\0-c\0/etc/my config.conf\0"),
            b64("PATH=/bin\0HOME=/home/vcap\0"),
        );
        let procs = parse_process_table(&text);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 1);
        assert_eq!(procs[0].user, "root");
        assert_eq!(procs[0].cmdline, vec!["/sbin/init", "splash"]);
        assert!(procs[0].env.is_empty());
        assert_eq!(procs[1].cmdline, vec!["nginx", "-c", "/etc/my config.conf"]);
        assert_eq!(procs[1].env, vec!["PATH=/bin", "HOME=/home/vcap"]);
    }

    #[test]
    fn vanished_processes_are_skipped() {
        let text = format!("44\troot\tkworker\n45\t\t\t\t\nxx\troot\tbash\t{}\t{}\n46\troot\tbash\t{}\t{}\n", b64(""), b64(""), b64("bash\0"), b64(""));
        let procs = parse_process_table(&text);
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 46);
    }
}
