//! lsof `-F` field output: one field per line, each prefixed by its field letter.
//!
//! ```text
//! p1234        process id
//! cnginx       command name
//! f6           file descriptor (starts a new file)
//! PTCP         protocol
//! n*:80        name: local[->remote] address
//! TST=LISTEN   TCP state
//! ```

use crate::{split_host_port, SocketEntry};
use fleetaudit_core::{Port, Transport};
use tracing::debug;

#[derive(Default)]
struct PendingFile {
    protocol: Option<Transport>,
    name: Option<String>,
    state: String,
}

pub fn parse_lsof_output(output: &str) -> Vec<SocketEntry> {
    let mut out = Vec::new();
    let mut pid: Option<u32> = None;
    let mut command = String::new();
    let mut file: Option<PendingFile> = None;

    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        let mut chars = line.chars();
        let Some(tag) = chars.next() else { continue };
        let value = chars.as_str();
        match tag {
            'p' => {
                flush(&mut out, pid, &command, file.take());
                pid = value.parse().ok();
                command.clear();
            }
            'c' => command = value.to_string(),
            'f' => {
                flush(&mut out, pid, &command, file.take());
                file = Some(PendingFile::default());
            }
            'P' => {
                if let Some(f) = file.as_mut() {
                    f.protocol = value.parse().ok();
                }
            }
            'n' => {
                if let Some(f) = file.as_mut() {
                    f.name = Some(value.to_string());
                }
            }
            'T' => {
                if let (Some(f), Some(state)) = (file.as_mut(), value.strip_prefix("ST=")) {
                    f.state = state.to_string();
                }
            }
            _ => {}
        }
    }
    flush(&mut out, pid, &command, file);
    out
}

fn flush(out: &mut Vec<SocketEntry>, pid: Option<u32>, command: &str, file: Option<PendingFile>) {
    let (Some(pid), Some(file)) = (pid, file) else { return };
    let (Some(protocol), Some(name)) = (file.protocol, file.name) else { return };
    let local = name.split("->").next().unwrap_or_default();
    match split_host_port(local) {
        Ok((address, number)) => out.push(SocketEntry {
            pid,
            command: command.to_string(),
            port: Port::new(protocol, address, number, file.state),
        }),
        Err(e) => debug!(name = %name, error = %e, "skipping lsof socket"),
    }
}
