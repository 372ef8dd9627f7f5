pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE snapshots (
  seq             INTEGER PRIMARY KEY AUTOINCREMENT,
  snapshot_id     TEXT NOT NULL UNIQUE,
  created_at      TEXT NOT NULL,
  host_count      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE hosts (
  host_id         INTEGER PRIMARY KEY AUTOINCREMENT,
  seq             INTEGER NOT NULL REFERENCES snapshots(seq) ON DELETE CASCADE,
  name            TEXT NOT NULL,
  address         TEXT NOT NULL
);

CREATE TABLE processes (
  process_id      INTEGER PRIMARY KEY AUTOINCREMENT,
  host_id         INTEGER NOT NULL REFERENCES hosts(host_id) ON DELETE CASCADE,
  command_name    TEXT NOT NULL,
  pid             INTEGER NOT NULL,
  user            TEXT NOT NULL,
  cmdline_json    TEXT NOT NULL,
  env_json        TEXT NOT NULL
);

CREATE TABLE ports (
  port_id         INTEGER PRIMARY KEY AUTOINCREMENT,
  process_id      INTEGER NOT NULL REFERENCES processes(process_id) ON DELETE CASCADE,
  transport       TEXT NOT NULL CHECK (transport IN ('tcp','udp')),
  address         TEXT NOT NULL,
  port            INTEGER NOT NULL CHECK (port BETWEEN 0 AND 65535),
  state           TEXT NOT NULL
);

CREATE TABLE tls_informations (
  port_id         INTEGER PRIMARY KEY REFERENCES ports(port_id) ON DELETE CASCADE,
  presence        INTEGER NOT NULL CHECK (presence IN (0,1)),
  mutual          INTEGER NOT NULL CHECK (mutual IN (0,1)) DEFAULT 0,
  scan_error      TEXT,
  cert_bits       INTEGER,
  cert_expiration TEXT,
  cert_country    TEXT,
  cert_province   TEXT,
  cert_locality   TEXT,
  cert_org        TEXT,
  cert_cn         TEXT
);

CREATE TABLE tls_ciphers (
  cipher_id       INTEGER PRIMARY KEY AUTOINCREMENT,
  port_id         INTEGER NOT NULL REFERENCES tls_informations(port_id) ON DELETE CASCADE,
  version         TEXT NOT NULL,
  name            TEXT NOT NULL,
  quality         TEXT NOT NULL CHECK (quality IN ('acceptable','weak','broken'))
);

CREATE TABLE files (
  file_id         INTEGER PRIMARY KEY AUTOINCREMENT,
  host_id         INTEGER NOT NULL REFERENCES hosts(host_id) ON DELETE CASCADE,
  path            TEXT NOT NULL,
  permissions     INTEGER NOT NULL
);

CREATE TABLE ssh_keys (
  key_id          INTEGER PRIMARY KEY AUTOINCREMENT,
  host_id         INTEGER NOT NULL REFERENCES hosts(host_id) ON DELETE CASCADE,
  key_type        TEXT NOT NULL,
  key             TEXT NOT NULL
);

CREATE INDEX idx_hosts_seq ON hosts(seq);
CREATE INDEX idx_processes_host ON processes(host_id);
CREATE INDEX idx_ports_process ON ports(process_id);
CREATE INDEX idx_ciphers_port ON tls_ciphers(port_id);
CREATE INDEX idx_files_host ON files(host_id);
CREATE INDEX idx_ssh_keys_host ON ssh_keys(host_id);
CREATE INDEX idx_ssh_keys_key ON ssh_keys(key);

COMMIT;
"#;
