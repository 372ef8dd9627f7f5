use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fleet_scan::{DirectSource, DirectoryOptions, FleetDirectorySource, FleetScanner, Gateway, HostSource, ListSource};
use fleetaudit_core::logging::init_logging_with_config;
use fleetaudit_core::{Snapshot, SnapshotStore, StoreError};
use inventory::{Collector, CollectorOptions, SshOptions};
use ipnet::IpNet;
use report::{render, Manifest, OutputFormat};
use snapshot_sqlite::Db;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tls_probe::{ProbeOptions, TlsProber};
use tracing::info;

mod config;
use config::{Config, DirectoryConfig, DEFAULT_DATABASE};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Format { Table, Csv, Json }

impl From<Format> for OutputFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Table => OutputFormat::Table,
            Format::Csv => OutputFormat::Csv,
            Format::Json => OutputFormat::Json,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "fleetaudit", version, about = "Fleet inventory, TLS probing and compliance reports")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./fleetaudit.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Snapshot database (default: ./fleetaudit.db)
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,
    /// Log level when RUST_LOG is unset (overrides the config file)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Scan the fleet and save a snapshot
    Scan {
        /// Single host address
        #[arg(conflicts_with_all = ["targets", "deployment"])]
        target: Option<String>,
        /// File with one `address` or `name address` per line (# comments and blanks ignored)
        #[arg(long, value_name = "FILE", conflicts_with = "deployment")]
        targets: Option<PathBuf>,
        /// Deployment to enumerate through the fleet directory (overrides the config file)
        #[arg(long)]
        deployment: Option<String>,
        /// SSH login user
        #[arg(long)]
        user: Option<String>,
        /// SSH private key
        #[arg(long, value_name = "FILE")]
        identity_file: Option<PathBuf>,
        #[arg(long)]
        ssh_port: Option<u16>,
        /// Run inventory commands through `sudo -n`
        #[arg(long, default_value_t = false)]
        sudo: bool,
        /// Preferred network (CIDR) when a host has several addresses
        #[arg(long)]
        network: Option<String>,
    },
    /// Print every rule's violations for the latest snapshot; exits 1 if any
    Report {
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
    /// Print the listening-process manifest of the latest snapshot as YAML
    Manifest,
    /// Compare a manifest file against the latest snapshot; exits 1 on any finding
    Audit {
        /// Manifest YAML as produced by `manifest`, optionally with `ignore_ports` per host entry
        #[arg(long, value_name = "FILE")]
        manifest: PathBuf,
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
    /// List every process port of the latest snapshot with its TLS details
    Show {
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut cfg = config::load_config(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        cfg.logging.level = level.clone();
    }
    init_logging_with_config(&cfg.logging);

    let database = cli
        .database
        .clone()
        .or_else(|| cfg.database.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE));

    match cli.command {
        Commands::Version => {
            println!("fleetaudit {} (core {})", env!("CARGO_PKG_VERSION"), fleetaudit_core::version());
        }
        Commands::Scan { target, targets, deployment, user, identity_file, ssh_port, sudo, network } => {
            let scan = &cfg.scan;
            let ssh = SshOptions {
                user: user.or_else(|| scan.user.clone()).unwrap_or_else(|| SshOptions::default().user),
                identity_file: identity_file.or_else(|| scan.identity_file.clone()),
                port: ssh_port.or(scan.ssh_port).unwrap_or(22),
                use_sudo: sudo || scan.use_sudo,
                command_timeout: scan
                    .command_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| SshOptions::default().command_timeout),
                ..SshOptions::default()
            };
            let preferred: Option<IpNet> = network
                .or_else(|| scan.preferred_network.clone())
                .map(|n| n.parse().with_context(|| format!("invalid network {n}")))
                .transpose()?;

            let source: Arc<dyn HostSource> = if let Some(t) = target {
                Arc::new(DirectSource::new(t, ssh.clone()))
            } else if let Some(path) = targets {
                let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
                Arc::new(ListSource::parse(&text, ssh.clone())?)
            } else if let Some(dir) = directory_config(&cfg, deployment)? {
                directory_source(&dir, ssh.clone())?
            } else {
                bail!("provide a target, --targets <file>, or a fleet directory (--deployment / config)");
            };

            let collector = Collector::new(CollectorOptions {
                ssh_port: ssh.port,
                extra_exclusions: scan.exclude_paths.clone(),
                ..CollectorOptions::default()
            });
            let defaults = ProbeOptions::default();
            let prober = Arc::new(TlsProber::new(ProbeOptions {
                connect_timeout: scan.connect_timeout_ms.map(Duration::from_millis).unwrap_or(defaults.connect_timeout),
                handshake_timeout: scan
                    .handshake_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.handshake_timeout),
            }));
            let scanner = FleetScanner::new(source, collector, prober).preferred_network(preferred);

            let rt = tokio::runtime::Runtime::new()?;
            let snapshot = rt.block_on(scanner.scan())?;
            let mut db = Db::open_or_create(&database)?;
            db.save(&snapshot)?;
            info!(id = %snapshot.id, hosts = snapshot.hosts.len(), db = %database.display(), "snapshot saved");
            println!("snapshot {} saved with {} host(s)", snapshot.id, snapshot.hosts.len());
        }
        Commands::Report { format } => {
            let snapshot = latest(&database)?;
            let reports = report::build_reports(&snapshot, &cfg.tls);
            render(&mut std::io::stdout().lock(), &reports, format.into())?;
            if report::has_violations(&reports) {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Manifest => {
            let snapshot = latest(&database)?;
            print!("{}", Manifest::from_snapshot(&snapshot).to_yaml()?);
        }
        Commands::Audit { manifest, format } => {
            let text =
                std::fs::read_to_string(&manifest).with_context(|| format!("reading {}", manifest.display()))?;
            let expected = Manifest::from_yaml(&text)?;
            let snapshot = latest(&database)?;
            let findings = report::audit::audit(&expected, &snapshot);
            render(&mut std::io::stdout().lock(), std::slice::from_ref(&findings), format.into())?;
            if !findings.is_empty() {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Show { format } => {
            let snapshot = latest(&database)?;
            render(&mut std::io::stdout().lock(), &[report::show::inventory(&snapshot)], format.into())?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn latest(database: &Path) -> Result<Snapshot> {
    if !database.exists() {
        bail!("no snapshot database at {}; run `fleetaudit scan` first", database.display());
    }
    let db = Db::open_or_create(database)?;
    match db.latest() {
        Ok(snapshot) => Ok(snapshot),
        Err(StoreError::NoData) => Err(anyhow!("{} holds no snapshot; run `fleetaudit scan` first", database.display())),
        Err(e) => Err(e.into()),
    }
}

/// Directory settings from the config, with `--deployment` overriding its deployment.
fn directory_config(cfg: &Config, deployment: Option<String>) -> Result<Option<DirectoryConfig>> {
    match (cfg.directory.clone(), deployment) {
        (Some(mut dir), Some(d)) => {
            dir.deployment = d;
            Ok(Some(dir))
        }
        (Some(dir), None) => Ok(Some(dir)),
        (None, Some(_)) => bail!("--deployment needs a `directory` section in the config"),
        (None, None) => Ok(None),
    }
}

fn directory_source(dir: &DirectoryConfig, ssh: SshOptions) -> Result<Arc<dyn HostSource>> {
    if dir.url.is_empty() || dir.deployment.is_empty() {
        bail!("fleet directory needs both `url` and `deployment`");
    }
    let options = DirectoryOptions {
        url: dir.url.clone(),
        deployment: dir.deployment.clone(),
        username: dir.username.clone(),
        password: dir.password.clone(),
        timeout: Duration::from_secs(dir.timeout_secs.unwrap_or(30)),
    };
    let gateway = dir.gateway_host.clone().map(|host| Gateway {
        host,
        user: dir.gateway_user.clone().unwrap_or_else(|| ssh.user.clone()),
        identity_file: dir.gateway_identity_file.clone().or_else(|| ssh.identity_file.clone()),
    });
    Ok(Arc::new(FleetDirectorySource::new(options, ssh, gateway)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["fleetaudit", "--database", "x.db", "report", "--format", "csv"]).unwrap();
        assert_eq!(cli.database.as_deref(), Some(Path::new("x.db")));
        assert!(matches!(cli.command, Commands::Report { format: Format::Csv }));

        let cli = Cli::try_parse_from(["fleetaudit", "scan", "10.0.0.5", "--sudo"]).unwrap();
        assert!(matches!(cli.command, Commands::Scan { target: Some(_), sudo: true, .. }));

        assert!(Cli::try_parse_from(["fleetaudit", "scan", "10.0.0.5", "--targets", "hosts.txt"]).is_err());
        assert!(Cli::try_parse_from(["fleetaudit", "audit"]).is_err());
    }

    #[test]
    fn deployment_flag_overrides_config() {
        let cfg = config::parse_config("directory:\n  url: https://director:25555\n  deployment: cf\n").unwrap();
        let dir = directory_config(&cfg, Some("diego".into())).unwrap().unwrap();
        assert_eq!(dir.deployment, "diego");
        assert_eq!(directory_config(&cfg, None).unwrap().unwrap().deployment, "cf");
        assert!(directory_config(&Config::default(), Some("cf".into())).is_err());
        assert!(directory_config(&Config::default(), None).unwrap().is_none());
    }

    #[test]
    fn directory_source_requires_url_and_deployment() {
        let dir = DirectoryConfig { url: "https://director:25555".into(), ..Default::default() };
        assert!(directory_source(&dir, SshOptions::default()).is_err());
    }
}
