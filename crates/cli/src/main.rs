use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kdelegate_core::{Clock, DelegationSpec, OffsetClock, ResourceKind, SystemClock};
use kdelegate_delegation::{Delegation, DelegationOutcome, DryRunBinder, RoleBinder};
use kdelegate_ntp::{average_offsets, validate_response, NtpClient, NtpConfig};
use kdelegate_persist::{default_db_path, SqliteStatusStore};
use kdelegate_trigger::{parse_time_expression, BuildContext, DedupTracker, Trigger, TriggerSet, WatchHub};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kdelegatectl", version, about = "Trigger-gated RBAC delegation")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict watches to one namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(flatten)]
    ntp: NtpArgs,

    /// Status database (SQLite)
    #[arg(long = "db-path", env = "KDELEGATE_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct NtpArgs {
    /// NTP server, `host` or `host:port`; repeatable
    #[arg(long = "ntp-host", env = "KDELEGATE_NTP_HOSTS", value_delimiter = ',', default_value = "pool.ntp.org", global = true)]
    hosts: Vec<String>,

    #[arg(long = "ntp-port", default_value_t = 123, global = true)]
    port: u16,

    /// Protocol version sent in requests
    #[arg(long = "ntp-version", default_value_t = 4, value_parser = clap::value_parser!(u8).range(2..=4), global = true)]
    ntp_version: u8,

    #[arg(long = "ntp-timeout-secs", default_value_t = 5, global = true)]
    timeout_secs: u64,

    /// Local address to bind the UDP socket to
    #[arg(long = "ntp-bind", global = true)]
    bind: Option<SocketAddr>,

    /// Skip NTP and use the uncorrected local clock
    #[arg(long = "no-ntp", action = ArgAction::SetTrue, global = true)]
    disabled: bool,
}

impl NtpArgs {
    fn config(&self) -> NtpConfig {
        NtpConfig {
            hosts: self.hosts.clone(),
            port: self.port,
            version: self.ntp_version,
            timeout: Duration::from_secs(self.timeout_secs),
            local_bind_addr: self.bind,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Query the NTP hosts and print the clock offset
    Offset,
    /// Resolve a time trigger expression, e.g. "1h 30m" or "2030-05-01"
    ParseTime {
        expr: String,
        /// Base instant for relative expressions (RFC 3339; default: now)
        #[arg(long = "base")]
        base: Option<String>,
    },
    /// Validate a delegation file and its triggers without touching the cluster
    Check { file: PathBuf },
    /// Run a delegation until it is revoked or interrupted
    Run {
        file: PathBuf,
        /// Log grants and revokes instead of writing RBAC objects
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KDELEGATE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KDELEGATE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KDELEGATE_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_spec(path: &Path) -> Result<DelegationSpec> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut spec: DelegationSpec = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    spec.normalize().with_context(|| format!("validating {}", path.display()))?;
    Ok(spec)
}

fn watched_kinds(spec: &DelegationSpec) -> BTreeSet<ResourceKind> {
    spec.event_triggers.iter().chain(spec.deletion_triggers.iter()).filter_map(|t| t.kind.resource()).collect()
}

/// Offset-corrected clock; falls back to local time when no host answers.
async fn corrected_clock(ntp: &NtpArgs) -> OffsetClock {
    if ntp.disabled {
        info!("ntp disabled; using local clock");
        return OffsetClock::uncorrected();
    }
    match NtpClient::new(ntp.config()).get_offset().await {
        Ok(offset) => OffsetClock::new(offset),
        Err(e) => {
            warn!(error = %e, "ntp unavailable; using uncorrected local clock");
            OffsetClock::uncorrected()
        }
    }
}

async fn cmd_offset(cli: &Cli) -> Result<()> {
    let client = NtpClient::new(cli.ntp.config());
    let mut rows = Vec::new();
    let mut offsets = Vec::new();
    for host in &cli.ntp.hosts {
        match client.query(host).await {
            Ok(r) => {
                offsets.push(r.offset);
                let valid = validate_response(&r.query, &r.packet);
                rows.push(serde_json::json!({
                    "host": r.host,
                    "offsetMs": r.offset.num_milliseconds(),
                    "stratum": r.packet.stratum,
                    "valid": valid.is_ok(),
                    "problem": valid.err().map(|e| e.to_string()),
                }));
            }
            Err(e) => rows.push(serde_json::json!({ "host": host, "error": e.to_string() })),
        }
    }
    let avg = average_offsets(&offsets);
    match cli.output {
        Output::Human => {
            for r in &rows {
                match r.get("error") {
                    Some(e) => println!("{:<24} error: {}", r["host"].as_str().unwrap_or_default(), e.as_str().unwrap_or_default()),
                    None => println!(
                        "{:<24} {:>8} ms  stratum {}{}",
                        r["host"].as_str().unwrap_or_default(),
                        r["offsetMs"],
                        r["stratum"],
                        if r["valid"].as_bool().unwrap_or(false) { String::new() } else { format!("  ({})", r["problem"].as_str().unwrap_or("invalid")) },
                    ),
                }
            }
            match &avg {
                Some(o) => println!("average: {} ms", o.num_milliseconds()),
                None => println!("average: unavailable"),
            }
        }
        Output::Json => {
            let out = serde_json::json!({
                "hosts": rows,
                "averageMs": avg.map(|o| o.num_milliseconds()),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    avg.map(|_| ()).context("no ntp host answered")
}

fn cmd_parse_time(cli: &Cli, expr: &str, base: Option<&str>) -> Result<()> {
    let base = match base {
        Some(b) => DateTime::parse_from_rfc3339(b).with_context(|| format!("parsing base {}", b))?.with_timezone(&Utc),
        None => Utc::now(),
    };
    let at = parse_time_expression(expr, base)?;
    match cli.output {
        Output::Human => println!("{}  (in {}s)", at.to_rfc3339(), (at - base).num_seconds()),
        Output::Json => println!("{}", serde_json::json!({ "expr": expr, "base": base.to_rfc3339(), "at": at.to_rfc3339() })),
    }
    Ok(())
}

fn cmd_check(cli: &Cli, file: &Path) -> Result<()> {
    let spec = load_spec(file)?;
    let ctx = BuildContext {
        hub: WatchHub::default(),
        dedup: Arc::new(DedupTracker::new()),
        cancel: CancellationToken::new(),
        clock: Arc::new(SystemClock),
        base_time: Utc::now(),
    };
    let grant = TriggerSet::build(&spec.event_triggers, &ctx).context("event triggers")?;
    let revoke = TriggerSet::build(&spec.deletion_triggers, &ctx).context("deletion triggers")?;
    match cli.output {
        Output::Human => {
            println!("delegation {}: {} -> {} destination(s)", spec.name, spec.origin, spec.destinations.len());
            for d in &spec.destinations {
                println!("  to {}", d);
            }
            for (label, set) in [("grant", &grant), ("revoke", &revoke)] {
                for t in set.iter() {
                    let s = t.spec();
                    println!("  {} #{} {} {:?} x{}", label, s.uid, s.kind, s.value, s.replicas);
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&spec)?),
    }
    ctx.cancel.cancel();
    Ok(())
}

async fn cmd_run(cli: &Cli, file: &Path, dry_run: bool) -> Result<()> {
    let spec = load_spec(file)?;
    let clock: Arc<dyn Clock> = Arc::new(corrected_clock(&cli.ntp).await);
    let db_path = cli.db_path.as_ref().map(|p| p.to_string_lossy().to_string()).unwrap_or_else(default_db_path);
    let store = Arc::new(SqliteStatusStore::open(&db_path)?);
    info!(db = %db_path, "status store opened");

    let client = kdelegate_kubehub::client().await?;
    let kinds = watched_kinds(&spec);
    kdelegate_kubehub::preflight(client.clone(), &kinds, cli.namespace.as_deref()).await?;
    let hub = WatchHub::default();
    let watchers = kdelegate_kubehub::start_watchers(client.clone(), &kinds, cli.namespace.clone(), hub.clone());

    let binder: Arc<dyn RoleBinder> =
        if dry_run { Arc::new(DryRunBinder) } else { Arc::new(kdelegate_kubehub::KubeRoleBinder::new(client)) };
    let delegation = Arc::new(Delegation::new(spec, hub, clock, store, binder)?);
    info!(delegation = %delegation.name(), kinds = kinds.len(), dry_run, "delegation started");

    let mut run = tokio::spawn({
        let d = Arc::clone(&delegation);
        async move { d.run().await }
    });
    let res = tokio::select! {
        res = &mut run => res,
        _ = signal::ctrl_c() => {
            info!("interrupt received; closing delegation");
            delegation.delete();
            run.await
        }
    };
    for w in watchers {
        w.abort();
    }
    match res.context("delegation task panicked")? {
        Ok(out) => {
            let msg = match out {
                DelegationOutcome::Completed => "granted and revoked",
                DelegationOutcome::ClosedBeforeGrant => "closed before grant",
                DelegationOutcome::ClosedAfterGrant => "closed after grant; bindings revoked",
            };
            match cli.output {
                Output::Human => println!("{}: {}", delegation.name(), msg),
                Output::Json => println!("{}", serde_json::json!({ "delegation": delegation.name(), "outcome": format!("{:?}", out) })),
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, delegation = %delegation.name(), "delegation failed");
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Offset => cmd_offset(&cli).await,
        Commands::ParseTime { expr, base } => cmd_parse_time(&cli, expr, base.as_deref()),
        Commands::Check { file } => cmd_check(&cli, file),
        Commands::Run { file, dry_run } => cmd_run(&cli, file, *dry_run).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ntp_flags_build_the_client_config() {
        let cli = Cli::parse_from(["kdelegatectl", "--ntp-host", "a", "--ntp-host", "b:1123", "--ntp-version", "3", "--ntp-timeout-secs", "2", "offset"]);
        let cfg = cli.ntp.config();
        assert_eq!(cfg.hosts, vec!["a", "b:1123"]);
        assert_eq!(cfg.version, 3);
        assert_eq!(cfg.timeout, Duration::from_secs(2));
        assert!(Cli::try_parse_from(["kdelegatectl", "--ntp-version", "5", "offset"]).is_err());
    }

    #[test]
    fn watched_kinds_cover_both_phases() {
        let spec: DelegationSpec = serde_yaml::from_str(
            r#"
name: d
origin: { kind: User, name: bob }
destinations: [{ kind: User, name: alice }]
eventTriggers: [{ kind: AddPod, value: "*" }, { kind: Time, value: "1h" }]
deletionTriggers: [{ kind: DelJob, value: "*" }, { kind: UpdatePod, value: "x" }]
"#,
        )
        .unwrap();
        assert_eq!(watched_kinds(&spec), BTreeSet::from([ResourceKind::Pod, ResourceKind::Job]));
    }
}
