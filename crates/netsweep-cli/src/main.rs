//! # NetSweep CLI Entry Point
//!
//! Main binary for the NetSweep discovery engine. Starts the discoverer
//! service or talks to a running one over its IPC sockets.
//!
//! ## Usage
//!
//! ```bash
//! # Start the discoverer with a rules file
//! netsweep discoverer -r rules.json
//!
//! # Query the pending-check queue depth
//! netsweep queue
//!
//! # Per-worker busy fractions
//! netsweep usage
//!
//! # Proxy group statistics
//! netsweep pgroup-stats dc-east
//!
//! # Ask the service to drop cached SNMP engine state
//! netsweep reload-snmp
//!
//! # Stop the service
//! netsweep shutdown
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use argh::FromArgs;

use netsweep_common::ipc::IpcSocket;
use netsweep_common::model::Rule;
use netsweep_common::protocol::messages::{decode_queue_reply, decode_usage_reply};
use netsweep_common::protocol::{DiscovererRequest, GroupStatsReply, PgRequest};
use netsweep_discoverer::config::{discoverer_socket_path, DiscovererConfig};
use netsweep_discoverer::drivers::builtin_drivers;
use netsweep_discoverer::rules::InMemoryRuleSource;
use netsweep_discoverer::service::DiscovererService;
use netsweep_discoverer::sink::LogSink;
use netsweep_pgroup::pgroup_socket_path;

/// NetSweep - network discovery engine
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Discoverer(DiscovererArgs),
    Queue(QueueArgs),
    Usage(UsageArgs),
    PgroupStats(PgroupStatsArgs),
    ReloadSnmp(ReloadSnmpArgs),
    Shutdown(ShutdownArgs),
}

/// start the discoverer service
#[derive(FromArgs)]
#[argh(subcommand, name = "discoverer")]
struct DiscovererArgs {
    /// path to a JSON file with discovery rules
    #[argh(option, short = 'r')]
    rules: PathBuf,
    /// path to a JSON configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

/// query the pending-check queue depth
#[derive(FromArgs)]
#[argh(subcommand, name = "queue")]
struct QueueArgs {
    /// socket directory of the running service
    #[argh(option, short = 's')]
    socket_dir: Option<PathBuf>,
}

/// query per-worker busy fractions
#[derive(FromArgs)]
#[argh(subcommand, name = "usage")]
struct UsageArgs {
    /// socket directory of the running service
    #[argh(option, short = 's')]
    socket_dir: Option<PathBuf>,
}

/// query statistics of a proxy group
#[derive(FromArgs)]
#[argh(subcommand, name = "pgroup-stats")]
struct PgroupStatsArgs {
    /// proxy group name
    #[argh(positional)]
    name: String,
    /// socket directory of the running service
    #[argh(option, short = 's')]
    socket_dir: Option<PathBuf>,
}

/// ask the service to drop cached SNMP engine state
#[derive(FromArgs)]
#[argh(subcommand, name = "reload-snmp")]
struct ReloadSnmpArgs {
    /// socket directory of the running service
    #[argh(option, short = 's')]
    socket_dir: Option<PathBuf>,
}

/// stop the discoverer service
#[derive(FromArgs)]
#[argh(subcommand, name = "shutdown")]
struct ShutdownArgs {
    /// socket directory of the running service
    #[argh(option, short = 's')]
    socket_dir: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<DiscovererConfig> {
    match path {
        None => Ok(DiscovererConfig::default()),
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("cannot parse config {}", path.display()))
        }
    }
}

fn socket_dir_of(override_dir: Option<PathBuf>) -> PathBuf {
    override_dir.unwrap_or_else(|| DiscovererConfig::default().socket_dir)
}

async fn run_discoverer(args: DiscovererArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;

    let data = std::fs::read_to_string(&args.rules)
        .with_context(|| format!("cannot read rules {}", args.rules.display()))?;
    let rules: Vec<Rule> = serde_json::from_str(&data)
        .with_context(|| format!("cannot parse rules {}", args.rules.display()))?;

    let source = Arc::new(InMemoryRuleSource::new());
    for rule in rules {
        source.upsert_rule(rule);
    }

    let drivers = builtin_drivers(&config);
    let service = DiscovererService::start(config, source, Arc::new(LogSink), drivers)
        .await
        .context("cannot initialize discovery manager")?;
    service.run().await.context("discoverer failed")?;
    Ok(())
}

async fn run_queue(args: QueueArgs) -> Result<()> {
    let path = discoverer_socket_path(&socket_dir_of(args.socket_dir));
    let mut sock = IpcSocket::connect(&path).await?;
    let reply = sock.request(DiscovererRequest::QUEUE, &[]).await?;
    let pending = decode_queue_reply(&reply.data)?;
    println!("{}", pending);
    Ok(())
}

async fn run_usage(args: UsageArgs) -> Result<()> {
    let path = discoverer_socket_path(&socket_dir_of(args.socket_dir));
    let mut sock = IpcSocket::connect(&path).await?;
    let reply = sock.request(DiscovererRequest::USAGE_STATS, &[]).await?;
    let usage = decode_usage_reply(&reply.data)?;
    for (idx, fraction) in usage.iter().enumerate() {
        println!("worker #{}: {:.1}% busy", idx + 1, fraction * 100.0);
    }
    Ok(())
}

async fn run_pgroup_stats(args: PgroupStatsArgs) -> Result<()> {
    let path = pgroup_socket_path(&socket_dir_of(args.socket_dir));
    let mut sock = IpcSocket::connect(&path).await?;
    let request = PgRequest::GetStats {
        name: args.name.clone(),
    };
    let reply = sock.request(request.code(), &request.encode()).await?;
    match GroupStatsReply::decode(&reply.data)? {
        GroupStatsReply::NotFound => {
            println!("proxy group \"{}\" not found", args.name);
        }
        GroupStatsReply::Found {
            state,
            online_num,
            proxyids,
        } => {
            println!("state: {}", state);
            println!("online: {}/{}", online_num, proxyids.len());
            for proxyid in proxyids {
                println!("proxy: {}", proxyid);
            }
        }
    }
    Ok(())
}

async fn run_notify(socket_dir: Option<PathBuf>, code: u32) -> Result<()> {
    let path = discoverer_socket_path(&socket_dir_of(socket_dir));
    let mut sock = IpcSocket::connect(&path).await?;
    sock.send(code, &[]).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli: Cli = argh::from_env();
    match cli.command {
        Commands::Discoverer(args) => run_discoverer(args).await,
        Commands::Queue(args) => run_queue(args).await,
        Commands::Usage(args) => run_usage(args).await,
        Commands::PgroupStats(args) => run_pgroup_stats(args).await,
        Commands::ReloadSnmp(args) => {
            run_notify(args.socket_dir, DiscovererRequest::SNMP_CACHE_RELOAD).await
        }
        Commands::Shutdown(args) => run_notify(args.socket_dir, DiscovererRequest::SHUTDOWN).await,
    }
}
