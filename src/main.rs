//! The gibram server binary.
//!
//! Wires the durability layer, engine and wire server together: open the
//! WAL, recover from the newest snapshot plus the WAL tail, start the TTL
//! sweeper, then serve until interrupted. Exits 0 on clean shutdown and 1
//! on any start-up failure.

use anyhow::{bail, Context};
use clap::Parser;
use gibram_durability::backup::BackupCoordinator;
use gibram_durability::wal::{Wal, WalConfig};
use gibram_engine::backup::{run_recovery, BackupManager};
use gibram_engine::engine::{Engine, EngineConfig};
use gibram_wire::auth::{AuthTable, Permission};
use gibram_wire::ratelimit::RateLimitConfig;
use gibram_wire::server::{Server, ServerContext, WireConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gibram-server", about = "Graph-augmented vector retrieval engine")]
struct Args {
    /// Configuration file; accepted so launch wrappers can pass it through.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:7667")]
    addr: String,

    /// Data directory (holds wal/ and snapshots/).
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Embedding dimension for every session.
    #[arg(long, default_value_t = 384)]
    dim: usize,

    /// Disable the authentication handshake.
    #[arg(long)]
    insecure: bool,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between TTL sweeps.
    #[arg(long, default_value_t = 60)]
    session_cleanup_interval: u64,

    /// API key as `key:permission` (permission = read | write | admin).
    /// Repeatable.
    #[arg(long = "api-key")]
    api_keys: Vec<String>,

    /// Token-bucket refill rate per key, per second.
    #[arg(long, default_value_t = 100.0)]
    rate_limit: f64,

    /// Token-bucket burst per key.
    #[arg(long, default_value_t = 200.0)]
    rate_burst: f64,
}

fn parse_auth(args: &Args) -> anyhow::Result<Option<AuthTable>> {
    if args.insecure {
        return Ok(None);
    }
    if args.api_keys.is_empty() {
        return Ok(None);
    }
    let mut table = AuthTable::new();
    for entry in &args.api_keys {
        let Some((key, permission)) = entry.rsplit_once(':') else {
            bail!("--api-key must be key:permission, got {entry:?}");
        };
        let Some(permission) = Permission::parse(permission) else {
            bail!("unknown permission {permission:?} in --api-key");
        };
        table.insert(key, permission);
    }
    Ok(Some(table))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let auth = parse_auth(&args)?;

    let wal = Arc::new(
        Wal::open(&args.data.join("wal"), WalConfig::default())
            .context("failed to open write-ahead log")?,
    );

    let mut engine_config = EngineConfig::new(args.dim);
    engine_config.sweep_interval = Duration::from_secs(args.session_cleanup_interval.max(1));
    let engine = Arc::new(Engine::with_wal(engine_config, wal.clone()));

    let stats = run_recovery(&engine, &args.data).context("recovery failed")?;
    info!(
        sessions = engine.info().sessions,
        records_replayed = stats.records_replayed,
        "recovery complete"
    );

    engine.start_sweeper();

    let coordinator = Arc::new(BackupCoordinator::new(wal.clone()));
    let backups = Arc::new(BackupManager::new(
        engine.clone(),
        coordinator,
        &args.data,
        "engine",
    ));

    let server = Server::new(
        ServerContext {
            engine: engine.clone(),
            wal: wal.clone(),
            backups,
        },
        WireConfig {
            addr: args.addr.clone(),
            rate_limit: RateLimitConfig {
                rate: args.rate_limit,
                burst: args.rate_burst,
            },
            auth,
            ..WireConfig::default()
        },
    );

    let listener = TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;

    let token = CancellationToken::new();
    let serve = tokio::spawn(server.serve_on(listener, token.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;
    info!("interrupt received, shutting down");
    token.cancel();
    serve.await.context("server task failed")??;

    engine.shutdown();
    wal.sync().context("final WAL flush failed")?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|e| {
        eprintln!("gibram-server: invalid --log-level: {e}");
        std::process::exit(1);
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        eprintln!("gibram-server: {e:#}");
        std::process::exit(1);
    }
}
