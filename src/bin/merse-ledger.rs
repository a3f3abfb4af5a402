use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use merse_credits::config::{Env, LedgerConfig};
use merse_credits::credits::{CreditLedger, DocumentStore, MemoryStore, UsageRecorder};
use merse_credits::http::{LedgerHttpState, router};
use merse_credits::limits::{FixedWindowLimiter, RemoteCounter, RestCounter, TieredRateLimiter};
use merse_credits::observability::Observability;
use merse_credits::orion::{HttpLoopEndpoints, OrionLoop};
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Debug, Parser)]
#[command(name = "merse-ledger", about = "Credit ledger and rate limiting service")]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address, overrides the config file.
    #[arg(long)]
    listen: Option<String>,
    /// SQLite database for profiles and usage records (feature `store-sqlite`).
    #[arg(long)]
    sqlite: Option<PathBuf>,
    /// Bearer token required by `/admin/*` routes. Falls back to `MERSE_ADMIN_TOKEN`.
    #[arg(long)]
    admin_token: Option<String>,
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    let mut config = match args.config.as_deref() {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };
    let env = Env::default();
    config.apply_env(&env);
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(path) = args.sqlite {
        config.store.sqlite_path = Some(path);
    }
    config.validate()?;

    let observability = Arc::new(Observability::default());
    let store = open_store(&config).await?;
    let usage = UsageRecorder::spawn(store.clone(), observability.clone());
    let ledger = CreditLedger::new(store.clone(), usage, observability.clone());

    let mut tiered = TieredRateLimiter::new(remote_counter(&config)?, observability.clone());
    if let Some(prefix) = config.counter.prefix.as_deref() {
        tiered = tiered.with_prefix(prefix);
    }
    if !tiered.is_enabled() {
        tracing::warn!("no rate limit counter configured; tiered limits fail open");
    }

    let mut state = LedgerHttpState::new(ledger, observability.clone())
        .with_local_limits(FixedWindowLimiter::default(), config.limits.clone())
        .with_tiered_limiter(tiered);
    if let Some(base_url) = config.orion.base_url.as_deref() {
        let endpoints = Arc::new(HttpLoopEndpoints::new(base_url)?);
        let orion = OrionLoop::new(store, endpoints, observability)
            .with_score_threshold(config.orion.score_threshold);
        state = state.with_orion(orion);
    }
    if let Some(token) = args.admin_token.or_else(|| env.get("MERSE_ADMIN_TOKEN")) {
        state = state.with_admin_token(token);
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "merse-ledger listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn open_store(
    config: &LedgerConfig,
) -> Result<Arc<dyn DocumentStore>, Box<dyn std::error::Error>> {
    let Some(path) = config.store.sqlite_path.as_ref() else {
        tracing::warn!("no sqlite path configured; balances live in memory only");
        return Ok(Arc::new(MemoryStore::new()));
    };

    #[cfg(feature = "store-sqlite")]
    {
        let store = merse_credits::credits::SqliteStore::new(path);
        store.init().await?;
        Ok(Arc::new(store))
    }
    #[cfg(not(feature = "store-sqlite"))]
    {
        Err(format!(
            "sqlite store requested at {} but the store-sqlite feature is disabled",
            path.display()
        )
        .into())
    }
}

fn remote_counter(
    config: &LedgerConfig,
) -> Result<Option<Arc<dyn RemoteCounter>>, Box<dyn std::error::Error>> {
    #[cfg(feature = "store-redis")]
    if let Some(url) = config.counter.redis_url.as_deref() {
        let counter = merse_credits::limits::RedisCounter::new(url)?;
        return Ok(Some(Arc::new(counter) as Arc<dyn RemoteCounter>));
    }

    let counter = RestCounter::from_parts(
        config.counter.url.as_deref(),
        config.counter.token.as_deref(),
    )?;
    Ok(counter.map(|counter| Arc::new(counter) as Arc<dyn RemoteCounter>))
}
