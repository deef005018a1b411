//! CLI entry point: `serve` runs the coordinator (heartbeat receiver +
//! readiness/liveness probes), `agent` runs the node-side sidecar that
//! dials in with registration and health updates.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use locate_core::claims::{ClaimsExtractor, DirectJwksExtractor, InsecureDevExtractor, UpstreamHeaderExtractor};
use locate_core::instances::InstanceHandler;
use locate_core::ratelimit::{LimiterConfig, RateLimiter};
use locate_core::server::{self, AppState};
use locate_core::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "locate-core", about = "Heartbeat registry and locator agent")]
struct Cli {
    /// Redis connection URL backing the registry store and rate limiter
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator: heartbeat receiver, health/readiness routes
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value_t = 4160)]
        port: u16,
        /// Key prefix for registry store entries
        #[arg(long, env = "STORE_KEY_PREFIX", default_value = "locate")]
        key_prefix: String,
        /// Seconds a registry key survives without a refreshing write
        #[arg(long, env = "STORE_KEY_EXPIRY_SECS", default_value_t = 600)]
        key_expiry_secs: u64,
        /// Requests per minute a single hostname's write path may make
        #[arg(long, env = "WRITE_RATE_LIMIT", default_value_t = 120)]
        write_rate_limit: u64,
        /// Count-min sketch width (columns per row)
        #[arg(long, env = "RATELIMIT_WIDTH", default_value_t = 2048)]
        ratelimit_width: u32,
        /// Count-min sketch depth (independent hash rows)
        #[arg(long, env = "RATELIMIT_DEPTH", default_value_t = 4)]
        ratelimit_depth: u32,
        /// Claims extraction backend: upstream, direct, or insecure
        #[arg(long, env = "CLAIMS_MODE", default_value = "upstream")]
        claims_mode: String,
        /// JWKS URL for the direct claims backend
        #[arg(long, env = "JWKS_URL")]
        jwks_url: Option<String>,
        /// Importer period refreshing the in-memory snapshot from the store
        #[arg(long, env = "IMPORT_PERIOD_SECS", default_value_t = 30)]
        import_period_secs: u64,
    },
    /// Run the node agent sidecar
    Agent {
        /// Coordinator websocket URL, e.g. wss://coordinator.example.org/v2/platform/heartbeat
        #[arg(long, env = "COORDINATOR_URL")]
        coordinator_url: String,
        /// Canonical hostname identifying this node
        #[arg(long, env = "NODE_HOSTNAME")]
        hostname: String,
        /// Experiment label attached to this node's registration
        #[arg(long, env = "EXPERIMENT")]
        experiment: String,
        /// Siteinfo source URL (file:// or http(s)://)
        #[arg(long, env = "SITEINFO_URL")]
        siteinfo_url: String,
        /// Expected interval between registration reloads
        #[arg(long, env = "RELOAD_INTERVAL_SECS", default_value_t = 3600)]
        reload_interval_secs: u64,
        /// Interval between health/registration heartbeats sent over the link
        #[arg(long, env = "HEARTBEAT_PERIOD_SECS", default_value_t = 10)]
        heartbeat_period_secs: u64,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize structured logging: LOG_FORMAT=json for K8s, human-readable otherwise
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_target(false)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    match &cli.command {
        Commands::Serve {
            port,
            key_prefix,
            key_expiry_secs,
            write_rate_limit,
            ratelimit_width,
            ratelimit_depth,
            claims_mode,
            jwks_url,
            import_period_secs,
        } => rt.block_on(run_serve(
            &cli.redis_url,
            *port,
            key_prefix,
            *key_expiry_secs,
            *write_rate_limit,
            *ratelimit_width,
            *ratelimit_depth,
            claims_mode,
            jwks_url.as_deref(),
            *import_period_secs,
        )),
        Commands::Agent {
            coordinator_url,
            hostname,
            experiment,
            siteinfo_url,
            reload_interval_secs,
            heartbeat_period_secs,
        } => rt.block_on(run_agent(
            coordinator_url,
            hostname,
            experiment,
            siteinfo_url,
            *reload_interval_secs,
            *heartbeat_period_secs,
        )),
    }
}

fn claims_extractor_for(mode: &str, jwks_url: Option<&str>) -> Result<Box<dyn ClaimsExtractor>> {
    match mode {
        "upstream" => Ok(Box::new(UpstreamHeaderExtractor)),
        "direct" => {
            let url = jwks_url.context("--jwks-url is required when --claims-mode=direct")?;
            Ok(Box::new(DirectJwksExtractor::new(url.to_string())?))
        }
        "insecure" => Ok(Box::new(InsecureDevExtractor::new()?)),
        other => anyhow::bail!("unknown claims mode: {other}"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_serve(
    redis_url: &str,
    port: u16,
    key_prefix: &str,
    key_expiry_secs: u64,
    write_rate_limit: u64,
    ratelimit_width: u32,
    ratelimit_depth: u32,
    claims_mode: &str,
    jwks_url: Option<&str>,
    import_period_secs: u64,
) -> Result<()> {
    let client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;
    let conn = client
        .get_connection_manager()
        .await
        .context("failed to connect to redis")?;

    let store = Store::new(conn.clone(), key_prefix.to_string(), key_expiry_secs);
    let instances = InstanceHandler::new(store);
    let limiter = RateLimiter::new(
        conn.clone(),
        LimiterConfig {
            width: ratelimit_width,
            depth: ratelimit_depth,
            window: Duration::from_secs(60),
            key_prefix: format!("{}:ratelimit", key_prefix),
        },
    );
    let claims_extractor = claims_extractor_for(claims_mode, jwks_url)?;

    let state = Arc::new(AppState {
        instances,
        limiter,
        write_rate_limit,
        claims_extractor,
        redis: conn,
    });

    let shutdown = CancellationToken::new();
    let importer_state = Arc::clone(&state);
    let importer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        importer_state
            .instances
            .run_importer(Duration::from_secs(import_period_secs), importer_shutdown)
            .await;
    });

    let app = server::router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

async fn run_agent(
    coordinator_url: &str,
    hostname: &str,
    experiment: &str,
    siteinfo_url: &str,
    reload_interval_secs: u64,
    heartbeat_period_secs: u64,
) -> Result<()> {
    use locate_core::link::{BackoffConfig, Link, ReconnectBudget};
    use locate_core::loader::{IntervalConfig, Loader};

    let reload_expected = Duration::from_secs(reload_interval_secs);
    let loader = Loader::new(
        siteinfo_url.to_string(),
        hostname.to_string(),
        experiment.to_string(),
        Default::default(),
        IntervalConfig {
            min: reload_expected / 2,
            expected: reload_expected,
            max: reload_expected * 2,
        },
    )
    .context("failed to construct siteinfo loader")?;

    let link = Link::new(
        BackoffConfig::default(),
        ReconnectBudget {
            max_reconnects: 10,
            window: Duration::from_secs(60),
        },
    );

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal_shutdown.cancel();
    });

    locate_core::agent::run(
        loader,
        link,
        locate_core::agent::AgentConfig {
            heartbeat_period: Duration::from_secs(heartbeat_period_secs),
            coordinator_url: coordinator_url.to_string(),
        },
        shutdown,
    )
    .await
}
