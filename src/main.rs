//! tagsrv service entry point
//!
//! Startup order: config, logging, registry, field session, storage
//! session (optional), fan-out and persistence wiring, initial seed, HTTP
//! server. Shutdown reverses it: HTTP drains first, the persistence worker
//! finishes its in-flight cycle, the event pump stops, then both sessions
//! close.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tagsrv::api::{build_router, ApiState};
use tagsrv::cache::ValueCache;
use tagsrv::config::{Config, DEFAULT_CONFIG_PATH};
use tagsrv::fanout::NotificationFanout;
use tagsrv::persist::PersistenceWorker;
use tagsrv::protocol::{build_client, FieldClient};
use tagsrv::registry::TagRegistry;
use tagsrv::storage::{ColumnMapping, Severity, SqliteStorage, Storage};
use tagsrv::supervisor::ReconnectSupervisor;
use tagsrv::{GatewayError, SERVICE_NAME, SERVICE_VERSION};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = SERVICE_NAME, version, about = "Field-protocol telemetry gateway")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", SERVICE_NAME, level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Wait for ctrl-c or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.service.log_level);
    init_logging(log_level);

    info!(
        version = SERVICE_VERSION,
        config = %args.config,
        "starting {}",
        SERVICE_NAME
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "service failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), GatewayError> {
    let registry = Arc::new(TagRegistry::load(&config)?);
    info!(tags = registry.len(), "tag registry loaded");

    // Field session: the initial connect must succeed, later drops are
    // handled by the supervisor
    let field = build_client(&config)?;
    field.connect().await?;
    info!(endpoint = %config.field.endpoint, driver = %config.field.driver, "field session connected");

    for tag in registry.tags() {
        if let Err(e) = field.subscribe(&tag.node_id).await {
            warn!(tag = %tag.name, error = %e, "subscription failed");
        }
    }

    // Storage session: optional, and a failed initial connect degrades to
    // cache-only operation instead of aborting startup
    let mapping = Arc::new(ColumnMapping::empty());
    let storage: Option<Arc<dyn Storage>> = if config.database.enabled {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new(config.database.path.clone()));
        match storage.connect().await {
            Ok(()) => {
                match storage.load_mapping().await {
                    Ok(loaded) => mapping.replace(loaded),
                    Err(e) => warn!(error = %e, "mapping load failed, persisting nothing until reconnect"),
                }
                if let Err(e) = storage
                    .log_event("system", "tagsrv service started", Severity::Info)
                    .await
                {
                    warn!(error = %e, "failed to record startup event");
                }
                Some(storage)
            }
            Err(e) => {
                warn!(error = %e, "storage connect failed, running without persistence");
                None
            }
        }
    } else {
        info!("persistence disabled by configuration");
        None
    };

    let cache = Arc::new(ValueCache::new());
    let supervisor = Arc::new(ReconnectSupervisor::new(
        field.clone(),
        registry.clone(),
        storage.clone(),
        mapping.clone(),
        Duration::from_secs(config.database.reconnect_backoff_secs),
    ));

    let mut fanout = NotificationFanout::new(registry.clone(), cache.clone());

    let persist_handle = storage.clone().map(|storage| {
        let worker = PersistenceWorker::new(
            cache.clone(),
            storage,
            mapping.clone(),
            supervisor.clone(),
            config.database.log_interval_secs,
        );
        fanout.register_listener(worker.listener());
        worker.spawn(CancellationToken::new())
    });

    let fanout = Arc::new(fanout);
    fanout.seed_initial(&field).await;

    let pump_token = CancellationToken::new();
    let pump = tokio::spawn(fanout.clone().run(
        field.clone(),
        supervisor.clone(),
        pump_token.clone(),
    ));

    // HTTP query surface
    let state = ApiState {
        cache: cache.clone(),
        registry: registry.clone(),
        field: field.clone(),
        storage: storage.clone(),
        mapping: mapping.clone(),
    };
    let router = build_router(state, &config.http);

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "http server listening");

    let http_token = CancellationToken::new();
    let server = {
        let token = http_token.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server error");
            }
        })
    };

    wait_for_shutdown().await;
    info!("shutting down");

    // Drain HTTP first so in-flight queries still see live state
    http_token.cancel();
    if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
        warn!("http server did not drain in time");
    }

    if let Some(handle) = persist_handle {
        handle.stop(Duration::from_secs(5)).await;
    }

    pump_token.cancel();
    if tokio::time::timeout(Duration::from_secs(5), pump).await.is_err() {
        warn!("event pump did not stop in time");
    }

    if let Err(e) = field.disconnect().await {
        warn!(error = %e, "field disconnect failed");
    }

    if let Some(storage) = storage {
        if let Err(e) = storage
            .log_event("system", "tagsrv service stopped", Severity::Info)
            .await
        {
            warn!(error = %e, "failed to record shutdown event");
        }
        if let Err(e) = storage.disconnect().await {
            warn!(error = %e, "storage disconnect failed");
        }
    }

    info!("shutdown complete");
    Ok(())
}
