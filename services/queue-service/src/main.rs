//! Queue service entry point.

use anyhow::Context;
use queue_service::collaborators::{CodeRunner, HttpCodeRunner};
use queue_service::dispatch::{
    BackoffPolicy, DispatchBridge, EventSource, JobConsumer, MemoryBroker, Publisher, RedisBroker,
};
use queue_service::http::{self, AppState};
use queue_service::{
    shutdown, CachedEnrollments, JobProducer, QueueService, QueueServiceConfig, SqliteEnrollments,
    SqliteJobStore, SystemClock,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, config_error) = match QueueServiceConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (QueueServiceConfig::default(), Some(e)),
    };

    init_tracing(config.logging.json);
    if let Some(e) = config_error {
        warn!(error = %e, "Failed to load configuration, using defaults");
    }
    info!("Starting queue service");

    let store = SqliteJobStore::connect(&config.database)
        .await
        .context("opening job store")?;
    let enrollments = Arc::new(CachedEnrollments::new(
        SqliteEnrollments::new(store.pool().clone()),
        Duration::from_secs(config.access.cache_ttl_seconds),
    ));
    let store = Arc::new(store);
    let clock = Arc::new(SystemClock);

    let shutdown = shutdown::install_shutdown_handler();
    let broker = connect_broker(&config).await;
    let dispatch = broker.as_ref().map_or_else(DispatchBridge::disabled, |(publisher, _)| {
        DispatchBridge::new(
            Arc::clone(publisher),
            BackoffPolicy::from_config(&config.broker),
        )
    });

    let queue = QueueService::new(store.clone(), enrollments, clock.clone())
        .with_dispatch(dispatch.clone())
        .with_retry_min_age(config.retry.min_age());
    let producer = JobProducer::new(store, clock, dispatch);

    let consumer = match broker {
        Some((_, source)) => {
            let runner = build_runner(&config)?;
            let consumer = JobConsumer::new(source, queue.clone(), runner);
            Some(tokio::spawn(consumer.run(shutdown.clone())))
        }
        None => {
            warn!("No broker available; code execution jobs wait for manual processing");
            None
        }
    };

    let addr: SocketAddr = format!("{}:{}", config.service.host, config.service.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Queue service listening");

    let app = http::router(AppState::new(queue, producer));
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    shutdown.cancel();
    if let Some(consumer) = consumer {
        if let Err(e) = consumer.await {
            warn!(error = %e, "Job consumer task ended abnormally");
        }
    }

    info!("Queue service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "queue_service=info,sqlx=warn,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

type BrokerHandles = (Arc<dyn Publisher>, Arc<dyn EventSource>);

/// Connect the configured broker, or `None` to run degraded.
async fn connect_broker(config: &QueueServiceConfig) -> Option<BrokerHandles> {
    let url = config.broker.url.as_deref()?;

    if url.starts_with("memory://") {
        let broker = MemoryBroker::new(config.broker.poll_interval());
        let publisher: Arc<dyn Publisher> = Arc::new(broker.clone());
        let source: Arc<dyn EventSource> = Arc::new(broker);
        return Some((publisher, source));
    }

    match RedisBroker::connect(url, &config.broker).await {
        Ok(broker) => {
            let broker = Arc::new(broker);
            let publisher: Arc<dyn Publisher> = broker.clone();
            let source: Arc<dyn EventSource> = broker;
            Some((publisher, source))
        }
        Err(e) => {
            warn!(error = %e, "Broker unavailable, running in degraded mode");
            None
        }
    }
}

fn build_runner(config: &QueueServiceConfig) -> anyhow::Result<Option<Arc<dyn CodeRunner>>> {
    let Some(url) = config.executor.url.as_deref() else {
        return Ok(None);
    };
    let runner = HttpCodeRunner::new(url, Duration::from_secs(config.executor.timeout_seconds))
        .context("building execution client")?;
    info!(url, "Automated code execution enabled");
    Ok(Some(Arc::new(runner)))
}
