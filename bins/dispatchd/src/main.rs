//! Ride dispatch CLI and server binary
//!
//! Provides commands for initializing, validating, and starting the
//! dispatch service. `start` wires the configured backends into the
//! matching engine, then runs the HTTP API, the background workers, or
//! both, until Ctrl+C or SIGTERM.

mod shutdown;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cli::{Cli, Commands, Role};
use common::{Clock, SystemClock};
use config::{generate_default_config, load_config, save_config, validate_config, DispatchConfig};
use dispatch_engine::api::{create_router, DispatchApiState};
use dispatch_engine::clients::location::LocationClient;
use dispatch_engine::clients::profile::ProfileClient;
use dispatch_engine::dead_letter::{DeadLetterSource, QuarantineStore};
use dispatch_engine::lock::BatchLock;
use dispatch_engine::publisher::EventPublisher;
use dispatch_engine::{
    redis_conn, DeadLetterConsumer, DispatchService, DispatchWorker, DriverCallService,
    DriverCallStore, EngineMetrics, EventBus, FareEstimator, HttpLocationClient,
    HttpProfileClient, InMemoryBatchLock, InMemoryDispatchStore, InMemoryEventPublisher,
    InMemoryQuarantineStore, LogEventPublisher, MatchingEngine, MatchingRequestStore,
    PostgresDispatchStore, RedisBatchLock, RedisStreamDeadLetterSource, RedisStreamPublisher, RideStore,
    StaticLocationClient,
    StaticProfileClient, SurgePriceService, SurgePriceStore, WorkerIntervals,
};
use observability::{init_logging, init_metrics, LogFormat};
use redis::aio::ConnectionManager;
use shutdown::{run_until_shutdown, ShutdownController};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Start {
            role,
            config,
            http,
            metrics,
            log_format,
            instance_id,
        } => {
            let overrides = StartOverrides {
                http,
                metrics,
                log_format,
                instance_id,
            };
            start_dispatch(role, config, overrides).await
        }
        Commands::Validate { config } => {
            init_logging("dispatchd", LogFormat::Pretty)?;
            info!("Executing 'validate' command");
            validate_command(config).await
        }
        Commands::Init { output } => {
            init_logging("dispatchd", LogFormat::Pretty)?;
            info!("Executing 'init' command");
            init_command(output).await
        }
    }
}

/// Command-line values that win over the configuration file
struct StartOverrides {
    http: Option<u16>,
    metrics: Option<u16>,
    log_format: Option<String>,
    instance_id: Option<String>,
}

impl StartOverrides {
    fn apply(self, config: &mut DispatchConfig) {
        if let Some(port) = self.http {
            config.api.port = port;
            config.api.enabled = true;
        }
        if let Some(port) = self.metrics {
            config.monitoring.metrics_port = Some(port);
        }
        if let Some(format) = self.log_format {
            config.monitoring.log_format = format;
        }
        if let Some(id) = self.instance_id {
            config.service.instance_id = Some(id);
        }
    }
}

async fn start_dispatch<P: AsRef<Path>>(role: Role, config_path: P, overrides: StartOverrides) -> Result<()> {
    let config_path = config_path.as_ref();

    let mut config = load_config(config_path)?;
    overrides.apply(&mut config);

    let format = LogFormat::parse(&config.monitoring.log_format).unwrap_or_default();
    init_logging(&config.service.name, format)?;
    info!(role = role.as_str(), path = ?config_path, "Ride dispatch starting");

    let report = validate_config(&config);
    if !report.warnings.is_empty() {
        warn!("Configuration warnings:");
        for warning in &report.warnings {
            warn!(field = %warning.field, message = %warning.message);
        }
    }
    if !report.is_valid() {
        error!(error_count = report.errors.len(), "Configuration validation failed");
        for err in &report.errors {
            error!("{}", err);
        }
        anyhow::bail!("Cannot start dispatch service due to configuration errors");
    }

    if let Some(port) = config.monitoring.metrics_port {
        init_metrics(port)?;
        info!(port, "Prometheus exporter listening");
    }

    let controller = ShutdownController::with_signals();
    let Some(services) = run_until_shutdown(controller.child_token(), Services::build(&config)).await else {
        info!("Shutdown requested while connecting to backends");
        return Ok(());
    };
    let services = services?;

    let mut worker_handles = Vec::new();
    if role.runs_workers() {
        let mut worker = DispatchWorker::new(
            services.engine.clone(),
            services.surge.clone(),
            WorkerIntervals::from_config(&config),
        );
        match &services.dead_letter_source {
            Some(source) => {
                worker = worker.with_dead_letters(
                    services.dead_letters.clone(),
                    source.clone(),
                    config.dead_letter.read_batch_size as usize,
                );
            }
            None => debug!("No dead-letter streams to read"),
        }
        worker_handles = worker.spawn(controller.child_token());
        info!(jobs = worker_handles.len(), "Background workers started");
    }

    let api_result = if role.runs_api() && config.api.enabled {
        serve_api(&config, &services, controller.clone()).await
    } else {
        if role.runs_api() {
            warn!("api.enabled is false; serving no HTTP traffic");
        }
        controller.wait_for_shutdown().await;
        Ok(())
    };

    // The API may have stopped on its own; make sure the workers follow.
    controller.shutdown();
    for result in futures::future::join_all(worker_handles).await {
        if let Err(e) = result {
            error!(error = %e, "Worker task ended abnormally");
        }
    }

    info!("Ride dispatch stopped");
    api_result
}

async fn serve_api(config: &DispatchConfig, services: &Services, controller: ShutdownController) -> Result<()> {
    let addr: SocketAddr = config
        .api
        .bind_address()
        .parse()
        .with_context(|| format!("Invalid API bind address: {}", config.api.bind_address()))?;

    let state = Arc::new(DispatchApiState {
        service_name: config.service.name.clone(),
        service: services.dispatch.clone(),
        dead_letters: services.dead_letters.clone(),
        metrics: services.metrics.clone(),
    });
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API listener on {}", addr))?;
    info!(%addr, "HTTP API listening");

    let token = controller.child_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("HTTP API server failed")
}

/// Storage behind the store traits; one backend serves them all
struct Stores {
    rides: Arc<dyn RideStore>,
    requests: Arc<dyn MatchingRequestStore>,
    calls: Arc<dyn DriverCallStore>,
    surge: Arc<dyn SurgePriceStore>,
    quarantine: Arc<dyn QuarantineStore>,
}

impl Stores {
    fn from_backend<S>(store: Arc<S>, quarantine: Arc<dyn QuarantineStore>) -> Self
    where
        S: RideStore + MatchingRequestStore + DriverCallStore + SurgePriceStore + 'static,
    {
        Self {
            rides: store.clone(),
            requests: store.clone(),
            calls: store.clone(),
            surge: store,
            quarantine,
        }
    }
}

/// Everything `start` needs, wired from the configuration
struct Services {
    metrics: Arc<EngineMetrics>,
    surge: Arc<SurgePriceService>,
    engine: Arc<MatchingEngine>,
    dispatch: Arc<DispatchService>,
    dead_letters: Arc<DeadLetterConsumer>,
    /// Set when events go to Redis streams
    dead_letter_source: Option<Arc<dyn DeadLetterSource>>,
}

impl Services {
    async fn build(config: &DispatchConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let metrics = Arc::new(EngineMetrics::new());
        let external_timeout = Duration::from_millis(config.matching.external_call_timeout_ms);

        let stores = match config.store.store_type.as_str() {
            "postgres" => {
                let pg = config
                    .store
                    .postgres
                    .as_ref()
                    .context("store.type is 'postgres' but store.postgres is not set")?;
                let store = PostgresDispatchStore::connect(pg)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                info!(host = %pg.host, database = %pg.database, "Connected to PostgreSQL");
                let store = Arc::new(store);
                Stores::from_backend(store.clone(), store)
            }
            _ => {
                warn!("Using in-memory store; rides are lost on restart");
                Stores::from_backend(
                    Arc::new(InMemoryDispatchStore::new()),
                    Arc::new(InMemoryQuarantineStore::new()),
                )
            }
        };

        let redis = redis_connection(config).await?;

        let lock: Arc<dyn BatchLock> = match (config.lock.backend.as_str(), redis.clone()) {
            ("redis", Some(conn)) => Arc::new(RedisBatchLock::new(conn, clock.clone())),
            ("redis", None) => anyhow::bail!("lock.backend 'redis' requires store.redis"),
            _ => Arc::new(InMemoryBatchLock::new(clock.clone())),
        };

        let dead_letter_source: Option<Arc<dyn DeadLetterSource>> =
            match (config.events.publisher.as_str(), redis.clone()) {
                ("redis", Some(conn)) => {
                    let consumer_name = config
                        .service
                        .instance_id
                        .clone()
                        .unwrap_or_else(|| config.service.name.clone());
                    let source =
                        RedisStreamDeadLetterSource::connect(conn, config.dead_letter.consumer_group.clone(), consumer_name)
                            .await
                            .context("Failed to set up dead-letter consumer group")?;
                    Some(Arc::new(source))
                }
                _ => None,
            };

        let publisher: Arc<dyn EventPublisher> = match (config.events.publisher.as_str(), redis) {
            ("redis", Some(conn)) => Arc::new(RedisStreamPublisher::new(conn, config.events.stream_max_len)),
            ("redis", None) => anyhow::bail!("events.publisher 'redis' requires store.redis"),
            ("log", _) => Arc::new(LogEventPublisher),
            _ => Arc::new(InMemoryEventPublisher::new()),
        };
        debug!(
            lock = %config.lock.backend,
            publisher = %config.events.publisher,
            "Coordination backends selected"
        );

        let location: Arc<dyn LocationClient> = match &config.clients.location_url {
            Some(url) => Arc::new(
                HttpLocationClient::new(url, external_timeout).context("Failed to build location client")?,
            ),
            None => {
                warn!("No location service configured; no drivers will be found");
                Arc::new(StaticLocationClient::new())
            }
        };
        let profiles: Arc<dyn ProfileClient> = match &config.clients.profile_url {
            Some(url) => Arc::new(
                HttpProfileClient::new(url, external_timeout).context("Failed to build profile client")?,
            ),
            None => Arc::new(StaticProfileClient::new()),
        };

        let bus = Arc::new(EventBus::new(publisher, clock.clone(), metrics.clone()));
        let calls = Arc::new(DriverCallService::new(
            stores.rides.clone(),
            stores.calls.clone(),
            bus.clone(),
            config.driver_call.clone(),
            config.matching.max_retry_count,
            clock.clone(),
            metrics.clone(),
        ));
        let surge = Arc::new(SurgePriceService::new(
            stores.surge.clone(),
            stores.requests.clone(),
            location.clone(),
            config.surge.clone(),
            external_timeout,
            clock.clone(),
            metrics.clone(),
        ));
        let fares = Arc::new(FareEstimator::new(config.fares.clone()));

        let instance_id = config
            .service
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.service.name, uuid::Uuid::new_v4()));
        info!(%instance_id, "Batch lock owner identity");

        let engine = Arc::new(MatchingEngine::new(
            config.matching.clone(),
            instance_id,
            stores.rides.clone(),
            stores.requests.clone(),
            location,
            lock,
            calls.clone(),
            fares.clone(),
            bus.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let dispatch = Arc::new(DispatchService::new(
            stores.rides,
            stores.requests,
            calls,
            engine.clone(),
            surge.clone(),
            fares,
            profiles,
            bus.clone(),
            chrono_seconds(config.matching.request_ttl_seconds),
            external_timeout,
            clock.clone(),
            metrics.clone(),
        ));

        let dead_letters = Arc::new(DeadLetterConsumer::new(
            config.dead_letter.clone(),
            bus,
            stores.quarantine,
            clock,
            metrics.clone(),
        ));

        Ok(Self {
            metrics,
            surge,
            engine,
            dispatch,
            dead_letters,
            dead_letter_source,
        })
    }
}

/// Connect to Redis only when a backend actually uses it
async fn redis_connection(config: &DispatchConfig) -> Result<Option<ConnectionManager>> {
    let wanted = config.lock.backend == "redis" || config.events.publisher == "redis";
    match (&config.store.redis, wanted) {
        (Some(redis), true) => {
            let conn = redis_conn::connect(redis)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}:{}", redis.host, redis.port))?;
            info!(host = %redis.host, port = redis.port, "Connected to Redis");
            Ok(Some(conn))
        }
        _ => Ok(None),
    }
}

fn chrono_seconds(seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX / 1000))
}

async fn validate_command<P: AsRef<Path>>(config_path: P) -> Result<()> {
    info!(path = ?config_path.as_ref(), "Validating configuration");

    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "Failed to load configuration");
            anyhow::bail!(e);
        }
    };

    let report = validate_config(&config);

    println!("\n=== Configuration Validation Report ===\n");

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  [warn] [{}] {}", warning.field, warning.message);
        }
        println!();
    }

    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for err in &report.errors {
            println!("  [error] {}", err);
        }
        println!();
        anyhow::bail!("Configuration validation failed");
    }

    println!("[ok] Configuration is valid!");
    println!();
    println!("Service: {}", config.service.name);
    println!("Store: {}", config.store.store_type);
    println!("Batch lock: {}", config.lock.backend);
    println!("Event publisher: {}", config.events.publisher);
    println!(
        "Matching: batch every {}ms, up to {} requests, {} calls per request",
        config.matching.batch_interval_ms, config.matching.batch_size, config.matching.max_calls_per_request
    );
    println!("Offer window: {}s", config.driver_call.offer_ttl_seconds);

    Ok(())
}

async fn init_command<P: AsRef<Path>>(output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!(?output_path, "Initializing new configuration file");

    let config = generate_default_config();

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    save_config(&config, output_path)?;

    println!("[ok] Configuration file created successfully!");
    println!();
    println!("Location: {:?}", output_path);
    println!();
    println!("The defaults run everything in memory: store, batch lock and event log.");
    println!();
    println!("Next steps:");
    println!("  1. Point store.postgres and store.redis at real backends");
    println!("  2. Set clients.location_url and clients.profile_url");
    println!("  3. Run 'dispatchd validate --config {:?}' to check configuration", output_path);
    println!("  4. Run 'dispatchd start --config {:?}' to start the service", output_path);

    Ok(())
}
