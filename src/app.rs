use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::CommandFactory;
use clap::Parser;
use fieldx::fxstruct;
use fieldx_plus::fx_plus;
use garde::Validate;
use tokio::signal;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::bus::memory::BusServer;
use crate::bus::MessageBus;
use crate::bus::SubscriptionOptions;
use crate::cache::CacheConfig;
use crate::cache::OrderCache;
use crate::error::AppError;
use crate::error::LookupError;
use crate::ingest::OrderIngestor;
use crate::publisher::sample_order;
use crate::publisher::OrderPublisher;
use crate::recovery::RecoveryReport;
#[cfg(feature = "pg")]
use crate::store::driver::pg::Pg;
#[cfg(feature = "sqlite")]
use crate::store::driver::sqlite::Sqlite;
use crate::store::DatabaseDriver;
use crate::store::DbStore;
use crate::traits::RecordStore;
use crate::types::OrderKey;
use crate::types::OrderSummary;

#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, author, name = "order-cache")]
pub(crate) struct Cli {
    /// Number of orders kept in the cache. 0 disables caching.
    #[clap(long, env = "ORDER_CACHE_CACHE_SIZE", default_value_t = 10)]
    #[garde(skip)]
    cache_size: usize,

    /// Instance key scoping the persisted cache log.
    #[clap(long, env = "ORDER_CACHE_APP_KEY", default_value = "default")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    app_key: String,

    /// Drop records from memory as soon as their key leaves the insertion queue.
    #[clap(long, env = "ORDER_CACHE_PRUNE_EVICTED", default_value_t = false)]
    #[garde(skip)]
    prune_evicted: bool,

    /// Use SQLite as the database backend.
    #[clap(long, env = "ORDER_CACHE_SQLITE", default_value_t = false)]
    #[garde(
        custom(Self::feature_enabled(cfg!(feature = "sqlite"), "sqlite")),
        custom(Self::one_backend(&self.pg))
    )]
    sqlite: bool,

    /// SQLite database file. A temporary directory is used when omitted.
    #[clap(long, env = "ORDER_CACHE_SQLITE_PATH")]
    #[fieldx(get(clone, attributes_fn(allow(unused))))]
    #[garde(skip)]
    sqlite_path: Option<PathBuf>,

    /// Use PostgreSQL as the database backend.
    #[clap(long, env = "ORDER_CACHE_PG", default_value_t = false)]
    #[garde(custom(Self::feature_enabled(cfg!(feature = "pg"), "pg")))]
    pg: bool,

    #[clap(long, env = "ORDER_CACHE_PG_HOST", default_value = "localhost")]
    #[fieldx(get(clone, attributes_fn(allow(unused))))]
    #[garde(skip)]
    pg_host: String,

    #[clap(long, env = "ORDER_CACHE_PG_PORT", default_value_t = 5432)]
    #[fieldx(get(copy, attributes_fn(allow(unused))))]
    #[garde(skip)]
    pg_port: u16,

    #[clap(long, env = "ORDER_CACHE_PG_USER", default_value = "orders")]
    #[fieldx(get(clone, attributes_fn(allow(unused))))]
    #[garde(skip)]
    pg_user: String,

    #[clap(long, env = "ORDER_CACHE_PG_PASSWORD", hide_env_values = true, default_value = "orders")]
    #[fieldx(get(clone, attributes_fn(allow(unused))))]
    #[garde(skip)]
    pg_password: String,

    #[clap(long, env = "ORDER_CACHE_PG_DATABASE", default_value = "orders")]
    #[fieldx(get(clone, attributes_fn(allow(unused))))]
    #[garde(skip)]
    pg_database: String,

    /// Bus subject carrying order messages.
    #[clap(long, env = "ORDER_CACHE_SUBJECT", default_value = "orders")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    subject: String,

    /// Stable client identity; durable progress is tracked per client id and durable name.
    #[clap(long, env = "ORDER_CACHE_CLIENT_ID", default_value = "order-cache")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    client_id: String,

    #[clap(long, env = "ORDER_CACHE_DURABLE_NAME", default_value = "order-cache-durable")]
    #[fieldx(get(clone))]
    #[garde(length(min = 1))]
    durable_name: String,

    /// Maximum number of unacknowledged messages.
    #[clap(long, env = "ORDER_CACHE_MAX_IN_FLIGHT", default_value_t = 10)]
    #[garde(range(min = 1))]
    max_in_flight: usize,

    /// Seconds before an unacknowledged message is redelivered.
    #[clap(long, env = "ORDER_CACHE_ACK_WAIT", default_value_t = 30)]
    #[garde(range(min = 1))]
    ack_wait: u64,

    /// Publish this many sample orders after startup.
    #[clap(long, env = "ORDER_CACHE_DEMO_ORDERS", default_value_t = 0)]
    #[garde(skip)]
    demo_orders: usize,

    /// Look these orders up after startup and print their summaries.
    #[clap(long = "lookup", env = "ORDER_CACHE_LOOKUP", value_delimiter = ',')]
    #[fieldx(get(clone))]
    #[garde(skip)]
    lookups: Vec<OrderKey>,

    /// Shut down right after startup work instead of waiting for Ctrl-C.
    #[clap(long, env = "ORDER_CACHE_ONCE", default_value_t = false)]
    #[garde(skip)]
    once: bool,

    /// File to send log into
    #[clap(long, env = "ORDER_CACHE_LOG_FILE")]
    #[fieldx(get(clone, attributes_fn(allow(unused))))]
    #[garde(skip)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn feature_enabled<'a>(
        feature_enabled: bool,
        feature: &'static str,
    ) -> impl FnOnce(&'a bool, &()) -> garde::Result {
        move |value, _| {
            if !*value || feature_enabled {
                Ok(())
            }
            else {
                Err(garde::Error::new(format!("Build feature '{feature}' must be enabled.")))
            }
        }
    }

    fn one_backend<'a>(other: &'a bool) -> impl FnOnce(&'a bool, &()) -> garde::Result {
        move |value, _| {
            if *value != *other {
                Ok(())
            }
            else {
                Err(garde::Error::new("Exactly one of --sqlite or --pg must be given"))
            }
        }
    }

    fn cache_config(&self) -> Result<CacheConfig, AppError> {
        Ok(CacheConfig::builder()
            .capacity(self.cache_size)
            .instance_key(self.app_key.as_str())
            .prune_evicted(self.prune_evicted)
            .build()?)
    }

    fn subscription_options(&self) -> Result<SubscriptionOptions, AppError> {
        Ok(SubscriptionOptions::builder()
            .subject(self.subject.as_str())
            .durable_name(self.durable_name.as_str())
            .max_in_flight(self.max_in_flight)
            .ack_wait(Duration::from_secs(self.ack_wait))
            .build()?)
    }
}

/// The order service: recovers the cache, ingests orders from the bus, answers lookups.
#[fx_plus(app, rc, new(private), sync, get, fallible(off, error(AppError)), builder(vis(pub)))]
pub struct OrderServiceApp {
    #[fieldx(inner_mut, clearer, builder("_cli_args"))]
    cli_args: Vec<String>,

    #[fieldx(lazy, private, fallible(error(clap::Error)), get(clone))]
    cli: Cli,

    // Only used by the SQLite backend.
    #[fieldx(lazy, private, get(attributes_fn(allow(unused))), fallible)]
    tempdir: tempfile::TempDir,

    #[fieldx(lock, get(clone, vis(pub)), set("_set_recovery"), builder(off))]
    recovery: Option<RecoveryReport>,

    /// Messages acknowledged by the ingestion pipeline so far.
    #[fieldx(lock, get(copy, vis(pub)), set("_set_ingested"), builder(off))]
    ingested: u64,

    /// Summaries of the orders found by the startup lookups.
    #[fieldx(lock, get(clone, vis(pub)), set("_set_found"), builder(off))]
    found: Vec<OrderSummary>,
}

impl OrderServiceApp {
    fn build_cli(&self) -> Result<Cli, clap::Error> {
        Ok(if let Some(custom_args) = self.clear_cli_args() {
            Cli::try_parse_from(custom_args.into_iter())?
        }
        else {
            Cli::try_parse()?
        })
    }

    fn build_tempdir(&self) -> Result<tempfile::TempDir, AppError> {
        Ok(tempfile::Builder::new().prefix("order-cache").tempdir()?)
    }

    fn validate(&self) -> Result<(), AppError> {
        if let Err(err) = self.cli()?.validate() {
            let mut cmd = Cli::command();
            return Err(cmd.error(ErrorKind::InvalidValue, err).into());
        }

        Ok(())
    }

    #[allow(unused)]
    fn db_path(&self) -> Result<PathBuf, AppError> {
        self.cli()?
            .sqlite_path()
            .map_or_else(|| self.tempdir().map(|t| t.path().join("orders.db")), Ok)
    }

    #[cfg(feature = "tracing")]
    fn log_writer(&self) -> Result<Box<dyn std::io::Write + Send>, AppError> {
        #[cfg(feature = "tracing-file")]
        if let Some(log_file) = self.cli()?.log_file() {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)?;
            return Ok(Box::new(file));
        }

        Ok(Box::new(std::io::stderr()))
    }

    #[cfg(feature = "tracing")]
    fn setup_tracing(&self) -> Result<(), AppError> {
        use std::sync::Mutex;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let filter = tracing_subscriber::EnvFilter::from_default_env();

        let tracing_registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(Mutex::new(self.log_writer()?)));

        // Another app instance in the same process may have set it up already.
        if let Err(err) = tracing_registry.try_init() {
            debug!("Tracing is already initialized: {err}");
        }
        else {
            info!("Tracing initialized");
        }

        Ok(())
    }

    pub async fn execute(&self) -> Result<(), AppError> {
        if let Err(err) = self.cli() {
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    err.print()?;
                    Ok(())
                }
                _ => Err(err.into()),
            };
        }

        self.validate()?;

        #[cfg(feature = "tracing")]
        self.setup_tracing()?;

        self.execute_per_db().await
    }

    async fn execute_per_db(&self) -> Result<(), AppError> {
        #[allow(unused)]
        let cli = self.cli()?;

        #[cfg(feature = "sqlite")]
        if cli.sqlite() {
            let driver = Sqlite::connect(&self.db_path()?).await?;
            return self.serve(&driver).await;
        }

        #[cfg(feature = "pg")]
        if cli.pg() {
            let driver = Pg::builder()
                .host(cli.pg_host())
                .port(cli.pg_port())
                .user(cli.pg_user())
                .password(cli.pg_password())
                .database(cli.pg_database())
                .build()?;
            driver.connect().await?;
            return self.serve(&*driver).await;
        }

        Err(AppError::Config("no database backend selected".to_string()))
    }

    #[instrument(level = "trace", skip(self, driver), fields(driver = driver.name()))]
    async fn serve<D: DatabaseDriver>(&self, driver: &D) -> Result<(), AppError> {
        let cli = self.cli()?;

        driver.prepare().await?;

        let cache = Arc::new(
            OrderCache::<DbStore>::builder()
                .store(Arc::new(DbStore::from_driver(driver)))
                .config(cli.cache_config()?)
                .build()?,
        );

        // Without the log the cache simply starts cold.
        match cache.recover().await {
            Ok(report) => {
                self._set_recovery(Some(report));
            }
            Err(err) => {
                warn!("Cache recovery failed, starting with an empty cache: {err}");
            }
        }

        let server = BusServer::new();
        let bus = Arc::new(server.connect(cli.client_id()));
        let ingestor = Arc::new(OrderIngestor::builder().cache(cache.clone()).build()?);

        let subscription = match ingestor.subscribe(bus.clone(), cli.subscription_options()?).await {
            Ok(subscription) => {
                info!("Ingesting orders from '{}'", cli.subject());
                Some(subscription)
            }
            Err(err) => {
                error!("Order ingestion is unavailable, serving lookups only: {err}");
                None
            }
        };

        if cli.demo_orders() > 0 {
            let publisher = OrderPublisher::new(
                Arc::new(server.connect(format!("{}-publisher", cli.client_id()))),
                cli.subject(),
            );
            for _ in 0..cli.demo_orders() {
                publisher.publish_detached(sample_order()).await?;
            }

            if subscription.is_some() {
                self.await_ingestion(
                    &ingestor,
                    cli.demo_orders() as u64,
                    Duration::from_secs(cli.ack_wait() * 2),
                )
                .await;
            }
        }
        self._set_ingested(ingestor.acked());

        self.lookup_orders(&cache, &cli.lookups()).await?;

        if !cli.once() {
            info!("Order service is running, press Ctrl-C to stop");
            signal::ctrl_c().await?;
        }

        info!("Shutting down");
        if let Some(subscription) = subscription {
            if let Err(err) = subscription.unsubscribe().await {
                warn!("Unsubscribe failed: {err}");
            }
        }
        bus.close().await?;
        self._set_ingested(ingestor.acked());
        cache.finish().await?;
        driver.checkpoint().await?;

        Ok(())
    }

    async fn await_ingestion<S: RecordStore>(&self, ingestor: &OrderIngestor<S>, expected: u64, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while ingestor.acked() < expected {
            if tokio::time::Instant::now() >= deadline {
                warn!("Only {} of {expected} demo orders ingested", ingestor.acked());
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        debug!("{expected} demo orders ingested");
    }

    async fn lookup_orders<S: RecordStore>(&self, cache: &OrderCache<S>, keys: &[OrderKey]) -> Result<(), AppError> {
        let mut found = Vec::with_capacity(keys.len());

        for key in keys {
            match cache.get(*key).await {
                Ok(summary) => {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    found.push(summary);
                }
                Err(LookupError::NotFound(_)) => {
                    warn!("Order #{key} not found");
                }
                Err(err) => {
                    error!("{err}");
                }
            }
        }

        self._set_found(found);
        Ok(())
    }

    pub async fn run() -> Result<(), AppError> {
        OrderServiceApp::__fieldx_new().execute().await
    }
}

impl OrderServiceAppBuilder {
    pub fn cli_args<S: ToString>(self, args: Vec<S>) -> Self {
        self._cli_args(args.into_iter().map(|s| s.to_string()).collect())
    }
}

impl Debug for OrderServiceApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OrderServiceApp {{ ... }}")
    }
}
