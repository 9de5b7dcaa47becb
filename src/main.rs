use std::collections::HashSet;
use std::sync::Arc;

use slog::*;
use sqlx::migrate::Migrate;
use sqlx::prelude::*;
use structopt::StructOpt;

use radcore::alerts::AlertSink;
use radcore::config::{self, Opt};
use radcore::db::Store;
use radcore::enforcement::Dispatcher;
use radcore::license::{HttpLicenseValidator, LicenseGate};
use radcore::logging::build_root_logger;
use radcore::nas::pool::NasPool;
use radcore::nas::HttpNasAdapter;
use radcore::quota_sync::QuotaSyncLoop;
use radcore::radius::RadiusServer;
use radcore::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let root_log = build_root_logger(opt.verbose, std::env::var("RADCORE_JOURNALD").is_ok());

    slog::info!(root_log, "starting radcore"; "build" => radcore::logging::GIT_VERSION);

    let config = match config::load(&opt.config) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            slog::error!(root_log, "failed to load configuration"; "err" => %e);
            std::process::exit(1);
        }
    };

    let db_string = format!(
        "postgres://{}:{}@{}/{}",
        config.db_user, config.db_pass, config.db_host, config.db_name
    );

    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .after_connect(|conn| {
            Box::pin(async move {
                conn.execute("SET default_transaction_isolation TO 'read committed'")
                    .await?;
                Ok(())
            })
        })
        .connect(&db_string);

    let db_pool = tokio::time::timeout(std::time::Duration::from_secs(5), db_pool)
        .await
        .expect("DB connection timed out")
        .expect("failed to connect to database");

    slog::info!(root_log, "connected to database"; "db" => &config.db_name, "host" => &config.db_host);
    let db_pool = Arc::new(db_pool);

    let mut migrator = sqlx::migrate::Migrator::new(opt.migration_directory.clone())
        .await
        .expect("unable to read available database schema migrations");

    if opt.migrate {
        slog::warn!(root_log, "running database migrations, this cannot be easily undone");
        migrator.set_ignore_missing(true);
        migrator.run(db_pool.as_ref()).await.expect("migration run failed");
        slog::info!(root_log, "migrations complete, exiting");
        return;
    }

    let available_migrations: HashSet<_> = migrator.iter().map(|m| m.version).collect();
    let applied_migrations: HashSet<_> = db_pool
        .as_ref()
        .acquire()
        .await
        .expect("unable to acquire DB connection")
        .list_applied_migrations()
        .await
        .expect("unable to query applied DB schema migrations")
        .iter()
        .map(|m| m.version)
        .collect();

    if available_migrations != applied_migrations {
        slog::error!(
            root_log,
            "the set of expected database migrations does not match what has been applied; \
             run with --db-upgrade after backing up the database"
        );
        std::process::exit(1);
    }

    let store = Arc::new(Store::new(db_pool.clone(), config.subscriber_cache_ttl, root_log.new(o!("component" => "store"))));

    let license_validator = config
        .license_endpoint
        .clone()
        .map(|endpoint| {
            Arc::new(HttpLicenseValidator::new(endpoint).expect("failed to build license client"))
                as Arc<dyn radcore::license::LicenseValidator>
        });
    let license = Arc::new(LicenseGate::new(
        license_validator.unwrap_or_else(|| Arc::new(NeverBlockedValidator)),
        config.license_grace_period,
        root_log.new(o!("component" => "license")),
    ));
    {
        let license = license.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                ticker.tick().await;
                license.poll_once().await;
            }
        });
    }

    let nas_pool = Arc::new(NasPool::new(config.nas_pool_size, |nas| {
        Ok(Arc::new(HttpNasAdapter::new(nas)?) as Arc<dyn radcore::nas::NasAdapter>)
    }));

    let alerts = AlertSink::new(store.clone(), root_log.new(o!("component" => "alerts")));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        nas_pool.clone(),
        alerts.clone(),
        root_log.new(o!("component" => "enforcement")),
    ));

    let radius_server = Arc::new(RadiusServer::new(
        store.clone(),
        license.clone(),
        dispatcher.clone(),
        alerts.clone(),
        config.static_ip_conflict_kick_threshold,
        config.timezone,
        config.boost_stacks_on_override,
        root_log.new(o!("component" => "radius")),
    ));

    {
        let radius_server = radius_server.clone();
        let log = root_log.new(o!("component" => "radius_auth_listener"));
        let bind = format!("0.0.0.0:{}", config.radius_auth_port).parse().unwrap();
        tokio::spawn(async move {
            if let Err(e) = radius_server.run_auth(bind).await {
                slog::error!(log, "auth listener stopped"; "err" => %e);
            }
        });
    }
    {
        let radius_server = radius_server.clone();
        let log = root_log.new(o!("component" => "radius_acct_listener"));
        let bind = format!("0.0.0.0:{}", config.radius_acct_port).parse().unwrap();
        tokio::spawn(async move {
            if let Err(e) = radius_server.run_accounting(bind).await {
                slog::error!(log, "accounting listener stopped"; "err" => %e);
            }
        });
    }

    let quota_sync = Arc::new(QuotaSyncLoop::new(
        store.clone(),
        nas_pool.clone(),
        dispatcher.clone(),
        config.enforcement_max_concurrency,
        config.timezone,
        config.boost_stacks_on_override,
        root_log.new(o!("component" => "quota_sync")),
    ));
    tokio::spawn(quota_sync.run(config.quota_sync_interval));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        dispatcher.clone(),
        alerts.clone(),
        config.timezone,
        config.daily_reset_time,
        config.accounting_archival_time,
        config.sharing_detection_time,
        config.sharing_detection_enabled,
        config.sharing_detection_ttl_threshold,
        config.accounting_retention_days,
        config.boost_stacks_on_override,
        root_log.new(o!("component" => "scheduler")),
    ));
    scheduler.spawn_all();

    slog::info!(root_log, "radcore is running");
    tokio::signal::ctrl_c().await.expect("failed to listen for shutdown signal");
    slog::info!(root_log, "received shutdown signal, exiting");
}

/// Used when no license endpoint is configured (e.g. local development):
/// reports an always-active license so the gate never rejects auth.
struct NeverBlockedValidator;

#[async_trait::async_trait]
impl radcore::license::LicenseValidator for NeverBlockedValidator {
    async fn check(&self) -> Result<radcore::license::LicenseState, radcore::license::LicenseError> {
        Ok(radcore::license::LicenseState {
            status: radcore::license::LicenseStatus::Active,
            max_subscribers: u64::MAX,
            encryption_key: String::new(),
        })
    }
}
