//! Crossflow entry point
//!
//! Explicit composition root: configuration comes in, every engine gets its
//! dependencies handed to it, background loops run until a signal lands.
//!
//! ```text
//! ┌────────┐   ┌───────────┐   ┌──────────────┐   ┌────────────┐
//! │ Config │──▶│ Cache/DB  │──▶│ Engines      │──▶│ Loops      │
//! │ (env)  │   │ + wallet  │   │ (dex/orders/ │   │ (watcher/  │
//! └────────┘   └───────────┘   │  p2p)        │   │  scheduler)│
//!                              └──────────────┘   └────────────┘
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 unrecoverable
//! startup failure (store unreachable after retries).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crossflow::backup::{BackupService, LocalOnlyUploader, PgDumpSnapshotter};
use crossflow::cache::{CacheStore, MemoryCache};
use crossflow::config::AppConfig;
use crossflow::copytrade::CopyTradeDispatcher;
use crossflow::dex::DexAggregator;
use crossflow::events::EventBus;
use crossflow::fees::FeeService;
use crossflow::notify::{LogNotifier, NotificationPort};
use crossflow::orders::{OrderEngine, TriggerWatcher};
use crossflow::p2p::P2pEngine;
use crossflow::scheduler::{Schedule, Scheduler};
use crossflow::store::{
    MarketDataStore, MemoryStore, OrderStore, P2pStore, PgStore, TransactionStore, UserStore,
};
use crossflow::wallet::{InMemoryWallet, WalletAdapter};
use crossflow::{logging, telemetry};

/// Startup grace before a stale PENDING order is considered abandoned.
const RECOVERY_THRESHOLD_MINUTES: i64 = 10;
/// Slippage bound applied to order-engine swaps.
const DEFAULT_SLIPPAGE_BPS: u32 = 50;
/// In-flight work gets this long after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct Stores {
    orders: Arc<dyn OrderStore>,
    p2p: Arc<dyn P2pStore>,
    users: Arc<dyn UserStore>,
    transactions: Arc<dyn TransactionStore>,
    market: Arc<dyn MarketDataStore>,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let config = match AppConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return 1;
        }
    };
    let _log_guard = logging::init_logging(&config.log);
    info!("crossflow {} starting", env!("CARGO_PKG_VERSION"));
    telemetry::register_metrics();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Cache
    let cache = MemoryCache::new();
    cache.spawn_sweeper(shutdown_rx.clone());
    let cache: Arc<dyn CacheStore> = cache;

    // Persistent store: Postgres when configured, in-memory otherwise
    let stores = match build_stores(&config).await {
        Ok(stores) => stores,
        Err(e) => {
            error!("store unreachable after retries: {}", e);
            return 2;
        }
    };

    // Ports: the real signer and chat frontend plug in here
    let wallet: Arc<dyn WalletAdapter> = Arc::new(InMemoryWallet::new());
    let notifier: Arc<dyn NotificationPort> = Arc::new(LogNotifier);

    // Engines
    let fees = Arc::new(FeeService::new(config.fees.clone()));
    let aggregator = Arc::new(DexAggregator::from_config(&config, cache.clone()));
    let order_engine = Arc::new(OrderEngine::new(
        stores.orders.clone(),
        stores.transactions.clone(),
        aggregator.clone(),
        cache.clone(),
        notifier.clone(),
        EventBus::default(),
        DEFAULT_SLIPPAGE_BPS,
    ));
    let p2p_engine = Arc::new(P2pEngine::new(
        stores.p2p.clone(),
        stores.users.clone(),
        stores.transactions.clone(),
        wallet.clone(),
        notifier.clone(),
        fees.p2p_fee_bps(),
    ));

    // Startup reconciliation: status rows are the source of truth
    match p2p_engine.recover_escrows().await {
        Ok(0) => {}
        Ok(n) => warn!("settled {} interrupted escrow movements", n),
        Err(e) => error!("escrow reconciliation failed: {}", e),
    }
    match order_engine
        .recover_stale_pending(chrono::Duration::minutes(RECOVERY_THRESHOLD_MINUTES))
        .await
    {
        Ok(0) => {}
        Ok(n) => info!("re-armed {} stale conditional orders", n),
        Err(e) => error!("order recovery failed: {}", e),
    }

    // Copy-trading observer
    let dispatcher = CopyTradeDispatcher::new(
        order_engine.clone(),
        stores.users.clone(),
        wallet.clone(),
    );
    let copy_handle = dispatcher.spawn(order_engine.events().subscribe(), shutdown_rx.clone());

    // Trigger watcher
    let watcher = TriggerWatcher::new(
        order_engine.clone(),
        aggregator.clone(),
        cache.clone(),
        stores.market.clone(),
        config.clone(),
    );
    let watcher_handle = tokio::spawn(watcher.run(shutdown_rx.clone()));

    // Scheduler jobs
    let mut scheduler = Scheduler::new();
    {
        let p2p = p2p_engine.clone();
        scheduler.register(
            "p2p.sweep_expired",
            Schedule::Every(Duration::from_secs(60)),
            move || {
                let p2p = p2p.clone();
                async move {
                    p2p.sweep_expired().await?;
                    Ok(())
                }
            },
        );
    }
    {
        let fees = fees.clone();
        let users = stores.users.clone();
        let notifier = notifier.clone();
        scheduler.register(
            "fees.notify_day",
            Schedule::DailyAtUtc { hour: 0, minute: 0 },
            move || {
                let fees = fees.clone();
                let users = users.clone();
                let notifier = notifier.clone();
                async move {
                    fees.notify_fee_day(&users, &notifier).await?;
                    Ok(())
                }
            },
        );
    }
    if let Some(database_url) = config.database_url.clone() {
        let backup = Arc::new(BackupService::new(
            &config.backup_dir,
            Arc::new(PgDumpSnapshotter::new(&database_url)),
            Arc::new(LocalOnlyUploader),
        ));
        scheduler.register(
            "backup.snapshot_db",
            Schedule::Every(Duration::from_secs(6 * 3600)),
            move || {
                let backup = backup.clone();
                async move {
                    backup.create_backup().await?;
                    Ok(())
                }
            },
        );
    }
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    // Telemetry
    telemetry::spawn_system_sampler(shutdown_rx.clone());
    telemetry::spawn_user_sampler(stores.users.clone(), shutdown_rx.clone());
    let metrics_addr = config.metrics_addr.clone();
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = telemetry::serve(&metrics_addr, shutdown_rx).await {
            error!("metrics endpoint failed: {}", e);
        }
    });

    info!("crossflow up");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handling failed: {}", e);
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = watcher_handle.await;
        let _ = scheduler_handle.await;
        let _ = copy_handle.await;
        let _ = metrics_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("background tasks did not drain in time, aborting");
    }
    info!("crossflow stopped");
    0
}

/// Connect to Postgres with bounded retries, or fall back to the in-memory
/// store when no DATABASE_URL is configured.
async fn build_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    match &config.database_url {
        Some(url) => {
            let mut last_err: Option<anyhow::Error> = None;
            for attempt in 1..=3u32 {
                match PgStore::connect(url).await {
                    Ok(pg) => {
                        pg.ensure_schema().await?;
                        let pg = Arc::new(pg);
                        return Ok(Stores {
                            orders: pg.clone(),
                            p2p: pg.clone(),
                            users: pg.clone(),
                            transactions: pg.clone(),
                            market: pg,
                        });
                    }
                    Err(e) => {
                        warn!(attempt, "postgres connect failed: {}", e);
                        last_err = Some(e.into());
                        tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| anyhow::anyhow!("postgres unreachable")))
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store");
            let mem = Arc::new(MemoryStore::new());
            Ok(Stores {
                orders: mem.clone(),
                p2p: mem.clone(),
                users: mem.clone(),
                transactions: mem.clone(),
                market: mem,
            })
        }
    }
}
