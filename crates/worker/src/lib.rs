//! Process wiring for the background workers.
//!
//! Connects the configured store and runs the outbox dispatcher and the SLA
//! engine as independent tasks sharing one shutdown token.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use homefix_core::{Clock, SystemClock};
use homefix_infra::outbox::{DispatcherStats, LogSender, OutboxDispatcher, OutboxEnqueuer};
use homefix_infra::sla::{SlaEngine, SlaEngineStats};
use homefix_infra::{
    InMemoryStore, Notifier, PlainTextComposer, PostgresStore, ReadCache, Settings, Store,
    WorkerHandle,
};

/// Dashboard summary cache shared by the write paths of this process.
pub type DashboardCache = ReadCache<String>;

pub struct Workers {
    dispatcher: WorkerHandle<DispatcherStats>,
    sla: WorkerHandle<SlaEngineStats>,
}

impl Workers {
    /// Wait for both loops to stop. The shutdown token must be cancelled by
    /// the caller.
    pub async fn join(self) -> (DispatcherStats, SlaEngineStats) {
        let dispatcher = self.dispatcher.join().await;
        let sla = self.sla.join().await;
        (dispatcher, sla)
    }
}

/// Spawn the dispatcher and the SLA engine over `store`.
pub fn start<S>(
    store: S,
    settings: &Settings,
    clock: Arc<dyn Clock>,
    shutdown: &CancellationToken,
) -> Workers
where
    S: Store + Clone,
{
    let cache = Arc::new(DashboardCache::new(settings.cache_ttl()));
    let notifier = Notifier::new(
        Arc::new(PlainTextComposer::default()),
        OutboxEnqueuer::new(Arc::clone(&clock)),
        Arc::clone(&clock),
    );

    let dispatcher = OutboxDispatcher::new(
        store.clone(),
        LogSender,
        Arc::clone(&clock),
        settings.dispatcher_config(),
    )
    .spawn(shutdown.clone());

    let sla = SlaEngine::new(store, notifier, clock, cache, settings.sla_engine_config())
        .spawn(shutdown.clone());

    Workers { dispatcher, sla }
}

/// Connect the configured store, run both loops until `shutdown` fires, then
/// join them.
pub async fn run(settings: Settings, shutdown: CancellationToken) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let workers = match settings.database.url.as_deref() {
        Some(url) => {
            let store = PostgresStore::connect(
                url,
                settings.database.max_connections,
                settings.acquire_timeout(),
            )
            .await
            .context("failed to connect to the database")?;
            store
                .migrate()
                .await
                .context("failed to apply the schema")?;
            info!("connected to postgres");
            start(store, &settings, clock, &shutdown)
        }
        None => {
            warn!("database.url not set; running against the in-memory store");
            start(InMemoryStore::new(), &settings, clock, &shutdown)
        }
    };

    shutdown.cancelled().await;
    let (dispatched, sla) = workers.join().await;
    info!(
        dispatch_cycles = dispatched.cycles,
        sent = dispatched.sent,
        failed = dispatched.failed,
        sla_cycles = sla.cycles,
        alerts_created = sla.alerts_created,
        "workers stopped"
    );
    Ok(())
}
