//! Periodic evaluation of the SLA rule set.
//!
//! Every cycle asks the store for the jobs breaching each rule. Each breach is
//! handled in its own unit of work: skip when an unresolved alert for the same
//! `(job, type)` already exists, otherwise raise the alert and notify every
//! operator. Failures are contained to the breach (or rule) that caused them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use homefix_core::Clock;
use homefix_notify::NotificationKind;
use homefix_sla::{Alert, AlertType, Breach, SlaPolicy};

use crate::cache::{CacheInvalidator, DASHBOARD_KEY};
use crate::notifier::{JobRef, Notifier};
use crate::store::{Store, StoreError, UnitOfWork};
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaEngineConfig {
    pub interval: Duration,
    pub policy: SlaPolicy,
}

impl Default for SlaEngineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2 * 60),
            policy: SlaPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlaCycleReport {
    pub breaches: usize,
    pub created: usize,
    /// Breaches that already had an unresolved alert.
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaEngineStats {
    pub cycles: u64,
    pub alerts_created: u64,
    pub errors: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

pub struct SlaEngine<S> {
    store: S,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    cache: Arc<dyn CacheInvalidator>,
    config: SlaEngineConfig,
}

impl<S: Store> SlaEngine<S> {
    pub fn new(
        store: S,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        cache: Arc<dyn CacheInvalidator>,
        config: SlaEngineConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            cache,
            config,
        }
    }

    pub async fn run_cycle(&self) -> SlaCycleReport {
        let now = self.clock.now();
        let mut report = SlaCycleReport::default();

        for kind in AlertType::ALL {
            let breaches = match self.store.find_breaches(&self.config.policy, kind, now).await {
                Ok(breaches) => breaches,
                Err(err) => {
                    report.errors += 1;
                    error!(alert_type = kind.as_str(), error = %err, "sla rule evaluation failed");
                    continue;
                }
            };

            for breach in &breaches {
                report.breaches += 1;
                match self.raise(breach, now).await {
                    Ok(true) => report.created += 1,
                    Ok(false) => report.skipped += 1,
                    Err(err) => {
                        report.errors += 1;
                        warn!(
                            job_id = %breach.job_id,
                            alert_type = kind.as_str(),
                            error = %err,
                            "failed to raise sla alert"
                        );
                    }
                }
            }
        }

        if report.created > 0 {
            self.cache.invalidate(DASHBOARD_KEY);
            info!(
                created = report.created,
                skipped = report.skipped,
                "sla alerts raised"
            );
        }
        report
    }

    /// Returns whether a new alert was written. A concurrent pass that raised
    /// the same alert first wins; this unit is then discarded whole.
    async fn raise(&self, breach: &Breach, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tx = self.store.begin().await?;
        if tx.has_unresolved_alert(breach.job_id, breach.kind).await? {
            return Ok(false);
        }

        let alert = Alert::raise(breach, now);
        if !tx.insert_alert(&alert).await? {
            return Ok(false);
        }

        let operators = tx.admin_ids().await?;
        self.notifier
            .notify(
                &mut tx,
                &operators,
                NotificationKind::SlaAlert,
                &alert.message,
                &JobRef::from(breach),
            )
            .await?;
        match tx.commit().await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation(_)) => return Ok(false),
            Err(err) => return Err(err),
        }

        info!(
            alert_id = %alert.id,
            job_id = %alert.job_id,
            alert_type = alert.kind.as_str(),
            operators = operators.len(),
            "sla alert created"
        );
        Ok(true)
    }

    pub fn spawn(self, shutdown: CancellationToken) -> WorkerHandle<SlaEngineStats> {
        let stats = Arc::new(Mutex::new(SlaEngineStats::default()));
        let join = tokio::spawn({
            let stats = Arc::clone(&stats);
            let shutdown = shutdown.clone();
            async move { self.run(shutdown, stats).await }
        });
        WorkerHandle::new("sla-engine", shutdown, join, stats)
    }

    async fn run(self, shutdown: CancellationToken, stats: Arc<Mutex<SlaEngineStats>>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "sla engine started"
        );

        let period = self.config.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.run_cycle().await;
            let mut totals = stats.lock().unwrap_or_else(|p| p.into_inner());
            totals.cycles += 1;
            totals.alerts_created += report.created as u64;
            totals.errors += report.errors as u64;
            totals.last_cycle_at = Some(self.clock.now());
        }

        info!("sla engine stopped");
    }
}
