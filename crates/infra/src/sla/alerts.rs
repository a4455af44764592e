use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use homefix_core::{AlertId, Clock};
use homefix_jobs::Actor;
use homefix_sla::{Alert, AlertError};

use crate::cache::{CacheInvalidator, DASHBOARD_KEY};
use crate::store::{Store, StoreError, UnitOfWork};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveAlertError {
    #[error("alert not found")]
    NotFound,

    #[error("alert already resolved")]
    AlreadyResolved,

    #[error("only operators may resolve alerts")]
    Forbidden,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResolveAlertError {
    pub fn code(&self) -> &'static str {
        match self {
            ResolveAlertError::NotFound => "NOT_FOUND",
            ResolveAlertError::AlreadyResolved => "ALREADY_RESOLVED",
            ResolveAlertError::Forbidden => "FORBIDDEN",
            ResolveAlertError::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<AlertError> for ResolveAlertError {
    fn from(err: AlertError) -> Self {
        match err {
            AlertError::AlreadyResolved => ResolveAlertError::AlreadyResolved,
            AlertError::UnknownType(kind) => {
                ResolveAlertError::Store(StoreError::backend(format!("unknown alert type {kind}")))
            }
        }
    }
}

/// Manual resolution of SLA alerts by operators.
pub struct AlertService<S> {
    store: S,
    clock: Arc<dyn Clock>,
    cache: Arc<dyn CacheInvalidator>,
}

impl<S: Store> AlertService<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            store,
            clock,
            cache,
        }
    }

    pub async fn resolve_alert(
        &self,
        actor: &Actor,
        alert_id: AlertId,
    ) -> Result<Alert, ResolveAlertError> {
        if !actor.is_admin() {
            return Err(ResolveAlertError::Forbidden);
        }

        let mut tx = self.store.begin().await?;
        let mut alert = tx
            .alert(alert_id)
            .await?
            .ok_or(ResolveAlertError::NotFound)?;
        alert.resolve(actor.user_id, self.clock.now())?;
        if !tx.resolve_alert(&alert).await? {
            return Err(ResolveAlertError::AlreadyResolved);
        }
        tx.commit().await.map_err(|err| match err {
            StoreError::Conflict(_) => ResolveAlertError::AlreadyResolved,
            other => ResolveAlertError::Store(other),
        })?;

        self.cache.invalidate(DASHBOARD_KEY);
        info!(
            alert_id = %alert.id,
            job_id = %alert.job_id,
            alert_type = alert.kind.as_str(),
            resolved_by = %actor.user_id,
            "sla alert resolved"
        );
        Ok(alert)
    }
}
