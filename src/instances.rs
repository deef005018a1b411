//! Instance handler — an in-memory snapshot of the registry, refreshed by a
//! periodic import, updated eagerly on registration and health writes.
//! Serves the locator's read path.
//!
//! Generalizes the shape of a plain in-memory worker registry (one
//! `HashMap` guarded by a lock, with a periodic background reconciliation
//! that replaces the map wholesale on success and leaves it untouched on
//! failure) to the read/write-lock split this component's concurrency
//! model requires: writers touch the map only while mutating it, readers
//! (the locator) hold a read lock for the duration of a lookup.

use crate::heartbeat::{Health, HeartbeatMessage};
use crate::store::{PutOptions, Store, StoreError, FIELD_HEALTH, FIELD_REGISTRATION};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Recovers from a poisoned lock the same way a plain `Mutex`-guarded
/// in-memory registry would: a panic while holding the lock shouldn't
/// permanently wedge every subsequent reader/writer.
fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct InstanceHandler {
    snapshot: RwLock<HashMap<String, HeartbeatMessage>>,
    store: Store,
}

impl InstanceHandler {
    pub fn new(store: Store) -> Self {
        InstanceHandler {
            snapshot: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Requires `msg.registration` to be set. Writes it to the store with
    /// `with_expire: true, field_must_exist: None`; on success, updates the
    /// snapshot.
    pub async fn register_instance(
        &self,
        hostname: &str,
        msg: HeartbeatMessage,
    ) -> Result<(), InstanceError> {
        let registration = msg
            .registration
            .clone()
            .ok_or_else(|| InstanceError::InvalidArgument("missing registration".to_string()))?;

        self.store
            .put(
                hostname,
                FIELD_REGISTRATION,
                &registration,
                PutOptions {
                    field_must_exist: None,
                    with_expire: true,
                },
            )
            .await?;

        let mut guard = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        guard
            .entry(hostname.to_string())
            .or_default()
            .merge(HeartbeatMessage::registration(registration));
        Ok(())
    }

    /// Writes `Health` with `field_must_exist: Some(FIELD_REGISTRATION)`; on
    /// success, updates `snapshot[hostname].health`, else `NotFound`.
    pub async fn update_health(&self, hostname: &str, health: Health) -> Result<(), InstanceError> {
        let result = self
            .store
            .put(
                hostname,
                FIELD_HEALTH,
                &health,
                PutOptions {
                    field_must_exist: Some(FIELD_REGISTRATION.to_string()),
                    with_expire: true,
                },
            )
            .await;

        match result {
            Ok(()) => {
                let mut guard = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
                guard
                    .entry(hostname.to_string())
                    .or_default()
                    .merge(HeartbeatMessage::health(health));
                Ok(())
            }
            Err(StoreError::ConditionalMiss(_)) => {
                Err(InstanceError::NotFound(hostname.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the snapshot wholesale on a successful `store.get_all()`;
    /// leaves it untouched on failure, so nearest queries keep answering
    /// from the last good snapshot during a registry outage.
    pub async fn import(&self) {
        match self.store.get_all::<HeartbeatMessage>().await {
            Ok(fresh) => {
                let mut guard = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
                *guard = fresh;
            }
            Err(e) => {
                tracing::warn!(error = %e, "periodic import failed; snapshot left intact");
            }
        }
    }

    /// Runs `import()` on `period` until `shutdown` fires.
    pub async fn run_importer(
        &self,
        period: std::time::Duration,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.import().await,
            }
        }
    }

    /// A read-only iterator over cloned snapshot entries, so external
    /// readers (the locator's nearest-query path) cannot mutate shared
    /// state.
    pub fn snapshot_iter(&self) -> Vec<(String, HeartbeatMessage)> {
        let guard = read_or_recover(&self.snapshot);
        guard
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        read_or_recover(&self.snapshot).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
