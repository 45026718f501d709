// Transaction manager.
//
// Owns the current transaction scope, drives the commit and rollback
// paths, and hands the accumulated cache-dirty set to the cache manager
// after a successful write phase. Compensation runs strictly in reverse
// log order; compensation failures are logged and aggregated, never
// escalated into a `Failed` terminal state.

use serde_json::{json, Map, Value as Json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::error::{ClientError, Result, TransactionError};
use crate::transaction::types::{OpEntry, OpKind, Savepoint, Transaction, TransactionState};
use crate::transport::RpcTransport;

/// Outcome of a rollback's compensation pass.
#[derive(Debug, Default)]
pub struct RollbackSummary {
    pub compensated: usize,
    pub failures: Vec<String>,
}

/// Shared handle to an open transaction.
///
/// A handle is owned by exactly one scope at a time; nested scopes hold
/// the same handle behind a savepoint.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<parking_lot::Mutex<Transaction>>,
    transport: Arc<dyn RpcTransport>,
}

impl TransactionHandle {
    fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(Transaction::new())),
            transport,
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.lock().id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Append an operation to the log (legal only while active).
    pub fn record_operation(&self, entry: OpEntry) -> Result<()> {
        self.inner.lock().append(entry).map_err(ClientError::from)
    }

    /// Manually mark a cache key dirty.
    pub fn add_cache_invalidation_key(&self, key: impl Into<String>) {
        self.inner.lock().cache_dirty.add_key(key);
    }

    /// Manually mark a cache pattern dirty.
    pub fn add_cache_invalidation_pattern(&self, pattern: impl Into<String>) {
        self.inner.lock().cache_dirty.add_pattern(pattern);
    }

    pub fn operation_count(&self) -> usize {
        self.inner.lock().operations.len()
    }

    /// Create a named savepoint at the current log position.
    pub fn savepoint(&self, name: impl Into<String>) -> Result<Savepoint> {
        let mut txn = self.inner.lock();
        if !txn.state.is_active() {
            return Err(TransactionError::InvalidState {
                expected: TransactionState::Active.to_string(),
                found: txn.state.to_string(),
            }
            .into());
        }
        Ok(txn.add_savepoint(name))
    }

    /// Drop a savepoint, keeping its operations.
    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        self.inner
            .lock()
            .release_savepoint(name)
            .map_err(ClientError::from)
    }

    /// Roll the log back to a savepoint, compensating the trimmed
    /// suffix in reverse order.
    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<RollbackSummary> {
        let trimmed = self
            .inner
            .lock()
            .truncate_to_savepoint(name)
            .map_err(ClientError::from)?;
        debug!(
            savepoint = name,
            trimmed = trimmed.len(),
            "rolling back to savepoint"
        );
        let reversed: Vec<OpEntry> = trimmed.into_iter().rev().collect();
        Ok(compensate(&self.transport, reversed).await)
    }

    fn take_dirty(&self) -> crate::transaction::types::CacheDirty {
        self.inner.lock().cache_dirty.clone()
    }

    fn take_operations_reversed(&self) -> Vec<OpEntry> {
        let txn = self.inner.lock();
        txn.operations.iter().rev().cloned().collect()
    }

    fn transition(&self, next: TransactionState) -> Result<()> {
        self.inner.lock().transition(next).map_err(ClientError::from)
    }

    fn force_state(&self, state: TransactionState) {
        self.inner.lock().state = state;
    }
}

/// Manager coordinating transaction scopes.
pub struct TransactionManager {
    transport: Arc<dyn RpcTransport>,
    cache: parking_lot::RwLock<Option<Arc<CacheManager>>>,
    current: parking_lot::Mutex<Option<TransactionHandle>>,
}

impl TransactionManager {
    pub fn new(transport: Arc<dyn RpcTransport>, cache: Option<Arc<CacheManager>>) -> Self {
        Self {
            transport,
            cache: parking_lot::RwLock::new(cache),
            current: parking_lot::Mutex::new(None),
        }
    }

    /// Attach (or replace) the cache manager used for commit-time
    /// invalidation.
    pub fn set_cache_manager(&self, cache: Arc<CacheManager>) {
        *self.cache.write() = Some(cache);
    }

    /// The transaction owned by the current scope, if any.
    pub fn current(&self) -> Option<TransactionHandle> {
        self.current.lock().clone()
    }

    /// Open a new root transaction. Fails if a scope is already open.
    pub fn begin(&self) -> Result<TransactionHandle> {
        let mut current = self.current.lock();
        if current.is_some() {
            return Err(TransactionError::Other(
                "a transaction scope is already open; use a nested scope".to_string(),
            )
            .into());
        }
        let handle = TransactionHandle::new(Arc::clone(&self.transport));
        info!(txn = %handle.id(), "transaction started");
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Commit: finalize the state machine, then hand the dirty set to
    /// the cache manager. Cache failures are logged and never revert the
    /// commit.
    pub async fn commit(&self, handle: &TransactionHandle) -> Result<()> {
        handle.transition(TransactionState::Committing)?;

        let dirty = handle.take_dirty();
        handle.transition(TransactionState::Committed)?;
        self.clear_current(handle);
        info!(txn = %handle.id(), operations = handle.operation_count(), "transaction committed");

        let cache = self.cache.read().clone();
        if let Some(cache) = cache {
            // Keys, then patterns, then models.
            for key in &dirty.keys {
                if let Ok(cache_key) = crate::cache::CacheKey::new(key.clone()) {
                    cache.delete(&cache_key, None).await;
                }
            }
            for pattern in &dirty.patterns {
                let removed = cache.invalidate_pattern(pattern, None).await;
                debug!(pattern = %pattern, removed, "commit invalidated pattern");
            }
            for model in &dirty.models {
                cache.invalidate_model(model, None).await;
            }
        } else if !dirty.is_empty() {
            warn!(txn = %handle.id(), "no cache manager attached; dirty set dropped");
        }

        Ok(())
    }

    /// Roll back: compensate every logged operation in reverse order.
    /// The transaction ends in `RolledBack` even when individual
    /// compensations fail; those failures are aggregated in the summary.
    pub async fn rollback(&self, handle: &TransactionHandle) -> RollbackSummary {
        if handle.transition(TransactionState::RollingBack).is_err() {
            // Already terminal; nothing to do.
            self.clear_current(handle);
            return RollbackSummary::default();
        }

        let reversed = handle.take_operations_reversed();
        let summary = compensate(&self.transport, reversed).await;

        handle.force_state(TransactionState::RolledBack);
        self.clear_current(handle);

        if summary.failures.is_empty() {
            info!(txn = %handle.id(), compensated = summary.compensated, "transaction rolled back");
        } else {
            warn!(
                txn = %handle.id(),
                compensated = summary.compensated,
                failures = summary.failures.len(),
                "transaction rolled back with compensation failures"
            );
        }
        summary
    }

    /// Mark the transaction failed (fatal error path).
    pub fn fail(&self, handle: &TransactionHandle) {
        handle.force_state(TransactionState::Failed);
        self.clear_current(handle);
        error!(txn = %handle.id(), "transaction failed");
    }

    fn clear_current(&self, handle: &TransactionHandle) {
        let mut current = self.current.lock();
        if current
            .as_ref()
            .is_some_and(|open| open.id() == handle.id())
        {
            *current = None;
        }
    }

    /// Run `f` inside a transaction scope: commit on Ok, roll back on
    /// Err. A scope opened while another is active becomes a savepoint
    /// scope on the parent, and its dirty set merges upward on release.
    pub async fn run_scope<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if let Some(parent) = self.current() {
            let sp_name = format!("nested-{}", Uuid::new_v4().simple());
            parent.savepoint(&sp_name)?;
            return match f(parent.clone()).await {
                Ok(value) => {
                    parent.release_savepoint(&sp_name)?;
                    Ok(value)
                }
                Err(err) => {
                    let summary = parent.rollback_to_savepoint(&sp_name).await?;
                    if !summary.failures.is_empty() {
                        warn!(
                            failures = summary.failures.len(),
                            "nested scope compensation reported failures"
                        );
                    }
                    Err(err)
                }
            };
        }

        let handle = self.begin()?;
        match f(handle.clone()).await {
            Ok(value) => match self.commit(&handle).await {
                Ok(()) => Ok(value),
                Err(err) => {
                    self.fail(&handle);
                    Err(err)
                }
            },
            Err(err) => {
                self.rollback(&handle).await;
                Err(err)
            }
        }
    }
}

/// Run compensation for operations in the order given (callers pass the
/// reversed log). Failures are collected, not raised.
async fn compensate(transport: &Arc<dyn RpcTransport>, operations: Vec<OpEntry>) -> RollbackSummary {
    let mut summary = RollbackSummary::default();

    for op in operations {
        let outcome = match op.kind {
            OpKind::Create => {
                if op.created_ids.is_empty() {
                    Ok(Json::Bool(true))
                } else {
                    transport
                        .execute_kw(&op.model, "unlink", vec![json!(op.created_ids)], Map::new())
                        .await
                }
            }
            OpKind::Update => match &op.original_data {
                Some(Json::Null) | None => Err(ClientError::Internal(
                    "update entry has no pre-image".to_string(),
                )),
                // A list pre-image restores record by record; a single
                // object restores all ids with one write.
                Some(Json::Array(rows)) if rows.len() == op.record_ids.len() => {
                    let mut last = Ok(Json::Bool(true));
                    for (id, row) in op.record_ids.iter().zip(rows) {
                        let result = transport
                            .execute_kw(
                                &op.model,
                                "write",
                                vec![json!([id]), row.clone()],
                                Map::new(),
                            )
                            .await;
                        if result.is_err() {
                            last = result;
                        }
                    }
                    last
                }
                Some(original) => {
                    transport
                        .execute_kw(
                            &op.model,
                            "write",
                            vec![json!(op.record_ids), original.clone()],
                            Map::new(),
                        )
                        .await
                }
            },
            OpKind::Delete => match &op.original_data {
                Some(Json::Null) | None => Err(ClientError::Internal(
                    "delete entry has no pre-image".to_string(),
                )),
                // Best effort: ids of the re-created records need not
                // match the originals.
                Some(original) => {
                    let values = if original.is_array() {
                        original.clone()
                    } else {
                        json!([original])
                    };
                    transport
                        .execute_kw(&op.model, "create", vec![values], Map::new())
                        .await
                }
            },
            OpKind::Call => {
                debug!(model = %op.model, "call operation has no compensation");
                Ok(Json::Bool(true))
            }
        };

        match outcome {
            Ok(_) => summary.compensated += 1,
            Err(err) => {
                error!(model = %op.model, kind = ?op.kind, error = %err, "compensation failed");
                summary
                    .failures
                    .push(format!("{:?} on {}: {}", op.kind, op.model, err));
            }
        }
    }

    summary
}
