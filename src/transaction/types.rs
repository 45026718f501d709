// Core transaction types.
//
// A transaction is an append-only operation log with savepoints and an
// accumulated cache-dirty set. State transitions follow a fixed machine:
//
// ```text
// Active ── commit ──► Committing ─► Committed
//    │
//    ├── rollback ──► RollingBack ─► RolledBack
//    │
//    └── fatal error ──► Failed
// ```

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

use crate::common::RecordId;
use crate::error::TransactionError;

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Accepting operations.
    Active,
    /// Commit in progress.
    Committing,
    /// Successfully committed.
    Committed,
    /// Rollback in progress.
    RollingBack,
    /// Rolled back; compensation ran (possibly with logged failures).
    RolledBack,
    /// A fatal error prevented an orderly transition.
    Failed,
}

impl Default for TransactionState {
    fn default() -> Self {
        TransactionState::Active
    }
}

impl TransactionState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed
        )
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    /// Whether the machine permits moving to `next`.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Active, Committing)
                | (Active, RollingBack)
                | (Active, Failed)
                | (Committing, Committed)
                | (Committing, Failed)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "active",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::RollingBack => "rolling_back",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Kind of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Create,
    Update,
    Delete,
    Call,
}

/// One entry of the operation log.
///
/// For updates and deletes, `original_data` holds the pre-image captured
/// before the mutation so rollback can restore it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpEntry {
    pub kind: OpKind,
    pub model: String,
    pub record_ids: Vec<RecordId>,
    /// Server-assigned ids for creates.
    pub created_ids: Vec<RecordId>,
    /// Pre-image: an object for updates, a list of objects for deletes.
    pub original_data: Option<Json>,
    /// Values the operation applied.
    pub new_data: Option<Json>,
}

impl OpEntry {
    pub fn create(model: impl Into<String>, created_ids: Vec<RecordId>, values: Json) -> Self {
        Self {
            kind: OpKind::Create,
            model: model.into(),
            record_ids: created_ids.clone(),
            created_ids,
            original_data: None,
            new_data: Some(values),
        }
    }

    pub fn update(
        model: impl Into<String>,
        record_ids: Vec<RecordId>,
        original_data: Json,
        new_data: Json,
    ) -> Self {
        Self {
            kind: OpKind::Update,
            model: model.into(),
            record_ids,
            created_ids: Vec::new(),
            original_data: Some(original_data),
            new_data: Some(new_data),
        }
    }

    pub fn delete(model: impl Into<String>, record_ids: Vec<RecordId>, original_data: Json) -> Self {
        Self {
            kind: OpKind::Delete,
            model: model.into(),
            record_ids,
            created_ids: Vec::new(),
            original_data: Some(original_data),
            new_data: None,
        }
    }

    pub fn call(model: impl Into<String>, record_ids: Vec<RecordId>) -> Self {
        Self {
            kind: OpKind::Call,
            model: model.into(),
            record_ids,
            created_ids: Vec::new(),
            original_data: None,
            new_data: None,
        }
    }
}

/// Named index into the operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Savepoint {
    pub name: String,
    /// Length of `operations` at creation time.
    pub index: usize,
}

/// Cache regions dirtied by a transaction's operations.
///
/// Ordered sets keep the commit-time invalidation sequence stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDirty {
    pub keys: BTreeSet<String>,
    pub patterns: BTreeSet<String>,
    pub models: BTreeSet<String>,
}

impl CacheDirty {
    /// Record a mutation of `model` touching `ids`: one key per record,
    /// the model-wide and query-result patterns, and the model itself.
    pub fn record_mutation(&mut self, model: &str, ids: &[RecordId]) {
        for id in ids {
            self.keys.insert(format!("{}:{}", model, id));
        }
        self.patterns.insert(format!("{}:*", model));
        self.patterns.insert(format!("query:{}:*", model));
        self.models.insert(model.to_string());
    }

    pub fn add_key(&mut self, key: impl Into<String>) {
        self.keys.insert(key.into());
    }

    pub fn add_pattern(&mut self, pattern: impl Into<String>) {
        self.patterns.insert(pattern.into());
    }

    /// Merge a child scope's dirty set into this one.
    pub fn merge(&mut self, other: CacheDirty) {
        self.keys.extend(other.keys);
        self.patterns.extend(other.patterns);
        self.models.extend(other.models);
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.patterns.is_empty() && self.models.is_empty()
    }
}

/// Transaction metadata and operation log.
#[derive(Debug)]
pub struct Transaction {
    pub id: Uuid,
    pub state: TransactionState,
    pub operations: Vec<OpEntry>,
    pub savepoints: Vec<Savepoint>,
    pub cache_dirty: CacheDirty,
    pub started_at: SystemTime,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: TransactionState::Active,
            operations: Vec::new(),
            savepoints: Vec::new(),
            cache_dirty: CacheDirty::default(),
            started_at: SystemTime::now(),
        }
    }

    /// Transition to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: TransactionState) -> Result<(), TransactionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransactionError::InvalidState {
                expected: format!("a state that can move to {}", next),
                found: self.state.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Append an operation. Only legal while the transaction is active.
    pub fn append(&mut self, entry: OpEntry) -> Result<(), TransactionError> {
        if !self.state.is_active() {
            return Err(TransactionError::InvalidState {
                expected: TransactionState::Active.to_string(),
                found: self.state.to_string(),
            });
        }
        match entry.kind {
            OpKind::Create => self
                .cache_dirty
                .record_mutation(&entry.model, &entry.created_ids),
            OpKind::Update | OpKind::Delete => self
                .cache_dirty
                .record_mutation(&entry.model, &entry.record_ids),
            OpKind::Call => {
                self.cache_dirty.record_mutation(&entry.model, &entry.record_ids)
            }
        }
        self.operations.push(entry);
        Ok(())
    }

    pub fn add_savepoint(&mut self, name: impl Into<String>) -> Savepoint {
        let sp = Savepoint {
            name: name.into(),
            index: self.operations.len(),
        };
        self.savepoints.push(sp.clone());
        sp
    }

    pub fn find_savepoint(&self, name: &str) -> Option<&Savepoint> {
        self.savepoints.iter().rev().find(|sp| sp.name == name)
    }

    /// Drop a savepoint without touching the log.
    pub fn release_savepoint(&mut self, name: &str) -> Result<(), TransactionError> {
        let position = self
            .savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| TransactionError::SavepointNotFound(name.to_string()))?;
        self.savepoints.remove(position);
        Ok(())
    }

    /// Truncate the log back to a savepoint, returning the trimmed
    /// suffix (in append order) for compensation. Savepoints created
    /// after it are dropped.
    pub fn truncate_to_savepoint(&mut self, name: &str) -> Result<Vec<OpEntry>, TransactionError> {
        let sp = self
            .find_savepoint(name)
            .cloned()
            .ok_or_else(|| TransactionError::SavepointNotFound(name.to_string()))?;
        let trimmed = self.operations.split_off(sp.index);
        self.savepoints.retain(|other| other.index <= sp.index);
        Ok(trimmed)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_machine() {
        use TransactionState::*;
        assert!(Active.can_transition_to(Committing));
        assert!(Committing.can_transition_to(Committed));
        assert!(Active.can_transition_to(RollingBack));
        assert!(RollingBack.can_transition_to(RolledBack));
        assert!(Active.can_transition_to(Failed));

        assert!(!Committed.can_transition_to(Active));
        assert!(!Committed.can_transition_to(RollingBack));
        assert!(!Active.can_transition_to(Committed));
        assert!(!RolledBack.can_transition_to(Committing));
    }

    #[test]
    fn test_append_requires_active_state() {
        let mut txn = Transaction::new();
        txn.transition(TransactionState::Committing).unwrap();
        let err = txn
            .append(OpEntry::call("res.partner", vec![1]))
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidState { .. }));
    }

    #[test]
    fn test_cache_dirty_accumulation() {
        let mut txn = Transaction::new();
        txn.append(OpEntry::update(
            "res.partner",
            vec![5],
            json!({"name": "Y"}),
            json!({"name": "B"}),
        ))
        .unwrap();
        txn.append(OpEntry::create("res.partner", vec![11], json!({"name": "A"})))
            .unwrap();

        let dirty = &txn.cache_dirty;
        assert!(dirty.keys.contains("res.partner:5"));
        assert!(dirty.keys.contains("res.partner:11"));
        assert!(dirty.patterns.contains("res.partner:*"));
        assert!(dirty.patterns.contains("query:res.partner:*"));
        assert!(dirty.models.contains("res.partner"));
    }

    #[test]
    fn test_savepoint_truncation() {
        let mut txn = Transaction::new();
        txn.append(OpEntry::call("res.partner", vec![1])).unwrap();
        txn.add_savepoint("sp1");
        txn.append(OpEntry::call("res.partner", vec![2])).unwrap();
        txn.append(OpEntry::call("res.partner", vec![3])).unwrap();

        let trimmed = txn.truncate_to_savepoint("sp1").unwrap();
        assert_eq!(trimmed.len(), 2);
        assert_eq!(txn.operations.len(), 1);
        // The savepoint itself survives for repeated partial rollbacks.
        assert!(txn.find_savepoint("sp1").is_some());
    }

    #[test]
    fn test_savepoint_not_found() {
        let mut txn = Transaction::new();
        assert!(matches!(
            txn.release_savepoint("missing"),
            Err(TransactionError::SavepointNotFound(_))
        ));
        assert!(matches!(
            txn.truncate_to_savepoint("missing"),
            Err(TransactionError::SavepointNotFound(_))
        ));
    }

    #[test]
    fn test_dirty_merge() {
        let mut parent = CacheDirty::default();
        parent.record_mutation("res.partner", &[1]);
        let mut child = CacheDirty::default();
        child.record_mutation("res.users", &[2]);

        parent.merge(child);
        assert!(parent.keys.contains("res.partner:1"));
        assert!(parent.keys.contains("res.users:2"));
        assert!(parent.models.contains("res.users"));
    }
}
