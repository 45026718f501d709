// Batch operation types.

use serde_json::{Map, Value as Json};
use std::sync::Arc;
use uuid::Uuid;

use crate::common::RecordId;
use crate::error::ClientError;

/// One bulk-capable operation.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Create a single record from a value map. Creates for the same
    /// model are merged into one wire call per chunk.
    Create {
        model: String,
        values: Map<String, Json>,
    },
    /// Write one value map to a set of records.
    Update {
        model: String,
        ids: Vec<RecordId>,
        values: Map<String, Json>,
    },
    /// Unlink a set of records. Deletes for the same model are merged
    /// into one wire call per chunk.
    Delete { model: String, ids: Vec<RecordId> },
}

/// Partition discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchOpKind {
    Create,
    Update,
    Delete,
}

impl BatchOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOpKind::Create => "create",
            BatchOpKind::Update => "update",
            BatchOpKind::Delete => "delete",
        }
    }
}

impl BatchOperation {
    pub fn kind(&self) -> BatchOpKind {
        match self {
            BatchOperation::Create { .. } => BatchOpKind::Create,
            BatchOperation::Update { .. } => BatchOpKind::Update,
            BatchOperation::Delete { .. } => BatchOpKind::Delete,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            BatchOperation::Create { model, .. }
            | BatchOperation::Update { model, .. }
            | BatchOperation::Delete { model, .. } => model,
        }
    }

    /// Partition key: operations of the same kind against the same
    /// model execute together.
    pub fn partition_key(&self) -> (BatchOpKind, String) {
        (self.kind(), self.model().to_string())
    }
}

/// An ordered collection of operations to execute.
#[derive(Debug, Default)]
pub struct Batch {
    pub id: Uuid,
    operations: Vec<BatchOperation>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            operations: Vec::new(),
        }
    }

    /// Queue a create; returns the operation index used in results.
    pub fn create(&mut self, model: impl Into<String>, values: Map<String, Json>) -> usize {
        self.operations.push(BatchOperation::Create {
            model: model.into(),
            values,
        });
        self.operations.len() - 1
    }

    /// Queue an update; returns the operation index used in results.
    pub fn update(
        &mut self,
        model: impl Into<String>,
        ids: Vec<RecordId>,
        values: Map<String, Json>,
    ) -> usize {
        self.operations.push(BatchOperation::Update {
            model: model.into(),
            ids,
            values,
        });
        self.operations.len() - 1
    }

    /// Queue a delete; returns the operation index used in results.
    pub fn delete(&mut self, model: impl Into<String>, ids: Vec<RecordId>) -> usize {
        self.operations.push(BatchOperation::Delete {
            model: model.into(),
            ids,
        });
        self.operations.len() - 1
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub(crate) fn into_operations(self) -> Vec<BatchOperation> {
        self.operations
    }
}

/// Per-operation outcome: the wire result or the error that failed its
/// chunk. Errors are shared between the members of a failed chunk.
pub type BatchOutcome = Result<Json, Arc<ClientError>>;
