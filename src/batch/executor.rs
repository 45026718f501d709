// Batch executor.
//
// Partitions operations by (kind, model), chunks each partition, and
// dispatches chunks concurrently under a semaphore. A chunk failure
// fails only its member operations. Within-chunk order equals input
// order; no ordering is guaranteed across chunks or partitions.

use serde_json::{json, Map, Value as Json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::batch::operations::{Batch, BatchOpKind, BatchOperation, BatchOutcome};
use crate::error::ClientError;
use crate::transaction::{OpEntry, TransactionHandle};
use crate::transport::RpcTransport;

/// Timing of one partition's chunks.
#[derive(Debug, Clone)]
pub struct PartitionTiming {
    pub kind: BatchOpKind,
    pub model: String,
    pub chunks: usize,
    pub elapsed: Duration,
}

/// Merged outcome of a batch run.
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Original operation index -> outcome.
    pub results: HashMap<usize, BatchOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub partitions: Vec<PartitionTiming>,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn is_fully_successful(&self) -> bool {
        self.failed == 0
    }
}

/// Chunked, concurrency-bounded bulk dispatcher.
pub struct BatchExecutor {
    transport: Arc<dyn RpcTransport>,
    max_chunk_size: usize,
    max_concurrency: usize,
}

impl BatchExecutor {
    pub fn new(transport: Arc<dyn RpcTransport>, max_chunk_size: usize, max_concurrency: usize) -> Self {
        Self {
            transport,
            max_chunk_size: max_chunk_size.max(1),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Execute a batch. When a transaction handle is supplied, every
    /// successful chunk appends an operation entry (with pre-images for
    /// updates and deletes) to the transaction.
    pub async fn execute(&self, batch: Batch, txn: Option<&TransactionHandle>) -> BatchResult {
        let operations = batch.into_operations();
        if operations.is_empty() {
            return BatchResult::default();
        }

        // Partition by (kind, model), preserving input order within
        // each partition.
        let mut partitions: HashMap<(BatchOpKind, String), Vec<(usize, BatchOperation)>> =
            HashMap::new();
        for (index, op) in operations.into_iter().enumerate() {
            partitions.entry(op.partition_key()).or_default().push((index, op));
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut chunk_handles = Vec::new();

        for ((kind, model), members) in partitions {
            let chunk_count = members.len().div_ceil(self.max_chunk_size);
            debug!(
                kind = kind.as_str(),
                model = %model,
                operations = members.len(),
                chunks = chunk_count,
                "dispatching batch partition"
            );

            let mut members = members;
            while !members.is_empty() {
                let rest = members.split_off(members.len().min(self.max_chunk_size));
                let chunk = std::mem::replace(&mut members, rest);

                let transport = Arc::clone(&self.transport);
                let semaphore = Arc::clone(&semaphore);
                let txn = txn.cloned();
                let kind = kind;
                let model = model.clone();

                chunk_handles.push(tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("batch semaphore closed");
                    let start = Instant::now();
                    let outcomes = execute_chunk(&transport, kind, &model, chunk, txn.as_ref()).await;
                    (kind, model, start.elapsed(), outcomes)
                }));
            }
        }

        let mut result = BatchResult::default();
        let mut partition_timing: HashMap<(BatchOpKind, String), (usize, Duration)> =
            HashMap::new();

        for handle in chunk_handles {
            let Ok((kind, model, elapsed, outcomes)) = handle.await else {
                warn!("batch chunk task panicked");
                continue;
            };

            let entry = partition_timing.entry((kind, model)).or_insert((0, Duration::ZERO));
            entry.0 += 1;
            entry.1 += elapsed;

            for (index, outcome) in outcomes {
                match &outcome {
                    Ok(_) => result.succeeded += 1,
                    Err(_) => result.failed += 1,
                }
                result.results.insert(index, outcome);
            }
        }

        result.partitions = partition_timing
            .into_iter()
            .map(|((kind, model), (chunks, elapsed))| PartitionTiming {
                kind,
                model,
                chunks,
                elapsed,
            })
            .collect();

        result
    }
}

/// Execute one chunk as bulk wire calls.
async fn execute_chunk(
    transport: &Arc<dyn RpcTransport>,
    kind: BatchOpKind,
    model: &str,
    chunk: Vec<(usize, BatchOperation)>,
    txn: Option<&TransactionHandle>,
) -> Vec<(usize, BatchOutcome)> {
    match kind {
        BatchOpKind::Create => execute_create_chunk(transport, model, chunk, txn).await,
        BatchOpKind::Update => execute_update_chunk(transport, model, chunk, txn).await,
        BatchOpKind::Delete => execute_delete_chunk(transport, model, chunk, txn).await,
    }
}

/// One `create` call with the chunk's value maps; the returned id list
/// is distributed back to the member operations in input order.
async fn execute_create_chunk(
    transport: &Arc<dyn RpcTransport>,
    model: &str,
    chunk: Vec<(usize, BatchOperation)>,
    txn: Option<&TransactionHandle>,
) -> Vec<(usize, BatchOutcome)> {
    let values: Vec<Json> = chunk
        .iter()
        .filter_map(|(_, op)| match op {
            BatchOperation::Create { values, .. } => Some(Json::Object(values.clone())),
            _ => None,
        })
        .collect();

    let response = transport
        .execute_kw(model, "create", vec![json!(values)], Map::new())
        .await;

    match response {
        Ok(result) => {
            let ids: Vec<i64> = match &result {
                Json::Array(items) => items.iter().filter_map(Json::as_i64).collect(),
                Json::Number(_) => result.as_i64().into_iter().collect(),
                _ => Vec::new(),
            };

            if let Some(txn) = txn {
                let _ = txn.record_operation(OpEntry::create(model, ids.clone(), json!(values)));
            }

            chunk
                .into_iter()
                .enumerate()
                .map(|(position, (index, _))| {
                    let outcome = match ids.get(position) {
                        Some(id) => Ok(json!(id)),
                        None => Err(Arc::new(ClientError::Server(
                            "create returned fewer ids than records".to_string(),
                        ))),
                    };
                    (index, outcome)
                })
                .collect()
        }
        Err(err) => fail_chunk(chunk, err),
    }
}

/// One `write` call per member operation, in input order. Pre-images
/// are read first when a transaction is recording.
async fn execute_update_chunk(
    transport: &Arc<dyn RpcTransport>,
    model: &str,
    chunk: Vec<(usize, BatchOperation)>,
    txn: Option<&TransactionHandle>,
) -> Vec<(usize, BatchOutcome)> {
    let mut outcomes = Vec::with_capacity(chunk.len());

    for (index, op) in chunk {
        let BatchOperation::Update { ids, values, .. } = op else {
            continue;
        };

        let original = match txn {
            Some(_) => {
                let fields: Vec<Json> =
                    values.keys().map(|k| Json::String(k.clone())).collect();
                match transport
                    .execute_kw(model, "read", vec![json!(ids), json!(fields)], Map::new())
                    .await
                {
                    Ok(rows) => Some(rows),
                    Err(err) => {
                        warn!(model, error = %err, "pre-image read failed; skipping compensation data");
                        None
                    }
                }
            }
            None => None,
        };

        let response = transport
            .execute_kw(
                model,
                "write",
                vec![json!(ids), Json::Object(values.clone())],
                Map::new(),
            )
            .await;

        match response {
            Ok(result) => {
                if let Some(txn) = txn {
                    let pre_image = original
                        .and_then(|rows| strip_ids(&rows))
                        .unwrap_or(Json::Null);
                    let _ = txn.record_operation(OpEntry::update(
                        model,
                        ids.clone(),
                        pre_image,
                        Json::Object(values),
                    ));
                }
                outcomes.push((index, Ok(result)));
            }
            Err(err) => outcomes.push((index, Err(Arc::new(err)))),
        }
    }

    outcomes
}

/// One `unlink` call covering every id in the chunk. Pre-images are
/// read first when a transaction is recording.
async fn execute_delete_chunk(
    transport: &Arc<dyn RpcTransport>,
    model: &str,
    chunk: Vec<(usize, BatchOperation)>,
    txn: Option<&TransactionHandle>,
) -> Vec<(usize, BatchOutcome)> {
    let all_ids: Vec<i64> = chunk
        .iter()
        .filter_map(|(_, op)| match op {
            BatchOperation::Delete { ids, .. } => Some(ids.clone()),
            _ => None,
        })
        .flatten()
        .collect();

    let original = match txn {
        Some(_) => {
            match transport
                .execute_kw(model, "read", vec![json!(all_ids)], Map::new())
                .await
            {
                Ok(rows) => Some(rows),
                Err(err) => {
                    warn!(model, error = %err, "pre-image read failed; skipping compensation data");
                    None
                }
            }
        }
        None => None,
    };

    let response = transport
        .execute_kw(model, "unlink", vec![json!(all_ids)], Map::new())
        .await;

    match response {
        Ok(result) => {
            if let Some(txn) = txn {
                let pre_image = original
                    .and_then(|rows| strip_ids(&rows))
                    .unwrap_or(Json::Null);
                let _ = txn.record_operation(OpEntry::delete(model, all_ids, pre_image));
            }
            chunk
                .into_iter()
                .map(|(index, _)| (index, Ok(result.clone())))
                .collect()
        }
        Err(err) => fail_chunk(chunk, err),
    }
}

fn fail_chunk(chunk: Vec<(usize, BatchOperation)>, err: ClientError) -> Vec<(usize, BatchOutcome)> {
    let shared = Arc::new(err);
    chunk
        .into_iter()
        .map(|(index, _)| (index, Err(Arc::clone(&shared))))
        .collect()
}

/// Remove the `id` key from pre-image rows; compensation re-creates or
/// re-writes values, never ids.
fn strip_ids(rows: &Json) -> Option<Json> {
    let Json::Array(items) = rows else {
        return Some(rows.clone());
    };
    let stripped: Vec<Json> = items
        .iter()
        .map(|row| {
            let mut row = row.clone();
            if let Some(obj) = row.as_object_mut() {
                obj.remove("id");
            }
            row
        })
        .collect();
    Some(Json::Array(stripped))
}
