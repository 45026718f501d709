// Lazy relationships with batched loading.
//
// Accessing a relationship field yields a `LazyRelationship`; nothing is
// fetched until `load()`. Concurrent loads that share a (target model,
// field) pair coalesce into one `search_read`: the first loader starts a
// batch task that waits a short quantum, drains every queued sibling,
// and issues a single fetch for the union of their ids. A per-id memo
// keeps duplicate relationships from ever re-fetching.

use serde_json::{json, Value as Json};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::client::OdooClient;
use crate::common::RecordId;
use crate::error::{ClientError, Result};
use crate::models::record::Record;

/// Fields fetched for batch-resolved related records.
const BASIC_FIELDS: [&str; 3] = ["id", "name", "display_name"];

/// How long a batch task waits to accumulate siblings.
const BATCH_QUANTUM: Duration = Duration::from_millis(1);

/// Resolved value of a relationship.
#[derive(Debug, Clone)]
pub enum RelationValue {
    One(Option<Record>),
    Many(Vec<Record>),
}

impl RelationValue {
    pub fn record(&self) -> Option<&Record> {
        match self {
            RelationValue::One(record) => record.as_ref(),
            RelationValue::Many(records) => records.first(),
        }
    }

    pub fn records(&self) -> Vec<&Record> {
        match self {
            RelationValue::One(Some(record)) => vec![record],
            RelationValue::One(None) => Vec::new(),
            RelationValue::Many(records) => records.iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RelationValue::One(Some(_)) => 1,
            RelationValue::One(None) => 0,
            RelationValue::Many(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Load state of a lazy relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

type RowsByIdResult = std::result::Result<HashMap<RecordId, Json>, String>;

struct BatchRequest {
    ids: Vec<RecordId>,
    responder: oneshot::Sender<RowsByIdResult>,
}

/// Client-owned shared state for relationship loading: the batch queue
/// per (model, field) and the per-id prefetch memo.
#[derive(Default)]
pub struct RelationshipLoader {
    queues: parking_lot::Mutex<HashMap<(String, String), Vec<BatchRequest>>>,
    running: parking_lot::Mutex<HashSet<(String, String)>>,
    prefetch: parking_lot::Mutex<HashMap<(String, RecordId), Json>>,
}

impl RelationshipLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows memoized for every requested id, or None on any gap.
    fn memoized(&self, model: &str, ids: &[RecordId]) -> Option<HashMap<RecordId, Json>> {
        let prefetch = self.prefetch.lock();
        let mut rows = HashMap::with_capacity(ids.len());
        for id in ids {
            let row = prefetch.get(&(model.to_string(), *id))?;
            rows.insert(*id, row.clone());
        }
        Some(rows)
    }

    fn memoize_rows(&self, model: &str, rows: &HashMap<RecordId, Json>) {
        let mut prefetch = self.prefetch.lock();
        for (id, row) in rows {
            prefetch.insert((model.to_string(), *id), row.clone());
        }
    }

    /// Drop memoized rows for specific target records.
    pub fn invalidate(&self, model: &str, ids: &[RecordId]) {
        let mut prefetch = self.prefetch.lock();
        for id in ids {
            prefetch.remove(&(model.to_string(), *id));
        }
    }

    /// Drop everything (client shutdown).
    pub fn clear(&self) {
        self.queues.lock().clear();
        self.running.lock().clear();
        self.prefetch.lock().clear();
    }

    /// Number of memoized rows (observability).
    pub fn memo_size(&self) -> usize {
        self.prefetch.lock().len()
    }

    /// Fetch any not-yet-memoized rows of `model` in one query and add
    /// them to the memo, so later lazy loads resolve without I/O.
    /// Returns the number of rows fetched.
    pub(crate) async fn prefetch_into_memo(
        &self,
        client: &OdooClient,
        model: &str,
        ids: &[RecordId],
    ) -> Result<usize> {
        let missing: Vec<RecordId> = {
            let prefetch = self.prefetch.lock();
            ids.iter()
                .copied()
                .filter(|id| !prefetch.contains_key(&(model.to_string(), *id)))
                .collect()
        };
        if missing.is_empty() {
            return Ok(0);
        }

        let fields: Vec<String> = BASIC_FIELDS.iter().map(|f| f.to_string()).collect();
        let rows = client
            .search_read(
                model,
                &crate::Domain::leaf("id", crate::common::DomainOperator::In, json!(missing)),
                Some(&fields),
                None,
                0,
                None,
                None,
            )
            .await?;

        let mut by_id = HashMap::new();
        for row in rows {
            if let Some(id) = row.get("id").and_then(Json::as_i64) {
                by_id.insert(id, row);
            }
        }
        let fetched = by_id.len();
        self.memoize_rows(model, &by_id);
        debug!(model, fetched, "prefetched relationship rows");
        Ok(fetched)
    }

    /// Resolve `ids` of `model` for relationship `field`, coalescing
    /// with concurrent siblings of the same (model, field).
    async fn load_rows(
        &self,
        client: &OdooClient,
        model: &str,
        field: &str,
        ids: &[RecordId],
    ) -> Result<HashMap<RecordId, Json>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        if let Some(rows) = self.memoized(model, ids) {
            debug!(model, field, "relationship served from prefetch memo");
            return Ok(rows);
        }

        let key = (model.to_string(), field.to_string());
        let (tx, rx) = oneshot::channel();

        let start_task = {
            let mut queues = self.queues.lock();
            queues.entry(key.clone()).or_default().push(BatchRequest {
                ids: ids.to_vec(),
                responder: tx,
            });
            let mut running = self.running.lock();
            if running.contains(&key) {
                false
            } else {
                running.insert(key.clone());
                true
            }
        };

        if start_task {
            let client = client.clone();
            let loader_model = model.to_string();
            let loader_field = field.to_string();
            tokio::spawn(async move {
                run_batch(client, loader_model, loader_field).await;
            });
        }

        match rx.await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(message)) => Err(ClientError::Internal(format!(
                "batched relationship load failed: {}",
                message
            ))),
            Err(_) => Err(ClientError::Internal(
                "batched relationship load was cancelled".to_string(),
            )),
        }
    }
}

/// Drain the queue for one (model, field) key and resolve it with a
/// single `search_read`.
async fn run_batch(client: OdooClient, model: String, field: String) {
    // Accumulation quantum: let concurrent siblings enqueue.
    tokio::time::sleep(BATCH_QUANTUM).await;

    let key = (model.clone(), field.clone());
    let loader = client.relationship_loader();
    let requests: Vec<BatchRequest> = {
        let mut queues = loader.queues.lock();
        let requests = queues.remove(&key).unwrap_or_default();
        loader.running.lock().remove(&key);
        requests
    };

    if requests.is_empty() {
        return;
    }

    let mut all_ids: Vec<RecordId> = Vec::new();
    let mut seen = HashSet::new();
    for request in &requests {
        for id in &request.ids {
            if seen.insert(*id) {
                all_ids.push(*id);
            }
        }
    }

    debug!(
        model = %model,
        field = %field,
        relationships = requests.len(),
        ids = all_ids.len(),
        "executing batched relationship fetch"
    );

    let fields: Vec<String> = BASIC_FIELDS.iter().map(|f| f.to_string()).collect();
    let fetched = client
        .search_read(
            &model,
            &crate::Domain::leaf("id", crate::common::DomainOperator::In, json!(all_ids)),
            Some(&fields),
            None,
            0,
            None,
            None,
        )
        .await;

    match fetched {
        Ok(rows) => {
            let mut by_id: HashMap<RecordId, Json> = HashMap::new();
            for row in rows {
                if let Some(id) = row.get("id").and_then(Json::as_i64) {
                    by_id.insert(id, row);
                }
            }
            loader.memoize_rows(&model, &by_id);
            for request in requests {
                let _ = request.responder.send(Ok(by_id.clone()));
            }
        }
        Err(err) => {
            warn!(model = %model, field = %field, error = %err, "batched relationship fetch failed");
            let message = err.to_string();
            for request in requests {
                let _ = request.responder.send(Err(message.clone()));
            }
        }
    }
}

/// A deferred reference to related record(s).
pub struct LazyRelationship {
    client: OdooClient,
    parent_model: String,
    parent_id: RecordId,
    field: String,
    target_model: String,
    ids: Vec<RecordId>,
    is_collection: bool,
    state: parking_lot::Mutex<RelationshipState>,
    loaded: parking_lot::Mutex<Option<RelationValue>>,
}

impl LazyRelationship {
    pub(crate) fn new(
        client: OdooClient,
        parent_model: String,
        parent_id: RecordId,
        field: String,
        target_model: String,
        ids: Vec<RecordId>,
        is_collection: bool,
    ) -> Self {
        Self {
            client,
            parent_model,
            parent_id,
            field,
            target_model,
            ids,
            is_collection,
            state: parking_lot::Mutex::new(RelationshipState::Unloaded),
            loaded: parking_lot::Mutex::new(None),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn target_model(&self) -> &str {
        &self.target_model
    }

    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }

    pub fn is_collection(&self) -> bool {
        self.is_collection
    }

    pub fn state(&self) -> RelationshipState {
        *self.state.lock()
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == RelationshipState::Loaded
    }

    /// The resolved value without triggering a load.
    pub fn cached(&self) -> Option<RelationValue> {
        self.loaded.lock().clone()
    }

    /// Drop the resolved value, forcing a reload on next access.
    pub fn invalidate(&self) {
        *self.loaded.lock() = None;
        *self.state.lock() = RelationshipState::Unloaded;
        self.client
            .relationship_loader()
            .invalidate(&self.target_model, &self.ids);
    }

    /// Materialize the relationship, batch-coalescing with concurrent
    /// sibling loads of the same (model, field).
    ///
    /// Returned records follow the order of this relationship's ids. On
    /// a fetch failure every awaiter observes the error and an empty
    /// loaded value.
    pub async fn load(&self) -> Result<RelationValue> {
        if let Some(value) = self.cached() {
            return Ok(value);
        }

        *self.state.lock() = RelationshipState::Loading;

        let rows = match self
            .client
            .relationship_loader()
            .load_rows(&self.client, &self.target_model, &self.field, &self.ids)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                let empty = if self.is_collection {
                    RelationValue::Many(Vec::new())
                } else {
                    RelationValue::One(None)
                };
                *self.loaded.lock() = Some(empty);
                *self.state.lock() = if matches!(err, ClientError::Internal(ref m) if m.contains("cancelled"))
                {
                    RelationshipState::Failed
                } else {
                    RelationshipState::Loaded
                };
                return Err(err);
            }
        };

        // Index per-relationship in input id order.
        let mut records = Vec::with_capacity(self.ids.len());
        for id in &self.ids {
            if let Some(row) = rows.get(id) {
                records.push(Record::from_row(
                    &self.target_model,
                    row,
                    Some(self.client.clone()),
                )?);
            }
        }

        let value = if self.is_collection {
            RelationValue::Many(records)
        } else {
            RelationValue::One(records.into_iter().next())
        };

        *self.loaded.lock() = Some(value.clone());
        *self.state.lock() = RelationshipState::Loaded;
        Ok(value)
    }
}

impl std::fmt::Debug for LazyRelationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyRelationship")
            .field("parent", &format!("{}({})", self.parent_model, self.parent_id))
            .field("field", &self.field)
            .field("target_model", &self.target_model)
            .field("ids", &self.ids)
            .field("is_collection", &self.is_collection)
            .field("state", &self.state())
            .finish()
    }
}
