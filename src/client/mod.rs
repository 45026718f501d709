// # Client facade
//
// `OdooClient` owns the transport, the schema registry, the
// relationship loader, and the cache / transaction / batch managers.
// Every other subsystem is reached through it: queries via `model()`,
// mutations via the typed wrappers (which record into the active
// transaction and keep the cache coherent), bulk work via
// `execute_batch`, and scoped transactions via `transaction()`.

use serde_json::{json, Map, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchExecutor, BatchResult};
use crate::cache::{CacheManager, RedisCacheConfig, StrategyKind};
use crate::common::{Domain, RecordId};
use crate::error::{ClientError, Result};
use crate::models::{ModelRegistry, RelationshipLoader};
use crate::query::QuerySet;
use crate::transaction::{OpEntry, TransactionHandle, TransactionManager};
use crate::transport::{JsonRpcTransport, JsonRpcTransportConfig, RpcTransport};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub timeout: Duration,
    pub max_connections: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8069".to_string(),
            timeout: Duration::from_secs(30),
            max_connections: 10,
        }
    }
}

struct ClientInner {
    transport: Arc<dyn RpcTransport>,
    /// Concrete transport when the client owns the session handshake.
    jsonrpc: Option<Arc<JsonRpcTransport>>,
    registry: Arc<ModelRegistry>,
    relations: Arc<RelationshipLoader>,
    cache: parking_lot::RwLock<Option<Arc<CacheManager>>>,
    transactions: parking_lot::RwLock<Option<Arc<TransactionManager>>>,
    batch: parking_lot::RwLock<Option<Arc<BatchExecutor>>>,
}

/// Asynchronous ERP client.
#[derive(Clone)]
pub struct OdooClient {
    inner: Arc<ClientInner>,
}

impl OdooClient {
    /// Build a client speaking JSON-RPC to `config.url`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(JsonRpcTransport::new(JsonRpcTransportConfig {
            url: config.url,
            timeout: config.timeout,
            max_connections: config.max_connections,
        })?);
        Ok(Self::assemble(
            Arc::clone(&transport) as Arc<dyn RpcTransport>,
            Some(transport),
        ))
    }

    /// Build a client over a caller-supplied transport (tests, custom
    /// wire layers). `login()` is unavailable on such clients.
    pub fn with_transport(transport: Arc<dyn RpcTransport>) -> Self {
        Self::assemble(transport, None)
    }

    fn assemble(
        transport: Arc<dyn RpcTransport>,
        jsonrpc: Option<Arc<JsonRpcTransport>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                jsonrpc,
                registry: Arc::new(ModelRegistry::new()),
                relations: Arc::new(RelationshipLoader::new()),
                cache: parking_lot::RwLock::new(None),
                transactions: parking_lot::RwLock::new(None),
                batch: parking_lot::RwLock::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    /// Authenticate and hold the session for subsequent calls.
    pub async fn login(&self, database: &str, login: &str, password: &str) -> Result<i64> {
        let jsonrpc = self.inner.jsonrpc.as_ref().ok_or_else(|| {
            ClientError::Session("this client uses an external transport; no login".to_string())
        })?;
        jsonrpc.authenticate(database, login, password).await
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner
            .jsonrpc
            .as_ref()
            .is_some_and(|t| t.is_authenticated())
    }

    /// Tear down managers, background tasks, and the session.
    pub async fn close(&self) {
        if let Some(cache) = self.cache_manager() {
            cache.close().await;
        }
        self.inner.relations.clear();
        if let Some(jsonrpc) = &self.inner.jsonrpc {
            jsonrpc.clear_session();
        }
        info!("client closed");
    }

    // ------------------------------------------------------------------
    // Manager lifecycle
    // ------------------------------------------------------------------

    /// Set up (or extend) the cache manager with an in-memory backend.
    pub fn setup_memory_cache(
        &self,
        max_size: usize,
        default_ttl: Option<Duration>,
        strategy: StrategyKind,
    ) -> Arc<CacheManager> {
        let manager = self.ensure_cache_manager();
        manager.setup_memory_cache("memory", max_size, default_ttl, strategy);
        manager
    }

    /// Set up (or extend) the cache manager with a Redis backend.
    pub async fn setup_redis_cache(
        &self,
        config: RedisCacheConfig,
        strategy: StrategyKind,
    ) -> Result<Arc<CacheManager>> {
        let manager = self.ensure_cache_manager();
        manager.setup_redis_cache("redis", config, strategy).await?;
        manager.set_default_backend("redis")?;
        Ok(manager)
    }

    fn ensure_cache_manager(&self) -> Arc<CacheManager> {
        let mut slot = self.inner.cache.write();
        if let Some(manager) = slot.as_ref() {
            return Arc::clone(manager);
        }
        let manager = Arc::new(CacheManager::new());
        *slot = Some(Arc::clone(&manager));
        drop(slot);

        // Keep commit-time invalidation wired when transactions were
        // set up first.
        if let Some(transactions) = self.transaction_manager() {
            transactions.set_cache_manager(Arc::clone(&manager));
        }
        manager
    }

    pub fn setup_transaction_manager(&self) -> Arc<TransactionManager> {
        let mut slot = self.inner.transactions.write();
        if let Some(manager) = slot.as_ref() {
            return Arc::clone(manager);
        }
        let manager = Arc::new(TransactionManager::new(
            Arc::clone(&self.inner.transport),
            self.inner.cache.read().clone(),
        ));
        *slot = Some(Arc::clone(&manager));
        manager
    }

    pub fn setup_batch_manager(
        &self,
        max_chunk_size: usize,
        max_concurrency: usize,
    ) -> Arc<BatchExecutor> {
        let executor = Arc::new(BatchExecutor::new(
            Arc::clone(&self.inner.transport),
            max_chunk_size,
            max_concurrency,
        ));
        *self.inner.batch.write() = Some(Arc::clone(&executor));
        executor
    }

    pub fn cache_manager(&self) -> Option<Arc<CacheManager>> {
        self.inner.cache.read().clone()
    }

    pub fn transaction_manager(&self) -> Option<Arc<TransactionManager>> {
        self.inner.transactions.read().clone()
    }

    pub fn batch_executor(&self) -> Option<Arc<BatchExecutor>> {
        self.inner.batch.read().clone()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn relationship_loader(&self) -> &Arc<RelationshipLoader> {
        &self.inner.relations
    }

    // ------------------------------------------------------------------
    // RPC surface
    // ------------------------------------------------------------------

    /// Uniform RPC entry point; everything else is expressible through
    /// it.
    pub async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Vec<Json>,
        kwargs: Map<String, Json>,
    ) -> Result<Json> {
        self.inner
            .transport
            .execute_kw(model, method, args, kwargs)
            .await
    }

    /// Idempotent reads retry once on connection/timeout failures.
    async fn execute_read(
        &self,
        model: &str,
        method: &str,
        args: Vec<Json>,
        kwargs: Map<String, Json>,
    ) -> Result<Json> {
        match self
            .inner
            .transport
            .execute_kw(model, method, args.clone(), kwargs.clone())
            .await
        {
            Ok(value) => Ok(value),
            Err(err) if err.is_retryable() => {
                warn!(model, method, error = %err, "retrying idempotent read");
                self.inner.transport.execute_kw(model, method, args, kwargs).await
            }
            Err(err) => Err(err),
        }
    }

    /// `search_read` with raw JSON rows.
    #[allow(clippy::too_many_arguments)]
    pub async fn search_read(
        &self,
        model: &str,
        domain: &Domain,
        fields: Option<&[String]>,
        limit: Option<u32>,
        offset: u32,
        order: Option<&str>,
        context: Option<&BTreeMap<String, Json>>,
    ) -> Result<Vec<Json>> {
        let mut kwargs = Map::new();
        if let Some(fields) = fields {
            kwargs.insert("fields".to_string(), json!(fields));
        }
        if let Some(limit) = limit {
            kwargs.insert("limit".to_string(), json!(limit));
        }
        if offset > 0 {
            kwargs.insert("offset".to_string(), json!(offset));
        }
        if let Some(order) = order {
            kwargs.insert("order".to_string(), json!(order));
        }
        if let Some(context) = context {
            kwargs.insert("context".to_string(), json!(context));
        }

        let result = self
            .execute_read(model, "search_read", vec![domain.to_wire()], kwargs)
            .await?;
        match result {
            Json::Array(rows) => Ok(rows),
            other => Err(ClientError::Server(format!(
                "search_read returned {}",
                other
            ))),
        }
    }

    /// `read` specific records.
    pub async fn read(
        &self,
        model: &str,
        ids: &[RecordId],
        fields: Option<&[String]>,
    ) -> Result<Vec<Json>> {
        let mut args = vec![json!(ids)];
        if let Some(fields) = fields {
            args.push(json!(fields));
        }
        let result = self.execute_read(model, "read", args, Map::new()).await?;
        match result {
            Json::Array(rows) => Ok(rows),
            other => Err(ClientError::Server(format!("read returned {}", other))),
        }
    }

    /// `search_count` over a domain.
    pub async fn search_count(&self, model: &str, domain: &Domain) -> Result<u64> {
        let result = self
            .execute_read(model, "search_count", vec![domain.to_wire()], Map::new())
            .await?;
        result
            .as_u64()
            .ok_or_else(|| ClientError::Server(format!("search_count returned {}", result)))
    }

    /// Create one record, returning its id.
    pub async fn create(&self, model: &str, values: Map<String, Json>) -> Result<RecordId> {
        let result = self
            .execute_kw(model, "create", vec![Json::Object(values.clone())], Map::new())
            .await?;
        let id = result
            .as_i64()
            .ok_or_else(|| ClientError::Server(format!("create returned {}", result)))?;

        self.after_mutation(OpEntry::create(model, vec![id], Json::Object(values)))
            .await;
        Ok(id)
    }

    /// Bulk create, returning the new ids in input order.
    pub async fn create_many(
        &self,
        model: &str,
        values_list: Vec<Map<String, Json>>,
    ) -> Result<Vec<RecordId>> {
        let values: Vec<Json> = values_list.into_iter().map(Json::Object).collect();
        let result = self
            .execute_kw(model, "create", vec![json!(values)], Map::new())
            .await?;

        let ids: Vec<RecordId> = match &result {
            Json::Array(items) => items.iter().filter_map(Json::as_i64).collect(),
            Json::Number(_) => result.as_i64().into_iter().collect(),
            other => {
                return Err(ClientError::Server(format!("create returned {}", other)))
            }
        };

        self.after_mutation(OpEntry::create(model, ids.clone(), json!(values)))
            .await;
        Ok(ids)
    }

    /// Write one value map to a set of records.
    pub async fn write(
        &self,
        model: &str,
        ids: &[RecordId],
        values: Map<String, Json>,
    ) -> Result<bool> {
        // Snapshot the pre-image before mutating when a transaction is
        // recording, so rollback can restore it.
        let pre_image = match self.current_transaction() {
            Some(_) => {
                let fields: Vec<String> = values.keys().cloned().collect();
                Some(self.read_pre_image(model, ids, Some(&fields)).await)
            }
            None => None,
        };

        let result = self
            .execute_kw(
                model,
                "write",
                vec![json!(ids), Json::Object(values.clone())],
                Map::new(),
            )
            .await?;
        let ok = result.as_bool().unwrap_or(true);

        self.after_mutation(OpEntry::update(
            model,
            ids.to_vec(),
            pre_image.unwrap_or(Json::Null),
            Json::Object(values),
        ))
        .await;
        Ok(ok)
    }

    /// Unlink a set of records.
    pub async fn unlink(&self, model: &str, ids: &[RecordId]) -> Result<bool> {
        let pre_image = match self.current_transaction() {
            Some(_) => Some(self.read_pre_image(model, ids, None).await),
            None => None,
        };

        let result = self
            .execute_kw(model, "unlink", vec![json!(ids)], Map::new())
            .await?;
        let ok = result.as_bool().unwrap_or(true);

        self.after_mutation(OpEntry::delete(
            model,
            ids.to_vec(),
            pre_image.unwrap_or(Json::Null),
        ))
        .await;
        Ok(ok)
    }

    async fn read_pre_image(
        &self,
        model: &str,
        ids: &[RecordId],
        fields: Option<&[String]>,
    ) -> Json {
        match self.read(model, ids, fields).await {
            Ok(rows) => {
                let stripped: Vec<Json> = rows
                    .into_iter()
                    .map(|mut row| {
                        if let Some(object) = row.as_object_mut() {
                            object.remove("id");
                        }
                        row
                    })
                    .collect();
                Json::Array(stripped)
            }
            Err(err) => {
                warn!(model, error = %err, "pre-image read failed; compensation data lost");
                Json::Null
            }
        }
    }

    /// Record a mutation into the active transaction, or invalidate the
    /// affected cache regions immediately when no scope is open.
    async fn after_mutation(&self, entry: OpEntry) {
        if let Some(txn) = self.current_transaction() {
            if let Err(err) = txn.record_operation(entry) {
                warn!(error = %err, "failed to record operation in transaction");
            }
            return;
        }

        if let Some(cache) = self.cache_manager() {
            let model = entry.model.clone();
            let removed = cache
                .invalidate_pattern(&format!("query:{}:*", model), None)
                .await;
            let removed = removed + cache.invalidate_model(&model, None).await;
            debug!(model = %model, removed, "invalidated cache after mutation");
        }
    }

    fn current_transaction(&self) -> Option<TransactionHandle> {
        self.transaction_manager().and_then(|m| m.current())
    }

    // ------------------------------------------------------------------
    // Entry points into the subsystems
    // ------------------------------------------------------------------

    /// Query entry point for a model.
    pub fn model(&self, odoo_name: &str) -> QuerySet {
        QuerySet::new(self.clone(), odoo_name)
    }

    /// Run `f` inside a transaction scope: commit on Ok, rollback on
    /// Err. Requires `setup_transaction_manager()`.
    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let manager = self.transaction_manager().ok_or_else(|| {
            ClientError::Internal(
                "transaction manager not set up; call setup_transaction_manager()".to_string(),
            )
        })?;
        manager.run_scope(f).await
    }

    /// Execute a batch through the configured executor, recording into
    /// the active transaction when one is open.
    pub async fn execute_batch(&self, batch: Batch) -> Result<BatchResult> {
        let executor = self.batch_executor().ok_or_else(|| {
            ClientError::Internal(
                "batch manager not set up; call setup_batch_manager()".to_string(),
            )
        })?;
        let txn = self.current_transaction();
        Ok(executor.execute(batch, txn.as_ref()).await)
    }
}

impl std::fmt::Debug for OdooClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OdooClient")
            .field("authenticated", &self.is_authenticated())
            .field("cache", &self.cache_manager().is_some())
            .field("transactions", &self.transaction_manager().is_some())
            .field("batch", &self.batch_executor().is_some())
            .finish()
    }
}
