// Fluent query builder.
//
// A `QuerySet` is an immutable value: every builder method returns a
// modified clone. Execution composes a fingerprint over the canonical
// query tuple, consults the cache, and issues a stampede-guarded
// `search_read` on a miss.

use serde_json::{json, Map, Value as Json};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;
use tracing::debug;

use crate::cache::{hash_params, CacheKey};
use crate::client::OdooClient;
use crate::common::{Domain, FieldValue, RecordId};
use crate::error::{ClientError, Result};
use crate::models::record::Record;
use crate::query::expressions::{field, Expr};
use crate::query::filters;

/// A lazy, chainable query over one model.
#[derive(Clone)]
pub struct QuerySet {
    client: OdooClient,
    model: String,
    domain: Domain,
    fields: Option<Vec<String>>,
    limit: Option<u32>,
    offset: u32,
    order: Option<String>,
    context: BTreeMap<String, Json>,
    select_related: BTreeSet<String>,
    prefetch_related: BTreeSet<String>,
    cache_enabled: bool,
    cache_ttl: Option<Duration>,
}

impl QuerySet {
    pub(crate) fn new(client: OdooClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            domain: Domain::new(),
            fields: None,
            limit: None,
            offset: 0,
            order: None,
            context: BTreeMap::new(),
            select_related: BTreeSet::new(),
            prefetch_related: BTreeSet::new(),
            cache_enabled: true,
            cache_ttl: None,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    // ------------------------------------------------------------------
    // Builder methods
    // ------------------------------------------------------------------

    /// AND an expression tree into the query.
    pub fn filter(&self, expr: Expr) -> Self {
        let mut qs = self.clone();
        qs.domain.extend(expr.to_domain());
        qs
    }

    /// AND a set of keyword lookups (`name__ilike`, `age__gte`, ...).
    pub fn filter_by(&self, pairs: Vec<(&str, Json)>) -> Self {
        match filters::lookups(pairs) {
            Some(expr) => self.filter(expr),
            None => self.clone(),
        }
    }

    /// Exclude records matching the expression (wraps it with NOT).
    pub fn exclude(&self, expr: Expr) -> Self {
        self.filter(expr.negate())
    }

    /// Set the ordering. A leading `-` means descending; no arguments
    /// clears the ordering.
    pub fn order_by(&self, fields: &[&str]) -> Self {
        let mut qs = self.clone();
        if fields.is_empty() {
            qs.order = None;
            return qs;
        }
        let parts: Vec<String> = fields
            .iter()
            .map(|f| match f.strip_prefix('-') {
                Some(name) => format!("{} desc", name),
                None => f.to_string(),
            })
            .collect();
        qs.order = Some(parts.join(", "));
        qs
    }

    pub fn limit(&self, count: u32) -> Self {
        let mut qs = self.clone();
        qs.limit = Some(count);
        qs
    }

    pub fn offset(&self, count: u32) -> Self {
        let mut qs = self.clone();
        qs.offset = count;
        qs
    }

    /// Fetch only the given fields.
    pub fn only(&self, fields: &[&str]) -> Self {
        let mut qs = self.clone();
        qs.fields = Some(fields.iter().map(|f| f.to_string()).collect());
        qs
    }

    /// Exclude fields from fetching. With no explicit field list, the
    /// registered descriptor supplies the candidates.
    pub fn defer(&self, fields: &[&str]) -> Self {
        let deferred: HashSet<&str> = fields.iter().copied().collect();
        let mut qs = self.clone();

        let candidates: Vec<String> = match &self.fields {
            Some(fields) => fields.clone(),
            None => self
                .client
                .registry()
                .get(&self.model)
                .map(|descriptor| descriptor.fields.keys().cloned().collect())
                .unwrap_or_default(),
        };

        qs.fields = Some(
            candidates
                .into_iter()
                .filter(|f| !deferred.contains(f.as_str()))
                .collect(),
        );
        qs
    }

    /// Shallow-merge one context entry.
    pub fn with_context(&self, key: impl Into<String>, value: Json) -> Self {
        let mut qs = self.clone();
        qs.context.insert(key.into(), value);
        qs
    }

    /// Hint: resolve these relationship fields in the same round-trip.
    pub fn select_related(&self, fields: &[&str]) -> Self {
        let mut qs = self.clone();
        qs.select_related
            .extend(fields.iter().map(|f| f.to_string()));
        qs
    }

    /// Hint: after the base query, batch-resolve these relationship
    /// fields for all returned records.
    pub fn prefetch_related(&self, fields: &[&str]) -> Self {
        let mut qs = self.clone();
        qs.prefetch_related
            .extend(fields.iter().map(|f| f.to_string()));
        qs
    }

    /// Per-query cache override.
    pub fn cache(&self, ttl: Option<Duration>, enabled: bool) -> Self {
        let mut qs = self.clone();
        qs.cache_ttl = ttl.or(qs.cache_ttl);
        qs.cache_enabled = enabled;
        qs
    }

    // ------------------------------------------------------------------
    // Fingerprint
    // ------------------------------------------------------------------

    /// Cache key over the canonical query tuple:
    /// `query:{model}:{hex8}`. Equal fingerprints read the same entry.
    pub fn cache_key(&self) -> Result<CacheKey> {
        let mut sorted_fields = self.fields.clone();
        if let Some(fields) = &mut sorted_fields {
            fields.sort();
        }
        let params = json!({
            "model": self.model,
            "domain": self.domain.to_wire(),
            "fields": sorted_fields,
            "limit": self.limit,
            "offset": self.offset,
            "order": self.order,
            "context": self.context,
        });
        let key = format!("query:{}:{}", self.model, hash_params(&params));
        CacheKey::new(key).map_err(ClientError::from)
    }

    // ------------------------------------------------------------------
    // Terminals
    // ------------------------------------------------------------------

    /// Execute and materialize every matching record.
    pub async fn all(&self) -> Result<Vec<Record>> {
        let rows = self.fetch_rows().await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(Record::from_row(
                &self.model,
                row,
                Some(self.client.clone()),
            )?);
        }

        if !self.prefetch_related.is_empty() && !records.is_empty() {
            self.run_prefetch(&records).await?;
        }

        Ok(records)
    }

    /// First result or None.
    pub async fn first(&self) -> Result<Option<Record>> {
        let records = self.limit(1).all().await?;
        Ok(records.into_iter().next())
    }

    /// Exactly one matching record.
    pub async fn get(&self) -> Result<Record> {
        let mut records = self.limit(2).all().await?;
        match records.len() {
            0 => Err(ClientError::NotFound(format!(
                "no {} matches the query",
                self.model
            ))),
            1 => Ok(records.remove(0)),
            _ => Err(ClientError::MultipleMatches(format!(
                "more than one {} matches the query",
                self.model
            ))),
        }
    }

    /// Exactly one record by id.
    pub async fn get_by_id(&self, id: RecordId) -> Result<Record> {
        self.filter(field("id").eq(id)).get().await
    }

    /// `search_count` over the current domain.
    pub async fn count(&self) -> Result<u64> {
        let mut kwargs = Map::new();
        if !self.context.is_empty() {
            kwargs.insert("context".to_string(), json!(self.context));
        }
        let result = self
            .client
            .execute_kw(
                &self.model,
                "search_count",
                vec![self.domain.to_wire()],
                kwargs,
            )
            .await?;
        result.as_u64().ok_or_else(|| {
            ClientError::Server(format!("search_count returned {}", result))
        })
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.count().await? > 0)
    }

    /// Raw rows restricted to the given fields, without materializing
    /// records.
    pub async fn values(&self, fields: &[&str]) -> Result<Vec<Json>> {
        let qs = if fields.is_empty() {
            self.clone()
        } else {
            self.only(fields)
        };
        qs.fetch_rows().await
    }

    /// Tuples of field values. With `flat` and a single field, the
    /// values themselves.
    pub async fn values_list(&self, fields: &[&str], flat: bool) -> Result<Vec<Json>> {
        if fields.is_empty() {
            return Err(ClientError::Validation(
                "values_list requires at least one field".to_string(),
            ));
        }
        let rows = self.only(fields).fetch_rows().await?;

        if flat && fields.len() == 1 {
            let field = fields[0];
            return Ok(rows
                .iter()
                .map(|row| row.get(field).cloned().unwrap_or(Json::Null))
                .collect());
        }

        Ok(rows
            .iter()
            .map(|row| {
                Json::Array(
                    fields
                        .iter()
                        .map(|f| row.get(*f).cloned().unwrap_or(Json::Null))
                        .collect(),
                )
            })
            .collect())
    }

    /// Create one record through the owning client (transaction- and
    /// cache-aware), returning it materialized.
    pub async fn create(&self, values: Map<String, Json>) -> Result<Record> {
        let id = self.client.create(&self.model, values.clone()).await?;

        let fields: Vec<String> = values.keys().cloned().collect();
        let rows = self
            .client
            .read(&self.model, &[id], Some(&fields))
            .await?;
        match rows.first() {
            Some(row) => Record::from_row(&self.model, row, Some(self.client.clone())),
            None => {
                // Fall back to the submitted values plus the new id.
                let mut row = values;
                row.insert("id".to_string(), json!(id));
                Record::from_row(&self.model, &Json::Object(row), Some(self.client.clone()))
            }
        }
    }

    /// Bulk create through the wire's list form.
    pub async fn bulk_create(&self, values_list: Vec<Map<String, Json>>) -> Result<Vec<Record>> {
        let ids = self.client.create_many(&self.model, values_list).await?;
        self.filter(field("id").in_(json!(ids))).all().await
    }

    // ------------------------------------------------------------------
    // Execution internals
    // ------------------------------------------------------------------

    /// Fields to request, folding `select_related` hints into an
    /// explicit field list so the related references come back in the
    /// same round-trip.
    fn effective_fields(&self) -> Option<Vec<String>> {
        let mut fields = self.fields.clone()?;
        for related in &self.select_related {
            if !fields.contains(related) {
                fields.push(related.clone());
            }
        }
        Some(fields)
    }

    async fn fetch_rows(&self) -> Result<Vec<Json>> {
        let cache = self.client.cache_manager().filter(|_| self.cache_enabled);

        let key = match &cache {
            Some(_) => Some(self.cache_key()?),
            None => None,
        };

        if let (Some(cache), Some(key)) = (&cache, &key) {
            if let Some(cached) = cache.get(key, None).await {
                debug!(model = %self.model, key = %key.key, "query served from cache");
                if let Json::Array(rows) = cached {
                    return Ok(rows);
                }
            }
        }

        let fields = self.effective_fields();
        let fetch = || async {
            self.client
                .search_read(
                    &self.model,
                    &self.domain,
                    fields.as_deref(),
                    self.limit,
                    self.offset,
                    self.order.as_deref(),
                    if self.context.is_empty() {
                        None
                    } else {
                        Some(&self.context)
                    },
                )
                .await
                .map(Json::Array)
        };

        let result = match (&cache, &key) {
            // Misses go through the promise table so concurrent
            // identical queries share one origin call.
            (Some(cache), Some(key)) => {
                let (result, _prevented) =
                    cache.stampede_guard().get_or_run(&key.key, fetch).await;
                let value = result?;
                cache.set(key, value.clone(), self.cache_ttl, None).await;
                value
            }
            _ => fetch().await?,
        };

        match result {
            Json::Array(rows) => Ok(rows),
            other => Err(ClientError::Server(format!(
                "search_read returned {}",
                other
            ))),
        }
    }

    /// Issue one batched follow-up per prefetch hint, filling the
    /// relationship memo for every returned record.
    async fn run_prefetch(&self, records: &[Record]) -> Result<()> {
        let Some(descriptor) = self.client.registry().get(&self.model) else {
            return Ok(());
        };

        for field_name in &self.prefetch_related {
            let Some(kind) = descriptor.field_kind(field_name) else {
                continue;
            };
            let Some(target) = kind.relation() else {
                continue;
            };

            let mut ids: Vec<RecordId> = Vec::new();
            let mut seen = HashSet::new();
            for record in records {
                if let Some(record_ids) =
                    record.get(field_name).and_then(FieldValue::ref_ids)
                {
                    for id in record_ids {
                        if seen.insert(id) {
                            ids.push(id);
                        }
                    }
                }
            }

            if ids.is_empty() {
                continue;
            }

            self.client
                .relationship_loader()
                .prefetch_into_memo(&self.client, target, &ids)
                .await?;
            debug!(
                model = %self.model,
                field = %field_name,
                target = %target,
                ids = ids.len(),
                "prefetched relationship field"
            );
        }

        Ok(())
    }
}

impl std::fmt::Debug for QuerySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &self.model)
            .field("domain", &self.domain)
            .field("fields", &self.fields)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("order", &self.order)
            .finish()
    }
}
