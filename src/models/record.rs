// Record model.
//
// A record is a tagged-value map over a server row: an immutable id,
// normalized field values, and the monotone set of loaded field names.
// Lifecycle operations (update, delete, refresh) go through the owning
// client so transaction logging and cache invalidation apply.

use serde_json::{Map, Value as Json};
use std::collections::{HashMap, HashSet};

use crate::client::OdooClient;
use crate::common::{FieldValue, RecordId};
use crate::error::{ClientError, Result};
use crate::models::relationships::LazyRelationship;

/// A materialized server record.
#[derive(Clone)]
pub struct Record {
    id: RecordId,
    model: String,
    fields: HashMap<String, FieldValue>,
    loaded: HashSet<String>,
    client: Option<OdooClient>,
    deleted: bool,
}

impl Record {
    /// Build a record from a raw `search_read`/`read` row, normalizing
    /// every value through the model descriptor when one is registered.
    pub fn from_row(model: &str, row: &Json, client: Option<OdooClient>) -> Result<Self> {
        let Some(object) = row.as_object() else {
            return Err(ClientError::Validation(format!(
                "expected an object row for {}, got {}",
                model, row
            )));
        };

        let id = object
            .get("id")
            .and_then(Json::as_i64)
            .ok_or_else(|| ClientError::Validation(format!("row for {} has no id", model)))?;

        let descriptor = client
            .as_ref()
            .and_then(|client| client.registry().get(model));

        let mut fields = HashMap::new();
        let mut loaded = HashSet::new();
        for (name, raw) in object {
            if name == "id" {
                continue;
            }
            let kind = descriptor.as_ref().and_then(|d| d.field_kind(name));
            fields.insert(name.clone(), FieldValue::from_wire(raw, kind));
            loaded.insert(name.clone());
        }

        Ok(Self {
            id,
            model: model.to_string(),
            fields,
            loaded,
            client,
            deleted: false,
        })
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// A field's normalized value, if loaded.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn is_field_loaded(&self, field: &str) -> bool {
        self.loaded.contains(field)
    }

    pub fn loaded_fields(&self) -> &HashSet<String> {
        &self.loaded
    }

    /// A lazy handle to a relationship field.
    ///
    /// The handle is returned without any I/O; callers materialize it
    /// explicitly with `load()`.
    pub fn relationship(&self, field: &str) -> Result<LazyRelationship> {
        let client = self.client()?;
        let descriptor = client.registry().get(&self.model).ok_or_else(|| {
            ClientError::Validation(format!("model '{}' is not registered", self.model))
        })?;
        let kind = descriptor.field_kind(field).ok_or_else(|| {
            ClientError::Validation(format!("unknown field '{}.{}'", self.model, field))
        })?;
        let target = kind.relation().ok_or_else(|| {
            ClientError::Validation(format!("'{}.{}' is not a relationship", self.model, field))
        })?;

        let ids = self
            .fields
            .get(field)
            .and_then(FieldValue::ref_ids)
            .unwrap_or_default();

        Ok(LazyRelationship::new(
            client.clone(),
            self.model.clone(),
            self.id,
            field.to_string(),
            target.to_string(),
            ids,
            kind.is_collection(),
        ))
    }

    /// Write values to the server and merge them into the local record.
    pub async fn update(&mut self, values: Map<String, Json>) -> Result<()> {
        if self.deleted {
            return Err(ClientError::Validation(format!(
                "record {}({}) was deleted; it cannot be mutated",
                self.model, self.id
            )));
        }
        let client = self.client()?.clone();
        client
            .write(&self.model, &[self.id], values.clone())
            .await?;

        let descriptor = client.registry().get(&self.model);
        for (name, raw) in values {
            let kind = descriptor.as_ref().and_then(|d| d.field_kind(&name));
            self.fields
                .insert(name.clone(), FieldValue::from_wire(&raw, kind));
            self.loaded.insert(name);
        }
        Ok(())
    }

    /// Unlink the record on the server. The local record keeps its id
    /// but refuses further mutation.
    pub async fn delete(&mut self) -> Result<()> {
        if self.deleted {
            return Ok(());
        }
        let client = self.client()?.clone();
        client.unlink(&self.model, &[self.id]).await?;
        self.deleted = true;
        Ok(())
    }

    /// Re-read the record's loaded fields from the server and drop any
    /// memoized relationship data the stale values referenced.
    pub async fn refresh(&mut self) -> Result<()> {
        if self.deleted {
            return Err(ClientError::Validation(format!(
                "record {}({}) was deleted; it cannot be refreshed",
                self.model, self.id
            )));
        }
        let client = self.client()?.clone();

        // Invalidate memoized relationship lookups for the old values.
        if let Some(descriptor) = client.registry().get(&self.model) {
            for field in descriptor.relationship_fields() {
                if let Some(ids) = self.fields.get(&field.name).and_then(FieldValue::ref_ids) {
                    if let Some(target) = field.kind.relation() {
                        client.relationship_loader().invalidate(target, &ids);
                    }
                }
            }
        }

        let fields: Vec<String> = self.loaded.iter().cloned().collect();
        let rows = client
            .read(&self.model, &[self.id], Some(&fields))
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| ClientError::NotFound(format!("{} id={}", self.model, self.id)))?;

        let refreshed = Record::from_row(&self.model, row, Some(client))?;
        self.fields = refreshed.fields;
        self.loaded.extend(refreshed.loaded);
        Ok(())
    }

    /// Encode the loaded fields back into a wire value map (excluding
    /// the id).
    pub fn to_values(&self) -> Map<String, Json> {
        self.fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_wire()))
            .collect()
    }

    fn client(&self) -> Result<&OdooClient> {
        self.client.as_ref().ok_or_else(|| {
            ClientError::Internal(format!(
                "record {}({}) has no client attached",
                self.model, self.id
            ))
        })
    }

    /// Display string: the name field when loaded, else `model(id)`.
    pub fn display_name(&self) -> String {
        match self.fields.get("name").or_else(|| self.fields.get("display_name")) {
            Some(FieldValue::String(name)) => name.clone(),
            _ => format!("{}({})", self.model, self.id),
        }
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("model", &self.model)
            .field("id", &self.id)
            .field("loaded", &self.loaded.len())
            .field("deleted", &self.deleted)
            .finish()
    }
}
