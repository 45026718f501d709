// Model descriptor registry.
//
// A name -> descriptor lookup for ERP models. Descriptors enumerate
// fields with their wire types and relationship metadata; a single
// descriptor kind parameterizes relationships instead of one type per
// relationship arity.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Wire type of a model field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Char,
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Binary,
    Monetary,
    Selection { choices: Vec<String> },
    Many2One { relation: String },
    One2Many { relation: String, inverse: Option<String> },
    Many2Many { relation: String },
}

impl FieldKind {
    /// Target model of a relationship field.
    pub fn relation(&self) -> Option<&str> {
        match self {
            FieldKind::Many2One { relation }
            | FieldKind::One2Many { relation, .. }
            | FieldKind::Many2Many { relation } => Some(relation),
            _ => None,
        }
    }

    pub fn is_relational(&self) -> bool {
        self.relation().is_some()
    }

    /// Whether the relationship refers to a set of records.
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            FieldKind::One2Many { .. } | FieldKind::Many2Many { .. }
        )
    }
}

/// Metadata for one model field.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    /// Char size limit, when the server enforces one.
    pub size: Option<usize>,
    /// (precision, scale) for float/monetary fields.
    pub digits: Option<(u8, u8)>,
    /// Companion currency field for monetary fields.
    pub currency_field: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            size: None,
            digits: None,
            currency_field: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_digits(mut self, precision: u8, scale: u8) -> Self {
        self.digits = Some((precision, scale));
        self
    }

    pub fn with_currency_field(mut self, field: impl Into<String>) -> Self {
        self.currency_field = Some(field.into());
        self
    }
}

/// Metadata for one ERP model.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub odoo_name: String,
    pub fields: HashMap<String, FieldDescriptor>,
}

impl ModelDescriptor {
    pub fn new(odoo_name: impl Into<String>) -> Self {
        Self {
            odoo_name: odoo_name.into(),
            fields: HashMap::new(),
        }
    }

    pub fn field(mut self, descriptor: FieldDescriptor) -> Self {
        self.fields.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn field_kind(&self, name: &str) -> Option<&FieldKind> {
        self.fields.get(name).map(|f| &f.kind)
    }

    /// Names of every relationship field.
    pub fn relationship_fields(&self) -> Vec<&FieldDescriptor> {
        self.fields
            .values()
            .filter(|f| f.kind.is_relational())
            .collect()
    }
}

/// Thread-safe name -> descriptor registry.
#[derive(Default)]
pub struct ModelRegistry {
    models: parking_lot::RwLock<HashMap<String, Arc<ModelDescriptor>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: ModelDescriptor) {
        debug!(model = %descriptor.odoo_name, fields = descriptor.fields.len(), "registered model");
        self.models
            .write()
            .insert(descriptor.odoo_name.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, odoo_name: &str) -> Option<Arc<ModelDescriptor>> {
        self.models.read().get(odoo_name).cloned()
    }

    pub fn has_model(&self, odoo_name: &str) -> bool {
        self.models.read().contains_key(odoo_name)
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models.read().keys().cloned().collect()
    }

    pub fn unregister(&self, odoo_name: &str) -> bool {
        self.models.write().remove(odoo_name).is_some()
    }
}
