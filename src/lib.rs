// RustyERP - asynchronous ERP RPC client
// Core library module

pub mod batch;
pub mod cache;
pub mod client;
pub mod common;
pub mod error;
pub mod models;
pub mod query;
pub mod transaction;
pub mod transport;

pub use client::{ClientConfig, OdooClient};
pub use common::{Domain, DomainLeaf, DomainNode, DomainOperator, FieldValue, RecordId};
pub use error::{CacheBackendError, CacheError, ClientError, Result, TransactionError};
pub use models::{
    FieldDescriptor, FieldKind, LazyRelationship, ModelDescriptor, ModelRegistry, Record,
    RelationValue,
};
pub use query::{field, Expr, QuerySet};
