// # Record model layer
//
// Dynamic records over normalized field values, the model descriptor
// registry, and lazy relationships with batched N+1-free loading.

pub mod record;
pub mod registry;
pub mod relationships;

pub use record::Record;
pub use registry::{FieldDescriptor, FieldKind, ModelDescriptor, ModelRegistry};
pub use relationships::{
    LazyRelationship, RelationValue, RelationshipLoader, RelationshipState,
};
