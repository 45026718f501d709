// # Batch execution
//
// Groups bulk operations by (kind, model), chunks them, and dispatches
// chunks concurrently under a bounded semaphore, merging per-operation
// outcomes back by original index.

pub mod executor;
pub mod operations;

pub use executor::{BatchExecutor, BatchResult, PartitionTiming};
pub use operations::{Batch, BatchOpKind, BatchOperation, BatchOutcome};
