// # Transaction management
//
// Every mutating operation runs inside a transaction scope. The scope
// keeps an append-only operation log with pre-images, supports named
// savepoints for partial rollback, and accumulates the cache regions its
// operations dirty. Commit hands that dirty set to the cache manager;
// rollback compensates the log in reverse order.

pub mod manager;
pub mod types;

pub use manager::{RollbackSummary, TransactionHandle, TransactionManager};
pub use types::{CacheDirty, OpEntry, OpKind, Savepoint, Transaction, TransactionState};
