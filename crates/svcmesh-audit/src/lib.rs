pub mod dispatcher;
pub mod error;
pub mod types;
pub mod wal;

pub use dispatcher::{AuditDispatcher, DispatchOutcome, DispatcherConfig};
pub use error::{DispatchError, WalError};
pub use types::{AuditEvent, FinalizeReason, WalCursor};
pub use wal::{AuditWal, WalConfig, WalHandle};
