//! Convenient imports for common functionality.
//!
//! ```rust
//! use sql_registry::prelude::*;
//! ```

pub use crate::client::Client;
pub use crate::config::{DbConfig, RegistryConfig};
pub use crate::error::{ErrorKind, SqlRegistryError};
pub use crate::registry::{HealthReport, Registry};
pub use crate::results::{ExecResult, Record};
pub use crate::rows::{Row, Rows};
pub use crate::scope::Scope;
pub use crate::statement::{StatementState, Stmt};
pub use crate::transaction::{Tx, TxStmt};
pub use crate::types::{DatabaseType, FromValue, RowValues};
