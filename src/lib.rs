//! Named database clients that are built lazily, bounded by per-operation deadlines,
//! and paired with prepared statements that heal themselves.
//!
//! - [`Registry`] maps names to configurations and builds each [`Client`] at most once.
//! - Every operation on a client derives a deadline from its configuration (query, exec
//!   or transaction budget) and layers it on the caller's [`Scope`]; the tighter wins.
//! - [`Client::prepared`] returns a [`Stmt`] that keeps compiling in the background
//!   until it succeeds.
//!
//! Backends are chosen with the `sqlite` (default) and `postgres` features.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use sql_registry::prelude::*;
//!
//! # async fn demo() -> Result<(), SqlRegistryError> {
//! let registry = Registry::new();
//! registry
//!     .register(
//!         "debug",
//!         DbConfig::sqlite("/tmp/debug.db").with_timeouts(Duration::from_secs(10)),
//!     )
//!     .await?;
//!
//! let db = registry.get("debug").await?;
//! let scope = Scope::new();
//! db.exec(&scope, "UPDATE t SET x = 1 WHERE id = ?", &[RowValues::Int(7)]).await?;
//! match db
//!     .query_row(&scope, "SELECT x FROM t WHERE id = ?", &[RowValues::Int(999)])
//!     .await
//!     .scan_one::<i64>()
//! {
//!     Err(e) if e.is_no_rows() => println!("nothing there"),
//!     other => println!("x = {}", other?),
//! }
//! # Ok(())
//! # }
//! ```

#[cfg(not(any(feature = "sqlite", feature = "postgres")))]
compile_error!("enable at least one backend feature: `sqlite` or `postgres`");

pub mod client;
pub mod config;
pub mod error;
mod executor;
mod factory;
mod pool;
#[cfg(feature = "postgres")]
mod postgres;
pub mod prelude;
pub mod registry;
pub mod results;
pub mod rows;
pub mod scope;
#[cfg(feature = "sqlite")]
mod sqlite;
pub mod statement;
pub mod transaction;
pub mod types;

pub use client::Client;
pub use config::{DbConfig, RegistryConfig};
pub use error::{DriverError, ErrorKind, SqlRegistryError};
pub use pool::PoolStatus;
pub use registry::{HealthReport, HealthStatus, Registry};
pub use results::{ExecResult, Record};
pub use rows::{Row, Rows};
pub use scope::Scope;
pub use statement::{CompiledStatement, RETRY_INTERVAL, StatementState, Stmt};
pub use transaction::{Tx, TxStmt};
pub use types::{DatabaseType, FromValue, RowValues};
