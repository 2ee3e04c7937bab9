// PostgreSQL backend
//
// - manager: bb8 connection manager
// - params: ToSql for RowValues
// - query: row value extraction
// - executor: cancellable execution and row streaming

mod executor;
mod manager;
mod params;
mod query;

pub(crate) use executor::{batch, compile, execute, ping, poison, query, transaction_state};
pub(crate) use manager::PgManager;
