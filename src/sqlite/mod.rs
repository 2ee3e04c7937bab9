// SQLite backend
//
// - manager: bb8 connection manager (open, busy timeout, WAL)
// - params: conversion from RowValues to rusqlite values
// - query: row value extraction
// - executor: blocking-pool execution with interrupt on cancellation

mod executor;
mod manager;
mod params;
mod query;

pub(crate) use executor::{batch, compile, execute, ping, query, transaction_state};
pub(crate) use manager::SqliteManager;
