//! Incremental brokerage-data pipeline.
//!
//! Pulls trade executions from pluggable sources into a local SQLite store,
//! keeps per-(account, source) sync cursors so every run is resumable,
//! aggregates valuation snapshots into equity curves, and verifies
//! recommendation snapshots against later prices. All derived views are
//! recomputed on demand from committed rows.

pub mod db;
pub mod equity;
pub mod models;
pub mod reality;
pub mod retention;
pub mod sync;
