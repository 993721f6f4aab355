//! SewerRat: a metadata indexing and search service for shared filesystems.
//!
//! Users register directories they own; the service walks them, parses named
//! JSON files as metadata, tokenizes the contents into an embedded SQLite
//! index, and serves a JSON-over-HTTP search and retrieval API. Results
//! reference absolute paths on the shared mount, with read-through endpoints
//! for remote clients.

pub mod cli;
pub mod config;
pub mod load;
pub mod period;
pub mod query;
pub mod scan;
pub mod server;
pub mod storage;
pub mod tokenize;
pub mod verify;
pub mod whitelist;

/// Marker error for cooperatively cancelled operations, distinguishable from
/// ordinary failures all the way up at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;
