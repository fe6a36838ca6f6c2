//! Persistence layer — the records table and its claim protocol.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{Claim, Record, RecordPage, StagedResult, WorkStore};
