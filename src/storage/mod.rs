// Output sinks for extracted lineage
pub mod memory;
pub mod sqlite;

pub use memory::MemorySink;
pub use sqlite::SqliteLineageSink;

use crate::error::LineageError;
use crate::models::LineageRecord;

/// Per-request writer: records are appended, then flushed once.
/// A writer dropped without a flush persists nothing.
#[async_trait::async_trait]
pub trait LineageWriter: Send {
    async fn append(&mut self, record: &LineageRecord) -> Result<(), LineageError>;

    async fn flush(&mut self) -> Result<(), LineageError>;
}

/// Hands out one writer per extraction request
pub trait LineageSink: Send + Sync {
    fn writer(&self) -> Box<dyn LineageWriter>;
}
