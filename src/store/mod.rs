//! Schema record store
//!
//! Stands in for the replicated log every node reads from. The election
//! core only needs `max_id`; the registry uses the rest for idempotent
//! registration and reads.

pub mod memory;
pub mod rocks;

use crate::common::Result;
use serde::{Deserialize, Serialize};

pub use memory::MemorySchemaStore;
pub use rocks::RocksSchemaStore;

pub type SchemaId = i64;

/// One registered version of a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub subject: String,
    pub version: u32,
    pub id: SchemaId,
    pub schema: String,
    pub fingerprint: String,
    pub registered_at: i64,
}

/// Trait for record store backends
pub trait SchemaStore: Send + Sync {
    /// Durably append a record. Binding an existing id to different
    /// content, or reusing a (subject, version) pair, is refused.
    fn append(&self, record: SchemaRecord) -> Result<()>;

    /// Highest id ever appended
    fn max_id(&self) -> Result<Option<SchemaId>>;

    fn get_by_id(&self, id: SchemaId) -> Result<Option<SchemaRecord>>;

    fn get_version(&self, subject: &str, version: u32) -> Result<Option<SchemaRecord>>;

    fn latest_version(&self, subject: &str) -> Result<Option<SchemaRecord>>;

    fn versions(&self, subject: &str) -> Result<Vec<u32>>;

    /// Record of `fingerprint` under `subject`, if registered there
    fn lookup(&self, subject: &str, fingerprint: &str) -> Result<Option<SchemaRecord>>;

    /// Id already bound to this content under any subject
    fn id_for_fingerprint(&self, fingerprint: &str) -> Result<Option<SchemaId>>;

    fn subjects(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
pub(crate) fn record(subject: &str, version: u32, id: SchemaId, schema: &str) -> SchemaRecord {
    SchemaRecord {
        subject: subject.to_string(),
        version,
        id,
        schema: schema.to_string(),
        fingerprint: crate::common::fingerprint(schema),
        registered_at: 0,
    }
}
