//! In-memory record store, shared between nodes through an `Arc`

use super::{SchemaId, SchemaRecord, SchemaStore};
use crate::common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct Records {
    by_id: BTreeMap<SchemaId, SchemaRecord>,
    by_subject: BTreeMap<String, BTreeMap<u32, SchemaRecord>>,
    fingerprints: HashMap<String, SchemaId>,
}

/// In-memory store (default)
#[derive(Default)]
pub struct MemorySchemaStore {
    records: Mutex<Records>,
}

impl MemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SchemaStore for MemorySchemaStore {
    fn append(&self, record: SchemaRecord) -> Result<()> {
        let mut records = self.lock();
        if let Some(existing) = records.by_id.get(&record.id) {
            if existing.fingerprint != record.fingerprint {
                return Err(Error::Store(format!(
                    "id {} is already bound to different content",
                    record.id
                )));
            }
        }
        let versions = records.by_subject.entry(record.subject.clone()).or_default();
        if versions.contains_key(&record.version) {
            return Err(Error::Store(format!(
                "{} version {} already exists",
                record.subject, record.version
            )));
        }
        versions.insert(record.version, record.clone());
        records
            .fingerprints
            .entry(record.fingerprint.clone())
            .or_insert(record.id);
        records.by_id.entry(record.id).or_insert(record);
        Ok(())
    }

    fn max_id(&self) -> Result<Option<SchemaId>> {
        Ok(self.lock().by_id.keys().next_back().copied())
    }

    fn get_by_id(&self, id: SchemaId) -> Result<Option<SchemaRecord>> {
        Ok(self.lock().by_id.get(&id).cloned())
    }

    fn get_version(&self, subject: &str, version: u32) -> Result<Option<SchemaRecord>> {
        Ok(self
            .lock()
            .by_subject
            .get(subject)
            .and_then(|v| v.get(&version))
            .cloned())
    }

    fn latest_version(&self, subject: &str) -> Result<Option<SchemaRecord>> {
        Ok(self
            .lock()
            .by_subject
            .get(subject)
            .and_then(|v| v.values().next_back())
            .cloned())
    }

    fn versions(&self, subject: &str) -> Result<Vec<u32>> {
        Ok(self
            .lock()
            .by_subject
            .get(subject)
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default())
    }

    fn lookup(&self, subject: &str, fingerprint: &str) -> Result<Option<SchemaRecord>> {
        Ok(self.lock().by_subject.get(subject).and_then(|v| {
            v.values()
                .find(|r| r.fingerprint == fingerprint)
                .cloned()
        }))
    }

    fn id_for_fingerprint(&self, fingerprint: &str) -> Result<Option<SchemaId>> {
        Ok(self.lock().fingerprints.get(fingerprint).copied())
    }

    fn subjects(&self) -> Result<Vec<String>> {
        Ok(self.lock().by_subject.keys().cloned().collect())
    }
}
