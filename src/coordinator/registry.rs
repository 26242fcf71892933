//! Write fencing and routing for schema registration
//!
//! Registration is admitted only on the master. A follower answers with
//! `NotMaster` naming the master it observes; forwarding is left to the
//! API layer. Reads are served by every node straight from the store.

use crate::common::{fingerprint, validate_subject, Error, Result};
use crate::coordinator::allocator::IdAllocator;
use crate::coordinator::elector::{MasterElector, MasterLease};
use crate::store::{SchemaId, SchemaRecord, SchemaStore};
use std::sync::Arc;

pub struct SchemaRegistry {
    elector: Arc<MasterElector>,
    allocator: Arc<IdAllocator>,
    store: Arc<dyn SchemaStore>,
    // one registration at a time per node keeps versions dense
    write_lock: tokio::sync::Mutex<()>,
}

impl SchemaRegistry {
    pub fn new(
        elector: Arc<MasterElector>,
        allocator: Arc<IdAllocator>,
        store: Arc<dyn SchemaStore>,
    ) -> Self {
        Self {
            elector,
            allocator,
            store,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register `schema` under `subject`, returning its id.
    ///
    /// Re-registering a schema the subject already has returns the existing
    /// id on any node. Anything new needs mastership: the same text under a
    /// new subject reuses its id, otherwise a fresh id is allocated. If the
    /// append fails the allocated id is abandoned.
    pub async fn register(&self, subject: &str, schema: &str) -> Result<SchemaId> {
        validate_subject(subject)?;
        if schema.trim().is_empty() {
            return Err(Error::InvalidInput("schema cannot be empty".into()));
        }
        let fp = fingerprint(schema);

        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.store.lookup(subject, &fp)? {
            tracing::debug!(
                "{} already registered under {} as version {}",
                existing.id,
                subject,
                existing.version
            );
            return Ok(existing.id);
        }

        let lease = self.elector.master_lease()?;
        let id = match self.store.id_for_fingerprint(&fp)? {
            Some(id) => id,
            None => self.allocate(&lease).await?,
        };
        let version = self
            .store
            .latest_version(subject)?
            .map_or(1, |latest| latest.version + 1);

        if !self.elector.is_lease_valid(&lease) {
            tracing::warn!("Mastership lost before appending id {}, id skipped", id);
            return Err(Error::LostMastership);
        }
        let record = SchemaRecord {
            subject: subject.to_string(),
            version,
            id,
            schema: schema.to_string(),
            fingerprint: fp,
            registered_at: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.store.append(record) {
            tracing::warn!(
                "Append of {} version {} failed, id {} will not be reused: {}",
                subject,
                version,
                id,
                e
            );
            return Err(e);
        }

        tracing::info!("Registered {} version {} with id {}", subject, version, id);
        Ok(id)
    }

    async fn allocate(&self, lease: &MasterLease) -> Result<SchemaId> {
        match self.allocator.next_id(lease).await {
            Err(Error::LostMastership) => {
                // no-op unless the elector still believes in this lease
                self.elector.resign(lease).await;
                Err(Error::LostMastership)
            }
            other => other,
        }
    }

    pub fn schema_by_id(&self, id: SchemaId) -> Result<SchemaRecord> {
        self.store
            .get_by_id(id)?
            .ok_or_else(|| Error::NotFound(format!("schema id {}", id)))
    }

    pub fn version(&self, subject: &str, version: u32) -> Result<SchemaRecord> {
        self.store
            .get_version(subject, version)?
            .ok_or_else(|| Error::NotFound(format!("{} version {}", subject, version)))
    }

    pub fn latest(&self, subject: &str) -> Result<SchemaRecord> {
        self.store
            .latest_version(subject)?
            .ok_or_else(|| Error::NotFound(format!("subject {}", subject)))
    }

    pub fn versions(&self, subject: &str) -> Result<Vec<u32>> {
        let versions = self.store.versions(subject)?;
        if versions.is_empty() {
            return Err(Error::NotFound(format!("subject {}", subject)));
        }
        Ok(versions)
    }

    pub fn subjects(&self) -> Result<Vec<String>> {
        self.store.subjects()
    }
}
