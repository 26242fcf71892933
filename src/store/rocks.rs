//! Record store using RocksDB
//!
//! Column families:
//! - `ids`: big-endian id → record (first binding of the id)
//! - `subjects`: `subject \0 version` → record
//! - `fingerprints`: fingerprint → big-endian id

use super::{SchemaId, SchemaRecord, SchemaStore};
use crate::common::{Error, Result};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Mutex;

const CF_IDS: &str = "ids";
const CF_SUBJECTS: &str = "subjects";
const CF_FINGERPRINTS: &str = "fingerprints";

fn id_key(id: SchemaId) -> [u8; 8] {
    (id as u64).to_be_bytes()
}

fn decode_id(bytes: &[u8]) -> Result<SchemaId> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Store(format!("malformed id key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw) as SchemaId)
}

fn subject_prefix(subject: &str) -> Vec<u8> {
    let mut key = subject.as_bytes().to_vec();
    key.push(0);
    key
}

fn subject_key(subject: &str, version: u32) -> Vec<u8> {
    let mut key = subject_prefix(subject);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// RocksDB-backed store
pub struct RocksSchemaStore {
    db: DB,
    // appends check-then-write across column families
    write_lock: Mutex<()>,
}

impl RocksSchemaStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_IDS, CF_SUBJECTS, CF_FINGERPRINTS])?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Store(format!("missing column family {}", name)))
    }

    fn decode(bytes: &[u8]) -> Result<SchemaRecord> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn subject_records(&self, subject: &str) -> Result<Vec<SchemaRecord>> {
        let cf = self.cf(CF_SUBJECTS)?;
        let prefix = subject_prefix(subject);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            records.push(Self::decode(&value)?);
        }
        Ok(records)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl SchemaStore for RocksSchemaStore {
    fn append(&self, record: SchemaRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let ids = self.cf(CF_IDS)?;
        let subjects = self.cf(CF_SUBJECTS)?;
        let fingerprints = self.cf(CF_FINGERPRINTS)?;

        let existing = self.get_by_id(record.id)?;
        if let Some(existing) = &existing {
            if existing.fingerprint != record.fingerprint {
                return Err(Error::Store(format!(
                    "id {} is already bound to different content",
                    record.id
                )));
            }
        }
        let skey = subject_key(&record.subject, record.version);
        if self.db.get_cf(subjects, &skey)?.is_some() {
            return Err(Error::Store(format!(
                "{} version {} already exists",
                record.subject, record.version
            )));
        }

        let value = bincode::serialize(&record)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(subjects, &skey, &value);
        if existing.is_none() {
            batch.put_cf(ids, id_key(record.id), &value);
        }
        if self
            .db
            .get_cf(fingerprints, record.fingerprint.as_bytes())?
            .is_none()
        {
            batch.put_cf(fingerprints, record.fingerprint.as_bytes(), id_key(record.id));
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn max_id(&self) -> Result<Option<SchemaId>> {
        let cf = self.cf(CF_IDS)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Some(decode_id(&key)?))
            }
            None => Ok(None),
        }
    }

    fn get_by_id(&self, id: SchemaId) -> Result<Option<SchemaRecord>> {
        let cf = self.cf(CF_IDS)?;
        match self.db.get_cf(cf, id_key(id))? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_version(&self, subject: &str, version: u32) -> Result<Option<SchemaRecord>> {
        let cf = self.cf(CF_SUBJECTS)?;
        match self.db.get_cf(cf, subject_key(subject, version))? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn latest_version(&self, subject: &str) -> Result<Option<SchemaRecord>> {
        Ok(self.subject_records(subject)?.pop())
    }

    fn versions(&self, subject: &str) -> Result<Vec<u32>> {
        Ok(self
            .subject_records(subject)?
            .iter()
            .map(|r| r.version)
            .collect())
    }

    fn lookup(&self, subject: &str, fingerprint: &str) -> Result<Option<SchemaRecord>> {
        Ok(self
            .subject_records(subject)?
            .into_iter()
            .find(|r| r.fingerprint == fingerprint))
    }

    fn id_for_fingerprint(&self, fingerprint: &str) -> Result<Option<SchemaId>> {
        let cf = self.cf(CF_FINGERPRINTS)?;
        match self.db.get_cf(cf, fingerprint.as_bytes())? {
            Some(bytes) => Ok(Some(decode_id(&bytes)?)),
            None => Ok(None),
        }
    }

    fn subjects(&self) -> Result<Vec<String>> {
        let cf = self.cf(CF_SUBJECTS)?;
        let mut subjects: Vec<String> = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record = Self::decode(&value)?;
            if subjects.last() != Some(&record.subject) {
                subjects.push(record.subject);
            }
        }
        Ok(subjects)
    }
}
