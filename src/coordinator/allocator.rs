//! Batched schema id allocation
//!
//! The master reserves ids from the coordination-service counter one batch
//! at a time and hands them out from memory. The persisted counter always
//! names the first id nobody has reserved yet and always lands on a batch
//! boundary.
//!
//! Every reservation reconciles the counter against the store: the next
//! batch starts at the smallest multiple of the batch size that is at least
//! the persisted counter and greater than the highest stored id. A counter
//! reset by hand therefore never causes an id to be issued twice.
//! Reserved ids that are never written are skipped, never reused.

use crate::common::{Error, Result};
use crate::coordination::{with_timeout, CoordinationClient, WriteCondition};
use crate::coordinator::elector::{MasterLease, MastershipListener};
use crate::store::{SchemaId, SchemaStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_RESERVE_ATTEMPTS: usize = 5;

/// Round `value` up to the next multiple of `batch_size`; `None` on overflow
pub fn align_up(value: i64, batch_size: i64) -> Option<i64> {
    if batch_size <= 0 {
        return None;
    }
    let rem = value.rem_euclid(batch_size);
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(batch_size - rem)
    }
}

/// Start of the next batch given the persisted counter and the highest id
/// already assigned (either may be missing). `None` if a whole batch no
/// longer fits below `i64::MAX`.
pub fn reconcile(
    persisted: Option<i64>,
    max_assigned: Option<i64>,
    batch_size: i64,
) -> Option<i64> {
    let after_max = match max_assigned {
        Some(m) => m.checked_add(1)?,
        None => 0,
    };
    let floor = persisted.unwrap_or(0).max(after_max).max(0);
    let start = align_up(floor, batch_size)?;
    start.checked_add(batch_size)?;
    Some(start)
}

/// Parse the persisted counter; anything but a decimal integer is corruption.
pub fn parse_counter(path: &str, data: &str) -> Result<i64> {
    data.trim().parse::<i64>().map_err(|_| Error::CorruptedCounter {
        path: path.to_string(),
        value: data.to_string(),
    })
}

/// Ids reserved in memory for one mastership epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdBatch {
    pub epoch: u64,
    pub start: SchemaId,
    pub size: i64,
    pub next_offset: i64,
}

impl IdBatch {
    pub fn new(epoch: u64, start: SchemaId, size: i64) -> Self {
        Self {
            epoch,
            start,
            size,
            next_offset: 0,
        }
    }

    pub fn take(&mut self) -> Option<SchemaId> {
        if self.next_offset >= self.size {
            return None;
        }
        let id = self.start + self.next_offset;
        self.next_offset += 1;
        Some(id)
    }

    /// First id past this batch
    pub fn end(&self) -> SchemaId {
        self.start + self.size
    }

    pub fn remaining(&self) -> i64 {
        self.size - self.next_offset
    }

    fn restart(&mut self, start: SchemaId) {
        self.start = start;
        self.next_offset = 0;
    }
}

pub struct IdAllocator {
    client: Arc<dyn CoordinationClient>,
    store: Arc<dyn SchemaStore>,
    counter_path: String,
    batch_size: i64,
    timeout: Duration,
    // epoch allowed to allocate; 0 while fenced
    active_epoch: AtomicU64,
    batch: tokio::sync::Mutex<Option<IdBatch>>,
}

impl IdAllocator {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        store: Arc<dyn SchemaStore>,
        counter_path: impl Into<String>,
        batch_size: i64,
        timeout: Duration,
    ) -> Self {
        assert!(batch_size > 0, "id batch size must be positive");
        Self {
            client,
            store,
            counter_path: counter_path.into(),
            batch_size,
            timeout,
            active_epoch: AtomicU64::new(0),
            batch: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn current_batch(&self) -> Option<IdBatch> {
        self.batch.lock().await.clone()
    }

    fn check(&self, lease: &MasterLease) -> Result<()> {
        let active = self.active_epoch.load(Ordering::SeqCst);
        if active != 0 && active == lease.epoch() {
            Ok(())
        } else {
            Err(Error::LostMastership)
        }
    }

    fn fence(&self) {
        self.active_epoch.store(0, Ordering::SeqCst);
    }

    /// Next id under `lease`. Fails with `LostMastership` once the lease's
    /// epoch is over, including when that happens during a rollover.
    ///
    /// Handing out the last id of a batch reserves the next one right away,
    /// so the persisted counter stays ahead of every id in use. If that
    /// reservation fails the next call retries it before allocating.
    pub async fn next_id(&self, lease: &MasterLease) -> Result<SchemaId> {
        self.check(lease)?;
        let mut guard = self.batch.lock().await;
        self.check(lease)?;
        let batch = match guard.as_mut() {
            Some(batch) if batch.epoch == lease.epoch() => batch,
            _ => return Err(Error::LostMastership),
        };

        if batch.remaining() == 0 {
            match self.roll_over(batch).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!("Id batch rollover failed, fencing allocation: {}", e);
                    self.fence();
                    *guard = None;
                    return Err(Error::LostMastership);
                }
            }
            // demoted while the counter write was in flight
            self.check(lease)?;
        }

        let id = batch
            .take()
            .ok_or_else(|| Error::Internal("fresh id batch is empty".into()))?;
        if batch.remaining() == 0 {
            match self.roll_over(batch).await {
                Ok(()) => self.check(lease)?,
                Err(e) => {
                    tracing::warn!("Early rollover after id {} failed, retrying later: {}", id, e)
                }
            }
        }
        Ok(id)
    }

    async fn roll_over(&self, batch: &mut IdBatch) -> Result<()> {
        let start = self.reserve(Some(batch.end())).await?;
        batch.restart(start);
        tracing::info!("Rolled over to id batch [{}, {})", start, batch.end());
        Ok(())
    }

    /// Reserve one batch, returning its first id. `floor` is an id bound
    /// the batch must not start below (the end of an exhausted batch).
    async fn reserve(&self, floor: Option<SchemaId>) -> Result<SchemaId> {
        for attempt in 1..=MAX_RESERVE_ATTEMPTS {
            let current = with_timeout(
                self.timeout,
                "read id counter",
                self.client.get(&self.counter_path),
            )
            .await?;
            let (persisted, condition) = match &current {
                Some(v) => (
                    Some(parse_counter(&self.counter_path, &v.data)?),
                    WriteCondition::Version(v.version),
                ),
                None => (None, WriteCondition::Absent),
            };
            let stored_max = self.store.max_id()?;
            let max_assigned = match floor {
                Some(f) => Some(stored_max.map_or(f - 1, |m| m.max(f - 1))),
                None => stored_max,
            };

            let start = reconcile(persisted, max_assigned, self.batch_size).ok_or_else(|| {
                Error::CorruptedCounter {
                    path: self.counter_path.clone(),
                    value: current.as_ref().map_or("none".to_string(), |v| v.data.clone()),
                }
            })?;
            let end = start + self.batch_size;
            let write = with_timeout(
                self.timeout,
                "write id counter",
                self.client.set(&self.counter_path, &end.to_string(), condition),
            )
            .await;
            match write {
                Ok(_) => {
                    tracing::debug!(
                        "Id counter {:?} -> {} (store max {:?})",
                        persisted,
                        end,
                        stored_max
                    );
                    return Ok(start);
                }
                Err(Error::VersionConflict { .. }) => {
                    tracing::warn!(
                        "Id counter changed during reservation (attempt {}), retrying",
                        attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::CoordinationUnavailable(format!(
            "could not reserve an id batch after {} attempts",
            MAX_RESERVE_ATTEMPTS
        )))
    }
}

#[async_trait]
impl MastershipListener for IdAllocator {
    async fn on_become_master(&self, epoch: u64) -> Result<()> {
        let mut guard = self.batch.lock().await;
        self.fence();
        *guard = None;

        let start = self.reserve(None).await?;
        *guard = Some(IdBatch::new(epoch, start, self.batch_size));
        self.active_epoch.store(epoch, Ordering::SeqCst);
        tracing::info!(
            "Reserved id batch [{}, {}) for epoch {}",
            start,
            start + self.batch_size,
            epoch
        );
        Ok(())
    }

    fn on_lose_master(&self) {
        self.fence();
        // a batch still locked by an in-flight call is dropped on the next
        // acquisition; the epoch check already makes it unusable
        if let Ok(mut guard) = self.batch.try_lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationPaths, MemoryCoordinationService};
    use crate::store::{record, MemorySchemaStore};

    const BATCH: i64 = 20;

    fn setup() -> (
        Arc<MemoryCoordinationService>,
        Arc<MemorySchemaStore>,
        IdAllocator,
        String,
    ) {
        let service = MemoryCoordinationService::new();
        let store = Arc::new(MemorySchemaStore::new());
        let path = CoordinationPaths::default().id_counter;
        let allocator = IdAllocator::new(
            service.connect(),
            store.clone(),
            path.clone(),
            BATCH,
            Duration::from_millis(200),
        );
        (service, store, allocator, path)
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 20), Some(0));
        assert_eq!(align_up(1, 20), Some(20));
        assert_eq!(align_up(20, 20), Some(20));
        assert_eq!(align_up(21, 20), Some(40));
        assert_eq!(align_up(-5, 20), Some(0));
        assert_eq!(align_up(i64::MAX - 5, 20), None);
        assert_eq!(align_up(7, 0), None);
    }

    #[test]
    fn test_reconcile() {
        // fresh cluster
        assert_eq!(reconcile(None, None, 20), Some(0));
        // counter ahead of the store
        assert_eq!(reconcile(Some(40), Some(20), 20), Some(40));
        // counter reset below the store maximum
        assert_eq!(reconcile(Some(0), Some(10), 20), Some(20));
        assert_eq!(reconcile(Some(0), Some(50), 100), Some(100));
        // odd counter with an empty store
        assert_eq!(reconcile(Some(19), None, 20), Some(20));
        // store maximum sitting on a boundary
        assert_eq!(reconcile(Some(0), Some(39), 20), Some(40));
        assert_eq!(reconcile(Some(-7), None, 20), Some(0));
    }

    #[test]
    fn test_reconcile_without_room_for_a_batch() {
        assert_eq!(reconcile(Some(i64::MAX - 5), None, 20), None);
        assert_eq!(reconcile(None, Some(i64::MAX), 20), None);
        // aligned, but the batch would run past i64::MAX
        let last_boundary = i64::MAX - i64::MAX % 20;
        assert_eq!(reconcile(Some(last_boundary), None, 20), None);
        assert_eq!(
            reconcile(Some(last_boundary - 20), None, 20),
            Some(last_boundary - 20)
        );
    }

    #[test]
    fn test_parse_counter() {
        assert_eq!(parse_counter("/c", " 40\n").unwrap(), 40);
        assert!(matches!(
            parse_counter("/c", "forty"),
            Err(Error::CorruptedCounter { .. })
        ));
    }

    #[test]
    fn test_id_batch() {
        let mut batch = IdBatch::new(1, 40, 2);
        assert_eq!(batch.take(), Some(40));
        assert_eq!(batch.remaining(), 1);
        assert_eq!(batch.take(), Some(41));
        assert_eq!(batch.take(), None);
        assert_eq!(batch.end(), 42);
    }

    #[tokio::test]
    async fn test_first_reservation() {
        let (service, _store, allocator, path) = setup();
        allocator.on_become_master(1).await.unwrap();

        assert_eq!(service.read(&path).as_deref(), Some("20"));
        let lease = MasterLease::new(1);
        assert_eq!(allocator.next_id(&lease).await.unwrap(), 0);
        assert_eq!(allocator.next_id(&lease).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollover_happens_with_last_id() {
        let (service, store, allocator, path) = setup();
        allocator.on_become_master(1).await.unwrap();
        let lease = MasterLease::new(1);

        for expected in 0..BATCH - 1 {
            let id = allocator.next_id(&lease).await.unwrap();
            assert_eq!(id, expected);
            store
                .append(record("s", (id + 1) as u32, id, &format!("schema-{}", id)))
                .unwrap();
        }
        assert_eq!(service.read(&path).as_deref(), Some("20"));

        // the last id of the batch reserves the next one
        assert_eq!(allocator.next_id(&lease).await.unwrap(), BATCH - 1);
        assert_eq!(service.read(&path).as_deref(), Some("40"));
        assert_eq!(allocator.next_id(&lease).await.unwrap(), BATCH);
        assert_eq!(service.read(&path).as_deref(), Some("40"));
    }

    #[tokio::test]
    async fn test_rollover_ignores_tampered_counter() {
        let (service, _store, allocator, path) = setup();
        allocator.on_become_master(1).await.unwrap();
        let lease = MasterLease::new(1);
        for _ in 0..BATCH - 1 {
            allocator.next_id(&lease).await.unwrap();
        }

        // nothing was written to the store, and the counter went back to 0
        service.write(&path, "0");
        assert_eq!(allocator.next_id(&lease).await.unwrap(), BATCH - 1);
        assert_eq!(service.read(&path).as_deref(), Some("40"));
        assert_eq!(allocator.next_id(&lease).await.unwrap(), BATCH);
    }

    #[tokio::test]
    async fn test_failed_early_rollover_is_retried() {
        let (service, _store, allocator, path) = setup();
        allocator.on_become_master(1).await.unwrap();
        let lease = MasterLease::new(1);
        for _ in 0..BATCH - 1 {
            allocator.next_id(&lease).await.unwrap();
        }

        // the early reservation trips over the corrupted counter, the id
        // it was issued with is still good
        service.write(&path, "garbage");
        assert_eq!(allocator.next_id(&lease).await.unwrap(), BATCH - 1);
        assert_eq!(allocator.current_batch().await.unwrap().remaining(), 0);
        assert!(matches!(
            allocator.next_id(&lease).await,
            Err(Error::CorruptedCounter { .. })
        ));

        service.write(&path, "20");
        assert_eq!(allocator.next_id(&lease).await.unwrap(), BATCH);
        assert_eq!(service.read(&path).as_deref(), Some("40"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocation_is_unique() {
        let (_service, _store, allocator, _path) = setup();
        let allocator = Arc::new(allocator);
        allocator.on_become_master(1).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                let lease = MasterLease::new(1);
                let mut ids = Vec::new();
                for _ in 0..10 {
                    ids.push(allocator.next_id(&lease).await.unwrap());
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        // four batches, no gaps and no duplicates
        assert_eq!(all, (0..4 * BATCH).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_overflowing_counter_is_corruption() {
        let (service, _store, allocator, path) = setup();
        service.write(&path, &(i64::MAX - 5).to_string());
        assert!(matches!(
            allocator.on_become_master(1).await,
            Err(Error::CorruptedCounter { .. })
        ));
        assert!(allocator.current_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_reservation_reconciles_with_store() {
        let (service, store, allocator, path) = setup();
        for id in 0..=10 {
            store
                .append(record("s", (id + 1) as u32, id, &format!("schema-{}", id)))
                .unwrap();
        }
        service.write(&path, "0");

        allocator.on_become_master(3).await.unwrap();
        assert_eq!(service.read(&path).as_deref(), Some("40"));
        assert_eq!(allocator.next_id(&MasterLease::new(3)).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_stale_lease_is_refused() {
        let (_service, _store, allocator, _path) = setup();
        allocator.on_become_master(1).await.unwrap();
        let old = MasterLease::new(1);
        assert!(allocator.next_id(&old).await.is_ok());

        allocator.on_lose_master();
        assert!(matches!(
            allocator.next_id(&old).await,
            Err(Error::LostMastership)
        ));
        assert!(allocator.current_batch().await.is_none());

        allocator.on_become_master(2).await.unwrap();
        assert!(matches!(
            allocator.next_id(&old).await,
            Err(Error::LostMastership)
        ));
        assert_eq!(allocator.next_id(&MasterLease::new(2)).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_corrupted_counter_is_reported() {
        let (service, _store, allocator, path) = setup();
        service.write(&path, "not-a-number");

        let err = allocator.on_become_master(1).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            allocator.next_id(&MasterLease::new(1)).await,
            Err(Error::LostMastership)
        ));
    }
}
