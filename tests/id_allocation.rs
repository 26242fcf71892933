//! Schema id allocation through elections and counter tampering

use minireg::common::{Error, NodeConfig};
use minireg::coordination::{CoordinationPaths, MemoryCoordinationService};
use minireg::coordinator::Role;
use minireg::store::{MemorySchemaStore, RocksSchemaStore, SchemaId, SchemaRecord, SchemaStore};
use minireg::RegistryNode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BATCH: i64 = 20;

async fn start_node(
    service: &Arc<MemoryCoordinationService>,
    store: Arc<dyn SchemaStore>,
    port: u16,
) -> RegistryNode {
    let config = NodeConfig {
        port,
        id_batch_size: BATCH,
        operation_timeout_ms: 500,
        ..Default::default()
    };
    RegistryNode::start(config, service.connect(), store)
        .await
        .unwrap()
}

/// Memory store whose next append can be made to fail
#[derive(Default)]
struct FailingStore {
    inner: MemorySchemaStore,
    fail_next: AtomicBool,
}

impl SchemaStore for FailingStore {
    fn append(&self, record: SchemaRecord) -> minireg::Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Store("disk full".into()));
        }
        self.inner.append(record)
    }

    fn max_id(&self) -> minireg::Result<Option<SchemaId>> {
        self.inner.max_id()
    }

    fn get_by_id(&self, id: SchemaId) -> minireg::Result<Option<SchemaRecord>> {
        self.inner.get_by_id(id)
    }

    fn get_version(&self, subject: &str, version: u32) -> minireg::Result<Option<SchemaRecord>> {
        self.inner.get_version(subject, version)
    }

    fn latest_version(&self, subject: &str) -> minireg::Result<Option<SchemaRecord>> {
        self.inner.latest_version(subject)
    }

    fn versions(&self, subject: &str) -> minireg::Result<Vec<u32>> {
        self.inner.versions(subject)
    }

    fn lookup(&self, subject: &str, fingerprint: &str) -> minireg::Result<Option<SchemaRecord>> {
        self.inner.lookup(subject, fingerprint)
    }

    fn id_for_fingerprint(&self, fingerprint: &str) -> minireg::Result<Option<SchemaId>> {
        self.inner.id_for_fingerprint(fingerprint)
    }

    fn subjects(&self) -> minireg::Result<Vec<String>> {
        self.inner.subjects()
    }
}

fn counter_path() -> String {
    CoordinationPaths::default().id_counter
}

fn counter(service: &MemoryCoordinationService) -> Option<String> {
    service.read(&counter_path())
}

#[tokio::test]
async fn test_first_master_reserves_first_batch() {
    let service = MemoryCoordinationService::new();
    let store = Arc::new(MemorySchemaStore::new());
    let node = start_node(&service, store, 8081).await;

    assert_eq!(counter(&service).as_deref(), Some("20"));
    for expected in 0..5 {
        let id = node
            .registry()
            .register("orders", &format!("{{\"v\": {}}}", expected))
            .await
            .unwrap();
        assert_eq!(id, expected);
    }
    let batch = node.allocator().current_batch().await.unwrap();
    assert_eq!(batch.remaining(), BATCH - 5);
}

#[tokio::test]
async fn test_counter_preset_just_below_batch() {
    let service = MemoryCoordinationService::new();
    service.write(&counter_path(), &(BATCH - 1).to_string());

    let store = Arc::new(MemorySchemaStore::new());
    let node = start_node(&service, store, 8081).await;

    assert_eq!(counter(&service), Some((2 * BATCH).to_string()));
    let id = node.registry().register("orders", "\"string\"").await.unwrap();
    assert_eq!(id, BATCH);
}

#[tokio::test]
async fn test_ids_increase_after_counter_reset_low() {
    let service = MemoryCoordinationService::new();
    let store = Arc::new(MemorySchemaStore::new());
    let a = start_node(&service, store.clone(), 8081).await;

    let mut max_id = -1;
    for i in 0..BATCH / 2 {
        let id = a
            .registry()
            .register("orders", &format!("{{\"a\": {}}}", i))
            .await
            .unwrap();
        assert!(id > max_id);
        max_id = id;
    }

    // an operator resets the counter below what was handed out
    assert_eq!(counter(&service), Some(BATCH.to_string()));
    service.write(&counter_path(), "0");
    let id = a.registry().register("orders", "{\"a\": -1}").await.unwrap();
    assert!(id > max_id);
    max_id = id;

    // reelection reconciles against the store
    let b = start_node(&service, store.clone(), 8082).await;
    a.stop().await.unwrap();
    assert!(b
        .elector()
        .wait_for(Duration::from_secs(5), |s| s.role() == Role::Master)
        .await);
    assert_eq!(counter(&service), Some((2 * BATCH).to_string()));

    // reset again and use up a whole batch: the counter jumps with it
    service.write(&counter_path(), "0");
    for i in 0..BATCH {
        let id = b
            .registry()
            .register("orders", &format!("{{\"b\": {}}}", i))
            .await
            .unwrap();
        assert!(id > max_id, "{} should follow {}", id, max_id);
        max_id = id;
    }
    assert_eq!(max_id, 2 * BATCH - 1);
    assert_eq!(counter(&service), Some((3 * BATCH).to_string()));
}

#[tokio::test]
async fn test_failed_append_skips_its_id() {
    let service = MemoryCoordinationService::new();
    let store = Arc::new(FailingStore::default());
    let node = start_node(&service, store.clone(), 8081).await;
    let registry = node.registry();

    assert_eq!(registry.register("orders", "\"string\"").await.unwrap(), 0);

    store.fail_next.store(true, Ordering::SeqCst);
    assert!(matches!(
        registry.register("orders", "\"int\"").await,
        Err(Error::Store(_))
    ));

    assert_eq!(registry.register("orders", "\"long\"").await.unwrap(), 2);
    assert_eq!(registry.register("orders", "\"int\"").await.unwrap(), 3);
    assert!(matches!(registry.schema_by_id(1), Err(Error::NotFound(_))));
    assert_eq!(registry.versions("orders").unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_same_schema_keeps_its_id() {
    let service = MemoryCoordinationService::new();
    let store = Arc::new(MemorySchemaStore::new());
    let node = start_node(&service, store, 8081).await;
    let registry = node.registry();

    let first = registry.register("orders", "\"string\"").await.unwrap();
    assert_eq!(registry.register("orders", "\"string\"").await.unwrap(), first);
    assert_eq!(registry.register("payments", "\"string\"").await.unwrap(), first);
    assert_eq!(registry.versions("orders").unwrap(), vec![1]);
    assert_eq!(registry.versions("payments").unwrap(), vec![1]);

    let second = registry.register("orders", "\"int\"").await.unwrap();
    assert_eq!(second, first + 1);
    assert_eq!(registry.latest("orders").unwrap().version, 2);
    assert_eq!(
        registry.subjects().unwrap(),
        vec!["orders".to_string(), "payments".to_string()]
    );
}

#[tokio::test]
async fn test_stale_lease_cannot_allocate() {
    let service = MemoryCoordinationService::new();
    let store = Arc::new(MemorySchemaStore::new());
    let node = start_node(&service, store, 8081).await;

    let lease = node.elector().master_lease().unwrap();
    assert_eq!(node.allocator().next_id(&lease).await.unwrap(), 0);

    node.set_master(None).await.unwrap();
    assert!(matches!(
        node.allocator().next_id(&lease).await,
        Err(Error::LostMastership)
    ));

    // a fresh mastership gets a fresh lease and a fresh batch
    let identity = node.identity().clone();
    node.set_master(Some(identity)).await.unwrap();
    let renewed = node.elector().master_lease().unwrap();
    assert!(renewed.epoch() > lease.epoch());
    assert!(matches!(
        node.allocator().next_id(&lease).await,
        Err(Error::LostMastership)
    ));
    assert_eq!(node.allocator().next_id(&renewed).await.unwrap(), 20);
}

#[tokio::test]
async fn test_corrupted_counter_fails_startup() {
    let service = MemoryCoordinationService::new();
    service.write(&counter_path(), "not-a-number");

    let config = NodeConfig {
        operation_timeout_ms: 500,
        ..Default::default()
    };
    let store = Arc::new(MemorySchemaStore::new());
    let res = RegistryNode::start(config, service.connect(), store).await;
    assert!(matches!(res, Err(Error::CorruptedCounter { .. })));

    // the failed candidate gave the leader key back
    assert!(service.read(&CoordinationPaths::default().leader).is_none());
}

#[tokio::test]
async fn test_ids_survive_restart_with_rocksdb() {
    let dir = tempfile::tempdir().unwrap();
    let service = MemoryCoordinationService::new();

    {
        let store = Arc::new(RocksSchemaStore::open(dir.path()).unwrap());
        let node = start_node(&service, store, 8081).await;
        node.registry().register("orders", "\"string\"").await.unwrap();
        node.registry().register("orders", "\"int\"").await.unwrap();
        node.stop().await.unwrap();
    }
    // let the aborted listener task drop its handle on the database
    tokio::time::sleep(Duration::from_millis(50)).await;

    // counter lost, store remembers
    let fresh = MemoryCoordinationService::new();
    let store = Arc::new(RocksSchemaStore::open(dir.path()).unwrap());
    let node = start_node(&fresh, store, 8081).await;
    assert_eq!(node.registry().latest("orders").unwrap().id, 1);
    let id = node.registry().register("orders", "\"long\"").await.unwrap();
    assert_eq!(id, 20);
}

#[tokio::test]
async fn test_counter_reset_mid_batch_then_failover() {
    let service = MemoryCoordinationService::new();
    let store = Arc::new(MemorySchemaStore::new());
    let start = |port| {
        let config = NodeConfig {
            port,
            id_batch_size: 100,
            operation_timeout_ms: 500,
            ..Default::default()
        };
        RegistryNode::start(config, service.connect(), store.clone())
    };

    let a = start(8081).await.unwrap();
    for i in 0..50 {
        a.registry()
            .register("metrics", &format!("{{\"m\": {}}}", i))
            .await
            .unwrap();
    }

    // the live batch is not affected by the reset
    service.write(&counter_path(), "0");
    assert_eq!(a.registry().register("metrics", "{\"m\": 50}").await.unwrap(), 50);

    let b = start(8082).await.unwrap();
    a.stop().await.unwrap();
    assert!(b
        .elector()
        .wait_for(Duration::from_secs(5), |s| s.role() == Role::Master)
        .await);
    assert_eq!(counter(&service).as_deref(), Some("200"));
    assert_eq!(b.registry().register("metrics", "{\"m\": 51}").await.unwrap(), 100);
}
