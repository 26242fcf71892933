//! Registry node: one process of the cluster

use crate::common::{Error, NodeConfig, NodeIdentity, Result};
use crate::coordination::{CoordinationClient, CoordinationPaths};
use crate::coordinator::allocator::IdAllocator;
use crate::coordinator::elector::{ElectorConfig, MasterElector, Role};
use crate::coordinator::http::create_router;
use crate::coordinator::registry::SchemaRegistry;
use crate::store::SchemaStore;
use std::sync::Arc;

pub struct RegistryNode {
    config: NodeConfig,
    elector: Arc<MasterElector>,
    allocator: Arc<IdAllocator>,
    registry: Arc<SchemaRegistry>,
    // forwards registrations that land on a follower
    http: reqwest::Client,
}

impl RegistryNode {
    /// Wire the node together and join the election.
    pub async fn start(
        config: NodeConfig,
        client: Arc<dyn CoordinationClient>,
        store: Arc<dyn SchemaStore>,
    ) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.forward_timeout())
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {}", e)))?;
        let identity = config.identity();
        let paths = CoordinationPaths::new(&config.namespace);

        tracing::info!("Starting registry node: {}", identity);
        tracing::info!("  Master eligible: {}", identity.master_eligible);
        tracing::info!("  Id batch size: {}", config.id_batch_size);
        tracing::info!("  Coordination session: {}", client.session_id());

        let allocator = Arc::new(IdAllocator::new(
            client.clone(),
            store.clone(),
            paths.id_counter.clone(),
            config.id_batch_size,
            config.operation_timeout(),
        ));
        let elector = Arc::new(MasterElector::new(
            identity,
            client,
            allocator.clone(),
            ElectorConfig {
                paths,
                operation_timeout: config.operation_timeout(),
            },
        ));
        if let Err(e) = elector.start().await {
            tracing::error!("Registry node failed to start: {}", e);
            if let Err(stop_err) = elector.stop().await {
                tracing::warn!("Cleanup after failed start: {}", stop_err);
            }
            return Err(e);
        }

        let registry = Arc::new(SchemaRegistry::new(
            elector.clone(),
            allocator.clone(),
            store,
        ));

        Ok(Self {
            config,
            elector,
            allocator,
            registry,
            http,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.elector.identity()
    }

    pub fn is_master(&self) -> bool {
        self.elector.role() == Role::Master
    }

    pub fn master_identity(&self) -> Option<NodeIdentity> {
        self.elector.current_master()
    }

    pub async fn set_master(&self, master: Option<NodeIdentity>) -> Result<()> {
        self.elector.set_master(master).await
    }

    pub fn elector(&self) -> &Arc<MasterElector> {
        &self.elector
    }

    pub fn allocator(&self) -> &Arc<IdAllocator> {
        &self.allocator
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn stop(&self) -> Result<()> {
        self.elector.stop().await
    }

    /// Serve the admin API until ctrl-c, then leave the cluster.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("  Admin API: {}", self.config.bind_addr);
        tracing::info!("✓ Registry node ready ({})", self.elector.role());

        let router = create_router(self.clone());
        let res = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
            })
            .await;
        if let Err(e) = &res {
            tracing::error!("HTTP server error: {}", e);
        }

        self.stop().await?;
        res.map_err(Error::from)
    }
}
