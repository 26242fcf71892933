//! Configuration for minireg nodes

use crate::common::{Error, NodeIdentity, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (`MINIREG_PORT=8082`, ...)
pub const ENV_PREFIX: &str = "MINIREG";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Advertised host of this node
    pub host: String,

    /// Advertised port of this node
    pub port: u16,

    /// Whether this node may ever become master
    pub master_eligible: bool,

    /// Number of ids reserved per counter write
    pub id_batch_size: i64,

    /// Upper bound for any single coordination-service call
    pub operation_timeout_ms: u64,

    /// Deadline for forwarding a registration to the master
    pub forward_timeout_ms: u64,

    /// Root under which coordination keys live
    pub namespace: String,

    /// Bind address for the admin HTTP API
    pub bind_addr: SocketAddr,

    /// RocksDB directory; in-memory store when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Logging level
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8081,
            master_eligible: true,
            id_batch_size: 20,
            operation_timeout_ms: 2000,
            forward_timeout_ms: 10_000,
            namespace: "schema_registry".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            data_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load from an optional TOML file, then `MINIREG_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;
        let config: NodeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfig("host cannot be empty".into()));
        }
        if self.id_batch_size < 1 {
            return Err(Error::InvalidConfig(format!(
                "id_batch_size must be positive, got {}",
                self.id_batch_size
            )));
        }
        if self.operation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "operation_timeout_ms must be positive".into(),
            ));
        }
        if self.forward_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "forward_timeout_ms must be positive".into(),
            ));
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "invalid namespace: {:?}",
                self.namespace
            )));
        }
        Ok(())
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.host.clone(), self.port, self.master_eligible)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}
