//! Common utilities and types shared across minireg

pub mod config;
pub mod error;
pub mod identity;
pub mod utils;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use identity::{ClusterView, NodeIdentity};
pub use utils::{fingerprint, retry_with_backoff, validate_subject};
