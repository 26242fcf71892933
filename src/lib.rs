//! # minireg
//!
//! Master election and schema id allocation for a clustered schema registry:
//! - One master among the master-eligible nodes, elected through an
//!   ephemeral leader key in a coordination service
//! - Globally unique, increasing schema ids handed out in batches
//! - Fail-safe demotion when the coordination session is lost
//! - Forced master override for operators
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │          Coordination service                │
//! │   /<ns>/schema_registry_master  (ephemeral)  │
//! │   /<ns>/schema_id_counter       (persistent) │
//! │   /<ns>/members/<host:port>     (ephemeral)  │
//! └───────┬──────────────────┬───────────────────┘
//!         │ watch            │ watch
//!   ┌─────▼────────┐   ┌─────▼────────┐
//!   │ Node A       │   │ Node B       │
//!   │ (master)     │   │ (follower)   │
//!   │  elector     │   │  elector     │
//!   │  allocator   │   │  allocator   │
//!   └──────┬───────┘   └──────┬───────┘
//!          └────── schema store ──────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! minireg serve \
//!   --host registry-1 \
//!   --port 8081 \
//!   --bind 0.0.0.0:8081 \
//!   --data-dir ./registry-data
//! ```
//!
//! ### Register a schema
//! ```bash
//! curl -X POST localhost:8081/subjects/orders/versions \
//!   -H 'content-type: application/json' \
//!   -d '{"schema": "\"string\""}'
//! ```

pub mod common;
pub mod coordination;
pub mod coordinator;
pub mod store;

// Re-export commonly used types
pub use common::{Error, NodeConfig, NodeIdentity, Result};
pub use coordinator::RegistryNode;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
