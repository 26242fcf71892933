//! Coordination service client
//!
//! The coordination service is an external, trusted primitive (a
//! ZooKeeper-style ensemble). This module only defines the capability the
//! registry needs from it:
//! - ephemeral keys tied to a session (leader key, membership)
//! - versioned persistent keys with conditional writes (id counter)
//! - an ordered stream of change notifications
//!
//! `memory` provides an in-process implementation used by tests and by
//! single-host deployments.

pub mod memory;

use crate::common::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;

pub use memory::{MemoryCoordinationService, MemorySession};

pub type SessionId = u64;

/// Value stored under a key, with the version a conditional write must quote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub data: String,
    pub version: u64,
}

/// Precondition for `set` and `delete`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Unconditional
    Any,
    /// Key must not exist yet
    Absent,
    /// Key must exist at exactly this version
    Version(u64),
}

impl std::fmt::Display for WriteCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteCondition::Any => write!(f, "any"),
            WriteCondition::Absent => write!(f, "absent"),
            WriteCondition::Version(v) => write!(f, "version {}", v),
        }
    }
}

/// Change notification delivered to every subscriber, in commit order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    NodeCreated(String),
    NodeDeleted(String),
    DataChanged(String),
    Disconnected(SessionId),
    Reconnected(SessionId),
    SessionExpired(SessionId),
}

/// Session-scoped handle to the coordination service
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    fn session_id(&self) -> SessionId;

    /// Create an ephemeral key owned by this session.
    /// Returns `false` if the key already exists.
    async fn create_ephemeral(&self, path: &str, data: &str) -> Result<bool>;

    async fn get(&self, path: &str) -> Result<Option<Versioned>>;

    /// Write a persistent key, returning its new version
    async fn set(&self, path: &str, data: &str, condition: WriteCondition) -> Result<u64>;

    /// Returns `false` if there was nothing to delete
    async fn delete(&self, path: &str, condition: WriteCondition) -> Result<bool>;

    /// Direct children of `parent`
    async fn children(&self, parent: &str) -> Result<Vec<(String, Versioned)>>;

    fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent>;

    /// End the session; its ephemeral keys disappear
    async fn close(&self) -> Result<()>;
}

/// Bound a coordination call; an elapsed deadline reads as unavailability.
pub async fn with_timeout<T, F>(timeout: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::CoordinationUnavailable(format!(
            "{} timed out after {:?}",
            op, timeout
        ))),
    }
}

/// Well-known keys under the registry namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationPaths {
    pub leader: String,
    pub id_counter: String,
    pub members: String,
}

impl CoordinationPaths {
    pub fn new(namespace: &str) -> Self {
        Self {
            leader: format!("/{}/schema_registry_master", namespace),
            id_counter: format!("/{}/schema_id_counter", namespace),
            members: format!("/{}/members", namespace),
        }
    }

    pub fn member(&self, address: &str) -> String {
        format!("{}/{}", self.members, address)
    }

    pub fn is_member(&self, path: &str) -> bool {
        path.strip_prefix(self.members.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl Default for CoordinationPaths {
    fn default() -> Self {
        Self::new("schema_registry")
    }
}
