//! In-process coordination service
//!
//! Behaves like a single-ensemble ZooKeeper: keys carry a data version,
//! ephemeral keys belong to the session that created them, and every
//! mutation is broadcast to all sessions in commit order. Operational hooks
//! (`expire_session`, `partition`, `heal`, `write`) simulate crashes,
//! network partitions and external tampering.

use super::{CoordinationClient, CoordinationEvent, SessionId, Versioned, WriteCondition};
use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    data: String,
    version: u64,
    owner: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Connected,
    Partitioned,
    Expired,
    Closed,
}

#[derive(Default)]
struct EnsembleState {
    entries: BTreeMap<String, Entry>,
    sessions: HashMap<SessionId, SessionStatus>,
}

/// The shared service every node connects to
pub struct MemoryCoordinationService {
    state: Mutex<EnsembleState>,
    events: broadcast::Sender<CoordinationEvent>,
    next_session: AtomicU64,
}

impl MemoryCoordinationService {
    pub fn new() -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(EnsembleState::default()),
            events,
            next_session: AtomicU64::new(1),
        })
    }

    /// Open a new session
    pub fn connect(self: &Arc<Self>) -> Arc<MemorySession> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.lock().sessions.insert(id, SessionStatus::Connected);
        tracing::debug!("Coordination session {} opened", id);
        Arc::new(MemorySession {
            id,
            service: self.clone(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: CoordinationEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Drop every ephemeral key owned by `id`. Caller holds the lock.
    fn drop_ephemerals(&self, state: &mut EnsembleState, id: SessionId) {
        let owned: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.owner == Some(id))
            .map(|(p, _)| p.clone())
            .collect();
        for path in owned {
            state.entries.remove(&path);
            self.emit(CoordinationEvent::NodeDeleted(path));
        }
    }

    /// Simulate a crash: the session's ephemeral keys vanish and the
    /// session is notified (if it is still listening).
    pub fn expire_session(&self, id: SessionId) {
        let mut state = self.lock();
        match state.sessions.get(&id) {
            Some(SessionStatus::Connected) | Some(SessionStatus::Partitioned) => {}
            _ => return,
        }
        state.sessions.insert(id, SessionStatus::Expired);
        self.drop_ephemerals(&mut state, id);
        self.emit(CoordinationEvent::SessionExpired(id));
        tracing::info!("Coordination session {} expired", id);
    }

    /// Cut a session off: its calls hang until healed and it is told it
    /// is disconnected. Ephemeral keys survive until `expire_session`.
    pub fn partition(&self, id: SessionId) {
        let mut state = self.lock();
        if state.sessions.get(&id) == Some(&SessionStatus::Connected) {
            state.sessions.insert(id, SessionStatus::Partitioned);
            self.emit(CoordinationEvent::Disconnected(id));
            tracing::info!("Coordination session {} partitioned", id);
        }
    }

    pub fn heal(&self, id: SessionId) {
        let mut state = self.lock();
        if state.sessions.get(&id) == Some(&SessionStatus::Partitioned) {
            state.sessions.insert(id, SessionStatus::Connected);
            self.emit(CoordinationEvent::Reconnected(id));
            tracing::info!("Coordination session {} reconnected", id);
        }
    }

    /// Read a key outside of any session
    pub fn read(&self, path: &str) -> Option<String> {
        self.lock().entries.get(path).map(|e| e.data.clone())
    }

    /// Overwrite a persistent key outside of any session (operator action)
    pub fn write(&self, path: &str, data: &str) {
        let mut state = self.lock();
        let event = match state.entries.get_mut(path) {
            Some(entry) => {
                entry.data = data.to_string();
                entry.version += 1;
                CoordinationEvent::DataChanged(path.to_string())
            }
            None => {
                state.entries.insert(
                    path.to_string(),
                    Entry {
                        data: data.to_string(),
                        version: 0,
                        owner: None,
                    },
                );
                CoordinationEvent::NodeCreated(path.to_string())
            }
        };
        self.emit(event);
    }

    /// Current owner session of an ephemeral key
    pub fn owner(&self, path: &str) -> Option<SessionId> {
        self.lock().entries.get(path).and_then(|e| e.owner)
    }
}

/// One node's session
pub struct MemorySession {
    id: SessionId,
    service: Arc<MemoryCoordinationService>,
}

impl MemorySession {
    /// Gate every call on the session status. Partitioned sessions hang so
    /// that the caller's deadline decides the outcome.
    async fn ready(&self) -> Result<()> {
        let status = self
            .service
            .lock()
            .sessions
            .get(&self.id)
            .copied()
            .unwrap_or(SessionStatus::Closed);
        match status {
            SessionStatus::Connected => Ok(()),
            SessionStatus::Partitioned => std::future::pending().await,
            SessionStatus::Expired => Err(Error::CoordinationUnavailable(format!(
                "session {} expired",
                self.id
            ))),
            SessionStatus::Closed => Err(Error::CoordinationUnavailable(format!(
                "session {} closed",
                self.id
            ))),
        }
    }
}

fn check_condition(path: &str, entry: Option<&Entry>, condition: WriteCondition) -> Result<()> {
    let ok = match (condition, entry) {
        (WriteCondition::Any, _) => true,
        (WriteCondition::Absent, None) => true,
        (WriteCondition::Version(v), Some(e)) => e.version == v,
        _ => false,
    };
    if ok {
        return Ok(());
    }
    Err(Error::VersionConflict {
        path: path.to_string(),
        expected: condition.to_string(),
        actual: entry.map_or("absent".to_string(), |e| format!("version {}", e.version)),
    })
}

#[async_trait]
impl CoordinationClient for MemorySession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn create_ephemeral(&self, path: &str, data: &str) -> Result<bool> {
        self.ready().await?;
        let mut state = self.service.lock();
        if state.entries.contains_key(path) {
            return Ok(false);
        }
        state.entries.insert(
            path.to_string(),
            Entry {
                data: data.to_string(),
                version: 0,
                owner: Some(self.id),
            },
        );
        self.service.emit(CoordinationEvent::NodeCreated(path.to_string()));
        Ok(true)
    }

    async fn get(&self, path: &str) -> Result<Option<Versioned>> {
        self.ready().await?;
        Ok(self.service.lock().entries.get(path).map(|e| Versioned {
            data: e.data.clone(),
            version: e.version,
        }))
    }

    async fn set(&self, path: &str, data: &str, condition: WriteCondition) -> Result<u64> {
        self.ready().await?;
        let mut state = self.service.lock();
        check_condition(path, state.entries.get(path), condition)?;
        let (version, event) = match state.entries.get_mut(path) {
            Some(entry) => {
                entry.data = data.to_string();
                entry.version += 1;
                (
                    entry.version,
                    CoordinationEvent::DataChanged(path.to_string()),
                )
            }
            None => {
                state.entries.insert(
                    path.to_string(),
                    Entry {
                        data: data.to_string(),
                        version: 0,
                        owner: None,
                    },
                );
                (0, CoordinationEvent::NodeCreated(path.to_string()))
            }
        };
        self.service.emit(event);
        Ok(version)
    }

    async fn delete(&self, path: &str, condition: WriteCondition) -> Result<bool> {
        self.ready().await?;
        let mut state = self.service.lock();
        if !state.entries.contains_key(path) {
            return Ok(false);
        }
        check_condition(path, state.entries.get(path), condition)?;
        state.entries.remove(path);
        self.service.emit(CoordinationEvent::NodeDeleted(path.to_string()));
        Ok(true)
    }

    async fn children(&self, parent: &str) -> Result<Vec<(String, Versioned)>> {
        self.ready().await?;
        let prefix = format!("{}/", parent);
        Ok(self
            .service
            .lock()
            .entries
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, e)| {
                (
                    p.clone(),
                    Versioned {
                        data: e.data.clone(),
                        version: e.version,
                    },
                )
            })
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.service.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.service.lock();
        match state.sessions.get(&self.id) {
            Some(SessionStatus::Closed) | None => return Ok(()),
            _ => {}
        }
        state.sessions.insert(self.id, SessionStatus::Closed);
        self.service.drop_ephemerals(&mut state, self.id);
        tracing::debug!("Coordination session {} closed", self.id);
        Ok(())
    }
}
