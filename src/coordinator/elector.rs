//! Master election engine
//!
//! Every node runs one `MasterElector`. Eligible nodes contend for an
//! ephemeral leader key; whoever creates it is master until its session
//! ends or it releases the key. Ineligible nodes never contend and stay
//! followers for their whole lifetime.
//!
//! The locally observed state lives in a `watch` channel: readers borrow
//! it without blocking, and all writes happen under `transition`, either
//! from the background listener reacting to coordination events or from
//! the explicit operations (`start`, `set_master`, `resign`, `stop`).
//!
//! Mastership is fail-safe: losing the connection to the coordination
//! service demotes the node at once, before anyone else can win.

use crate::common::{retry_with_backoff, ClusterView, Error, NodeIdentity, Result};
use crate::coordination::{
    with_timeout, CoordinationClient, CoordinationEvent, CoordinationPaths, WriteCondition,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const RESYNC_ATTEMPTS: usize = 3;
const RESYNC_BACKOFF: Duration = Duration::from_millis(50);

/// Role of this node as seen by the write path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// Lifecycle of the election state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Contending,
    Master,
    Follower,
    Stopped,
}

/// Snapshot of what this node currently believes
#[derive(Debug, Clone)]
pub struct ElectionState {
    pub phase: Phase,
    pub master: Option<NodeIdentity>,
    /// Epoch of the current (or last) local mastership
    pub epoch: u64,
    pub members: ClusterView,
}

impl ElectionState {
    pub fn role(&self) -> Role {
        match self.phase {
            Phase::Master => Role::Master,
            _ => Role::Follower,
        }
    }
}

/// Proof that this node was master at some epoch.
///
/// Writes carry the lease from admission to id allocation; an allocation
/// under a lease from an earlier epoch is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterLease {
    epoch: u64,
}

impl MasterLease {
    pub(crate) fn new(epoch: u64) -> Self {
        Self { epoch }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Hooks run when this node gains or loses mastership.
///
/// `on_become_master` runs before the node reports itself as master; if it
/// fails, the node gives the leader key back.
#[async_trait]
pub trait MastershipListener: Send + Sync {
    async fn on_become_master(&self, epoch: u64) -> Result<()>;
    fn on_lose_master(&self);
}

#[derive(Debug, Clone)]
pub struct ElectorConfig {
    pub paths: CoordinationPaths,
    pub operation_timeout: Duration,
}

pub struct MasterElector {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    identity: NodeIdentity,
    client: Arc<dyn CoordinationClient>,
    listener: Arc<dyn MastershipListener>,
    paths: CoordinationPaths,
    timeout: Duration,
    state: watch::Sender<ElectionState>,
    transition: tokio::sync::Mutex<()>,
    connected: AtomicBool,
    epochs: AtomicU64,
}

impl MasterElector {
    pub fn new(
        identity: NodeIdentity,
        client: Arc<dyn CoordinationClient>,
        listener: Arc<dyn MastershipListener>,
        config: ElectorConfig,
    ) -> Self {
        let (state, _rx) = watch::channel(ElectionState {
            phase: Phase::Uninitialized,
            master: None,
            epoch: 0,
            members: ClusterView::default(),
        });
        Self {
            inner: Arc::new(Inner {
                identity,
                client,
                listener,
                paths: config.paths,
                timeout: config.operation_timeout,
                state,
                transition: tokio::sync::Mutex::new(()),
                connected: AtomicBool::new(true),
                epochs: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    /// Register as a member, contend if eligible, and start listening.
    ///
    /// Errors here are startup failures (e.g. a corrupted id counter).
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        if inner.phase() != Phase::Uninitialized {
            return Err(Error::Internal(format!(
                "elector for {} already started",
                inner.identity
            )));
        }
        inner.publish(|s| s.phase = Phase::Contending);

        // subscribe first so nothing between the initial read and the
        // listener start goes unseen
        let events = inner.client.subscribe();
        inner.register_member().await?;
        inner.refresh_members().await?;
        inner.elect().await?;

        let handle = tokio::spawn(run_listener(inner.clone(), events));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        tracing::info!(
            "{} started as {} (eligible: {})",
            inner.identity,
            self.role(),
            inner.identity.master_eligible
        );
        Ok(())
    }

    /// Release mastership (if held), leave the cluster and close the session.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        let phase = inner.phase();
        if phase == Phase::Stopped {
            return Ok(());
        }

        if phase == Phase::Master {
            inner.listener.on_lose_master();
        }
        inner.publish(|s| {
            s.phase = Phase::Stopped;
            s.master = None;
        });
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        if phase == Phase::Master {
            // hand off right away instead of waiting for session expiry
            inner.release_leader_key().await;
        }
        inner.client.close().await?;
        tracing::info!("{} stopped", inner.identity);
        Ok(())
    }

    /// Operational override of the observed master.
    ///
    /// `Some(self)` makes this node master locally (reserving a fresh id
    /// batch), `Some(other)` makes it a follower of `other`, `None` leaves it
    /// without a master. The override holds until the next change of the
    /// leader key. Naming an ineligible node fails and changes nothing.
    pub async fn set_master(&self, master: Option<NodeIdentity>) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        if inner.phase() == Phase::Stopped {
            return Err(Error::NodeStopped);
        }

        match master {
            Some(m) if m == inner.identity => {
                if !inner.identity.master_eligible {
                    return Err(Error::IneligibleForMaster(m.address()));
                }
                tracing::warn!("{} forced to master", inner.identity);
                if inner.phase() == Phase::Master {
                    return Ok(());
                }
                inner.assume_mastership().await
            }
            Some(m) if !m.master_eligible => Err(Error::IneligibleForMaster(m.address())),
            other => {
                tracing::warn!(
                    "{} forced to follow {}",
                    inner.identity,
                    other.as_ref().map_or("nobody".to_string(), |m| m.address())
                );
                inner.demote(other);
                Ok(())
            }
        }
    }

    /// Step down after the allocator lost track of the counter under
    /// `lease`, and give the leader key back so a new election runs.
    /// No-op if the lease is already stale.
    pub async fn resign(&self, lease: &MasterLease) {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        let (phase, epoch) = {
            let state = inner.state.borrow();
            (state.phase, state.epoch)
        };
        if phase != Phase::Master || epoch != lease.epoch {
            return;
        }
        tracing::warn!("{} resigning mastership (epoch {})", inner.identity, epoch);
        inner.demote(None);
        inner.release_leader_key().await;
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    pub fn role(&self) -> Role {
        self.inner.state.borrow().role()
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase()
    }

    pub fn current_master(&self) -> Option<NodeIdentity> {
        self.inner.state.borrow().master.clone()
    }

    pub fn members(&self) -> ClusterView {
        self.inner.state.borrow().members.clone()
    }

    pub fn state(&self) -> ElectionState {
        self.inner.state.borrow().clone()
    }

    /// Fencing check for the write path
    pub fn master_lease(&self) -> Result<MasterLease> {
        let state = self.inner.state.borrow();
        match state.phase {
            Phase::Master => Ok(MasterLease { epoch: state.epoch }),
            Phase::Stopped => Err(Error::NodeStopped),
            _ => Err(Error::NotMaster(
                state
                    .master
                    .as_ref()
                    .map_or("none".to_string(), |m| m.address()),
            )),
        }
    }

    pub fn is_lease_valid(&self, lease: &MasterLease) -> bool {
        let state = self.inner.state.borrow();
        state.phase == Phase::Master && state.epoch == lease.epoch
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ElectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the local state satisfies `predicate`
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&ElectionState) -> bool,
    {
        let mut rx = self.inner.state.subscribe();
        let satisfied = match tokio::time::timeout(timeout, rx.wait_for(|s| predicate(s))).await {
            Ok(res) => res.is_ok(),
            Err(_) => false,
        };
        satisfied
    }
}

impl Drop for MasterElector {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

// All `Inner` methods below expect the caller to hold `transition`.
impl Inner {
    fn publish(&self, f: impl FnOnce(&mut ElectionState)) {
        self.state.send_modify(f);
    }

    fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    async fn register_member(&self) -> Result<()> {
        let path = self.paths.member(&self.identity.address());
        let data = self.identity.encode()?;
        let created = with_timeout(
            self.timeout,
            "register member",
            self.client.create_ephemeral(&path, &data),
        )
        .await?;
        if !created {
            tracing::warn!("Member key {} already present", path);
        }
        Ok(())
    }

    async fn refresh_members(&self) -> Result<()> {
        let children = with_timeout(
            self.timeout,
            "list members",
            self.client.children(&self.paths.members),
        )
        .await?;
        let view = ClusterView::new(children.into_iter().filter_map(|(path, value)| {
            match NodeIdentity::decode(&value.data) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable member {}: {}", path, e);
                    None
                }
            }
        }));
        tracing::debug!("{} sees {} live members", self.identity, view.len());
        self.publish(|s| s.members = view);
        Ok(())
    }

    async fn observed_leader(&self) -> Result<Option<NodeIdentity>> {
        let current = with_timeout(
            self.timeout,
            "read leader key",
            self.client.get(&self.paths.leader),
        )
        .await?;
        Ok(current.and_then(|v| match NodeIdentity::decode(&v.data) {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::warn!("Unreadable leader key {:?}: {}", v.data, e);
                None
            }
        }))
    }

    /// Contend for the leader key if eligible, then settle on a role.
    async fn elect(&self) -> Result<()> {
        if self.phase() == Phase::Stopped {
            return Ok(());
        }
        if self.identity.master_eligible {
            let data = self.identity.encode()?;
            let acquired = with_timeout(
                self.timeout,
                "acquire leader key",
                self.client.create_ephemeral(&self.paths.leader, &data),
            )
            .await?;
            if acquired {
                return self.assume_mastership().await;
            }
        }
        self.refresh_master().await
    }

    async fn refresh_master(&self) -> Result<()> {
        match self.observed_leader().await? {
            Some(leader) if leader == self.identity && self.identity.master_eligible => {
                // our own key, e.g. after reconnecting within the session
                if self.phase() != Phase::Master {
                    return self.assume_mastership().await;
                }
                Ok(())
            }
            other => {
                self.demote(other);
                Ok(())
            }
        }
    }

    async fn assume_mastership(&self) -> Result<()> {
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = self.listener.on_become_master(epoch).await {
            tracing::error!(
                "{} won mastership but could not prepare for writes: {}",
                self.identity,
                e
            );
            self.demote(None);
            self.release_leader_key().await;
            return Err(e);
        }
        let me = self.identity.clone();
        self.publish(|s| {
            s.phase = Phase::Master;
            s.master = Some(me);
            s.epoch = epoch;
        });
        tracing::info!("{} is now master (epoch {})", self.identity, epoch);
        Ok(())
    }

    fn demote(&self, master: Option<NodeIdentity>) {
        let phase = self.phase();
        if phase == Phase::Stopped {
            return;
        }
        if phase == Phase::Master {
            self.listener.on_lose_master();
            tracing::warn!("{} is no longer master", self.identity);
        }
        self.publish(|s| {
            s.phase = Phase::Follower;
            s.master = master;
        });
    }

    /// Delete the leader key if (and only if) it still names this node
    async fn release_leader_key(&self) {
        let res: Result<()> = async {
            let current = with_timeout(
                self.timeout,
                "read leader key",
                self.client.get(&self.paths.leader),
            )
            .await?;
            if let Some(current) = current {
                let holder = NodeIdentity::decode(&current.data).ok();
                if holder.as_ref() == Some(&self.identity) {
                    with_timeout(
                        self.timeout,
                        "release leader key",
                        self.client
                            .delete(&self.paths.leader, WriteCondition::Version(current.version)),
                    )
                    .await?;
                    tracing::info!("{} released the leader key", self.identity);
                }
            }
            Ok(())
        }
        .await;
        if let Err(e) = res {
            tracing::warn!("{} could not release the leader key: {}", self.identity, e);
        }
    }

    async fn resync(&self) -> Result<()> {
        self.refresh_members().await?;
        self.elect().await
    }

    async fn handle(&self, event: CoordinationEvent) -> Result<()> {
        let session = self.client.session_id();
        match event {
            CoordinationEvent::Disconnected(id) if id == session => {
                self.connected.store(false, Ordering::SeqCst);
                tracing::warn!("{} disconnected from coordination service", self.identity);
                self.demote(None);
                Ok(())
            }
            CoordinationEvent::SessionExpired(id) if id == session => {
                self.connected.store(false, Ordering::SeqCst);
                tracing::error!("{} coordination session expired", self.identity);
                self.demote(None);
                Ok(())
            }
            CoordinationEvent::Reconnected(id) if id == session => {
                self.connected.store(true, Ordering::SeqCst);
                tracing::info!("{} reconnected, resyncing", self.identity);
                retry_with_backoff(move || self.resync(), RESYNC_ATTEMPTS, RESYNC_BACKOFF).await
            }
            _ if !self.connected.load(Ordering::SeqCst) => Ok(()),
            CoordinationEvent::NodeDeleted(path) if path == self.paths.leader => {
                tracing::info!("{} observed master departure", self.identity);
                self.demote(None);
                self.elect().await
            }
            CoordinationEvent::NodeCreated(path) | CoordinationEvent::DataChanged(path)
                if path == self.paths.leader =>
            {
                self.refresh_master().await
            }
            CoordinationEvent::NodeCreated(path) | CoordinationEvent::NodeDeleted(path)
                if self.paths.is_member(&path) =>
            {
                self.refresh_members().await
            }
            _ => Ok(()),
        }
    }
}

/// Background listener: the only place coordination events turn into
/// state changes.
async fn run_listener(inner: Arc<Inner>, mut events: broadcast::Receiver<CoordinationEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("{} missed {} events, resyncing", inner.identity, missed);
                None
            }
            Err(RecvError::Closed) => break,
        };

        let _guard = inner.transition.lock().await;
        if inner.phase() == Phase::Stopped {
            break;
        }
        let res = match event {
            Some(event) => inner.handle(event).await,
            None if inner.connected.load(Ordering::SeqCst) => inner.resync().await,
            None => Ok(()),
        };
        if let Err(e) = res {
            tracing::warn!("{} election update failed: {}", inner.identity, e);
            if matches!(e, Error::CoordinationUnavailable(_)) {
                inner.demote(None);
            }
        }
    }
}
