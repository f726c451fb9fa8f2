//! Session proxies and the strong/weak retention model.
//!
//! A note holds its session through a [`SessionSlot`]: owning while
//! subscribers exist, a non-owning back-reference while an idle save is
//! pending, cold otherwise. Subscribed connections hold the strong
//! references; the pending save timer holds one more so the session
//! survives until it is written back.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, MutexGuard};

use crate::plugin::NoteSession;
use crate::proto::{ConnId, NodeId};

/// How a note currently holds its session.
#[derive(Default)]
pub enum SessionSlot {
    /// No session in memory. The next subscribe reloads from storage.
    #[default]
    Cold,
    /// Owning reference.
    Resident(Arc<SessionProxy>),
    /// Non-owning back-reference. Cleared implicitly when the last strong
    /// reference drops, which leaves the note effectively cold.
    Weak(Weak<SessionProxy>),
}

impl SessionSlot {
    /// The live proxy, if any.
    pub fn get(&self) -> Option<Arc<SessionProxy>> {
        match self {
            SessionSlot::Cold => None,
            SessionSlot::Resident(proxy) => Some(Arc::clone(proxy)),
            SessionSlot::Weak(weak) => weak.upgrade(),
        }
    }

    pub fn is_cold(&self) -> bool {
        self.get().is_none()
    }

    pub fn is_weak(&self) -> bool {
        matches!(self, SessionSlot::Weak(_))
    }
}

/// Synchronization phase of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPhase {
    /// Reserved by a pending subscription request; content not final yet.
    PreSync,
    /// Receiving initial content from one client (sync-in).
    SyncingFrom {
        source: ConnId,
        received: u32,
        total: u32,
    },
    /// Normal operation: ops are applied and rebroadcast.
    Running,
    /// Torn down; members must not touch it anymore.
    Closed,
}

pub struct ProxyState {
    pub session: Box<dyn NoteSession>,
    /// Connections joined to the subscription group.
    pub members: HashSet<ConnId>,
    pub phase: ProxyPhase,
    /// No session activity since the flag was last set.
    pub idle: bool,
    /// Content changed since the last successful save.
    pub dirty: bool,
}

/// Server-side wrapper owning one session and mediating membership.
pub struct SessionProxy {
    /// Back-index into the node tree; the node is looked up on demand so
    /// the proxy never holds a reference cycle onto its note.
    pub node_id: NodeId,
    /// Subscription group carrying this session's traffic.
    pub group: String,
    state: Mutex<ProxyState>,
}

impl SessionProxy {
    pub fn new(node_id: NodeId, group: String, session: Box<dyn NoteSession>) -> Arc<Self> {
        Self::with_phase(node_id, group, session, ProxyPhase::Running)
    }

    /// A proxy reserved by a subreq, not yet synchronized.
    pub fn pre_sync(node_id: NodeId, group: String, session: Box<dyn NoteSession>) -> Arc<Self> {
        Self::with_phase(node_id, group, session, ProxyPhase::PreSync)
    }

    fn with_phase(
        node_id: NodeId,
        group: String,
        session: Box<dyn NoteSession>,
        phase: ProxyPhase,
    ) -> Arc<Self> {
        Arc::new(SessionProxy {
            node_id,
            group,
            state: Mutex::new(ProxyState {
                session,
                members: HashSet::new(),
                phase,
                idle: true,
                dirty: false,
            }),
        })
    }

    pub async fn lock(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().await
    }

    /// Non-blocking state access for invariant checks.
    pub fn state_try_lock(
        &self,
    ) -> Result<MutexGuard<'_, ProxyState>, tokio::sync::TryLockError> {
        self.state.try_lock()
    }
}
