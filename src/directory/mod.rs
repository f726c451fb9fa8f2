//! The directory server core.
//!
//! All directory state lives in one [`Directory`] value driven by a single
//! task: connection tasks forward parsed frames through an event channel
//! and everything — tree mutation, ACL checks, timers, storage round trips
//! — happens inside the event loop, one event at a time. Handlers suspend
//! only at storage awaits, so each runs atomically with respect to every
//! other; there is no lock around directory state.

pub mod announce;
pub mod enforce;
pub mod handlers;
pub mod subreq;
pub mod sync_in;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::account::{AccountId, AccountRegistry};
use crate::acl::{self, PermMask, Sheet, SheetSet, DEFAULT_ACCOUNT};
use crate::proto::{
    ConnId, DirectoryError, Message, NodeId, ProtoError, SessionFrame, PROTOCOL_VERSION,
};
use crate::plugin::PluginRegistry;
use crate::session::{SessionProxy, SessionSlot};
use crate::storage::{NodeStorage, StorageError};
use crate::tree::{NodeKind, NodeTree};
use subreq::Subreq;
use sync_in::SyncIn;

/// Directory-level tunables, extracted from the server config.
#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    /// How long an unsubscribed session stays in memory before it is saved
    /// back and dropped.
    pub idle_save: Duration,
    pub chat_enabled: bool,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        DirectoryOptions {
            idle_save: Duration::from_secs(60),
            chat_enabled: true,
        }
    }
}

/// Everything that can happen to the directory.
pub enum DirectoryEvent {
    /// A transport connection came up. The directory assigns the
    /// connection id and sends the welcome through `tx`.
    Connect {
        tx: mpsc::UnboundedSender<Message>,
        /// Certificate fingerprint presented at connect, if any.
        fingerprint: Option<String>,
        reply: oneshot::Sender<ConnId>,
    },
    /// One parsed frame from a connection.
    Frame {
        conn: ConnId,
        raw: serde_json::Value,
    },
    Disconnect {
        conn: ConnId,
    },
    /// The idle-save timer for a note fired. The timer task keeps the
    /// proxy alive until the directory has had its chance to save.
    SaveTimer {
        node: NodeId,
        generation: u64,
        proxy: Arc<SessionProxy>,
    },
    /// Save every resident session and stop.
    Shutdown { done: oneshot::Sender<()> },
}

/// Per-connection server state.
pub struct ConnState {
    pub tx: mpsc::UnboundedSender<Message>,
    pub account: AccountId,
    pub fingerprint: Option<String>,
    /// Strong references to subscribed sessions, keyed by node id.
    pub subscriptions: HashMap<NodeId, Arc<SessionProxy>>,
    /// Receives add/remove-acl-account notifications.
    pub notifications_enabled: bool,
}

pub struct Directory {
    pub(crate) options: DirectoryOptions,
    pub(crate) plugins: PluginRegistry,
    pub(crate) storage: Option<Arc<dyn NodeStorage>>,
    pub(crate) accounts: AccountRegistry,
    pub(crate) signing_key: Option<SigningKey>,
    pub(crate) tree: NodeTree,
    pub(crate) conns: HashMap<ConnId, ConnState>,
    pub(crate) subreqs: Vec<Subreq>,
    pub(crate) sync_ins: Vec<SyncIn>,
    pub(crate) chat_members: HashSet<ConnId>,
    /// Root ACL as loaded from storage; never altered by capability limits.
    pub(crate) root_acl_configured: SheetSet,
    next_conn_id: ConnId,
    event_tx: mpsc::UnboundedSender<DirectoryEvent>,
}

impl Directory {
    pub fn new(
        options: DirectoryOptions,
        plugins: PluginRegistry,
        storage: Option<Arc<dyn NodeStorage>>,
        accounts: AccountRegistry,
        signing_key: Option<SigningKey>,
    ) -> (
        Self,
        mpsc::UnboundedSender<DirectoryEvent>,
        mpsc::UnboundedReceiver<DirectoryEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let directory = Directory {
            options,
            plugins,
            storage,
            accounts,
            signing_key,
            tree: NodeTree::new(),
            conns: HashMap::new(),
            subreqs: Vec::new(),
            sync_ins: Vec::new(),
            chat_members: HashSet::new(),
            root_acl_configured: SheetSet::new(),
            next_conn_id: 1,
            event_tx: tx.clone(),
        };
        (directory, tx, rx)
    }

    /// Load the root ACL and install its effective form. Run once before
    /// the event loop.
    pub async fn bootstrap(&mut self) -> Result<(), StorageError> {
        let mut configured = match &self.storage {
            Some(storage) => storage.read_acl("/").await?,
            None => SheetSet::new(),
        };
        let removed = {
            let mut known = Vec::new();
            for account in configured.accounts() {
                if self.accounts.is_known(account).await {
                    known.push(account.clone());
                }
            }
            configured.verify(|id| known.iter().any(|k| k == id))
        };
        if !removed.is_empty() {
            warn!(?removed, "dropped root ACL sheets for unknown accounts");
        }

        // The root default sheet must cover every permission bit so the
        // effective lookup always terminates with a full decision.
        let base = Sheet::full(PermMask::DEFAULT_ON);
        let stored = configured.get(DEFAULT_ACCOUNT).unwrap_or_default();
        let mut merged = base.overridden_by(stored);
        merged.mask = PermMask::all();
        configured.insert(DEFAULT_ACCOUNT, merged);

        self.root_acl_configured = configured;
        self.recompute_root_effective();
        info!("directory bootstrapped");
        Ok(())
    }

    /// Permission bits this process cannot honor; they are forced off in
    /// the effective root ACL while writes keep targeting the configured
    /// form.
    pub(crate) fn unfulfillable_bits(&self) -> PermMask {
        let features = self.accounts.features();
        let mut bits = PermMask::empty();
        if self.signing_key.is_none() || !features.add {
            bits |= PermMask::CREATE_ACCOUNT;
        }
        if !features.remove {
            bits |= PermMask::REMOVE_ACCOUNT;
        }
        if !self.options.chat_enabled {
            bits |= PermMask::SUBSCRIBE_CHAT;
        }
        bits
    }

    pub(crate) fn recompute_root_effective(&mut self) {
        let cleared = self.unfulfillable_bits();
        let effective: SheetSet = self
            .root_acl_configured
            .iter()
            .map(|(account, sheet)| {
                (
                    account.clone(),
                    Sheet {
                        mask: sheet.mask,
                        perms: sheet.perms & !cleared,
                    },
                )
            })
            .collect();
        if let Some(root) = self.tree.find_mut(0) {
            root.acl = Some(effective);
        }
    }

    // ─── Event loop ──────────────────────────────────────────────────────

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DirectoryEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                DirectoryEvent::Connect {
                    tx,
                    fingerprint,
                    reply,
                } => {
                    let conn = self.on_connect(tx, fingerprint).await;
                    let _ = reply.send(conn);
                }
                DirectoryEvent::Frame { conn, raw } => {
                    self.handle_frame(conn, raw).await;
                }
                DirectoryEvent::Disconnect { conn } => {
                    self.on_disconnect(conn).await;
                }
                DirectoryEvent::SaveTimer {
                    node,
                    generation,
                    proxy,
                } => {
                    self.on_save_timer(node, generation, proxy).await;
                }
                DirectoryEvent::Shutdown { done } => {
                    self.save_all().await;
                    let _ = done.send(());
                    break;
                }
            }
        }
        info!("directory stopped");
    }

    async fn on_connect(
        &mut self,
        tx: mpsc::UnboundedSender<Message>,
        fingerprint: Option<String>,
    ) -> ConnId {
        let conn = self.next_conn_id;
        self.next_conn_id += 1;

        let account = self
            .accounts
            .login_by_fingerprint(fingerprint.as_deref())
            .await;
        debug!(conn, account = %account, "connection registered");

        self.conns.insert(
            conn,
            ConnState {
                tx,
                account: account.clone(),
                fingerprint,
                subscriptions: HashMap::new(),
                notifications_enabled: false,
            },
        );

        let wire_account = if account != DEFAULT_ACCOUNT {
            self.accounts.lookup(&account).await.map(|a| a.wire())
        } else {
            None
        };
        let acl = self.sheets_for(0, conn).records();
        self.send(
            conn,
            Message::Welcome {
                protocol_version: PROTOCOL_VERSION.to_string(),
                sequence_id: conn,
                account: wire_account,
                acl,
            },
        );
        conn
    }

    async fn on_disconnect(&mut self, conn: ConnId) {
        debug!(conn, "connection closed");

        // Open subreqs die with the connection; their reserved resources
        // are torn down and nothing was ever committed.
        self.subreqs.retain(|s| s.conn() != conn);

        // In-flight sync-ins sourced by this connection fail; the reserved
        // id was never in the tree.
        let failed: Vec<SyncIn> = {
            let (dead, alive): (Vec<SyncIn>, Vec<SyncIn>) = self
                .sync_ins
                .drain(..)
                .partition(|s| s.conn == conn);
            self.sync_ins = alive;
            dead
        };
        for record in failed {
            self.close_proxy(&record.proxy).await;
        }

        self.chat_members.remove(&conn);

        let Some(state) = self.conns.remove(&conn) else {
            return;
        };
        for (node_id, proxy) in &state.subscriptions {
            let empty = {
                let mut proxy_state = proxy.lock().await;
                proxy_state.members.remove(&conn);
                proxy_state.members.is_empty()
            };
            if empty {
                self.start_idle_save(*node_id);
            }
        }
        drop(state);

        for id in self.tree.ids().collect::<Vec<_>>() {
            if let Some(node) = self.tree.find_mut(id) {
                node.acl_queried_by.remove(&conn);
                if let NodeKind::Subdirectory { subscribed, .. } = &mut node.kind {
                    subscribed.remove(&conn);
                }
            }
        }
    }

    // ─── Helpers shared by the handler modules ───────────────────────────

    pub(crate) fn send(&self, conn: ConnId, msg: Message) {
        if let Some(state) = self.conns.get(&conn) {
            // A send failure means the connection task is already gone; the
            // disconnect event will clean up.
            let _ = state.tx.send(msg);
        }
    }

    pub(crate) fn conn_account(&self, conn: ConnId) -> AccountId {
        self.conns
            .get(&conn)
            .map(|c| c.account.clone())
            .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string())
    }

    pub(crate) fn effective(&self, node: NodeId, account: &str) -> PermMask {
        acl::effective_perms(self.tree.acl_chain(node), account)
    }

    /// Authorization check; the error names the first missing bit.
    pub(crate) fn require(
        &self,
        conn: ConnId,
        node: NodeId,
        required: PermMask,
    ) -> Result<(), ProtoError> {
        let account = self.conn_account(conn);
        let granted = self.effective(node, &account);
        let missing = required & !granted;
        match missing.iter().next() {
            None => Ok(()),
            Some(bit) => Err(ProtoError::not_authorized(bit.name().unwrap_or("unknown"))),
        }
    }

    pub(crate) fn node_path(&self, id: NodeId) -> Result<String, ProtoError> {
        self.tree.path(id).map_err(ProtoError::Directory)
    }

    pub(crate) fn join_path(parent_path: &str, name: &str) -> String {
        if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        }
    }

    pub(crate) fn storage_backend(&self) -> Result<Arc<dyn NodeStorage>, ProtoError> {
        self.storage
            .clone()
            .ok_or(ProtoError::Directory(DirectoryError::NoStorage))
    }

    pub(crate) fn map_storage_err(err: StorageError) -> ProtoError {
        match err {
            StorageError::Collision(_) => ProtoError::Directory(DirectoryError::NodeExists),
            StorageError::NotFound(_) => ProtoError::Directory(DirectoryError::NoSuchNode),
            other => {
                warn!(err = %other, "storage operation failed");
                ProtoError::Directory(DirectoryError::NoStorage)
            }
        }
    }

    /// Whether `conn` can currently see `node` in its mirror: the root is
    /// always visible, everything else once the parent is explored.
    pub(crate) fn visible_to(&self, conn: ConnId, node: NodeId) -> bool {
        if node == 0 {
            return true;
        }
        let Some(parent) = self.tree.find(node).and_then(|n| n.parent) else {
            return false;
        };
        match self.tree.find(parent).map(|n| &n.kind) {
            Some(NodeKind::Subdirectory { subscribed, .. }) => subscribed.contains(&conn),
            _ => false,
        }
    }

    /// The ACL subset the server discloses to `conn` for `node`: the full
    /// sheet set after a successful `query-acl`, the default+own pair
    /// otherwise.
    pub(crate) fn sheets_for(&self, node: NodeId, conn: ConnId) -> SheetSet {
        let Some(node_ref) = self.tree.find(node) else {
            return SheetSet::new();
        };
        let Some(set) = node_ref.acl.as_ref() else {
            return SheetSet::new();
        };
        if node_ref.acl_queried_by.contains(&conn) {
            set.clone()
        } else {
            set.visible_subset(&self.conn_account(conn))
        }
    }

    // ─── Session retention ───────────────────────────────────────────────

    /// Downgrade a note's session to weakly-held and arm the idle-save
    /// timer. The spawned task holds the only scheduled strong reference.
    pub(crate) fn start_idle_save(&mut self, node_id: NodeId) {
        let delay = self.options.idle_save;
        let tx = self.event_tx.clone();
        let Some(node) = self.tree.find_mut(node_id) else {
            return;
        };
        let NodeKind::Note {
            slot,
            save_generation,
            ..
        } = &mut node.kind
        else {
            return;
        };
        let Some(proxy) = slot.get() else {
            return;
        };
        *save_generation += 1;
        let generation = *save_generation;
        *slot = SessionSlot::Weak(Arc::downgrade(&proxy));
        debug!(node = node_id, generation, "session weakly held, idle save armed");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(DirectoryEvent::SaveTimer {
                node: node_id,
                generation,
                proxy,
            });
        });
    }

    async fn on_save_timer(&mut self, node_id: NodeId, generation: u64, proxy: Arc<SessionProxy>) {
        let current = match self.tree.find(node_id).map(|n| &n.kind) {
            Some(NodeKind::Note {
                save_generation, ..
            }) => *save_generation,
            _ => return, // node gone; dropping the proxy frees the session
        };
        if current != generation {
            return; // resubscribed or otherwise superseded
        }
        if !proxy.lock().await.members.is_empty() {
            return;
        }

        match self.write_session(node_id, &proxy).await {
            Ok(()) => {
                if let Some(NodeKind::Note { slot, .. }) =
                    self.tree.find_mut(node_id).map(|n| &mut n.kind)
                {
                    *slot = SessionSlot::Cold;
                }
                info!(node = node_id, "idle session saved and dropped");
            }
            Err(err) => {
                // Keep the session resident; shutdown is the final chance
                // to save.
                warn!(node = node_id, err = %err, "idle save failed, session stays resident");
                if let Some(NodeKind::Note { slot, .. }) =
                    self.tree.find_mut(node_id).map(|n| &mut n.kind)
                {
                    *slot = SessionSlot::Resident(proxy);
                }
            }
        }
    }

    /// Serialize a session through its plugin into node storage.
    pub(crate) async fn write_session(
        &self,
        node_id: NodeId,
        proxy: &Arc<SessionProxy>,
    ) -> Result<(), ProtoError> {
        let path = self.node_path(node_id)?;
        let node = self.tree.get(node_id).map_err(ProtoError::Directory)?;
        let plugin_tag = match &node.kind {
            NodeKind::Note { plugin, .. } => plugin.clone(),
            _ => return Err(ProtoError::Directory(DirectoryError::NotANote)),
        };
        let plugin = self
            .plugins
            .get(&plugin_tag)
            .ok_or(ProtoError::Directory(DirectoryError::TypeUnknown(plugin_tag)))?;
        let storage = self.storage_backend()?;
        let mut state = proxy.lock().await;
        storage
            .session_write(&path, &*state.session, &*plugin)
            .await
            .map_err(Self::map_storage_err)?;
        state.dirty = false;
        Ok(())
    }

    /// Shutdown pass: every live session gets one last save.
    async fn save_all(&mut self) {
        let notes: Vec<(NodeId, Arc<SessionProxy>)> = self
            .tree
            .ids()
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|id| match self.tree.find(id).map(|n| &n.kind) {
                Some(NodeKind::Note { slot, .. }) => slot.get().map(|p| (id, p)),
                _ => None,
            })
            .collect();
        for (node_id, proxy) in notes {
            if let Err(err) = self.write_session(node_id, &proxy).await {
                warn!(node = node_id, err = %err, "shutdown save failed");
            }
        }
        info!("shutdown save pass complete");
    }

    /// Tear a proxy down: tell every member the session is gone.
    pub(crate) async fn close_proxy(&self, proxy: &Arc<SessionProxy>) {
        let members: Vec<ConnId> = {
            let mut state = proxy.lock().await;
            state.phase = crate::session::ProxyPhase::Closed;
            state.members.drain().collect()
        };
        for member in members {
            self.send(
                member,
                Message::GroupMessage {
                    group: proxy.group.clone(),
                    frame: SessionFrame::SessionClosed,
                },
            );
        }
    }

    /// Resolve a group name to its live proxy: in-flight sync-ins first,
    /// then resident sessions, then reserved subreq proxies.
    pub(crate) fn find_group_proxy(&self, group: &str) -> Option<Arc<SessionProxy>> {
        let id: NodeId = group.strip_prefix("session/")?.parse().ok()?;
        if let Some(record) = self.sync_ins.iter().find(|s| s.node_id == id) {
            return Some(Arc::clone(&record.proxy));
        }
        if let Some(NodeKind::Note { slot, .. }) = self.tree.find(id).map(|n| &n.kind) {
            if let Some(proxy) = slot.get() {
                return Some(proxy);
            }
        }
        self.subreqs
            .iter()
            .filter(|s| s.node_key() == Some(id))
            .find_map(|s| s.proxy().cloned())
    }

    /// Swap the account storage backend at runtime: announce the listing
    /// diff, re-run certificate login for every connection, and re-verify
    /// every node's ACL against the new account set.
    pub async fn swap_account_storage(
        &mut self,
        backend: Option<Arc<dyn crate::account::storage::AccountStorage>>,
    ) {
        let diff = self.accounts.swap_backend(backend).await;
        for account in &diff.added {
            self.announce_account_added(&account.wire());
        }
        for id in &diff.removed {
            self.announce_account_removed(id, &[]);
        }

        // Capability bits may have changed with the backend's features.
        self.recompute_root_effective();

        // Certificate logins are re-evaluated against the new backend.
        let conns: Vec<(ConnId, Option<String>, AccountId)> = self
            .conns
            .iter()
            .map(|(conn, state)| (*conn, state.fingerprint.clone(), state.account.clone()))
            .collect();
        for (conn, fingerprint, current) in conns {
            let account = self
                .accounts
                .login_by_fingerprint(fingerprint.as_deref())
                .await;
            if account != current {
                self.switch_account(conn, account).await;
            }
        }

        // Sheets referencing accounts the new backend does not know are
        // garbage-collected everywhere.
        let mut unknown: Vec<String> = Vec::new();
        let ids: Vec<NodeId> = self.tree.ids().collect();
        for id in ids {
            let accounts: Vec<String> = match self.tree.find(id).and_then(|n| n.acl.as_ref()) {
                Some(acl) => acl.accounts().cloned().collect(),
                None => continue,
            };
            for account in accounts {
                if !unknown.contains(&account) && !self.accounts.is_known(&account).await {
                    unknown.push(account);
                }
            }
        }
        for account in unknown {
            self.purge_account_sheets(&account).await;
        }
    }

    /// Structural invariants, checked by tests after every scripted step.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.tree.check_invariants()?;

        for subreq in &self.subreqs {
            match subreq {
                Subreq::Session {
                    node, node_removed, ..
                } => {
                    if !node_removed && !self.tree.contains(*node) {
                        return Err(format!("session subreq points at missing node {node}"));
                    }
                }
                Subreq::AddNode { parent, .. } | Subreq::SyncIn { parent, .. } => {
                    if let Some(p) = parent {
                        if !self.tree.contains(*p) {
                            return Err(format!("subreq parent {p} not in tree"));
                        }
                    }
                }
                Subreq::Chat { .. } => {}
            }
        }

        for record in &self.sync_ins {
            if self.tree.contains(record.node_id) {
                return Err(format!(
                    "sync-in reserved id {} already committed",
                    record.node_id
                ));
            }
            if let Some(p) = record.parent {
                if !self.tree.contains(p) {
                    return Err(format!("sync-in parent {p} not in tree"));
                }
            }
        }

        // A connection exploring a node must have every ancestor explored.
        for id in self.tree.ids() {
            let Some(node) = self.tree.find(id) else { continue };
            let NodeKind::Subdirectory { subscribed, .. } = &node.kind else {
                continue;
            };
            let Some(parent) = node.parent else { continue };
            for conn in subscribed {
                let parent_has = match self.tree.find(parent).map(|n| &n.kind) {
                    Some(NodeKind::Subdirectory { subscribed, .. }) => subscribed.contains(conn),
                    _ => false,
                };
                if !parent_has {
                    return Err(format!(
                        "conn {conn} explores {id} but not its parent {parent}"
                    ));
                }
            }
        }

        // A weakly-held session has no subscribers.
        for id in self.tree.ids() {
            if let Some(NodeKind::Note { slot, .. }) = self.tree.find(id).map(|n| &n.kind) {
                if slot.is_weak() {
                    if let Some(proxy) = slot.get() {
                        if let Ok(state) = proxy.state_try_lock() {
                            if !state.members.is_empty() {
                                return Err(format!("weak session on {id} has members"));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop `conn`'s subscription to the session on `node_id`, arming the
    /// idle save when it was the last subscriber.
    pub(crate) async fn unsubscribe_session(&mut self, conn: ConnId, node_id: NodeId) {
        let proxy = match self.conns.get_mut(&conn) {
            Some(state) => state.subscriptions.remove(&node_id),
            None => None,
        };
        let Some(proxy) = proxy else {
            return;
        };
        let empty = {
            let mut state = proxy.lock().await;
            state.members.remove(&conn);
            state.members.is_empty()
        };
        self.send(
            conn,
            Message::GroupMessage {
                group: proxy.group.clone(),
                frame: SessionFrame::SessionClosed,
            },
        );
        drop(proxy);
        if empty {
            self.start_idle_save(node_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::account::storage::{AccountRecord, AccountStorage, FileAccountStorage};
    use crate::storage::FsStorage;
    use crate::text::TextPlugin;

    async fn build(
        data: &tempfile::TempDir,
        accounts: AccountRegistry,
    ) -> (Directory, mpsc::UnboundedReceiver<DirectoryEvent>) {
        let tree_dir = data.path().join("tree");
        std::fs::create_dir_all(&tree_dir).unwrap();
        let mut plugins = PluginRegistry::new();
        plugins.register(Arc::new(TextPlugin));
        let (mut directory, _tx, rx) = Directory::new(
            DirectoryOptions::default(),
            plugins,
            Some(Arc::new(FsStorage::new(&tree_dir))),
            accounts,
            None,
        );
        directory.bootstrap().await.unwrap();
        (directory, rx)
    }

    async fn attach(
        directory: &mut Directory,
        fingerprint: Option<&str>,
    ) -> (ConnId, mpsc::UnboundedReceiver<Message>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = directory
            .on_connect(tx, fingerprint.map(str::to_string))
            .await;
        // Drain the welcome.
        let _ = rx.recv().await;
        (conn, rx)
    }

    fn raw(msg: &Message) -> serde_json::Value {
        serde_json::to_value(msg).unwrap()
    }

    #[tokio::test]
    async fn test_invariants_hold_through_a_subscription_cycle() {
        let data = tempfile::tempdir().unwrap();
        let accounts = AccountRegistry::new(None);
        let (mut dir, _events) = build(&data, accounts).await;
        let (conn, _rx) = attach(&mut dir, None).await;

        dir.handle_frame(
            conn,
            raw(&Message::ExploreNode {
                seq: Some(1),
                id: 0,
            }),
        )
        .await;
        dir.check_invariants().unwrap();

        dir.handle_frame(
            conn,
            raw(&Message::AddNode {
                seq: Some(2),
                id: None,
                parent: 0,
                node_type: "text".into(),
                name: "n.txt".into(),
                acl: vec![],
                subscribe: None,
                sync_in: None,
            }),
        )
        .await;
        dir.check_invariants().unwrap();
        let node = dir
            .tree
            .find_child_by_name(0, "n.txt")
            .unwrap()
            .expect("note inserted");

        dir.handle_frame(
            conn,
            raw(&Message::SubscribeSession {
                seq: Some(3),
                id: node,
                group: None,
                method: None,
            }),
        )
        .await;
        assert_eq!(dir.subreqs.len(), 1);
        dir.check_invariants().unwrap();

        dir.handle_frame(conn, raw(&Message::SubscribeAck { id: Some(node) }))
            .await;
        assert!(dir.subreqs.is_empty());
        dir.check_invariants().unwrap();
        match dir.tree.find(node).map(|n| &n.kind) {
            Some(NodeKind::Note { slot, .. }) => assert!(!slot.is_cold()),
            other => panic!("note lost its kind: {:?}", other.is_some()),
        }

        dir.handle_frame(
            conn,
            raw(&Message::RemoveNode {
                seq: Some(4),
                id: node,
            }),
        )
        .await;
        assert!(!dir.tree.contains(node));
        dir.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_swap_account_storage_relogs_and_purges() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let backend_a: Arc<dyn AccountStorage> = Arc::new(FileAccountStorage::new(
            dir_a.path().join("accounts.json"),
        ));
        let backend_b: Arc<dyn AccountStorage> = Arc::new(FileAccountStorage::new(
            dir_b.path().join("accounts.json"),
        ));
        backend_a
            .add(&AccountRecord {
                id: "alice-id".into(),
                name: Some("alice".into()),
                fingerprints: vec!["fp".into()],
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let data = tempfile::tempdir().unwrap();
        let accounts = AccountRegistry::new(Some(backend_a));
        let (mut dir, _events) = build(&data, accounts).await;

        let (conn, mut rx) = attach(&mut dir, Some("fp")).await;
        assert_eq!(dir.conns[&conn].account, "alice-id");

        // Give alice a sheet on the root so the swap has something to
        // garbage-collect.
        dir.root_acl_configured.insert(
            "alice-id",
            Sheet::new(PermMask::SET_ACL, PermMask::SET_ACL),
        );
        dir.recompute_root_effective();

        dir.swap_account_storage(Some(backend_b)).await;

        // The connection fell back to default and was told so.
        assert_eq!(dir.conns[&conn].account, DEFAULT_ACCOUNT);
        let mut saw_change = false;
        while let Ok(msg) = rx.try_recv() {
            if let Message::ChangeAclAccount { account, .. } = msg {
                assert_eq!(account.id, DEFAULT_ACCOUNT);
                saw_change = true;
            }
        }
        assert!(saw_change);

        // The stale sheet is gone from the root ACL, configured and
        // effective alike.
        assert!(dir.root_acl_configured.get("alice-id").is_none());
        let effective = dir.tree.find(0).unwrap().acl.as_ref().unwrap();
        assert!(effective.get("alice-id").is_none());
        dir.check_invariants().unwrap();
    }
}
