//! The directory request router and its handlers.
//!
//! Dispatch is flat on the element name. Every reply, success or failure,
//! echoes the client's `seq`; authorization failures carry the name of the
//! missing permission bit. Errors inside a handler fail the originating
//! request and are otherwise non-fatal to the connection.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::account::cert::{self, CertificateRequest};
use crate::account::storage::AccountRecord;
use crate::account::AccountRegistry;
use crate::acl::{PermMask, SheetRecord, SheetSet, DEFAULT_ACCOUNT};
use crate::proto::{
    request_tag, session_group_name, ConnId, DirectoryError, Message, NodeId, ProtoError,
    RequestError, Seq, SessionFrame, CHAT_GROUP, METHOD_CENTRAL,
};
use crate::session::{ProxyPhase, SessionProxy, SessionSlot};
use crate::storage::EntryKind;
use crate::tree::{self, NodeKind, SUBDIRECTORY_TYPE};

use super::subreq::Subreq;
use super::sync_in::SyncIn;
use super::Directory;

impl Directory {
    /// Parse and dispatch one inbound frame.
    pub(crate) async fn handle_frame(&mut self, conn: ConnId, raw: Value) {
        let msg: Message = match serde_json::from_value(raw.clone()) {
            Ok(msg) => msg,
            Err(_) => {
                let element = raw
                    .get("element")
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string();
                let seq = raw.get("seq").and_then(Value::as_u64).map(|s| s as Seq);
                let err = ProtoError::Directory(DirectoryError::UnexpectedMessage(element));
                self.send(conn, Message::failure(&err, seq));
                return;
            }
        };
        let seq = msg.seq();
        debug!(request = %request_tag(conn, seq), element = msg.element(), "dispatch");
        if let Err(err) = self.dispatch(conn, msg).await {
            self.send(conn, Message::failure(&err, seq));
        }
    }

    async fn dispatch(&mut self, conn: ConnId, msg: Message) -> Result<(), ProtoError> {
        match msg {
            Message::ExploreNode { seq, id } => self.handle_explore(conn, seq, id).await,
            Message::AddNode {
                seq,
                parent,
                node_type,
                name,
                acl,
                subscribe,
                sync_in,
                ..
            } => {
                self.handle_add_node(
                    conn,
                    seq,
                    parent,
                    node_type,
                    name,
                    acl,
                    subscribe.is_some(),
                    sync_in.is_some(),
                )
                .await
            }
            Message::RemoveNode { seq, id } => self.handle_remove_node(conn, seq, id).await,
            Message::SubscribeSession { seq, id, .. } => {
                self.handle_subscribe_session(conn, seq, id).await
            }
            Message::SubscribeChat { seq, .. } => self.handle_subscribe_chat(conn, seq),
            Message::SubscribeAck { id } => self.handle_subscribe_ack(conn, id).await,
            Message::SubscribeNack { id } => self.handle_subscribe_nack(conn, id),
            Message::SaveSession { seq, id } => self.handle_save_session(conn, seq, id).await,
            Message::QueryAcl { seq, id } => self.handle_query_acl(conn, seq, id),
            Message::SetAcl { seq, id, sheets } => {
                self.handle_set_acl(conn, seq, id, sheets).await
            }
            Message::QueryAclAccountList { seq } => {
                self.handle_query_account_list(conn, seq).await
            }
            Message::LookupAclAccounts {
                seq, ids, names, ..
            } => self.handle_lookup_accounts(conn, seq, ids, names).await,
            Message::CreateAclAccount { seq, crq, .. } => {
                self.handle_create_account(conn, seq, crq).await
            }
            Message::RemoveAclAccount { seq, id } => {
                self.handle_remove_account(conn, seq, id).await
            }
            Message::GroupMessage { group, frame } => {
                self.handle_group(conn, group, frame).await;
                Ok(())
            }
            other => Err(ProtoError::Directory(DirectoryError::UnexpectedMessage(
                other.element().to_string(),
            ))),
        }
    }

    // ─── Explore ─────────────────────────────────────────────────────────

    async fn handle_explore(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        id: NodeId,
    ) -> Result<(), ProtoError> {
        let (is_subdir, parent, explored_by_conn) = {
            let node = self.tree.get(id).map_err(ProtoError::Directory)?;
            let explored_by_conn = matches!(
                &node.kind,
                NodeKind::Subdirectory { subscribed, .. } if subscribed.contains(&conn)
            );
            (node.is_subdirectory(), node.parent, explored_by_conn)
        };
        if !is_subdir {
            return Err(ProtoError::Directory(DirectoryError::NotASubdirectory));
        }
        // Exploration starts at the root and works downward; a child can
        // only be explored once its parent is.
        if let Some(parent) = parent {
            if !self.parent_explorers(parent).contains(&conn) {
                return Err(ProtoError::Directory(DirectoryError::NotInitiated));
            }
        }
        self.require(conn, id, PermMask::EXPLORE_NODE)?;
        if explored_by_conn {
            return Err(ProtoError::Directory(DirectoryError::AlreadyExplored));
        }

        self.ensure_explored(id).await?;

        let children = self.tree.children(id);
        self.send(
            conn,
            Message::ExploreBegin {
                seq,
                total: children.len() as u32,
            },
        );
        for child in &children {
            if let Some(msg) = self.node_add_message(*child, conn, seq) {
                self.send(conn, msg);
            }
        }
        self.send(conn, Message::ExploreEnd { seq });

        if let Some(NodeKind::Subdirectory { subscribed, .. }) =
            self.tree.find_mut(id).map(|n| &mut n.kind)
        {
            subscribed.insert(conn);
        }
        Ok(())
    }

    /// Enumerate a subdirectory from the storage backend, once, and
    /// materialize its children into the tree.
    pub(crate) async fn ensure_explored(&mut self, id: NodeId) -> Result<(), ProtoError> {
        let already = match self.tree.get(id).map_err(ProtoError::Directory)?.kind {
            NodeKind::Subdirectory { explored, .. } => explored,
            _ => return Err(ProtoError::Directory(DirectoryError::NotASubdirectory)),
        };
        if already {
            return Ok(());
        }

        let path = self.node_path(id)?;
        if let Some(storage) = self.storage.clone() {
            let entries = storage
                .read_subdirectory(&path)
                .await
                .map_err(Self::map_storage_err)?;
            for entry in entries {
                if tree::validate_name(&entry.name).is_err() {
                    warn!(name = %entry.name, "skipping stored entry with invalid name");
                    continue;
                }
                if self
                    .tree
                    .find_child_by_name(id, &entry.name)
                    .map_err(ProtoError::Directory)?
                    .is_some()
                {
                    continue;
                }

                let child_path = Self::join_path(&path, &entry.name);
                let mut acl = match storage.read_acl(&child_path).await {
                    Ok(acl) => acl,
                    Err(err) => {
                        warn!(path = %child_path, err = %err, "unreadable stored ACL, ignoring");
                        SheetSet::new()
                    }
                };
                let mut known = Vec::new();
                for account in acl.accounts() {
                    if self.accounts.is_known(account).await {
                        known.push(account.clone());
                    }
                }
                let removed = acl.verify(|a| known.iter().any(|k| k == a));
                if !removed.is_empty() {
                    warn!(path = %child_path, ?removed, "dropped sheets for unknown accounts");
                }
                let acl = if acl.is_empty() { None } else { Some(acl) };

                let kind = match entry.kind {
                    EntryKind::Subdirectory => NodeKind::subdirectory(),
                    EntryKind::Note { plugin } => {
                        if self.plugins.contains(&plugin) {
                            NodeKind::note(&plugin)
                        } else {
                            NodeKind::UnknownNote { type_tag: plugin }
                        }
                    }
                };
                let child_id = self.tree.allocate_id();
                if let Err(err) = self.tree.insert(id, child_id, &entry.name, kind, acl) {
                    warn!(name = %entry.name, err = %err, "skipping stored entry");
                }
            }
        }

        if let Some(NodeKind::Subdirectory { explored, .. }) =
            self.tree.find_mut(id).map(|n| &mut n.kind)
        {
            *explored = true;
        }
        Ok(())
    }

    // ─── Node creation ───────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn handle_add_node(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        parent: NodeId,
        node_type: String,
        name: String,
        acl_records: Vec<SheetRecord>,
        subscribe: bool,
        sync_in: bool,
    ) -> Result<(), ProtoError> {
        tree::validate_name(&name).map_err(ProtoError::Directory)?;
        if !self
            .tree
            .get(parent)
            .map_err(ProtoError::Directory)?
            .is_subdirectory()
        {
            return Err(ProtoError::Directory(DirectoryError::NotASubdirectory));
        }
        self.ensure_explored(parent).await?;
        if self
            .tree
            .find_child_by_name(parent, &name)
            .map_err(ProtoError::Directory)?
            .is_some()
        {
            return Err(ProtoError::Directory(DirectoryError::NodeExists));
        }

        let sheets: Option<SheetSet> = if acl_records.is_empty() {
            None
        } else {
            Some(SheetSet::from(acl_records))
        };

        let mut required = if node_type == SUBDIRECTORY_TYPE {
            PermMask::ADD_SUBDIRECTORY
        } else {
            PermMask::ADD_DOCUMENT
        };
        if sync_in {
            required |= PermMask::SYNC_IN;
        }
        if subscribe {
            required |= PermMask::SUBSCRIBE_SESSION;
        }
        if sheets.is_some() {
            required |= PermMask::SET_ACL;
        }
        self.require(conn, parent, required)?;

        if let Some(sheets) = &sheets {
            for account in sheets.accounts() {
                if !self.accounts.is_known(account).await {
                    return Err(ProtoError::Directory(DirectoryError::NoSuchAccount(
                        account.clone(),
                    )));
                }
            }
        }

        if node_type == SUBDIRECTORY_TYPE {
            if subscribe || sync_in {
                return Err(ProtoError::Directory(DirectoryError::NotANote));
            }
            return self.add_subdirectory(conn, seq, parent, name, sheets).await;
        }

        if !self.plugins.contains(&node_type) {
            return Err(ProtoError::Directory(DirectoryError::TypeUnknown(node_type)));
        }

        if sync_in {
            // Reserve everything, register nothing: the node id stays out
            // of the tree until the client has uploaded the content.
            let node_id = self.tree.allocate_id();
            let group = session_group_name(node_id);
            let plugin = self.plugins.get(&node_type).expect("checked above");
            let proxy = SessionProxy::pre_sync(node_id, group.clone(), plugin.create_empty());
            self.subreqs.push(Subreq::SyncIn {
                conn,
                seq,
                parent: Some(parent),
                node_id,
                name: name.clone(),
                plugin: node_type.clone(),
                sheets: sheets.clone(),
                proxy,
                subscribe,
            });
            self.send(
                conn,
                Message::SyncIn {
                    seq,
                    id: node_id,
                    parent,
                    node_type,
                    name,
                    group,
                    method: METHOD_CENTRAL.to_string(),
                    acl: sheets.map(|s| s.records()).unwrap_or_default(),
                },
            );
            Ok(())
        } else if subscribe {
            let node_id = self.tree.allocate_id();
            let group = session_group_name(node_id);
            let plugin = self.plugins.get(&node_type).expect("checked above");
            let proxy = SessionProxy::new(node_id, group.clone(), plugin.create_empty());
            self.subreqs.push(Subreq::AddNode {
                conn,
                seq,
                parent: Some(parent),
                node_id,
                name: name.clone(),
                plugin: node_type.clone(),
                sheets: sheets.clone(),
                proxy,
            });
            self.send(
                conn,
                Message::AddNode {
                    seq,
                    id: Some(node_id),
                    parent,
                    node_type,
                    name,
                    acl: sheets.map(|s| s.records()).unwrap_or_default(),
                    subscribe: Some(Self::subscribe_grant(&group)),
                    sync_in: None,
                },
            );
            Ok(())
        } else {
            self.add_plain_note(conn, seq, parent, name, node_type, sheets)
                .await
        }
    }

    async fn add_subdirectory(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        parent: NodeId,
        name: String,
        sheets: Option<SheetSet>,
    ) -> Result<(), ProtoError> {
        let parent_path = self.node_path(parent)?;
        let path = Self::join_path(&parent_path, &name);
        if let Some(storage) = &self.storage {
            storage
                .create_subdirectory(&path)
                .await
                .map_err(Self::map_storage_err)?;
            if let Some(sheets) = &sheets {
                if let Err(err) = storage.write_acl(&path, sheets).await {
                    // Roll the creation back so tree and storage agree.
                    let _ = storage.remove_node(None, &path).await;
                    return Err(Self::map_storage_err(err));
                }
            }
        }
        let id = self.tree.allocate_id();
        self.tree
            .insert(parent, id, &name, NodeKind::subdirectory(), sheets)
            .map_err(ProtoError::Directory)?;
        info!(node = id, path = %path, "subdirectory created");
        if let Some(reply) = self.node_add_message(id, conn, seq) {
            self.send(conn, reply);
        }
        self.announce_add_node(id, Some(conn)).await;
        Ok(())
    }

    async fn add_plain_note(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        parent: NodeId,
        name: String,
        node_type: String,
        sheets: Option<SheetSet>,
    ) -> Result<(), ProtoError> {
        let parent_path = self.node_path(parent)?;
        let path = Self::join_path(&parent_path, &name);
        if let Some(storage) = &self.storage {
            let plugin = self
                .plugins
                .get(&node_type)
                .ok_or(ProtoError::Directory(DirectoryError::TypeUnknown(
                    node_type.clone(),
                )))?;
            let session = plugin.create_empty();
            storage
                .session_write(&path, &*session, &*plugin)
                .await
                .map_err(Self::map_storage_err)?;
            if let Some(sheets) = &sheets {
                if let Err(err) = storage.write_acl(&path, sheets).await {
                    let _ = storage.remove_node(Some(&node_type), &path).await;
                    return Err(Self::map_storage_err(err));
                }
            }
        }
        let id = self.tree.allocate_id();
        self.tree
            .insert(parent, id, &name, NodeKind::note(&node_type), sheets)
            .map_err(ProtoError::Directory)?;
        info!(node = id, path = %path, "note created");
        if let Some(reply) = self.node_add_message(id, conn, seq) {
            self.send(conn, reply);
        }
        self.announce_add_node(id, Some(conn)).await;
        Ok(())
    }

    // ─── Node removal ────────────────────────────────────────────────────

    async fn handle_remove_node(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        id: NodeId,
    ) -> Result<(), ProtoError> {
        let (parent, plugin_opt) = {
            let node = self.tree.get(id).map_err(ProtoError::Directory)?;
            let parent = node
                .parent
                .ok_or(ProtoError::Directory(DirectoryError::RootNodeRemoveAttempt))?;
            let plugin_opt = match &node.kind {
                NodeKind::Subdirectory { .. } => None,
                NodeKind::Note { plugin, .. } => Some(plugin.clone()),
                NodeKind::UnknownNote { type_tag } => Some(type_tag.clone()),
            };
            (parent, plugin_opt)
        };
        self.require(conn, id, PermMask::REMOVE_NODE)?;

        if let Some(storage) = &self.storage {
            let path = self.node_path(id)?;
            storage
                .remove_node(plugin_opt.as_deref(), &path)
                .await
                .map_err(Self::map_storage_err)?;
        }

        self.remove_subtree(id, parent, Some((conn, seq))).await;
        Ok(())
    }

    /// Remove a subtree from the live tree: clear subreq pointers into it,
    /// close its sessions, announce, free.
    pub(crate) async fn remove_subtree(
        &mut self,
        id: NodeId,
        parent: NodeId,
        requester: Option<(ConnId, Option<Seq>)>,
    ) {
        let subtree = self.tree.subtree_ids(id);

        // Subreqs keep working after their target vanishes: the ack then
        // completes into a failure instead of crashing.
        for subreq in &mut self.subreqs {
            match subreq {
                Subreq::Session {
                    node, node_removed, ..
                } => {
                    if subtree.contains(node) {
                        *node_removed = true;
                    }
                }
                Subreq::AddNode { parent, .. } | Subreq::SyncIn { parent, .. } => {
                    if parent.map(|p| subtree.contains(&p)).unwrap_or(false) {
                        *parent = None;
                    }
                }
                Subreq::Chat { .. } => {}
            }
        }
        for record in &mut self.sync_ins {
            if record.parent.map(|p| subtree.contains(&p)).unwrap_or(false) {
                record.parent = None;
            }
        }

        // Sessions in the subtree die with their notes.
        let mut doomed = Vec::new();
        for &node_id in &subtree {
            if let Some(NodeKind::Note { slot, .. }) = self.tree.find(node_id).map(|n| &n.kind) {
                if let Some(proxy) = slot.get() {
                    doomed.push((node_id, proxy));
                }
            }
        }
        for (node_id, proxy) in doomed {
            self.close_proxy(&proxy).await;
            for state in self.conns.values_mut() {
                state.subscriptions.remove(&node_id);
            }
        }

        self.announce_remove_node(id, parent, requester);
        let _ = self.tree.free_subtree(id, &mut |_| {});
    }

    // ─── Subscriptions ───────────────────────────────────────────────────

    async fn handle_subscribe_session(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        id: NodeId,
    ) -> Result<(), ProtoError> {
        let plugin_tag = {
            let node = self.tree.get(id).map_err(ProtoError::Directory)?;
            match &node.kind {
                NodeKind::Note { plugin, .. } => plugin.clone(),
                NodeKind::UnknownNote { type_tag } => {
                    return Err(ProtoError::Directory(DirectoryError::TypeUnknown(
                        type_tag.clone(),
                    )))
                }
                NodeKind::Subdirectory { .. } => {
                    return Err(ProtoError::Directory(DirectoryError::NotANote))
                }
            }
        };
        self.require(conn, id, PermMask::SUBSCRIBE_SESSION)?;
        if self
            .conns
            .get(&conn)
            .map(|c| c.subscriptions.contains_key(&id))
            .unwrap_or(false)
        {
            return Err(ProtoError::Directory(DirectoryError::AlreadySubscribed));
        }
        if self.subreqs.iter().any(|s| {
            matches!(s, Subreq::Session { conn: c, node, .. } if *c == conn && *node == id)
        }) {
            return Err(ProtoError::Directory(DirectoryError::AlreadySubscribed));
        }

        // Reuse the resident session, or the proxy another client's
        // in-flight subreq already reserved; load from storage only when
        // the note is cold.
        let existing = match self.tree.find(id).map(|n| &n.kind) {
            Some(NodeKind::Note { slot, .. }) => slot.get(),
            _ => None,
        };
        let racing = self
            .subreqs
            .iter()
            .filter(|s| matches!(s, Subreq::Session { node, .. } if *node == id))
            .find_map(|s| s.proxy().cloned());
        let proxy = match existing.or(racing) {
            Some(proxy) => proxy,
            None => {
                let plugin = self.plugins.get(&plugin_tag).ok_or(ProtoError::Directory(
                    DirectoryError::TypeUnknown(plugin_tag.clone()),
                ))?;
                let session = match &self.storage {
                    Some(storage) => {
                        let path = self.node_path(id)?;
                        storage
                            .session_read(&path, &*plugin)
                            .await
                            .map_err(Self::map_storage_err)?
                    }
                    None => plugin.create_empty(),
                };
                SessionProxy::new(id, session_group_name(id), session)
            }
        };

        let group = proxy.group.clone();
        self.subreqs.push(Subreq::Session {
            conn,
            seq,
            node: id,
            node_removed: false,
            proxy,
        });
        self.send(
            conn,
            Message::SubscribeSession {
                seq,
                id,
                group: Some(group),
                method: Some(METHOD_CENTRAL.to_string()),
            },
        );
        Ok(())
    }

    fn handle_subscribe_chat(&mut self, conn: ConnId, seq: Option<Seq>) -> Result<(), ProtoError> {
        if !self.options.chat_enabled {
            return Err(ProtoError::Directory(DirectoryError::ChatDisabled));
        }
        self.require(conn, 0, PermMask::SUBSCRIBE_CHAT)?;
        if self.chat_members.contains(&conn) {
            return Err(ProtoError::Directory(DirectoryError::AlreadySubscribed));
        }
        if self
            .subreqs
            .iter()
            .any(|s| matches!(s, Subreq::Chat { conn: c, .. } if *c == conn))
        {
            return Err(ProtoError::Directory(DirectoryError::AlreadySubscribed));
        }
        self.subreqs.push(Subreq::Chat { conn, seq });
        self.send(
            conn,
            Message::SubscribeChat {
                seq,
                group: Some(CHAT_GROUP.to_string()),
                method: Some(METHOD_CENTRAL.to_string()),
            },
        );
        Ok(())
    }

    fn find_subreq(&self, conn: ConnId, id: Option<NodeId>) -> Option<usize> {
        self.subreqs.iter().position(|s| {
            s.conn() == conn
                && match id {
                    None => matches!(s, Subreq::Chat { .. }),
                    Some(node) => s.node_key() == Some(node),
                }
        })
    }

    async fn handle_subscribe_ack(
        &mut self,
        conn: ConnId,
        id: Option<NodeId>,
    ) -> Result<(), ProtoError> {
        let pos = self
            .find_subreq(conn, id)
            .ok_or(ProtoError::Directory(DirectoryError::NoSuchSubscriptionRequest))?;
        let subreq = self.subreqs.remove(pos);

        match subreq {
            Subreq::Chat { .. } => {
                self.chat_members.insert(conn);
                Ok(())
            }

            Subreq::Session {
                seq,
                node,
                node_removed,
                proxy,
                ..
            } => {
                if node_removed || !self.tree.contains(node) {
                    // Close the proxy against the client so it sees the
                    // session die, then fail the originating request.
                    self.send(
                        conn,
                        Message::GroupMessage {
                            group: proxy.group.clone(),
                            frame: SessionFrame::SessionClosed,
                        },
                    );
                    self.send(
                        conn,
                        Message::failure(
                            &ProtoError::Directory(DirectoryError::NoSuchNode),
                            seq,
                        ),
                    );
                    return Ok(());
                }
                self.link_subscriber(conn, node, &proxy).await;
                self.sync_to(conn, &proxy).await;
                Ok(())
            }

            Subreq::AddNode {
                seq,
                parent,
                node_id,
                name,
                plugin,
                sheets,
                proxy,
                ..
            } => {
                let Some(parent) = parent.filter(|p| self.tree.contains(*p)) else {
                    // The client already mirrored the node from the reply.
                    self.send(conn, Message::RemoveNode { seq: None, id: node_id });
                    self.send(
                        conn,
                        Message::failure(
                            &ProtoError::Directory(DirectoryError::NoSuchNode),
                            seq,
                        ),
                    );
                    return Ok(());
                };

                if let Err(err) = self
                    .commit_added_note(parent, node_id, &name, &plugin, &sheets, &proxy)
                    .await
                {
                    self.send(conn, Message::RemoveNode { seq: None, id: node_id });
                    self.send(conn, Message::failure(&err, seq));
                    self.close_proxy(&proxy).await;
                    return Ok(());
                }

                self.announce_add_node(node_id, Some(conn)).await;
                self.link_subscriber(conn, node_id, &proxy).await;
                self.sync_to(conn, &proxy).await;
                Ok(())
            }

            Subreq::SyncIn {
                seq,
                parent,
                node_id,
                name,
                plugin,
                sheets,
                proxy,
                subscribe,
                ..
            } => {
                let Some(parent) = parent.filter(|p| self.tree.contains(*p)) else {
                    self.send(conn, Message::RemoveNode { seq: None, id: node_id });
                    self.send(
                        conn,
                        Message::failure(
                            &ProtoError::Directory(DirectoryError::NoSuchNode),
                            seq,
                        ),
                    );
                    self.close_proxy(&proxy).await;
                    return Ok(());
                };

                {
                    let mut state = proxy.lock().await;
                    state.phase = ProxyPhase::SyncingFrom {
                        source: conn,
                        received: 0,
                        total: 0,
                    };
                    if subscribe {
                        state.members.insert(conn);
                    }
                }
                if subscribe {
                    if let Some(conn_state) = self.conns.get_mut(&conn) {
                        conn_state.subscriptions.insert(node_id, Arc::clone(&proxy));
                    }
                }
                self.sync_ins.push(SyncIn {
                    conn,
                    seq,
                    parent: Some(parent),
                    node_id,
                    name,
                    plugin,
                    sheets,
                    proxy,
                    subscribe,
                });
                Ok(())
            }
        }
    }

    /// Storage write plus tree insertion for an acked add-node subreq.
    async fn commit_added_note(
        &mut self,
        parent: NodeId,
        node_id: NodeId,
        name: &str,
        plugin_tag: &str,
        sheets: &Option<SheetSet>,
        proxy: &Arc<SessionProxy>,
    ) -> Result<(), ProtoError> {
        if let Some(storage) = &self.storage {
            let plugin = self
                .plugins
                .get(plugin_tag)
                .ok_or(ProtoError::Directory(DirectoryError::TypeUnknown(
                    plugin_tag.to_string(),
                )))?;
            let parent_path = self.node_path(parent)?;
            let path = Self::join_path(&parent_path, name);
            {
                let state = proxy.lock().await;
                storage
                    .session_write(&path, &*state.session, &*plugin)
                    .await
                    .map_err(Self::map_storage_err)?;
            }
            if let Some(sheets) = sheets {
                if let Err(err) = storage.write_acl(&path, sheets).await {
                    let _ = storage.remove_node(Some(plugin_tag), &path).await;
                    return Err(Self::map_storage_err(err));
                }
            }
        }
        let kind = NodeKind::Note {
            plugin: plugin_tag.to_string(),
            slot: SessionSlot::Resident(Arc::clone(proxy)),
            save_generation: 0,
        };
        self.tree
            .insert(parent, node_id, name, kind, sheets.clone())
            .map_err(ProtoError::Directory)?;
        info!(node = node_id, name, "note created with subscription");
        Ok(())
    }

    fn handle_subscribe_nack(
        &mut self,
        conn: ConnId,
        id: Option<NodeId>,
    ) -> Result<(), ProtoError> {
        let pos = self
            .find_subreq(conn, id)
            .ok_or(ProtoError::Directory(DirectoryError::NoSuchSubscriptionRequest))?;
        let subreq = self.subreqs.remove(pos);
        // Nothing was committed: the reserved id never entered the tree and
        // no other peer heard about it. Dropping the subreq drops the proxy.
        self.send(
            conn,
            Message::failure(
                &ProtoError::Directory(DirectoryError::SubscriptionRejected),
                subreq.seq(),
            ),
        );
        Ok(())
    }

    async fn link_subscriber(
        &mut self,
        conn: ConnId,
        node_id: NodeId,
        proxy: &Arc<SessionProxy>,
    ) {
        {
            let mut state = proxy.lock().await;
            state.members.insert(conn);
            state.idle = false;
        }
        if let Some(conn_state) = self.conns.get_mut(&conn) {
            conn_state
                .subscriptions
                .insert(node_id, Arc::clone(proxy));
        }
        // Link the session into the node; a pending idle save is cancelled
        // by the generation bump.
        if let Some(NodeKind::Note {
            slot,
            save_generation,
            ..
        }) = self.tree.find_mut(node_id).map(|n| &mut n.kind)
        {
            *save_generation += 1;
            *slot = SessionSlot::Resident(Arc::clone(proxy));
        }
    }

    /// Synchronize the session content to a freshly joined subscriber.
    async fn sync_to(&self, conn: ConnId, proxy: &Arc<SessionProxy>) {
        let chunks = proxy.lock().await.session.sync_chunks();
        self.send(
            conn,
            Message::GroupMessage {
                group: proxy.group.clone(),
                frame: SessionFrame::SyncBegin {
                    total: chunks.len() as u32,
                },
            },
        );
        for data in chunks {
            self.send(
                conn,
                Message::GroupMessage {
                    group: proxy.group.clone(),
                    frame: SessionFrame::SyncChunk { data },
                },
            );
        }
        self.send(
            conn,
            Message::GroupMessage {
                group: proxy.group.clone(),
                frame: SessionFrame::SyncEnd,
            },
        );
    }

    // ─── Sessions & chat ─────────────────────────────────────────────────

    async fn handle_save_session(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        id: NodeId,
    ) -> Result<(), ProtoError> {
        let slot_proxy = {
            let node = self.tree.get(id).map_err(ProtoError::Directory)?;
            match &node.kind {
                NodeKind::Note { slot, .. } => slot.get(),
                NodeKind::UnknownNote { .. } => None,
                NodeKind::Subdirectory { .. } => {
                    return Err(ProtoError::Directory(DirectoryError::NotANote))
                }
            }
        };
        self.require(conn, id, PermMask::SUBSCRIBE_SESSION)?;
        match slot_proxy {
            // Cold means the content already sits in storage.
            None => {
                self.send(conn, Message::SavedSession { seq, id });
                Ok(())
            }
            Some(proxy) => {
                self.send(conn, Message::SaveSessionInProgress { seq, id });
                self.write_session(id, &proxy).await?;
                self.send(conn, Message::SavedSession { seq, id });
                Ok(())
            }
        }
    }

    pub(crate) async fn handle_group(&mut self, conn: ConnId, group: String, frame: SessionFrame) {
        if group == CHAT_GROUP {
            if !self.chat_members.contains(&conn) {
                debug!(conn, "chat frame from non-member dropped");
                return;
            }
            if let SessionFrame::Chat { text, .. } = frame {
                let from = self.conn_account(conn);
                for member in self.chat_members.clone() {
                    self.send(
                        member,
                        Message::GroupMessage {
                            group: CHAT_GROUP.to_string(),
                            frame: SessionFrame::Chat {
                                text: text.clone(),
                                from: Some(from.clone()),
                            },
                        },
                    );
                }
            }
            return;
        }

        let Some(proxy) = self.find_group_proxy(&group) else {
            debug!(conn, group = %group, "frame for unknown group dropped");
            return;
        };
        let phase = proxy.lock().await.phase;
        match phase {
            ProxyPhase::SyncingFrom { source, .. } if source == conn => {
                self.handle_sync_frame(conn, proxy, frame).await;
            }
            ProxyPhase::Running => {
                self.handle_session_frame(conn, proxy, frame).await;
            }
            _ => {
                debug!(conn, group = %group, ?phase, "frame dropped");
            }
        }
    }

    async fn handle_session_frame(
        &mut self,
        conn: ConnId,
        proxy: Arc<SessionProxy>,
        frame: SessionFrame,
    ) {
        match frame {
            SessionFrame::Op { op } => {
                if !proxy.lock().await.members.contains(&conn) {
                    debug!(conn, "op from non-member dropped");
                    return;
                }
                let account = self.conn_account(conn);
                // Editing a session means joining it as a user.
                if !self
                    .effective(proxy.node_id, &account)
                    .contains(PermMask::JOIN_USER)
                {
                    debug!(conn, node = proxy.node_id, "op without can-join-user dropped");
                    return;
                }
                let result = {
                    let mut state = proxy.lock().await;
                    let r = state.session.apply_op(&account, &op);
                    if r.is_ok() {
                        state.dirty = true;
                        state.idle = false;
                    }
                    r
                };
                match result {
                    Ok(()) => {
                        let members: Vec<ConnId> =
                            proxy.lock().await.members.iter().copied().collect();
                        for member in members {
                            if member != conn {
                                self.send(
                                    member,
                                    Message::GroupMessage {
                                        group: proxy.group.clone(),
                                        frame: SessionFrame::Op { op: op.clone() },
                                    },
                                );
                            }
                        }
                    }
                    // Apply failures hurt only the sending replica.
                    Err(err) => warn!(conn, node = proxy.node_id, err = %err, "op rejected"),
                }
            }
            SessionFrame::Unsubscribe => {
                self.unsubscribe_session(conn, proxy.node_id).await;
            }
            other => {
                debug!(conn, frame = ?other, "session frame ignored");
            }
        }
    }

    // ─── ACL ─────────────────────────────────────────────────────────────

    fn handle_query_acl(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        id: NodeId,
    ) -> Result<(), ProtoError> {
        let (queried, sheets) = {
            let node = self.tree.get(id).map_err(ProtoError::Directory)?;
            (
                node.acl_queried_by.contains(&conn),
                node.acl.clone().unwrap_or_default(),
            )
        };
        self.require(conn, id, PermMask::QUERY_ACL)?;
        if queried {
            return Err(ProtoError::Directory(DirectoryError::AclAlreadyQueried));
        }
        if let Some(node) = self.tree.find_mut(id) {
            node.acl_queried_by.insert(conn);
        }
        self.send(
            conn,
            Message::SetAcl {
                seq,
                id,
                sheets: sheets.records(),
            },
        );
        Ok(())
    }

    async fn handle_set_acl(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        id: NodeId,
        records: Vec<SheetRecord>,
    ) -> Result<(), ProtoError> {
        self.tree.get(id).map_err(ProtoError::Directory)?;
        self.require(conn, id, PermMask::SET_ACL)?;
        let delta = SheetSet::from(records);
        for account in delta.accounts() {
            if !self.accounts.is_known(account).await {
                return Err(ProtoError::Directory(DirectoryError::NoSuchAccount(
                    account.clone(),
                )));
            }
        }

        let mut merged = if id == 0 {
            self.root_acl_configured.clone()
        } else {
            self.tree
                .get(id)
                .map_err(ProtoError::Directory)?
                .acl
                .clone()
                .unwrap_or_default()
        };
        merged.merge(&delta);
        if id == 0 {
            // The root default sheet keeps covering every bit; bits newly
            // uncovered by the merge fall back to deny.
            let mut sheet = merged.get(DEFAULT_ACCOUNT).unwrap_or_default();
            sheet.mask = PermMask::all();
            merged.insert(DEFAULT_ACCOUNT, sheet);
        }

        // Storage first; memory only changes when the write went through.
        if let Some(storage) = &self.storage {
            let path = self.node_path(id)?;
            storage
                .write_acl(&path, &merged)
                .await
                .map_err(Self::map_storage_err)?;
        }
        if id == 0 {
            self.root_acl_configured = merged;
            self.recompute_root_effective();
        } else if let Some(node) = self.tree.find_mut(id) {
            node.acl = if merged.is_empty() { None } else { Some(merged) };
        }

        // The reply reaches the originator before the announcement fan-out.
        let reply = self.filter_delta_for(id, conn, &delta);
        self.send(
            conn,
            Message::SetAcl {
                seq,
                id,
                sheets: reply.records(),
            },
        );
        self.announce_set_acl(id, &delta, Some(conn));
        self.enforce_acl(id).await;
        Ok(())
    }

    // ─── Accounts ────────────────────────────────────────────────────────

    async fn handle_query_account_list(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
    ) -> Result<(), ProtoError> {
        self.require(conn, 0, PermMask::QUERY_ACCOUNT_LIST)?;
        let accounts = self.accounts.list_all().await;
        // Without a backend the directory itself is the only writer, so
        // notifications are always possible.
        let notifications =
            !self.accounts.has_backend() || self.accounts.features().notification;
        self.send(
            conn,
            Message::AclAccountListBegin {
                seq,
                total: accounts.len() as u32,
                notifications_enabled: notifications,
            },
        );
        for account in &accounts {
            self.send(
                conn,
                Message::AddAclAccount {
                    seq,
                    account: account.wire(),
                },
            );
        }
        self.send(conn, Message::AclAccountListEnd { seq });
        if let Some(state) = self.conns.get_mut(&conn) {
            state.notifications_enabled = notifications;
        }
        Ok(())
    }

    async fn handle_lookup_accounts(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        ids: Vec<String>,
        names: Vec<String>,
    ) -> Result<(), ProtoError> {
        self.require(conn, 0, PermMask::QUERY_ACCOUNT_LIST)?;
        let mut accounts = Vec::new();
        for id in &ids {
            if let Some(account) = self.accounts.lookup(id).await {
                accounts.push(account.wire());
            }
        }
        for name in &names {
            for account in self.accounts.lookup_by_name(name).await {
                if !accounts.iter().any(|a| a.id == account.id) {
                    accounts.push(account.wire());
                }
            }
        }
        self.send(
            conn,
            Message::LookupAclAccounts {
                seq,
                ids: Vec::new(),
                names: Vec::new(),
                accounts,
            },
        );
        Ok(())
    }

    async fn handle_create_account(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        crq: Option<String>,
    ) -> Result<(), ProtoError> {
        self.require(conn, 0, PermMask::CREATE_ACCOUNT)?;
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or(ProtoError::Directory(DirectoryError::OperationUnsupported))?;
        let crq = crq.ok_or(ProtoError::Request(RequestError::NoSuchAttribute(
            "crq".to_string(),
        )))?;
        let request = CertificateRequest::from_pem(&crq).map_err(ProtoError::Directory)?;

        let account_id = AccountRegistry::fresh_id();
        let certificate = cert::issue(signing_key, &request, &account_id);
        let record = AccountRecord {
            id: account_id,
            name: Some(request.name.clone()),
            fingerprints: vec![certificate.fingerprint()],
            created_at: Utc::now(),
        };
        let account = self
            .accounts
            .add_persistent(record)
            .await
            .map_err(ProtoError::Directory)?;
        let wire = account.wire();
        info!(id = %wire.id, name = %request.name, "account created");

        self.send(
            conn,
            Message::CreateAclAccount {
                seq,
                crq: None,
                certificate: Some(certificate.to_pem()),
                account: Some(wire.clone()),
            },
        );
        self.announce_account_added(&wire);
        Ok(())
    }

    async fn handle_remove_account(
        &mut self,
        conn: ConnId,
        seq: Option<Seq>,
        id: String,
    ) -> Result<(), ProtoError> {
        self.require(conn, 0, PermMask::REMOVE_ACCOUNT)?;
        self.accounts.remove(&id).await.map_err(ProtoError::Directory)?;
        info!(id = %id, "account removed");

        self.send(conn, Message::RemoveAclAccount { seq, id: id.clone() });

        // Connections logged into the account fall back to default, with
        // the full enforcement pass.
        let demoted: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, s)| s.account == id)
            .map(|(c, _)| *c)
            .collect();
        for c in &demoted {
            self.switch_account(*c, DEFAULT_ACCOUNT.to_string()).await;
        }

        self.purge_account_sheets(&id).await;
        self.announce_account_removed(&id, &demoted);
        Ok(())
    }
}
