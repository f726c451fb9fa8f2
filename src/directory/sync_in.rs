//! The sync-in engine.
//!
//! After a sync-in subreq is acked, one of these records tracks the inbound
//! synchronization: the reserved node id, the ACL to install, and the
//! pre-built proxy sitting in the syncing-from-client phase. The record
//! resolves either to a new tree node (content stored, peers told) or to
//! nothing at all — the id is never committed and storage is never written
//! on failure.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::acl::{PermMask, SheetSet};
use crate::proto::{
    ConnId, DirectoryError, Message, NodeId, ProtoError, Seq, SessionFrame,
};
use crate::session::{ProxyPhase, SessionProxy, SessionSlot};
use crate::tree::NodeKind;

use super::Directory;

pub struct SyncIn {
    pub conn: ConnId,
    pub seq: Option<Seq>,
    /// Cleared when the parent is removed mid-flight; completion then
    /// cancels instead of inserting.
    pub parent: Option<NodeId>,
    /// Reserved id, not yet in the node map.
    pub node_id: NodeId,
    pub name: String,
    pub plugin: String,
    pub sheets: Option<SheetSet>,
    pub proxy: Arc<SessionProxy>,
    /// The uploading client also subscribes to the finished session.
    pub subscribe: bool,
}

impl Directory {
    /// One frame from the synchronizing client.
    pub(crate) async fn handle_sync_frame(
        &mut self,
        conn: ConnId,
        proxy: Arc<SessionProxy>,
        frame: SessionFrame,
    ) {
        let node_id = proxy.node_id;
        match frame {
            SessionFrame::SyncBegin { total } => {
                let mut state = proxy.lock().await;
                if let ProxyPhase::SyncingFrom {
                    total: slot_total,
                    received,
                    ..
                } = &mut state.phase
                {
                    *slot_total = total;
                    *received = 0;
                }
            }
            SessionFrame::SyncChunk { data } => {
                let result = {
                    let mut state = proxy.lock().await;
                    let r = state.session.absorb_chunk(&data);
                    if r.is_ok() {
                        if let ProxyPhase::SyncingFrom { received, .. } = &mut state.phase {
                            *received += 1;
                        }
                    }
                    r
                };
                if let Err(err) = result {
                    warn!(node = node_id, err = %err, "sync-in chunk rejected");
                    self.fail_sync_in(node_id, ProtoError::Directory(DirectoryError::UnexpectedSyncIn))
                        .await;
                }
            }
            SessionFrame::SyncEnd => {
                self.complete_sync_in(node_id).await;
            }
            SessionFrame::SyncFailed { message } => {
                debug!(node = node_id, message = %message, "client aborted sync-in");
                self.fail_sync_in(
                    node_id,
                    ProtoError::Directory(DirectoryError::SubscriptionRejected),
                )
                .await;
            }
            other => {
                debug!(conn, frame = ?other, "ignoring frame during sync-in");
            }
        }
    }

    /// The network synchronization finished; decide whether to commit.
    async fn complete_sync_in(&mut self, node_id: NodeId) {
        let Some(pos) = self.sync_ins.iter().position(|s| s.node_id == node_id) else {
            return;
        };
        let record = self.sync_ins.remove(pos);

        // The parent may have vanished mid-flight.
        let Some(parent) = record.parent.filter(|p| self.tree.contains(*p)) else {
            self.cancel_sync_in(record, DirectoryError::NoSuchNode).await;
            return;
        };

        // Permissions may have been revoked mid-flight: the sync completed
        // at the network layer, but the directory refuses to commit.
        let mut required = PermMask::ADD_DOCUMENT | PermMask::SYNC_IN;
        if record.subscribe {
            required |= PermMask::SUBSCRIBE_SESSION;
        }
        if let Err(err) = self.require(record.conn, parent, required) {
            self.send(record.conn, Message::failure(&err, record.seq));
            self.send(
                record.conn,
                Message::RemoveNode {
                    seq: None,
                    id: record.node_id,
                },
            );
            self.close_proxy(&record.proxy).await;
            info!(node = record.node_id, "sync-in refused: permissions revoked mid-flight");
            return;
        }

        // Storage write comes first; a failed write means nothing is
        // inserted and nothing is announced.
        if self.storage.is_some() {
            if let Err(err) = self.write_sync_in_content(&record, parent).await {
                self.send(record.conn, Message::failure(&err, record.seq));
                self.send(
                    record.conn,
                    Message::RemoveNode {
                        seq: None,
                        id: record.node_id,
                    },
                );
                self.close_proxy(&record.proxy).await;
                return;
            }
        }

        let SyncIn {
            conn,
            seq,
            node_id,
            name,
            plugin,
            sheets,
            proxy,
            subscribe,
            ..
        } = record;

        let slot = if subscribe {
            SessionSlot::Resident(Arc::clone(&proxy))
        } else {
            SessionSlot::Cold
        };
        let kind = NodeKind::Note {
            plugin: plugin.clone(),
            slot,
            save_generation: 0,
        };
        if let Err(err) = self.tree.insert(parent, node_id, &name, kind, sheets.clone()) {
            self.send(conn, Message::failure(&ProtoError::Directory(err), seq));
            self.close_proxy(&proxy).await;
            return;
        }

        {
            let mut state = proxy.lock().await;
            state.phase = ProxyPhase::Running;
            state.idle = false;
            if subscribe {
                state.members.insert(conn);
            }
        }
        if subscribe {
            if let Some(conn_state) = self.conns.get_mut(&conn) {
                conn_state.subscriptions.insert(node_id, Arc::clone(&proxy));
            }
        }

        // ACL sidecar, best effort: the node exists either way.
        if let (Some(sheets), Some(storage)) = (&sheets, &self.storage) {
            if let Ok(path) = self.tree.path(node_id) {
                if let Err(err) = storage.write_acl(&path, sheets).await {
                    warn!(node = node_id, err = %err, "sync-in ACL write failed");
                }
            }
        }

        info!(node = node_id, name = %name, "sync-in complete, node inserted");
        self.announce_add_node(node_id, Some(conn)).await;
        // The originating request finishes with the add-node reply.
        let reply = self.node_add_message(node_id, conn, seq);
        if let Some(reply) = reply {
            self.send(conn, reply);
        }
    }

    async fn write_sync_in_content(
        &self,
        record: &SyncIn,
        parent: NodeId,
    ) -> Result<(), ProtoError> {
        let storage = self.storage_backend()?;
        let plugin = self
            .plugins
            .get(&record.plugin)
            .ok_or(ProtoError::Directory(DirectoryError::TypeUnknown(
                record.plugin.clone(),
            )))?;
        let parent_path = self.node_path(parent)?;
        let path = Self::join_path(&parent_path, &record.name);
        let state = record.proxy.lock().await;
        storage
            .session_write(&path, &*state.session, &*plugin)
            .await
            .map_err(Self::map_storage_err)
    }

    /// Fail an in-flight sync-in: the request fails, the proxy closes, the
    /// id is never committed.
    pub(crate) async fn fail_sync_in(&mut self, node_id: NodeId, err: ProtoError) {
        let Some(pos) = self.sync_ins.iter().position(|s| s.node_id == node_id) else {
            return;
        };
        let record = self.sync_ins.remove(pos);
        self.send(record.conn, Message::failure(&err, record.seq));
        self.send(
            record.conn,
            Message::RemoveNode {
                seq: None,
                id: record.node_id,
            },
        );
        self.close_proxy(&record.proxy).await;
        if let Some(state) = self.conns.get_mut(&record.conn) {
            state.subscriptions.remove(&record.node_id);
        }
    }

    async fn cancel_sync_in(&mut self, record: SyncIn, err: DirectoryError) {
        self.send(
            record.conn,
            Message::failure(&ProtoError::Directory(err), record.seq),
        );
        self.send(
            record.conn,
            Message::RemoveNode {
                seq: None,
                id: record.node_id,
            },
        );
        self.close_proxy(&record.proxy).await;
        if let Some(state) = self.conns.get_mut(&record.conn) {
            state.subscriptions.remove(&record.node_id);
        }
    }
}
