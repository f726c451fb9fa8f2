//! The ACL enforcement pass.
//!
//! Whenever an ACL changes or a connection's account changes, the directory
//! walks the affected (connection, node) pairs and reconciles in-flight
//! state with the new permissions: explored subdirectories are silently
//! unexplored, session subscriptions dropped, disclosed ACLs reduced back
//! to the default+own pair, and account-list notifications kept in step
//! with the account-list permission.

use tracing::{debug, warn};

use crate::account::AccountId;
use crate::acl::{PermMask, Sheet, SheetSet, DEFAULT_ACCOUNT};
use crate::proto::{ConnId, Message, NodeId, ProtoError, WireAccount};
use crate::proto::DirectoryError;
use crate::tree::NodeKind;

use super::subreq::Subreq;
use super::Directory;

impl Directory {
    /// Run the enforcement pass for every connection over the subtree of
    /// `root`.
    pub(crate) async fn enforce_acl(&mut self, root: NodeId) {
        let nodes = self.tree.subtree_ids(root);
        let conns: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn in conns {
            self.enforce_for_conn(conn, &nodes).await;
        }
    }

    /// Reconcile one connection against the given nodes.
    pub(crate) async fn enforce_for_conn(&mut self, conn: ConnId, nodes: &[NodeId]) {
        let account = self.conn_account(conn);
        for &node_id in nodes {
            if !self.tree.contains(node_id) {
                continue;
            }
            let perms = self.effective(node_id, &account);

            let (explored_by_conn, queried_by_conn) = match self.tree.find(node_id) {
                Some(node) => {
                    let explored = matches!(
                        &node.kind,
                        NodeKind::Subdirectory { subscribed, .. } if subscribed.contains(&conn)
                    );
                    (explored, node.acl_queried_by.contains(&conn))
                }
                None => continue,
            };

            if explored_by_conn && !perms.contains(PermMask::EXPLORE_NODE) {
                self.unexplore_for(conn, node_id).await;
            }

            let subscribed_session = self
                .conns
                .get(&conn)
                .map(|c| c.subscriptions.contains_key(&node_id))
                .unwrap_or(false);
            if subscribed_session && !perms.contains(PermMask::SUBSCRIBE_SESSION) {
                debug!(conn, node = node_id, "enforcement: dropping session subscription");
                self.unsubscribe_session(conn, node_id).await;
            }

            if queried_by_conn && !perms.contains(PermMask::QUERY_ACL) {
                self.revoke_acl_query(conn, node_id);
            }
        }

        // Account-list notifications follow the root-level permission, in
        // both directions: a revocation disables them, a re-grant restores
        // them.
        let root_perms = self.effective(0, &account);
        let notifiable = root_perms.contains(PermMask::QUERY_ACCOUNT_LIST)
            && (!self.accounts.has_backend() || self.accounts.features().notification);
        if let Some(state) = self.conns.get_mut(&conn) {
            state.notifications_enabled = notifiable;
        }
    }

    /// Silently unexplore a subdirectory on the client's behalf: synthetic
    /// node-removed for every child, the connection dropped from the
    /// explored set of the whole subtree, and its pending node-creating
    /// subreqs under this node killed.
    async fn unexplore_for(&mut self, conn: ConnId, node_id: NodeId) {
        debug!(conn, node = node_id, "enforcement: unexploring subdirectory");
        for child in self.tree.children(node_id) {
            self.send(conn, Message::RemoveNode { seq: None, id: child });
        }

        let subtree = self.tree.subtree_ids(node_id);
        for &id in &subtree {
            if let Some(node) = self.tree.find_mut(id) {
                node.acl_queried_by.remove(&conn);
                if let NodeKind::Subdirectory { subscribed, .. } = &mut node.kind {
                    subscribed.remove(&conn);
                }
            }
        }

        // Kill this connection's add-node / sync-in subreqs under the
        // now-invisible subtree.
        let mut killed = Vec::new();
        self.subreqs.retain(|subreq| {
            let parent = match subreq {
                Subreq::AddNode { conn: c, parent, .. }
                | Subreq::SyncIn { conn: c, parent, .. }
                    if *c == conn =>
                {
                    *parent
                }
                _ => return true,
            };
            match parent {
                Some(p) if subtree.contains(&p) => {
                    killed.push((subreq.conn(), subreq.seq(), subreq.node_key()));
                    false
                }
                _ => true,
            }
        });
        for (conn, seq, node_key) in killed {
            self.send(
                conn,
                Message::failure(
                    &ProtoError::Directory(DirectoryError::SubscriptionRejected),
                    seq,
                ),
            );
            if let Some(id) = node_key {
                self.send(conn, Message::RemoveNode { seq: None, id });
            }
        }

        // In-flight sync-ins from this connection under the subtree fail.
        let doomed: Vec<NodeId> = self
            .sync_ins
            .iter()
            .filter(|s| {
                s.conn == conn
                    && s.parent.map(|p| subtree.contains(&p)).unwrap_or(false)
            })
            .map(|s| s.node_id)
            .collect();
        for node in doomed {
            self.fail_sync_in(
                node,
                ProtoError::Directory(DirectoryError::SubscriptionRejected),
            )
            .await;
        }
    }

    /// The connection lost `can-query-acl`: reduce its view of the node's
    /// ACL back to the default+own pair with a synthetic set-acl carrying
    /// erasure sheets for everything else.
    fn revoke_acl_query(&mut self, conn: ConnId, node_id: NodeId) {
        let account = self.conn_account(conn);
        let Some(node) = self.tree.find_mut(node_id) else {
            return;
        };
        node.acl_queried_by.remove(&conn);

        let Some(acl) = node.acl.clone() else {
            return;
        };
        let mut reduced = SheetSet::new();
        for (sheet_account, sheet) in acl.iter() {
            if sheet_account == DEFAULT_ACCOUNT || *sheet_account == account {
                reduced.insert(sheet_account, *sheet);
            } else {
                // Empty mask signals erasure in the client's mirror.
                reduced.insert(sheet_account, Sheet::default());
            }
        }
        debug!(conn, node = node_id, "enforcement: reducing disclosed ACL");
        self.send(
            conn,
            Message::SetAcl {
                seq: None,
                id: node_id,
                sheets: reduced.records(),
            },
        );
    }

    /// Switch a connection to another account (certificate re-login,
    /// demotion on account removal) and run the full enforcement pass for
    /// it.
    pub(crate) async fn switch_account(&mut self, conn: ConnId, new_account: AccountId) {
        let wire = match self.accounts.lookup(&new_account).await {
            Some(account) => account.wire(),
            None => WireAccount {
                id: new_account.clone(),
                name: None,
            },
        };
        if let Some(state) = self.conns.get_mut(&conn) {
            state.account = new_account;
        }
        self.send_account_change(conn, &wire);
        let nodes = self.tree.subtree_ids(0);
        self.enforce_for_conn(conn, &nodes).await;
    }

    /// Strip every sheet referencing `account` from every node, rewriting
    /// storage and announcing the erasure per node.
    pub(crate) async fn purge_account_sheets(&mut self, account: &str) {
        let ids: Vec<NodeId> = self.tree.ids().collect();
        for node_id in ids {
            let had_sheet = self
                .tree
                .find(node_id)
                .and_then(|n| n.acl.as_ref())
                .map(|set| set.get(account).is_some())
                .unwrap_or(false);
            if !had_sheet && node_id != 0 {
                continue;
            }

            if node_id == 0 {
                if self.root_acl_configured.remove(account).is_none() {
                    continue;
                }
                self.recompute_root_effective();
            } else if let Some(node) = self.tree.find_mut(node_id) {
                if let Some(acl) = node.acl.as_mut() {
                    acl.remove(account);
                    if acl.is_empty() {
                        node.acl = None;
                    }
                }
            }

            // Rewrite the stored ACL; failures are logged and swallowed.
            if let Some(storage) = &self.storage {
                let path = match self.tree.path(node_id) {
                    Ok(path) => path,
                    Err(_) => continue,
                };
                let sheets = if node_id == 0 {
                    self.root_acl_configured.clone()
                } else {
                    self.tree
                        .find(node_id)
                        .and_then(|n| n.acl.clone())
                        .unwrap_or_default()
                };
                if let Err(err) = storage.write_acl(&path, &sheets).await {
                    warn!(node = node_id, err = %err, "ACL rewrite after account removal failed");
                }
            }

            // An empty-mask sheet announces the erasure.
            let mut delta = SheetSet::new();
            delta.insert(account, Sheet::default());
            self.announce_set_acl(node_id, &delta, None);
        }
    }
}
