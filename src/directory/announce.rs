//! Change propagation.
//!
//! Every directory mutation fans out to the interested subset of
//! connections: node changes go to peers with the parent explored, ACL
//! deltas are filtered per connection and suppressed when the filtered copy
//! is empty, account changes go to connections holding the account-list
//! permission. Failures here are logged and swallowed — announcements never
//! tear down a connection.

use crate::acl::SheetSet;
use crate::proto::{ConnId, Message, NodeId, NodeSheet, Seq, SubscribeChild, WireAccount};
use crate::tree::NodeKind;

use super::Directory;

impl Directory {
    /// Connections that have `parent` explored.
    pub(crate) fn parent_explorers(&self, parent: NodeId) -> Vec<ConnId> {
        match self.tree.find(parent).map(|n| &n.kind) {
            Some(NodeKind::Subdirectory { subscribed, .. }) => {
                subscribed.iter().copied().collect()
            }
            _ => Vec::new(),
        }
    }

    /// The `add-node` element describing `node` as disclosed to `conn`.
    pub(crate) fn node_add_message(
        &self,
        node: NodeId,
        conn: ConnId,
        seq: Option<Seq>,
    ) -> Option<Message> {
        let node_ref = self.tree.find(node)?;
        Some(Message::AddNode {
            seq,
            id: Some(node),
            parent: node_ref.parent.unwrap_or(0),
            node_type: node_ref.type_tag().to_string(),
            name: node_ref.name.clone(),
            acl: self.sheets_for(node, conn).records(),
            subscribe: None,
            sync_in: None,
        })
    }

    /// Announce a freshly inserted node to every peer that has the parent
    /// explored, except `exclude` (the requester, which gets its own copy
    /// with the seq attached).
    pub(crate) async fn announce_add_node(&self, node: NodeId, exclude: Option<ConnId>) {
        let Some(parent) = self.tree.find(node).and_then(|n| n.parent) else {
            return;
        };
        for conn in self.parent_explorers(parent) {
            if Some(conn) == exclude {
                continue;
            }
            if let Some(msg) = self.node_add_message(node, conn, None) {
                self.send(conn, msg);
            }
        }
    }

    /// Announce a node removal to every peer that had the parent explored.
    pub(crate) fn announce_remove_node(
        &self,
        node: NodeId,
        parent: NodeId,
        requester: Option<(ConnId, Option<Seq>)>,
    ) {
        // The reply must reach the originator before the announcement race.
        if let Some((conn, seq)) = requester {
            self.send(conn, Message::RemoveNode { seq, id: node });
        }
        for conn in self.parent_explorers(parent) {
            if requester.map(|(c, _)| c) == Some(conn) {
                continue;
            }
            self.send(conn, Message::RemoveNode { seq: None, id: node });
        }
    }

    /// Announce an ACL delta on `node`. Each connection sees the subset it
    /// is authorized to see; empty subsets are suppressed.
    pub(crate) fn announce_set_acl(
        &self,
        node: NodeId,
        delta: &SheetSet,
        exclude: Option<ConnId>,
    ) {
        let conns: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn in conns {
            if Some(conn) == exclude || !self.visible_to(conn, node) {
                continue;
            }
            let filtered = self.filter_delta_for(node, conn, delta);
            if filtered.is_empty() {
                continue;
            }
            self.send(
                conn,
                Message::SetAcl {
                    seq: None,
                    id: node,
                    sheets: filtered.records(),
                },
            );
        }
    }

    /// The subset of an ACL delta `conn` may see: everything after a
    /// successful `query-acl` on the node, the default+own sheets
    /// otherwise.
    pub(crate) fn filter_delta_for(
        &self,
        node: NodeId,
        conn: ConnId,
        delta: &SheetSet,
    ) -> SheetSet {
        let queried = self
            .tree
            .find(node)
            .map(|n| n.acl_queried_by.contains(&conn))
            .unwrap_or(false);
        if queried {
            delta.clone()
        } else {
            delta.visible_subset(&self.conn_account(conn))
        }
    }

    /// Tell every connection holding the account-list permission (and any
    /// extra connections, e.g. a dispossessed owner) about an account
    /// arrival or departure.
    pub(crate) fn announce_account_added(&self, account: &WireAccount) {
        for (conn, state) in &self.conns {
            if state.notifications_enabled {
                self.send(
                    *conn,
                    Message::AddAclAccount {
                        seq: None,
                        account: account.clone(),
                    },
                );
            }
        }
    }

    pub(crate) fn announce_account_removed(&self, id: &str, extra: &[ConnId]) {
        for (conn, state) in &self.conns {
            if state.notifications_enabled || extra.contains(conn) {
                self.send(
                    *conn,
                    Message::RemoveAclAccount {
                        seq: None,
                        id: id.to_string(),
                    },
                );
            }
        }
    }

    /// Tell one connection its effective account changed, piggy-backing the
    /// account's own sheets for every node the client currently sees.
    pub(crate) fn send_account_change(&self, conn: ConnId, account: &WireAccount) {
        let mut nodes = Vec::new();
        for id in self.tree.ids() {
            if !self.visible_to(conn, id) {
                continue;
            }
            let sheet = self
                .tree
                .find(id)
                .and_then(|n| n.acl.as_ref())
                .and_then(|set| set.get(&account.id));
            if let Some(sheet) = sheet {
                nodes.push(NodeSheet {
                    node_id: id,
                    mask: sheet.mask.bits(),
                    perms: sheet.perms.bits(),
                });
            }
        }
        self.send(
            conn,
            Message::ChangeAclAccount {
                account: account.clone(),
                nodes,
            },
        );
    }

    /// The filled-in subscribe grant for a reply.
    pub(crate) fn subscribe_grant(group: &str) -> SubscribeChild {
        SubscribeChild::grant(group, crate::proto::METHOD_CENTRAL)
    }
}
