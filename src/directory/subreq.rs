//! Pending subscription requests.
//!
//! A subreq is created when the server replies to a subscription-creating
//! request and lives until the client acks or nacks, or its connection
//! closes. While a subreq is open the server has reserved resources (a
//! group, a proxy, possibly an uncommitted node id) but has neither
//! registered a node into the tree nor told any other peer.

use std::sync::Arc;

use crate::acl::SheetSet;
use crate::proto::{ConnId, NodeId, Seq};
use crate::session::SessionProxy;

pub enum Subreq {
    /// `subscribe-chat` awaiting ack.
    Chat { conn: ConnId, seq: Option<Seq> },
    /// `subscribe-session` awaiting ack. `node_removed` is flagged when the
    /// node vanishes mid-handshake; the ack then completes into a failure
    /// instead of crashing.
    Session {
        conn: ConnId,
        seq: Option<Seq>,
        node: NodeId,
        node_removed: bool,
        proxy: Arc<SessionProxy>,
    },
    /// `add-node` with a subscribe child: the node id is reserved but not
    /// yet in the tree.
    AddNode {
        conn: ConnId,
        seq: Option<Seq>,
        parent: Option<NodeId>,
        node_id: NodeId,
        name: String,
        plugin: String,
        sheets: Option<SheetSet>,
        proxy: Arc<SessionProxy>,
    },
    /// `add-node` with a sync-in child: on ack the client starts uploading
    /// the initial content.
    SyncIn {
        conn: ConnId,
        seq: Option<Seq>,
        parent: Option<NodeId>,
        node_id: NodeId,
        name: String,
        plugin: String,
        sheets: Option<SheetSet>,
        proxy: Arc<SessionProxy>,
        subscribe: bool,
    },
}

impl Subreq {
    pub fn conn(&self) -> ConnId {
        match self {
            Subreq::Chat { conn, .. }
            | Subreq::Session { conn, .. }
            | Subreq::AddNode { conn, .. }
            | Subreq::SyncIn { conn, .. } => *conn,
        }
    }

    pub fn seq(&self) -> Option<Seq> {
        match self {
            Subreq::Chat { seq, .. }
            | Subreq::Session { seq, .. }
            | Subreq::AddNode { seq, .. }
            | Subreq::SyncIn { seq, .. } => *seq,
        }
    }

    /// The node id an ack/nack refers to; `None` for chat.
    pub fn node_key(&self) -> Option<NodeId> {
        match self {
            Subreq::Chat { .. } => None,
            Subreq::Session { node, .. } => Some(*node),
            Subreq::AddNode { node_id, .. } | Subreq::SyncIn { node_id, .. } => Some(*node_id),
        }
    }

    /// The proxy reserved by this subreq, if any.
    pub fn proxy(&self) -> Option<&Arc<SessionProxy>> {
        match self {
            Subreq::Chat { .. } => None,
            Subreq::Session { proxy, .. }
            | Subreq::AddNode { proxy, .. }
            | Subreq::SyncIn { proxy, .. } => Some(proxy),
        }
    }
}
