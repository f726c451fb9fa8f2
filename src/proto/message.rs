//! Directory protocol elements.
//!
//! Every message is one element with attributes, carried as a single JSON
//! object per transport frame, tagged with the element name. The schema is
//! structural — the transport below (WebSocket text frames here) is not part
//! of the protocol contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::acl::SheetRecord;
use crate::proto::error::ProtoError;
use crate::proto::{ConnId, NodeId, Seq};

/// A named account as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The `subscribe` child of `add-node` and the body of subscription replies.
/// Requests carry it empty; replies fill in the allocated group and method.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeChild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl SubscribeChild {
    /// The empty form a client attaches to a request.
    pub fn request() -> Self {
        SubscribeChild::default()
    }

    /// The filled-in form the server replies with.
    pub fn grant(group: &str, method: &str) -> Self {
        SubscribeChild {
            group: Some(group.to_string()),
            method: Some(method.to_string()),
        }
    }
}

/// Presence marker: the `sync-in` child of a client `add-node` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncInChild {}

/// One node's (mask, perms) pair piggy-backed on `change-acl-account`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSheet {
    pub node_id: NodeId,
    pub mask: u64,
    pub perms: u64,
}

/// Messages exchanged inside a subscription group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SessionFrame {
    /// Start of a session synchronization; `total` content chunks follow.
    SyncBegin { total: u32 },
    /// One plugin-opaque content chunk.
    SyncChunk { data: Value },
    /// Synchronization finished successfully.
    SyncEnd,
    /// The synchronizing side gave up; the session must be discarded.
    SyncFailed { message: String },
    /// A session operation, applied at every replica. The author is the
    /// sending connection's account.
    Op { op: Value },
    /// A chat line. `from` is filled in by the server on rebroadcast.
    Chat {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    /// A member leaves the session voluntarily.
    Unsubscribe,
    /// The session behind this group no longer exists.
    SessionClosed,
}

/// A directory protocol element. The serde tag is the element name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "element", rename_all = "kebab-case")]
pub enum Message {
    /// First message on every connection, server to client.
    Welcome {
        #[serde(rename = "protocol-version")]
        protocol_version: String,
        #[serde(rename = "sequence-id")]
        sequence_id: ConnId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account: Option<WireAccount>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        acl: Vec<SheetRecord>,
    },

    ExploreNode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        id: NodeId,
    },
    ExploreBegin {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        total: u32,
    },
    ExploreEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },

    /// Client request (no `id`, optional `subscribe`/`sync-in` children) and
    /// server reply/announcement (with `id`, optional `subscribe` grant).
    AddNode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<NodeId>,
        parent: NodeId,
        #[serde(rename = "type")]
        node_type: String,
        name: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        acl: Vec<SheetRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscribe: Option<SubscribeChild>,
        #[serde(rename = "sync-in", default, skip_serializing_if = "Option::is_none")]
        sync_in: Option<SyncInChild>,
    },
    RemoveNode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        id: NodeId,
    },

    /// Request (just `id`) and reply (`id` + allocated group and method).
    SubscribeSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
    SubscribeChat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
    /// Client accepts a pending subscription. `id` is absent for chat.
    SubscribeAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<NodeId>,
    },
    /// Client declines a pending subscription. `id` is absent for chat.
    SubscribeNack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<NodeId>,
    },

    /// Server reply to an `add-node` request carrying a `sync-in` child:
    /// names the reserved node and the group the client must sync into.
    SyncIn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        id: NodeId,
        parent: NodeId,
        #[serde(rename = "type")]
        node_type: String,
        name: String,
        group: String,
        method: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        acl: Vec<SheetRecord>,
    },

    SaveSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        id: NodeId,
    },
    SaveSessionInProgress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        id: NodeId,
    },
    SavedSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        id: NodeId,
    },

    QueryAclAccountList {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    AclAccountListBegin {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        total: u32,
        #[serde(rename = "notifications-enabled")]
        notifications_enabled: bool,
    },
    AclAccountListEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    /// List entry during a query, and server-initiated notification when an
    /// account appears.
    AddAclAccount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        account: WireAccount,
    },
    /// Request (account id to remove), reply, and server-initiated
    /// notification when an account disappears.
    RemoveAclAccount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        id: String,
    },
    /// Request carries `ids`/`names` filters; the reply carries `accounts`.
    LookupAclAccounts {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        names: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        accounts: Vec<WireAccount>,
    },
    /// Request carries the PEM `crq`; the reply carries the signed
    /// certificate and the new account.
    CreateAclAccount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        crq: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        certificate: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account: Option<WireAccount>,
    },
    /// Server tells one connection that its effective account changed,
    /// with the account's own sheets for every node the client can see.
    ChangeAclAccount {
        account: WireAccount,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        nodes: Vec<NodeSheet>,
    },

    QueryAcl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        id: NodeId,
    },
    /// Request and notification share this shape; it also serves as the
    /// reply to `query-acl`.
    SetAcl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        id: NodeId,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sheets: Vec<SheetRecord>,
    },

    RequestFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        domain: String,
        code: String,
        message: String,
    },

    /// A message inside a subscription group.
    GroupMessage { group: String, frame: SessionFrame },
}

impl Message {
    /// Build a `request-failed` reply for `err`, echoing `seq`.
    pub fn failure(err: &ProtoError, seq: Option<Seq>) -> Message {
        Message::RequestFailed {
            seq,
            domain: err.domain().to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// The element name, for dispatch logging.
    pub fn element(&self) -> &'static str {
        match self {
            Message::Welcome { .. } => "welcome",
            Message::ExploreNode { .. } => "explore-node",
            Message::ExploreBegin { .. } => "explore-begin",
            Message::ExploreEnd { .. } => "explore-end",
            Message::AddNode { .. } => "add-node",
            Message::RemoveNode { .. } => "remove-node",
            Message::SubscribeSession { .. } => "subscribe-session",
            Message::SubscribeChat { .. } => "subscribe-chat",
            Message::SubscribeAck { .. } => "subscribe-ack",
            Message::SubscribeNack { .. } => "subscribe-nack",
            Message::SyncIn { .. } => "sync-in",
            Message::SaveSession { .. } => "save-session",
            Message::SaveSessionInProgress { .. } => "save-session-in-progress",
            Message::SavedSession { .. } => "saved-session",
            Message::QueryAclAccountList { .. } => "query-acl-account-list",
            Message::AclAccountListBegin { .. } => "acl-account-list-begin",
            Message::AclAccountListEnd { .. } => "acl-account-list-end",
            Message::AddAclAccount { .. } => "add-acl-account",
            Message::RemoveAclAccount { .. } => "remove-acl-account",
            Message::LookupAclAccounts { .. } => "lookup-acl-accounts",
            Message::CreateAclAccount { .. } => "create-acl-account",
            Message::ChangeAclAccount { .. } => "change-acl-account",
            Message::QueryAcl { .. } => "query-acl",
            Message::SetAcl { .. } => "set-acl",
            Message::RequestFailed { .. } => "request-failed",
            Message::GroupMessage { .. } => "group-message",
        }
    }

    /// The client-chosen request seq, where the element carries one.
    pub fn seq(&self) -> Option<Seq> {
        match self {
            Message::ExploreNode { seq, .. }
            | Message::ExploreBegin { seq, .. }
            | Message::ExploreEnd { seq, .. }
            | Message::AddNode { seq, .. }
            | Message::RemoveNode { seq, .. }
            | Message::SubscribeSession { seq, .. }
            | Message::SubscribeChat { seq, .. }
            | Message::SyncIn { seq, .. }
            | Message::SaveSession { seq, .. }
            | Message::SaveSessionInProgress { seq, .. }
            | Message::SavedSession { seq, .. }
            | Message::QueryAclAccountList { seq, .. }
            | Message::AclAccountListBegin { seq, .. }
            | Message::AclAccountListEnd { seq, .. }
            | Message::AddAclAccount { seq, .. }
            | Message::RemoveAclAccount { seq, .. }
            | Message::LookupAclAccounts { seq, .. }
            | Message::CreateAclAccount { seq, .. }
            | Message::QueryAcl { seq, .. }
            | Message::SetAcl { seq, .. }
            | Message::RequestFailed { seq, .. } => *seq,
            _ => None,
        }
    }
}
