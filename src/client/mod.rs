//! The client-side directory mirror.
//!
//! A client keeps a read-only mirror of the part of the tree it has
//! explored, plus the chat and the account list when queried. Requests are
//! tracked in a table keyed by `seq` and finished on matching replies;
//! requests tied to a node are additionally failed when the server
//! announces the node's removal. The mirror is discarded on disconnect —
//! pending subscriptions are not re-emitted on reconnect.

pub mod mirror;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::acl::{SheetRecord, SheetSet};
use crate::plugin::{NoteSession, PluginRegistry};
use crate::proto::{
    DirectoryError, Message, NodeId, Seq, SessionFrame, WireAccount, CHAT_GROUP,
    PROTOCOL_VERSION,
};
use crate::server::CERTIFICATE_HEADER;

pub use mirror::{Mirror, MirrorNode};

/// How long the client waits for the server's welcome before giving up.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no welcome message within {WELCOME_TIMEOUT:?}")]
    NoWelcome,
    #[error("protocol version mismatch: server speaks {0}")]
    VersionMismatch(String),
    #[error("request failed: {domain}:{code}: {message}")]
    Request {
        domain: String,
        code: String,
        message: String,
    },
    #[error("disconnected")]
    Disconnected,
}

impl ClientError {
    /// The wire error code, for `request-failed` replies.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Request { code, .. } => Some(code),
            _ => None,
        }
    }

    /// A directory-domain failure raised on the client's own behalf.
    fn directory(err: DirectoryError) -> Self {
        ClientError::Request {
            domain: "directory".into(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ─── Requests in flight ──────────────────────────────────────────────────────

/// Progress of one explore reply stream. The number of `add-node` messages
/// received must match the `total` announced by `explore-begin`; either kind
/// of mismatch is a protocol error with its own code.
#[derive(Default)]
struct ExploreProgress {
    children: Vec<NodeId>,
    total: Option<u32>,
}

impl ExploreProgress {
    fn begin(&mut self, total: u32) {
        self.total = Some(total);
    }

    fn add(&mut self, id: NodeId) -> Result<(), DirectoryError> {
        if self
            .total
            .map(|t| self.children.len() as u32 >= t)
            .unwrap_or(false)
        {
            return Err(DirectoryError::TooManyChildren);
        }
        self.children.push(id);
        Ok(())
    }

    fn finish(self) -> Result<Vec<NodeId>, DirectoryError> {
        if let Some(total) = self.total {
            if (self.children.len() as u32) < total {
                return Err(DirectoryError::TooFewChildren);
            }
        }
        Ok(self.children)
    }
}

enum PendingKind {
    Explore(ExploreProgress),
    AddNode,
    Subscribe,
    SyncIn { chunks: Vec<Value>, subscribe: bool },
    RemoveNode,
    SetAcl,
    QueryAcl,
    SaveSession,
    Chat,
    AccountList { accounts: Vec<WireAccount> },
    Lookup,
    CreateAccount,
    RemoveAccount,
}

enum Reply {
    Unit,
    Node(NodeId),
    Children(Vec<NodeId>),
    Sheets(SheetSet),
    Accounts(Vec<WireAccount>),
    Certificate(String, WireAccount),
}

struct Pending {
    kind: PendingKind,
    /// Fail this request when the server announces this node's removal.
    node: Option<NodeId>,
    reply: oneshot::Sender<Result<Reply, ClientError>>,
}

enum Command {
    Request { msg: Message, pending: Pending },
    Frame { group: String, frame: SessionFrame },
    SessionText {
        node: NodeId,
        reply: oneshot::Sender<Option<String>>,
    },
    ChatLog {
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Handle to a connected directory client. Cloneable; the underlying task
/// lives until the connection drops.
#[derive(Clone)]
pub struct DirectoryClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    mirror: Arc<StdMutex<Mirror>>,
    sequence_id: u32,
    account: Option<WireAccount>,
}

impl DirectoryClient {
    pub async fn connect(url: &str, plugins: PluginRegistry) -> Result<Self, ClientError> {
        Self::connect_inner(url, plugins, None).await
    }

    /// Connect presenting a certificate for account login.
    pub async fn connect_with_certificate(
        url: &str,
        plugins: PluginRegistry,
        certificate_pem: &str,
    ) -> Result<Self, ClientError> {
        Self::connect_inner(url, plugins, Some(certificate_pem)).await
    }

    async fn connect_inner(
        url: &str,
        plugins: PluginRegistry,
        certificate_pem: Option<&str>,
    ) -> Result<Self, ClientError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if let Some(pem) = certificate_pem {
            let value = pem.replace('\n', "\\n");
            request.headers_mut().insert(
                CERTIFICATE_HEADER,
                value
                    .parse()
                    .map_err(|_| ClientError::Transport("bad certificate header".into()))?,
            );
        }
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (sink, mut stream) = ws.split();

        // The server must speak first; a missing welcome closes the
        // connection with a version-mismatch-style error.
        let welcome = tokio::time::timeout(WELCOME_TIMEOUT, stream.next())
            .await
            .map_err(|_| ClientError::NoWelcome)?
            .ok_or(ClientError::Disconnected)?
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let welcome: Message = match welcome {
            WsMessage::Text(text) => serde_json::from_str(&text)
                .map_err(|e| ClientError::Transport(e.to_string()))?,
            _ => return Err(ClientError::NoWelcome),
        };
        let Message::Welcome {
            protocol_version,
            sequence_id,
            account,
            acl,
        } = welcome
        else {
            return Err(ClientError::NoWelcome);
        };
        let server_major = protocol_version.split('.').next().unwrap_or("");
        let our_major = PROTOCOL_VERSION.split('.').next().unwrap_or("");
        if server_major != our_major {
            return Err(ClientError::VersionMismatch(protocol_version));
        }

        let mut mirror = Mirror::new();
        mirror.set_root_acl(SheetSet::from(acl));
        mirror.account = account.clone();
        let mirror = Arc::new(StdMutex::new(mirror));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = ClientTask {
            plugins,
            mirror: Arc::clone(&mirror),
            pending: HashMap::new(),
            sessions: HashMap::new(),
            chat: Vec::new(),
            next_seq: 1,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(task.run(sink, stream, cmd_rx));

        Ok(DirectoryClient {
            cmd_tx,
            mirror,
            sequence_id,
            account,
        })
    }

    /// The server-assigned connection sequence id from the welcome.
    pub fn sequence_id(&self) -> u32 {
        self.sequence_id
    }

    /// The non-default account this connection logged into, if any.
    pub fn account(&self) -> Option<&WireAccount> {
        self.account.as_ref()
    }

    /// A snapshot of the mirrored tree.
    pub fn mirror(&self) -> Mirror {
        self.mirror.lock().expect("mirror lock").clone()
    }

    async fn request(&self, msg: Message, kind: PendingKind, node: Option<NodeId>) -> Result<Reply, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                msg,
                pending: Pending {
                    kind,
                    node,
                    reply: tx,
                },
            })
            .map_err(|_| ClientError::Disconnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    pub async fn explore(&self, node: NodeId) -> Result<Vec<NodeId>, ClientError> {
        let reply = self
            .request(
                Message::ExploreNode { seq: None, id: node },
                PendingKind::Explore(ExploreProgress::default()),
                Some(node),
            )
            .await?;
        match reply {
            Reply::Children(children) => Ok(children),
            _ => Err(ClientError::Disconnected),
        }
    }

    pub async fn add_subdirectory(
        &self,
        parent: NodeId,
        name: &str,
    ) -> Result<NodeId, ClientError> {
        let msg = Message::AddNode {
            seq: None,
            id: None,
            parent,
            node_type: crate::tree::SUBDIRECTORY_TYPE.to_string(),
            name: name.to_string(),
            acl: Vec::new(),
            subscribe: None,
            sync_in: None,
        };
        match self.request(msg, PendingKind::AddNode, Some(parent)).await? {
            Reply::Node(id) => Ok(id),
            _ => Err(ClientError::Disconnected),
        }
    }

    pub async fn add_note(
        &self,
        parent: NodeId,
        name: &str,
        node_type: &str,
    ) -> Result<NodeId, ClientError> {
        let msg = Message::AddNode {
            seq: None,
            id: None,
            parent,
            node_type: node_type.to_string(),
            name: name.to_string(),
            acl: Vec::new(),
            subscribe: None,
            sync_in: None,
        };
        match self.request(msg, PendingKind::AddNode, Some(parent)).await? {
            Reply::Node(id) => Ok(id),
            _ => Err(ClientError::Disconnected),
        }
    }

    /// Subscribe to a note's session. Resolves once the server has
    /// synchronized the content across.
    pub async fn subscribe(&self, node: NodeId) -> Result<(), ClientError> {
        match self
            .request(
                Message::SubscribeSession {
                    seq: None,
                    id: node,
                    group: None,
                    method: None,
                },
                PendingKind::Subscribe,
                Some(node),
            )
            .await?
        {
            Reply::Unit => Ok(()),
            _ => Err(ClientError::Disconnected),
        }
    }

    /// Create a note whose initial content this client uploads.
    pub async fn sync_in(
        &self,
        parent: NodeId,
        name: &str,
        node_type: &str,
        chunks: Vec<Value>,
        subscribe: bool,
    ) -> Result<NodeId, ClientError> {
        let msg = Message::AddNode {
            seq: None,
            id: None,
            parent,
            node_type: node_type.to_string(),
            name: name.to_string(),
            acl: Vec::new(),
            subscribe: subscribe.then(crate::proto::SubscribeChild::request),
            sync_in: Some(crate::proto::SyncInChild::default()),
        };
        match self
            .request(
                msg,
                PendingKind::SyncIn { chunks, subscribe },
                Some(parent),
            )
            .await?
        {
            Reply::Node(id) => Ok(id),
            _ => Err(ClientError::Disconnected),
        }
    }

    pub async fn remove_node(&self, node: NodeId) -> Result<(), ClientError> {
        self.request(
            Message::RemoveNode { seq: None, id: node },
            PendingKind::RemoveNode,
            Some(node),
        )
        .await
        .map(|_| ())
    }

    pub async fn set_acl(&self, node: NodeId, sheets: Vec<SheetRecord>) -> Result<(), ClientError> {
        self.request(
            Message::SetAcl {
                seq: None,
                id: node,
                sheets,
            },
            PendingKind::SetAcl,
            Some(node),
        )
        .await
        .map(|_| ())
    }

    pub async fn query_acl(&self, node: NodeId) -> Result<SheetSet, ClientError> {
        match self
            .request(
                Message::QueryAcl { seq: None, id: node },
                PendingKind::QueryAcl,
                Some(node),
            )
            .await?
        {
            Reply::Sheets(sheets) => Ok(sheets),
            _ => Err(ClientError::Disconnected),
        }
    }

    pub async fn save_session(&self, node: NodeId) -> Result<(), ClientError> {
        self.request(
            Message::SaveSession { seq: None, id: node },
            PendingKind::SaveSession,
            Some(node),
        )
        .await
        .map(|_| ())
    }

    pub async fn query_account_list(&self) -> Result<Vec<WireAccount>, ClientError> {
        match self
            .request(
                Message::QueryAclAccountList { seq: None },
                PendingKind::AccountList {
                    accounts: Vec::new(),
                },
                None,
            )
            .await?
        {
            Reply::Accounts(accounts) => Ok(accounts),
            _ => Err(ClientError::Disconnected),
        }
    }

    pub async fn lookup_accounts(
        &self,
        ids: Vec<String>,
        names: Vec<String>,
    ) -> Result<Vec<WireAccount>, ClientError> {
        match self
            .request(
                Message::LookupAclAccounts {
                    seq: None,
                    ids,
                    names,
                    accounts: Vec::new(),
                },
                PendingKind::Lookup,
                None,
            )
            .await?
        {
            Reply::Accounts(accounts) => Ok(accounts),
            _ => Err(ClientError::Disconnected),
        }
    }

    /// Submit a certificate request; returns the signed PEM certificate and
    /// the created account.
    pub async fn create_account(&self, crq_pem: &str) -> Result<(String, WireAccount), ClientError> {
        match self
            .request(
                Message::CreateAclAccount {
                    seq: None,
                    crq: Some(crq_pem.to_string()),
                    certificate: None,
                    account: None,
                },
                PendingKind::CreateAccount,
                None,
            )
            .await?
        {
            Reply::Certificate(pem, account) => Ok((pem, account)),
            _ => Err(ClientError::Disconnected),
        }
    }

    pub async fn remove_account(&self, id: &str) -> Result<(), ClientError> {
        self.request(
            Message::RemoveAclAccount {
                seq: None,
                id: id.to_string(),
            },
            PendingKind::RemoveAccount,
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn subscribe_chat(&self) -> Result<(), ClientError> {
        self.request(
            Message::SubscribeChat {
                seq: None,
                group: None,
                method: None,
            },
            PendingKind::Chat,
            None,
        )
        .await
        .map(|_| ())
    }

    pub fn send_chat(&self, text: &str) -> Result<(), ClientError> {
        self.cmd_tx
            .send(Command::Frame {
                group: CHAT_GROUP.to_string(),
                frame: SessionFrame::Chat {
                    text: text.to_string(),
                    from: None,
                },
            })
            .map_err(|_| ClientError::Disconnected)
    }

    pub async fn chat_log(&self) -> Result<Vec<(String, String)>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ChatLog { reply: tx })
            .map_err(|_| ClientError::Disconnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)
    }

    /// Send a session operation on a subscribed note.
    pub fn send_op(&self, node: NodeId, op: Value) -> Result<(), ClientError> {
        self.cmd_tx
            .send(Command::Frame {
                group: crate::proto::session_group_name(node),
                frame: SessionFrame::Op { op },
            })
            .map_err(|_| ClientError::Disconnected)
    }

    /// The local replica text of a subscribed text note.
    pub async fn session_text(&self, node: NodeId) -> Result<Option<String>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SessionText { node, reply: tx })
            .map_err(|_| ClientError::Disconnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)
    }
}

// ─── Task ────────────────────────────────────────────────────────────────────

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    WsMessage,
>;
type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
>;

struct ClientTask {
    plugins: PluginRegistry,
    mirror: Arc<StdMutex<Mirror>>,
    pending: HashMap<Seq, Pending>,
    sessions: HashMap<NodeId, Box<dyn NoteSession>>,
    chat: Vec<(String, String)>,
    next_seq: Seq,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ClientTask {
    async fn run(
        mut self,
        mut sink: WsSink,
        mut stream: WsStream,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.handle_command(cmd, &mut sink).await.is_err() {
                        break;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<Message>(&text) {
                                Ok(msg) => self.handle_server(msg, &mut sink).await,
                                Err(e) => debug!(err = %e, "undecodable server frame"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        // Disconnect: the mirror is discarded and every outstanding
        // request fails.
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(ClientError::Disconnected));
        }
        self.mirror.lock().expect("mirror lock").clear();
        debug!("client task stopped");
    }

    async fn send(&self, sink: &mut WsSink, msg: Message) -> Result<(), ()> {
        let text = serde_json::to_string(&msg).map_err(|_| ())?;
        sink.send(WsMessage::Text(text)).await.map_err(|_| ())
    }

    async fn handle_command(&mut self, cmd: Command, sink: &mut WsSink) -> Result<(), ()> {
        match cmd {
            Command::Request { mut msg, pending } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                set_seq(&mut msg, seq);
                self.pending.insert(seq, pending);
                self.send(sink, msg).await
            }
            Command::Frame { group, frame } => {
                // Local echo for ops so the replica converges immediately.
                if let SessionFrame::Op { op } = &frame {
                    if let Some(node) = group
                        .strip_prefix("session/")
                        .and_then(|id| id.parse::<NodeId>().ok())
                    {
                        if let Some(session) = self.sessions.get_mut(&node) {
                            if let Err(err) = session.apply_op("local", op) {
                                warn!(node, err = %err, "local op rejected");
                                return Ok(());
                            }
                        }
                    }
                }
                self.send(sink, Message::GroupMessage { group, frame }).await
            }
            Command::SessionText { node, reply } => {
                let text = self.sessions.get(&node).and_then(|s| {
                    s.as_any()
                        .downcast_ref::<crate::text::TextNoteSession>()
                        .map(|t| t.buffer().text())
                });
                let _ = reply.send(text);
                Ok(())
            }
            Command::ChatLog { reply } => {
                let _ = reply.send(self.chat.clone());
                Ok(())
            }
        }
    }

    fn resolve(&mut self, seq: Seq, result: Result<Reply, ClientError>) {
        if let Some(pending) = self.pending.remove(&seq) {
            let _ = pending.reply.send(result);
        }
    }

    async fn handle_server(&mut self, msg: Message, sink: &mut WsSink) {
        match msg {
            Message::ExploreBegin { seq, total } => {
                let Some(seq) = seq else { return };
                if let Some(Pending {
                    kind: PendingKind::Explore(progress),
                    ..
                }) = self.pending.get_mut(&seq)
                {
                    progress.begin(total);
                }
            }
            Message::AddNode {
                seq,
                id: Some(id),
                parent,
                node_type,
                name,
                acl,
                subscribe,
                ..
            } => {
                self.mirror.lock().expect("mirror lock").add_node(
                    id,
                    parent,
                    &node_type,
                    &name,
                    SheetSet::from(acl),
                );
                if let Some(seq) = seq {
                    let mut resolve_node = false;
                    let mut explore_error = None;
                    match self.pending.get_mut(&seq) {
                        Some(Pending {
                            kind: PendingKind::Explore(progress),
                            ..
                        }) => {
                            if let Err(err) = progress.add(id) {
                                explore_error = Some(err);
                            }
                        }
                        Some(Pending {
                            kind: PendingKind::AddNode,
                            ..
                        }) => {
                            // A subscribe grant would arrive here for
                            // add-with-subscribe; plain adds resolve now.
                            resolve_node = subscribe.is_none();
                        }
                        Some(Pending {
                            kind: PendingKind::SyncIn { .. },
                            ..
                        }) => {
                            // Final confirmation: the synced node is in the
                            // directory.
                            resolve_node = true;
                        }
                        _ => {}
                    }
                    if let Some(err) = explore_error {
                        self.resolve(seq, Err(ClientError::directory(err)));
                    }
                    if resolve_node {
                        self.resolve(seq, Ok(Reply::Node(id)));
                    }
                }
            }
            Message::ExploreEnd { seq } => {
                let Some(seq) = seq else { return };
                let progress = match self.pending.get_mut(&seq) {
                    Some(Pending {
                        kind: PendingKind::Explore(progress),
                        ..
                    }) => std::mem::take(progress),
                    _ => return,
                };
                match progress.finish() {
                    Ok(children) => {
                        if let Some(id) = self.pending.get(&seq).and_then(|p| p.node) {
                            self.mirror.lock().expect("mirror lock").mark_explored(id);
                        }
                        self.resolve(seq, Ok(Reply::Children(children)));
                    }
                    Err(err) => {
                        self.resolve(seq, Err(ClientError::directory(err)));
                    }
                }
            }
            Message::RemoveNode { seq, id } => {
                // The requester's own reply resolves before the node-keyed
                // failure sweep below could swallow it.
                if let Some(seq) = seq {
                    if matches!(
                        self.pending.get(&seq).map(|p| &p.kind),
                        Some(PendingKind::RemoveNode)
                    ) {
                        self.resolve(seq, Ok(Reply::Unit));
                    }
                }
                let removed = self.mirror.lock().expect("mirror lock").remove_subtree(id);
                for node in &removed {
                    self.sessions.remove(node);
                }
                // Requests keyed to a removed node fail with no-such-node.
                let doomed: Vec<Seq> = self
                    .pending
                    .iter()
                    .filter(|(_, p)| p.node.map(|n| removed.contains(&n)).unwrap_or(false))
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in doomed {
                    self.resolve(seq, Err(ClientError::directory(DirectoryError::NoSuchNode)));
                }
            }
            Message::SubscribeSession {
                seq: Some(seq),
                id,
                ..
            } => {
                if !matches!(
                    self.pending.get(&seq).map(|p| &p.kind),
                    Some(PendingKind::Subscribe)
                ) {
                    return;
                }
                let node_type = self
                    .mirror
                    .lock()
                    .expect("mirror lock")
                    .node(id)
                    .map(|n| n.node_type.clone());
                let plugin = node_type.as_deref().and_then(|t| self.plugins.get(t));
                let Some(plugin) = plugin else {
                    self.resolve(
                        seq,
                        Err(ClientError::directory(DirectoryError::TypeUnknown(
                            node_type.unwrap_or_default(),
                        ))),
                    );
                    let _ = self.send(sink, Message::SubscribeNack { id: Some(id) }).await;
                    return;
                };
                self.sessions.insert(id, plugin.create_empty());
                let _ = self.send(sink, Message::SubscribeAck { id: Some(id) }).await;
                // Resolution happens at sync-end on the group.
            }
            Message::SubscribeChat { seq: Some(seq), .. } => {
                if matches!(
                    self.pending.get(&seq).map(|p| &p.kind),
                    Some(PendingKind::Chat)
                ) {
                    let _ = self.send(sink, Message::SubscribeAck { id: None }).await;
                    self.resolve(seq, Ok(Reply::Unit));
                }
            }
            Message::SyncIn {
                seq: Some(seq),
                id,
                parent,
                node_type,
                name,
                group,
                acl,
                ..
            } => {
                let (chunks, subscribe) = match self.pending.get_mut(&seq) {
                    Some(Pending {
                        kind: PendingKind::SyncIn { chunks, subscribe },
                        ..
                    }) => (std::mem::take(chunks), *subscribe),
                    _ => return,
                };
                // Optimistic mirror: the node exists locally from here on;
                // a synthetic remove-node converges it if the server
                // refuses to commit.
                self.mirror.lock().expect("mirror lock").add_node(
                    id,
                    parent,
                    &node_type,
                    &name,
                    SheetSet::from(acl),
                );
                if let Some(pending) = self.pending.get_mut(&seq) {
                    pending.node = Some(id);
                }
                // An uploading subscriber keeps a local replica seeded with
                // the same chunks it sends up.
                if subscribe {
                    if let Some(plugin) = self.plugins.get(&node_type) {
                        let mut session = plugin.create_empty();
                        for chunk in &chunks {
                            if let Err(err) = session.absorb_chunk(chunk) {
                                warn!(node = id, err = %err, "bad sync-in chunk");
                            }
                        }
                        self.sessions.insert(id, session);
                    }
                }
                let _ = self.send(sink, Message::SubscribeAck { id: Some(id) }).await;
                let total = chunks.len() as u32;
                let _ = self
                    .send(
                        sink,
                        Message::GroupMessage {
                            group: group.clone(),
                            frame: SessionFrame::SyncBegin { total },
                        },
                    )
                    .await;
                for data in chunks {
                    let _ = self
                        .send(
                            sink,
                            Message::GroupMessage {
                                group: group.clone(),
                                frame: SessionFrame::SyncChunk { data },
                            },
                        )
                        .await;
                }
                let _ = self
                    .send(
                        sink,
                        Message::GroupMessage {
                            group,
                            frame: SessionFrame::SyncEnd,
                        },
                    )
                    .await;
                // The pending request resolves on the final add-node reply.
            }
            Message::SetAcl { seq, id, sheets } => {
                let set = SheetSet::from(sheets);
                self.mirror
                    .lock()
                    .expect("mirror lock")
                    .apply_acl(id, &set);
                if let Some(seq) = seq {
                    match self.pending.get(&seq).map(|p| &p.kind) {
                        Some(PendingKind::QueryAcl) => {
                            self.resolve(seq, Ok(Reply::Sheets(set)))
                        }
                        Some(PendingKind::SetAcl) => self.resolve(seq, Ok(Reply::Unit)),
                        _ => {}
                    }
                }
            }
            Message::SaveSessionInProgress { .. } => {}
            Message::SavedSession { seq: Some(seq), .. } => {
                self.resolve(seq, Ok(Reply::Unit));
            }
            Message::AclAccountListBegin { .. } => {}
            Message::AddAclAccount { seq, account } => {
                match seq.and_then(|s| self.pending.get_mut(&s)) {
                    Some(Pending {
                        kind: PendingKind::AccountList { accounts },
                        ..
                    }) => accounts.push(account),
                    _ => {
                        self.mirror
                            .lock()
                            .expect("mirror lock")
                            .account_added(account);
                    }
                }
            }
            Message::AclAccountListEnd { seq: Some(seq) } => {
                let accounts = match self.pending.get_mut(&seq) {
                    Some(Pending {
                        kind: PendingKind::AccountList { accounts },
                        ..
                    }) => std::mem::take(accounts),
                    _ => return,
                };
                self.mirror
                    .lock()
                    .expect("mirror lock")
                    .set_account_list(accounts.clone());
                self.resolve(seq, Ok(Reply::Accounts(accounts)));
            }
            Message::RemoveAclAccount { seq, id } => {
                self.mirror.lock().expect("mirror lock").account_removed(&id);
                if let Some(seq) = seq {
                    if matches!(
                        self.pending.get(&seq).map(|p| &p.kind),
                        Some(PendingKind::RemoveAccount)
                    ) {
                        self.resolve(seq, Ok(Reply::Unit));
                    }
                }
            }
            Message::LookupAclAccounts {
                seq: Some(seq),
                accounts,
                ..
            } => {
                self.resolve(seq, Ok(Reply::Accounts(accounts)));
            }
            Message::CreateAclAccount {
                seq: Some(seq),
                certificate,
                account,
                ..
            } => match (certificate, account) {
                (Some(pem), Some(account)) => {
                    self.resolve(seq, Ok(Reply::Certificate(pem, account)))
                }
                _ => self.resolve(
                    seq,
                    Err(ClientError::Request {
                        domain: "request".into(),
                        code: "reply-unprocessed".into(),
                        message: "incomplete create-acl-account reply".into(),
                    }),
                ),
            },
            Message::ChangeAclAccount { account, nodes } => {
                self.mirror
                    .lock()
                    .expect("mirror lock")
                    .change_account(account, &nodes);
            }
            Message::RequestFailed {
                seq: Some(seq),
                domain,
                code,
                message,
            } => {
                self.resolve(
                    seq,
                    Err(ClientError::Request {
                        domain,
                        code,
                        message,
                    }),
                );
            }
            Message::GroupMessage { group, frame } => {
                self.handle_group_frame(group, frame).await;
            }
            other => {
                debug!(element = other.element(), "unhandled server message");
            }
        }
    }

    async fn handle_group_frame(&mut self, group: String, frame: SessionFrame) {
        if group == CHAT_GROUP {
            if let SessionFrame::Chat { text, from } = frame {
                self.chat.push((from.unwrap_or_default(), text));
            }
            return;
        }
        let Some(node) = group
            .strip_prefix("session/")
            .and_then(|id| id.parse::<NodeId>().ok())
        else {
            return;
        };
        match frame {
            SessionFrame::SyncBegin { .. } => {}
            SessionFrame::SyncChunk { data } => {
                if let Some(session) = self.sessions.get_mut(&node) {
                    if let Err(err) = session.absorb_chunk(&data) {
                        warn!(node, err = %err, "bad sync chunk");
                    }
                }
            }
            SessionFrame::SyncEnd => {
                // Resolve the subscribe that was waiting on this sync.
                let seq = self.pending.iter().find_map(|(seq, p)| {
                    (matches!(p.kind, PendingKind::Subscribe) && p.node == Some(node))
                        .then_some(*seq)
                });
                if let Some(seq) = seq {
                    self.resolve(seq, Ok(Reply::Unit));
                }
            }
            SessionFrame::Op { op } => {
                if let Some(session) = self.sessions.get_mut(&node) {
                    if let Err(err) = session.apply_op("remote", &op) {
                        warn!(node, err = %err, "remote op rejected");
                    }
                }
            }
            SessionFrame::SessionClosed => {
                self.sessions.remove(&node);
                let doomed: Vec<Seq> = self
                    .pending
                    .iter()
                    .filter(|(_, p)| p.node == Some(node))
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in doomed {
                    self.resolve(seq, Err(ClientError::directory(DirectoryError::NoSuchNode)));
                }
            }
            _ => {}
        }
    }
}

/// Stamp the client-chosen seq onto an outbound request.
fn set_seq(msg: &mut Message, new_seq: Seq) {
    match msg {
        Message::ExploreNode { seq, .. }
        | Message::AddNode { seq, .. }
        | Message::RemoveNode { seq, .. }
        | Message::SubscribeSession { seq, .. }
        | Message::SubscribeChat { seq, .. }
        | Message::SaveSession { seq, .. }
        | Message::QueryAclAccountList { seq }
        | Message::LookupAclAccounts { seq, .. }
        | Message::CreateAclAccount { seq, .. }
        | Message::RemoveAclAccount { seq, .. }
        | Message::QueryAcl { seq, .. }
        | Message::SetAcl { seq, .. } => *seq = Some(new_seq),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explore_progress_accepts_announced_total() {
        let mut progress = ExploreProgress::default();
        progress.begin(2);
        progress.add(4).unwrap();
        progress.add(7).unwrap();
        assert_eq!(progress.finish().unwrap(), vec![4, 7]);
    }

    #[test]
    fn test_explore_progress_rejects_extra_children() {
        let mut progress = ExploreProgress::default();
        progress.begin(1);
        progress.add(4).unwrap();
        assert_eq!(progress.add(7).unwrap_err(), DirectoryError::TooManyChildren);
    }

    #[test]
    fn test_explore_progress_rejects_short_streams() {
        let mut progress = ExploreProgress::default();
        progress.begin(3);
        progress.add(4).unwrap();
        assert_eq!(
            progress.finish().unwrap_err(),
            DirectoryError::TooFewChildren
        );
    }

    #[test]
    fn test_explore_progress_without_begin_is_lenient() {
        let mut progress = ExploreProgress::default();
        progress.add(4).unwrap();
        assert_eq!(progress.finish().unwrap(), vec![4]);
    }
}
