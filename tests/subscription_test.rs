//! Integration tests for the subscription handshake, session traffic,
//! sync-in, and the idle-save lifecycle.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use scribed::account::storage::FileAccountStorage;
use scribed::account::AccountRegistry;
use scribed::acl::{PermMask, Sheet, SheetRecord, SheetSet, DEFAULT_ACCOUNT};
use scribed::directory::{Directory, DirectoryEvent, DirectoryOptions};
use scribed::plugin::PluginRegistry;
use scribed::proto::{session_group_name, ConnId, Message, NodeId, SessionFrame};
use scribed::storage::{FsStorage, NodeStorage};
use scribed::text::{TextChunk, TextOperation, TextPlugin};

struct TestServer {
    events: mpsc::UnboundedSender<DirectoryEvent>,
    data: tempfile::TempDir,
}

async fn start_server(root_acl: Option<SheetSet>, idle_save: Duration) -> TestServer {
    let data = tempfile::tempdir().unwrap();
    let tree_dir = data.path().join("tree");
    std::fs::create_dir_all(&tree_dir).unwrap();
    let storage = Arc::new(FsStorage::new(&tree_dir));
    if let Some(acl) = &root_acl {
        storage.write_acl("/", acl).await.unwrap();
    }

    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(TextPlugin));
    let accounts = AccountRegistry::new(Some(Arc::new(FileAccountStorage::new(
        data.path().join("accounts.json"),
    ))));

    let (mut directory, events, rx) = Directory::new(
        DirectoryOptions {
            idle_save,
            chat_enabled: true,
        },
        plugins,
        Some(storage),
        accounts,
        None,
    );
    directory.bootstrap().await.unwrap();
    tokio::spawn(directory.run(rx));
    TestServer { events, data }
}

fn admin_root_acl() -> SheetSet {
    let mut set = SheetSet::new();
    set.insert(DEFAULT_ACCOUNT, Sheet::full(PermMask::all()));
    set
}

struct Peer {
    conn: ConnId,
    rx: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<DirectoryEvent>,
}

async fn connect(server: &TestServer) -> Peer {
    let (tx, rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    server
        .events
        .send(DirectoryEvent::Connect {
            tx,
            fingerprint: None,
            reply: reply_tx,
        })
        .unwrap();
    let conn = reply_rx.await.unwrap();
    let mut peer = Peer {
        conn,
        rx,
        events: server.events.clone(),
    };
    assert!(matches!(peer.recv().await, Message::Welcome { .. }));
    peer
}

impl Peer {
    fn send(&self, msg: Message) {
        self.events
            .send(DirectoryEvent::Frame {
                conn: self.conn,
                raw: serde_json::to_value(&msg).unwrap(),
            })
            .unwrap();
    }

    fn send_frame(&self, group: &str, frame: SessionFrame) {
        self.send(Message::GroupMessage {
            group: group.to_string(),
            frame,
        });
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("connection channel closed")
    }

    async fn recv_matching(&mut self, pred: impl Fn(&Message) -> bool) -> Message {
        for _ in 0..64 {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
        panic!("no matching message arrived");
    }

    async fn expect_failure(&mut self, code: &str, seq: Option<u32>) {
        let msg = self
            .recv_matching(|m| matches!(m, Message::RequestFailed { .. }))
            .await;
        if let Message::RequestFailed {
            code: got_code,
            seq: got_seq,
            ..
        } = msg
        {
            assert_eq!(got_code, code);
            assert_eq!(got_seq, seq);
        }
    }

    async fn explore_root(&mut self) {
        self.send(Message::ExploreNode {
            seq: Some(0),
            id: 0,
        });
        self.recv_matching(|m| matches!(m, Message::ExploreEnd { .. }))
            .await;
    }

    /// Create a plain text note under the root and return its id.
    async fn add_note(&mut self, seq: u32, name: &str) -> NodeId {
        self.send(Message::AddNode {
            seq: Some(seq),
            id: None,
            parent: 0,
            node_type: "text".into(),
            name: name.into(),
            acl: vec![],
            subscribe: None,
            sync_in: None,
        });
        match self
            .recv_matching(|m| matches!(m, Message::AddNode { seq: Some(s), .. } if *s == seq))
            .await
        {
            Message::AddNode { id: Some(id), .. } => id,
            _ => unreachable!(),
        }
    }

    /// Subscribe, ack, and consume the initial synchronization. Returns the
    /// group name.
    async fn subscribe(&mut self, seq: u32, node: NodeId) -> String {
        self.send(Message::SubscribeSession {
            seq: Some(seq),
            id: node,
            group: None,
            method: None,
        });
        let group = match self
            .recv_matching(|m| matches!(m, Message::SubscribeSession { .. }))
            .await
        {
            Message::SubscribeSession {
                group: Some(group),
                method: Some(method),
                ..
            } => {
                assert_eq!(method, "central");
                group
            }
            other => panic!("bad subscribe reply: {other:?}"),
        };
        self.send(Message::SubscribeAck { id: Some(node) });
        self.recv_matching(|m| {
            matches!(
                m,
                Message::GroupMessage {
                    frame: SessionFrame::SyncEnd,
                    ..
                }
            )
        })
        .await;
        group
    }

    fn insert_op(at: usize, text: &str, author: &str) -> serde_json::Value {
        serde_json::to_value(TextOperation::insert(
            at,
            TextChunk::from_text(text, author),
        ))
        .unwrap()
    }

    fn disconnect(&self) {
        let _ = self
            .events
            .send(DirectoryEvent::Disconnect { conn: self.conn });
    }
}

// ─── Subscribe / ack / nack ──────────────────────────────────────────────────

#[tokio::test]
async fn test_subscribe_and_ops_propagate() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut p1 = connect(&server).await;
    let mut p2 = connect(&server).await;
    p1.explore_root().await;
    p2.explore_root().await;

    let node = p1.add_note(1, "n.txt").await;
    p2.recv_matching(|m| matches!(m, Message::AddNode { .. }))
        .await;

    let group = p1.subscribe(2, node).await;
    p2.subscribe(2, node).await;

    p1.send_frame(&group, SessionFrame::Op {
        op: Peer::insert_op(0, "hi", DEFAULT_ACCOUNT),
    });

    // The other member receives the op; the sender gets no echo.
    let msg = p2
        .recv_matching(|m| {
            matches!(
                m,
                Message::GroupMessage {
                    frame: SessionFrame::Op { .. },
                    ..
                }
            )
        })
        .await;
    if let Message::GroupMessage { frame: SessionFrame::Op { op }, .. } = msg {
        assert_eq!(op["type"], "insert");
    }
}

#[tokio::test]
async fn test_double_subscribe_is_rejected() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.explore_root().await;
    let node = peer.add_note(1, "n.txt").await;
    peer.subscribe(2, node).await;

    peer.send(Message::SubscribeSession {
        seq: Some(3),
        id: node,
        group: None,
        method: None,
    });
    peer.expect_failure("already-subscribed", Some(3)).await;
}

#[tokio::test]
async fn test_subscribe_nack_fails_request() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.explore_root().await;
    let node = peer.add_note(1, "n.txt").await;

    peer.send(Message::SubscribeSession {
        seq: Some(2),
        id: node,
        group: None,
        method: None,
    });
    peer.recv_matching(|m| matches!(m, Message::SubscribeSession { .. }))
        .await;
    peer.send(Message::SubscribeNack { id: Some(node) });
    peer.expect_failure("subscription-rejected", Some(2)).await;

    // The teardown left the note subscribable.
    peer.subscribe(3, node).await;
}

#[tokio::test]
async fn test_ack_after_node_removal_closes_gracefully() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut p1 = connect(&server).await;
    let mut p2 = connect(&server).await;
    p1.explore_root().await;
    p2.explore_root().await;

    let node = p1.add_note(1, "n.txt").await;
    p2.recv_matching(|m| matches!(m, Message::AddNode { .. }))
        .await;

    p1.send(Message::SubscribeSession {
        seq: Some(2),
        id: node,
        group: None,
        method: None,
    });
    p1.recv_matching(|m| matches!(m, Message::SubscribeSession { .. }))
        .await;

    // The node vanishes between reply and ack.
    p2.send(Message::RemoveNode { seq: Some(1), id: node });
    p2.recv_matching(|m| matches!(m, Message::RemoveNode { .. }))
        .await;

    p1.send(Message::SubscribeAck { id: Some(node) });
    p1.recv_matching(|m| {
        matches!(
            m,
            Message::GroupMessage {
                frame: SessionFrame::SessionClosed,
                ..
            }
        )
    })
    .await;
    p1.expect_failure("no-such-node", Some(2)).await;
}

#[tokio::test]
async fn test_unknown_ack_is_an_error() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.send(Message::SubscribeAck { id: Some(999) });
    peer.expect_failure("no-such-subscription-request", None).await;
}

// ─── Chat ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_subscription_and_fanout() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut p1 = connect(&server).await;
    let mut p2 = connect(&server).await;

    for p in [&mut p1, &mut p2] {
        p.send(Message::SubscribeChat {
            seq: Some(1),
            group: None,
            method: None,
        });
        p.recv_matching(|m| matches!(m, Message::SubscribeChat { .. }))
            .await;
        p.send(Message::SubscribeAck { id: None });
    }

    p1.send_frame(
        "chat",
        SessionFrame::Chat {
            text: "hello".into(),
            from: None,
        },
    );
    let msg = p2
        .recv_matching(|m| {
            matches!(
                m,
                Message::GroupMessage {
                    frame: SessionFrame::Chat { .. },
                    ..
                }
            )
        })
        .await;
    if let Message::GroupMessage {
        frame: SessionFrame::Chat { text, from },
        ..
    } = msg
    {
        assert_eq!(text, "hello");
        assert_eq!(from.as_deref(), Some(DEFAULT_ACCOUNT));
    }
}

// ─── Idle save ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idle_save_writes_back_and_drops_session() {
    let server = start_server(None, Duration::from_millis(200)).await;
    let mut peer = connect(&server).await;
    peer.explore_root().await;
    let node = peer.add_note(1, "n.txt").await;
    let group = peer.subscribe(2, node).await;

    peer.send_frame(&group, SessionFrame::Op {
        op: Peer::insert_op(0, "hi", DEFAULT_ACCOUNT),
    });
    peer.send_frame(&group, SessionFrame::Unsubscribe);
    peer.recv_matching(|m| {
        matches!(
            m,
            Message::GroupMessage {
                frame: SessionFrame::SessionClosed,
                ..
            }
        )
    })
    .await;

    // The idle timer fires and the content lands in storage.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let raw = std::fs::read_to_string(server.data.path().join("tree/n.txt.note")).unwrap();
    let wrapper: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(wrapper["plugin"], "text");
    use base64::Engine as _;
    let content = base64::engine::general_purpose::STANDARD
        .decode(wrapper["content"].as_str().unwrap())
        .unwrap();
    assert!(String::from_utf8(content).unwrap().contains("hi"));

    // A fresh subscribe reloads from storage and synchronizes the content.
    peer.send(Message::SubscribeSession {
        seq: Some(3),
        id: node,
        group: None,
        method: None,
    });
    peer.recv_matching(|m| matches!(m, Message::SubscribeSession { .. }))
        .await;
    peer.send(Message::SubscribeAck { id: Some(node) });
    let chunk = peer
        .recv_matching(|m| {
            matches!(
                m,
                Message::GroupMessage {
                    frame: SessionFrame::SyncChunk { .. },
                    ..
                }
            )
        })
        .await;
    if let Message::GroupMessage {
        frame: SessionFrame::SyncChunk { data },
        ..
    } = chunk
    {
        assert_eq!(data["text"], "hi");
    }
}

// ─── Sync-in ─────────────────────────────────────────────────────────────────

fn sync_in_request(seq: u32, name: &str, subscribe: bool) -> Message {
    Message::AddNode {
        seq: Some(seq),
        id: None,
        parent: 0,
        node_type: "text".into(),
        name: name.into(),
        acl: vec![],
        subscribe: subscribe.then(scribed::proto::SubscribeChild::request),
        sync_in: Some(scribed::proto::SyncInChild::default()),
    }
}

#[tokio::test]
async fn test_sync_in_uploads_initial_content() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.explore_root().await;

    peer.send(sync_in_request(3, "up.txt", true));
    let (node, group) = match peer
        .recv_matching(|m| matches!(m, Message::SyncIn { .. }))
        .await
    {
        Message::SyncIn {
            seq, id, group, ..
        } => {
            assert_eq!(seq, Some(3));
            (id, group)
        }
        _ => unreachable!(),
    };
    assert_eq!(group, session_group_name(node));

    peer.send(Message::SubscribeAck { id: Some(node) });
    peer.send_frame(&group, SessionFrame::SyncBegin { total: 1 });
    peer.send_frame(
        &group,
        SessionFrame::SyncChunk {
            data: json!({ "author": "default", "text": "uploaded" }),
        },
    );
    peer.send_frame(&group, SessionFrame::SyncEnd);

    // Completion: the node enters the directory and the request finishes.
    let reply = peer
        .recv_matching(|m| matches!(m, Message::AddNode { seq: Some(3), .. }))
        .await;
    if let Message::AddNode { id, name, .. } = reply {
        assert_eq!(id, Some(node));
        assert_eq!(name, "up.txt");
    }

    // Content was stored.
    let raw = std::fs::read_to_string(server.data.path().join("tree/up.txt.note")).unwrap();
    assert!(raw.contains("text"));

    // Another peer sees the uploaded content on subscribe.
    let mut p2 = connect(&server).await;
    p2.explore_root().await;
    p2.subscribe(1, node).await;
}

#[tokio::test]
async fn test_sync_in_nack_commits_nothing() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.explore_root().await;

    peer.send(sync_in_request(4, "never.txt", false));
    let node = match peer
        .recv_matching(|m| matches!(m, Message::SyncIn { .. }))
        .await
    {
        Message::SyncIn { id, .. } => id,
        _ => unreachable!(),
    };
    peer.send(Message::SubscribeNack { id: Some(node) });
    peer.expect_failure("subscription-rejected", Some(4)).await;

    assert!(!server.data.path().join("tree/never.txt.note").exists());
}

#[tokio::test]
async fn test_sync_in_denied_mid_flight_is_not_committed() {
    let server = start_server(Some(admin_root_acl()), Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    let mut admin = connect(&server).await;
    peer.explore_root().await;

    peer.send(sync_in_request(3, "contested.txt", true));
    let (node, group) = match peer
        .recv_matching(|m| matches!(m, Message::SyncIn { .. }))
        .await
    {
        Message::SyncIn { id, group, .. } => (id, group),
        _ => unreachable!(),
    };
    peer.send(Message::SubscribeAck { id: Some(node) });
    peer.send_frame(&group, SessionFrame::SyncBegin { total: 1 });
    peer.send_frame(
        &group,
        SessionFrame::SyncChunk {
            data: json!({ "author": "default", "text": "contested" }),
        },
    );

    // An administrator revokes can-add-document before the sync finishes.
    admin.send(Message::SetAcl {
        seq: Some(1),
        id: 0,
        sheets: vec![SheetRecord::new(
            DEFAULT_ACCOUNT,
            Sheet::new(PermMask::ADD_DOCUMENT, PermMask::empty()),
        )],
    });
    admin
        .recv_matching(|m| matches!(m, Message::SetAcl { seq: Some(1), .. }))
        .await;

    // The sync completes at the network layer, but the directory refuses
    // to commit: the request fails and the optimistic mirror converges via
    // a synthetic remove-node.
    peer.send_frame(&group, SessionFrame::SyncEnd);
    peer.expect_failure("not-authorized", Some(3)).await;
    peer.recv_matching(
        |m| matches!(m, Message::RemoveNode { seq: None, id } if *id == node),
    )
    .await;

    assert!(!server.data.path().join("tree/contested.txt.note").exists());
}

// ─── Disconnect teardown ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_disconnect_tears_down_open_subreqs() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut p1 = connect(&server).await;
    p1.explore_root().await;
    let node = p1.add_note(1, "n.txt").await;

    p1.send(Message::SubscribeSession {
        seq: Some(2),
        id: node,
        group: None,
        method: None,
    });
    p1.recv_matching(|m| matches!(m, Message::SubscribeSession { .. }))
        .await;
    p1.disconnect();

    // The reserved proxy died with the connection; a fresh peer can
    // subscribe from cold.
    let mut p2 = connect(&server).await;
    p2.explore_root().await;
    p2.subscribe(1, node).await;
}
