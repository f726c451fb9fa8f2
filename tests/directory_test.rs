//! Integration tests for the directory core: exploration, node creation,
//! ACLs, and the account registry. Peers talk to the directory task
//! through its event channel, exactly as connection tasks do.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use scribed::account::cert::CertificateRequest;
use scribed::account::storage::FileAccountStorage;
use scribed::account::AccountRegistry;
use scribed::acl::{PermMask, Sheet, SheetRecord, SheetSet, DEFAULT_ACCOUNT};
use scribed::directory::{Directory, DirectoryEvent, DirectoryOptions};
use scribed::plugin::PluginRegistry;
use scribed::proto::{ConnId, Message, NodeId};
use scribed::storage::{FsStorage, NodeStorage};
use scribed::text::{TextBuffer, TextChunk, TextNoteSession, TextPlugin};
use scribed::tree::SUBDIRECTORY_TYPE;

// ─── Harness ─────────────────────────────────────────────────────────────────

struct TestServer {
    events: mpsc::UnboundedSender<DirectoryEvent>,
    data: tempfile::TempDir,
}

impl TestServer {
    fn storage(&self) -> FsStorage {
        FsStorage::new(self.data.path().join("tree"))
    }
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
    let signing_key = Some(ed25519_dalek::SigningKey::generate(&mut rand_core::OsRng));

    let (mut directory, events, rx) = Directory::new(
        DirectoryOptions {
            idle_save,
            chat_enabled: true,
        },
        plugins,
        Some(storage),
        accounts,
        signing_key,
    );
    directory.bootstrap().await.unwrap();
    tokio::spawn(directory.run(rx));
    TestServer { events, data }
}

/// Root ACL granting the default account every permission.
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
    match peer.recv().await {
        Message::Welcome { sequence_id, .. } => assert_eq!(sequence_id, conn),
        other => panic!("expected welcome, got {other:?}"),
    }
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

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("connection channel closed")
    }

    /// Skip unrelated traffic until `pred` matches.
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
}

fn explore(seq: u32, id: NodeId) -> Message {
    Message::ExploreNode { seq: Some(seq), id }
}

fn add_node(seq: u32, parent: NodeId, node_type: &str, name: &str) -> Message {
    Message::AddNode {
        seq: Some(seq),
        id: None,
        parent,
        node_type: node_type.to_string(),
        name: name.to_string(),
        acl: Vec::new(),
        subscribe: None,
        sync_in: None,
    }
}

fn sheet_record(account: &str, mask: PermMask, perms: PermMask) -> SheetRecord {
    SheetRecord::new(account, Sheet::new(mask, perms))
}

// ─── Exploration ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_explore_root_lists_stored_children() {
    let server = start_server(None, Duration::from_secs(60)).await;

    // Seed storage with a subdirectory and a note before any client looks.
    let storage = server.storage();
    storage.create_subdirectory("/a").await.unwrap();
    let note = TextNoteSession::from_buffer(TextBuffer::from_chunk(TextChunk::from_text(
        "seed", "default",
    )));
    storage
        .session_write("/b.txt", &note, &TextPlugin)
        .await
        .unwrap();

    let mut peer = connect(&server).await;
    peer.send(explore(7, 0));

    match peer.recv().await {
        Message::ExploreBegin { seq, total } => {
            assert_eq!(seq, Some(7));
            assert_eq!(total, 2);
        }
        other => panic!("expected explore-begin, got {other:?}"),
    }

    let mut seen = Vec::new();
    for _ in 0..2 {
        match peer.recv().await {
            Message::AddNode {
                seq,
                id: Some(id),
                parent,
                node_type,
                name,
                ..
            } => {
                assert_eq!(seq, Some(7));
                assert_eq!(parent, 0);
                assert!(id > 0);
                seen.push((name, node_type));
            }
            other => panic!("expected add-node, got {other:?}"),
        }
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("a".to_string(), SUBDIRECTORY_TYPE.to_string()),
            ("b.txt".to_string(), "text".to_string()),
        ]
    );

    assert!(matches!(
        peer.recv().await,
        Message::ExploreEnd { seq: Some(7) }
    ));

    // Exploring twice is an error.
    peer.send(explore(8, 0));
    peer.expect_failure("already-explored", Some(8)).await;
}

#[tokio::test]
async fn test_explore_child_requires_parent_explored() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let storage = server.storage();
    storage.create_subdirectory("/a").await.unwrap();

    let mut p1 = connect(&server).await;
    p1.send(explore(1, 0));
    let begin = p1
        .recv_matching(|m| matches!(m, Message::ExploreBegin { .. }))
        .await;
    assert!(matches!(begin, Message::ExploreBegin { total: 1, .. }));
    let child = match p1.recv().await {
        Message::AddNode { id: Some(id), .. } => id,
        other => panic!("expected add-node, got {other:?}"),
    };
    p1.recv_matching(|m| matches!(m, Message::ExploreEnd { .. }))
        .await;

    // A second connection that never explored the root cannot jump
    // straight to the child, even though it knows the id.
    let mut p2 = connect(&server).await;
    p2.send(explore(2, child));
    p2.expect_failure("not-initiated", Some(2)).await;
}

// ─── Node creation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_add_subdirectory_race_second_loses() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut p1 = connect(&server).await;
    let mut p2 = connect(&server).await;

    for p in [&mut p1, &mut p2] {
        p.send(explore(0, 0));
        p.recv_matching(|m| matches!(m, Message::ExploreEnd { .. }))
            .await;
    }

    p1.send(add_node(1, 0, SUBDIRECTORY_TYPE, "x"));
    p2.send(add_node(1, 0, SUBDIRECTORY_TYPE, "x"));

    // Winner: a reply carrying its seq.
    match p1.recv().await {
        Message::AddNode {
            seq, id: Some(_), name, ..
        } => {
            assert_eq!(seq, Some(1));
            assert_eq!(name, "x");
        }
        other => panic!("expected add-node reply, got {other:?}"),
    }

    // Loser: the winner's announcement (no seq) plus its own failure.
    let announce = p2
        .recv_matching(|m| matches!(m, Message::AddNode { .. }))
        .await;
    assert!(matches!(announce, Message::AddNode { seq: None, .. }));
    p2.expect_failure("node-exists", Some(1)).await;
}

#[tokio::test]
async fn test_name_validation() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.send(explore(0, 0));
    peer.recv_matching(|m| matches!(m, Message::ExploreEnd { .. }))
        .await;

    peer.send(add_node(1, 0, SUBDIRECTORY_TYPE, "   "));
    peer.expect_failure("invalid-name", Some(1)).await;

    peer.send(add_node(2, 0, SUBDIRECTORY_TYPE, "a/b"));
    peer.expect_failure("invalid-name", Some(2)).await;

    // Case-insensitive collision.
    peer.send(add_node(3, 0, SUBDIRECTORY_TYPE, "Foo"));
    peer.recv_matching(|m| matches!(m, Message::AddNode { .. }))
        .await;
    peer.send(add_node(4, 0, SUBDIRECTORY_TYPE, "foo"));
    peer.expect_failure("node-exists", Some(4)).await;

    // Unknown note types are refused.
    peer.send(add_node(5, 0, "spreadsheet", "calc"));
    peer.expect_failure("type-unknown", Some(5)).await;
}

#[tokio::test]
async fn test_remove_root_is_refused() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.send(Message::RemoveNode {
        seq: Some(9),
        id: 0,
    });
    peer.expect_failure("root-node-remove-attempt", Some(9)).await;
}

#[tokio::test]
async fn test_remove_node_announces_and_clears_storage() {
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut p1 = connect(&server).await;
    let mut p2 = connect(&server).await;
    for p in [&mut p1, &mut p2] {
        p.send(explore(0, 0));
        p.recv_matching(|m| matches!(m, Message::ExploreEnd { .. }))
            .await;
    }

    p1.send(add_node(1, 0, "text", "doomed.txt"));
    let id = match p1.recv().await {
        Message::AddNode { id: Some(id), .. } => id,
        other => panic!("expected add-node, got {other:?}"),
    };
    p2.recv_matching(|m| matches!(m, Message::AddNode { .. }))
        .await;

    p1.send(Message::RemoveNode { seq: Some(2), id });
    assert!(matches!(
        p1.recv().await,
        Message::RemoveNode { seq: Some(2), .. }
    ));
    assert!(matches!(
        p2.recv_matching(|m| matches!(m, Message::RemoveNode { .. }))
            .await,
        Message::RemoveNode { seq: None, .. }
    ));

    // Storage agrees.
    let entries = server.storage().read_subdirectory("/").await.unwrap();
    assert!(entries.is_empty());
}

// ─── ACL ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_query_acl_denied_without_permission() {
    // The stock root ACL does not grant can-query-acl.
    let server = start_server(None, Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.send(Message::QueryAcl {
        seq: Some(9),
        id: 0,
    });
    let msg = peer
        .recv_matching(|m| matches!(m, Message::RequestFailed { .. }))
        .await;
    match msg {
        Message::RequestFailed {
            seq,
            domain,
            code,
            message,
        } => {
            assert_eq!(seq, Some(9));
            assert_eq!(domain, "request");
            assert_eq!(code, "not-authorized");
            assert_eq!(message, "Permission denied");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_set_acl_and_query_round_trip() {
    let server = start_server(Some(admin_root_acl()), Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.send(explore(0, 0));
    peer.recv_matching(|m| matches!(m, Message::ExploreEnd { .. }))
        .await;

    peer.send(add_node(1, 0, SUBDIRECTORY_TYPE, "docs"));
    let id = match peer.recv().await {
        Message::AddNode { id: Some(id), .. } => id,
        other => panic!("expected add-node, got {other:?}"),
    };

    // Full disclosure requires query-acl first.
    peer.send(Message::QueryAcl { seq: Some(2), id });
    assert!(matches!(
        peer.recv().await,
        Message::SetAcl { seq: Some(2), .. }
    ));

    peer.send(Message::SetAcl {
        seq: Some(3),
        id,
        sheets: vec![sheet_record(
            DEFAULT_ACCOUNT,
            PermMask::EXPLORE_NODE,
            PermMask::empty(),
        )],
    });
    let reply = peer
        .recv_matching(|m| matches!(m, Message::SetAcl { seq: Some(3), .. }))
        .await;
    if let Message::SetAcl { sheets, .. } = reply {
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].account, DEFAULT_ACCOUNT);
    }

    // Querying twice is an error.
    peer.send(Message::QueryAcl { seq: Some(4), id });
    peer.expect_failure("acl-already-queried", Some(4)).await;

    // Storage round-trips the sheet set.
    let stored = server.storage().read_acl("/docs").await.unwrap();
    assert!(stored.get(DEFAULT_ACCOUNT).is_some());
}

#[tokio::test]
async fn test_set_acl_unknown_account_rejected() {
    let server = start_server(Some(admin_root_acl()), Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.send(Message::SetAcl {
        seq: Some(1),
        id: 0,
        sheets: vec![sheet_record(
            "nobody",
            PermMask::EXPLORE_NODE,
            PermMask::EXPLORE_NODE,
        )],
    });
    peer.expect_failure("no-such-account", Some(1)).await;
}

// ─── Accounts ────────────────────────────────────────────────────────────────

fn test_crq(name: &str) -> String {
    CertificateRequest {
        name: name.to_string(),
        public_key: hex::encode([9u8; 32]),
    }
    .to_pem()
}

#[tokio::test]
async fn test_create_account_and_list() {
    let server = start_server(Some(admin_root_acl()), Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;

    peer.send(Message::CreateAclAccount {
        seq: Some(1),
        crq: Some(test_crq("alice")),
        certificate: None,
        account: None,
    });
    let reply = peer
        .recv_matching(|m| matches!(m, Message::CreateAclAccount { .. }))
        .await;
    let alice = match reply {
        Message::CreateAclAccount {
            seq,
            certificate: Some(pem),
            account: Some(account),
            ..
        } => {
            assert_eq!(seq, Some(1));
            assert!(pem.contains("BEGIN SCRIBE CERTIFICATE"));
            assert_eq!(account.name.as_deref(), Some("alice"));
            account
        }
        other => panic!("incomplete create reply: {other:?}"),
    };

    // Duplicate names are refused.
    peer.send(Message::CreateAclAccount {
        seq: Some(2),
        crq: Some(test_crq("alice")),
        certificate: None,
        account: None,
    });
    peer.expect_failure("duplicate-account", Some(2)).await;

    peer.send(Message::QueryAclAccountList { seq: Some(3) });
    let begin = peer
        .recv_matching(|m| matches!(m, Message::AclAccountListBegin { .. }))
        .await;
    // default + alice
    assert!(matches!(
        begin,
        Message::AclAccountListBegin { total: 2, .. }
    ));
    let mut ids = Vec::new();
    loop {
        match peer.recv().await {
            Message::AddAclAccount { account, .. } => ids.push(account.id),
            Message::AclAccountListEnd { .. } => break,
            other => panic!("unexpected in account list: {other:?}"),
        }
    }
    assert!(ids.contains(&alice.id));
    assert!(ids.contains(&DEFAULT_ACCOUNT.to_string()));

    peer.send(Message::LookupAclAccounts {
        seq: Some(4),
        ids: vec![],
        names: vec!["alice".into()],
        accounts: vec![],
    });
    let reply = peer
        .recv_matching(|m| matches!(m, Message::LookupAclAccounts { .. }))
        .await;
    if let Message::LookupAclAccounts { accounts, .. } = reply {
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, alice.id);
    }
}

#[tokio::test]
async fn test_account_notifications_follow_permission_changes() {
    let server = start_server(Some(admin_root_acl()), Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;

    // Querying the list switches notifications on.
    peer.send(Message::QueryAclAccountList { seq: Some(1) });
    peer.recv_matching(|m| matches!(m, Message::AclAccountListEnd { .. }))
        .await;

    // Revoke and then re-grant the account-list permission; the
    // enforcement pass must track both changes.
    peer.send(Message::SetAcl {
        seq: Some(2),
        id: 0,
        sheets: vec![sheet_record(
            DEFAULT_ACCOUNT,
            PermMask::QUERY_ACCOUNT_LIST,
            PermMask::empty(),
        )],
    });
    peer.recv_matching(|m| matches!(m, Message::SetAcl { seq: Some(2), .. }))
        .await;
    peer.send(Message::SetAcl {
        seq: Some(3),
        id: 0,
        sheets: vec![sheet_record(
            DEFAULT_ACCOUNT,
            PermMask::QUERY_ACCOUNT_LIST,
            PermMask::QUERY_ACCOUNT_LIST,
        )],
    });
    peer.recv_matching(|m| matches!(m, Message::SetAcl { seq: Some(3), .. }))
        .await;

    // A new account now reaches this connection as a notification again.
    peer.send(Message::CreateAclAccount {
        seq: Some(4),
        crq: Some(test_crq("carol")),
        certificate: None,
        account: None,
    });
    peer.recv_matching(|m| matches!(m, Message::CreateAclAccount { .. }))
        .await;
    let announced = peer
        .recv_matching(|m| matches!(m, Message::AddAclAccount { seq: None, .. }))
        .await;
    if let Message::AddAclAccount { account, .. } = announced {
        assert_eq!(account.name.as_deref(), Some("carol"));
    }
}

#[tokio::test]
async fn test_remove_default_account_is_refused() {
    let server = start_server(Some(admin_root_acl()), Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.send(Message::RemoveAclAccount {
        seq: Some(1),
        id: DEFAULT_ACCOUNT.to_string(),
    });
    peer.expect_failure("no-such-account", Some(1)).await;
}

#[tokio::test]
async fn test_account_removal_strips_sheets_everywhere() {
    let server = start_server(Some(admin_root_acl()), Duration::from_secs(60)).await;
    let mut peer = connect(&server).await;
    peer.send(explore(0, 0));
    peer.recv_matching(|m| matches!(m, Message::ExploreEnd { .. }))
        .await;

    // Create alice and give her sheets on two nodes.
    peer.send(Message::CreateAclAccount {
        seq: Some(1),
        crq: Some(test_crq("alice")),
        certificate: None,
        account: None,
    });
    let alice = match peer
        .recv_matching(|m| matches!(m, Message::CreateAclAccount { .. }))
        .await
    {
        Message::CreateAclAccount {
            account: Some(account),
            ..
        } => account,
        _ => unreachable!(),
    };

    let mut nodes = Vec::new();
    for (seq, name) in [(2u32, "one"), (3u32, "two")] {
        peer.send(add_node(seq, 0, SUBDIRECTORY_TYPE, name));
        match peer
            .recv_matching(|m| matches!(m, Message::AddNode { .. }))
            .await
        {
            Message::AddNode { id: Some(id), .. } => nodes.push(id),
            _ => unreachable!(),
        }
    }
    for (i, node) in nodes.iter().enumerate() {
        // Query first so the full sheet set (and later the erasure) is
        // disclosed to this connection.
        peer.send(Message::QueryAcl {
            seq: Some(10 + i as u32),
            id: *node,
        });
        peer.recv_matching(|m| matches!(m, Message::SetAcl { .. }))
            .await;
        peer.send(Message::SetAcl {
            seq: Some(20 + i as u32),
            id: *node,
            sheets: vec![sheet_record(
                &alice.id,
                PermMask::EXPLORE_NODE,
                PermMask::EXPLORE_NODE,
            )],
        });
        peer.recv_matching(|m| matches!(m, Message::SetAcl { seq: Some(s), .. } if *s == 20 + i as u32))
            .await;
    }
    // Enable removal notifications.
    peer.send(Message::QueryAclAccountList { seq: Some(30) });
    peer.recv_matching(|m| matches!(m, Message::AclAccountListEnd { .. }))
        .await;

    peer.send(Message::RemoveAclAccount {
        seq: Some(31),
        id: alice.id.clone(),
    });

    // Reply, per-node erasure announcements, and the removal notification.
    peer.recv_matching(
        |m| matches!(m, Message::RemoveAclAccount { seq: Some(31), .. }),
    )
    .await;
    let mut erased = Vec::new();
    for _ in 0..2 {
        let msg = peer
            .recv_matching(|m| matches!(m, Message::SetAcl { seq: None, .. }))
            .await;
        if let Message::SetAcl { id, sheets, .. } = msg {
            assert_eq!(sheets.len(), 1);
            assert_eq!(sheets[0].account, alice.id);
            assert_eq!(sheets[0].mask, 0, "erasure sheets carry an empty mask");
            erased.push(id);
        }
    }
    erased.sort_unstable();
    let mut expected = nodes.clone();
    expected.sort_unstable();
    assert_eq!(erased, expected);

    // Stored ACLs no longer reference alice.
    for name in ["one", "two"] {
        let stored = server
            .storage()
            .read_acl(&format!("/{name}"))
            .await
            .unwrap();
        assert!(stored.get(&alice.id).is_none());
    }
    // And the account itself is gone.
    let accounts = std::fs::read_to_string(server.data.path().join("accounts.json")).unwrap();
    assert!(!accounts.contains(&alice.id));
}
