//! End-to-end behaviour of workspaces across peers, storage and projections.

use std::sync::Arc;
use std::time::Duration;

use epicenter_core::crdt::{
    EpochCoordinator, MemoryStorage, PersistenceProvider, Row, TableDefinition, WorkspaceDocument,
    cells,
};
use epicenter_core::index::{FileOutcome, MarkdownIndex};
use epicenter_core::sync::{SyncMessage, SyncPeer, SyncReply};
use epicenter_core::{ActionResult, ErrorKind, Field, Value, Workspace};

fn posts_definition() -> TableDefinition {
    TableDefinition::new("Posts")
        .field("title", Field::text())
        .field("body", Field::long_text().with_default(Value::text("")))
        .field("views", Field::number().with_default(Value::Number(0.0)))
}

/// Exchange full states so both documents hold everything either has.
fn merge(a: &WorkspaceDocument, b: &WorkspaceDocument) {
    let from_a = a.encode_state_as_update();
    let from_b = b.encode_state_as_update();
    a.apply_update(&from_b).unwrap();
    b.apply_update(&from_a).unwrap();
}

#[test]
fn concurrent_table_creation_keeps_both_tables() {
    let a = WorkspaceDocument::new("blog", 0);
    let b = WorkspaceDocument::new("blog", 0);

    let left = a.tables().create("Posts", None, "").unwrap();
    let right = b.tables().create("Posts", None, "").unwrap();
    assert_ne!(left.id(), right.id());
    merge(&a, &b);

    for document in [&a, &b] {
        let names: Vec<String> = document.tables().list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["Posts".to_string(), "Posts".to_string()]);
    }
}

#[test]
fn concurrent_row_creation_loses_nothing() {
    let a = WorkspaceDocument::new("blog", 0);
    let b = WorkspaceDocument::new("blog", 0);
    let posts_a = a.tables().define("posts", &posts_definition()).unwrap();
    let posts_b = b.tables().define("posts", &posts_definition()).unwrap();

    for i in 0..10 {
        posts_a
            .upsert(Row::new(cells([("title", Value::text(format!("a{}", i)))])))
            .unwrap();
        posts_b
            .upsert(Row::new(cells([("title", Value::text(format!("b{}", i)))])))
            .unwrap();
    }
    merge(&a, &b);

    assert_eq!(posts_a.count(), 20);
    assert_eq!(posts_b.count(), 20);
    assert_eq!(posts_a.get_all(), posts_b.get_all());
}

#[test]
fn corrupt_snapshot_opens_empty() {
    let storage = MemoryStorage::new();
    storage.save("blog", &[0xff, 0x13, 0x37]).unwrap();
    storage.save("blog-0", &[0x01, 0x02]).unwrap();

    let workspace = Workspace::open("blog", Arc::new(storage), "laptop");
    assert_eq!(workspace.epoch(), 0);
    assert!(workspace.tables().list().is_empty());

    // The empty document is fully usable.
    let posts = workspace.tables().define("posts", &posts_definition()).unwrap();
    posts
        .upsert(Row::with_id("p1", cells([("title", Value::text("Fresh"))])))
        .unwrap();
    assert!(posts.has("p1"));
}

#[test]
fn effective_epoch_is_max_of_all_peers() {
    let peers: Vec<EpochCoordinator> = ["a", "b", "c"]
        .into_iter()
        .map(|peer| EpochCoordinator::new("blog", peer))
        .collect();
    peers[0].propose(1);
    peers[1].propose(3);
    peers[2].propose(2);

    for i in 0..peers.len() {
        for j in 0..peers.len() {
            if i != j {
                merge(peers[i].document(), peers[j].document());
            }
        }
    }

    for peer in &peers {
        assert_eq!(peer.current(), 3);
        // A late, lower proposal cannot pull the epoch back.
        assert_eq!(peer.propose(2), 3);
    }
}

#[test]
fn reference_to_deleted_row_is_not_found() {
    let document = WorkspaceDocument::new("blog", 0);
    let tables = document.tables();
    let posts = tables.define("posts", &posts_definition()).unwrap();
    let comments = tables
        .define(
            "comments",
            &TableDefinition::new("Comments")
                .field("post", Field::reference("posts"))
                .field("text", Field::text()),
        )
        .unwrap();

    posts
        .upsert(Row::with_id("p1", cells([("title", Value::text("Hello"))])))
        .unwrap();
    comments
        .upsert(Row::with_id(
            "c1",
            cells([("post", Value::text("p1")), ("text", Value::text("Nice"))]),
        ))
        .unwrap();
    posts.delete("p1").unwrap();

    let comment = comments.get("c1").unwrap();
    let target = comment.get("post").and_then(Value::as_str).unwrap();
    assert_eq!(target, "p1");

    let lookup: ActionResult<Row> = posts.get(target).into();
    assert_eq!(lookup.error_kind(), Some(ErrorKind::NotFound));
}

#[test]
fn validation_errors_cross_the_action_boundary_tagged() {
    let document = WorkspaceDocument::new("blog", 0);
    let posts = document.tables().define("posts", &posts_definition()).unwrap();

    let result: ActionResult<()> = posts
        .upsert(Row::with_id("p1", cells([("title", Value::Number(1.0))])))
        .into();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["status"], "err");
    assert_eq!(json["kind"], "validation");
    assert!(!posts.has("p1"));

    let ok = ActionResult::from(epicenter_core::Result::Ok(posts.count()));
    assert_eq!(serde_json::to_value(&ok).unwrap()["value"], 0);
}

#[test]
fn sync_handshake_over_peers_converges() {
    let a = WorkspaceDocument::new("blog", 0);
    let b = WorkspaceDocument::new("blog", 0);
    a.tables()
        .define("posts", &posts_definition())
        .unwrap()
        .upsert(Row::with_id("p1", cells([("title", Value::text("From A"))])))
        .unwrap();

    let peer_a = SyncPeer::new(a.clone());
    let peer_b = SyncPeer::new(b.clone());

    // Both sides open with step1 and answer the other's step1 with step2.
    for (from, to) in [(&peer_a, &peer_b), (&peer_b, &peer_a)] {
        let wire = from.step1().encode();
        let (step1, _) = SyncMessage::decode(&wire).unwrap();
        let SyncReply::Reply(step2) = to.handle(&step1).unwrap() else {
            panic!("step1 must be answered");
        };
        from.handle(&step2).unwrap();
    }

    assert_eq!(a.encode_state_vector(), b.encode_state_vector());
    let row = b.tables().get("posts").unwrap().get("p1").unwrap();
    assert_eq!(row.get("title"), Some(&Value::text("From A")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_markdown_edit_is_applied() {
    let dir = tempfile::TempDir::new().unwrap();
    let storage: Arc<dyn PersistenceProvider> = Arc::new(MemoryStorage::new());
    let workspace = Workspace::open("blog", Arc::clone(&storage), "laptop");
    let posts = workspace.tables().define("posts", &posts_definition()).unwrap();
    posts
        .upsert(Row::with_id(
            "p1",
            cells([("title", Value::text("Hello")), ("body", Value::text("Body text\n"))]),
        ))
        .unwrap();

    let mut config = epicenter_core::config::MarkdownConfig {
        debounce_ms: 20,
        ..Default::default()
    };
    config.sync_only_fields.push("views".into());
    let markdown = MarkdownIndex::start(workspace.document(), dir.path(), &config).unwrap();
    let path = markdown.row_path("posts", "p1");
    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written, "---\nid: p1\ntitle: Hello\n---\nBody text\n");

    // Unmodified files are a no-op on the way back.
    assert_eq!(markdown.apply_file(&path).unwrap(), FileOutcome::Unchanged);

    // An external editor changes the file; the watcher applies it.
    std::fs::write(&path, "---\nid: p1\ntitle: Edited outside\n---\nBody text\n").unwrap();
    let mut applied = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if posts.get("p1").unwrap().get("title") == Some(&Value::text("Edited outside")) {
            applied = true;
            break;
        }
    }
    assert!(applied, "watcher never applied the edit");
    assert!(markdown.take_errors().is_empty());
    markdown.shutdown().await;
}
