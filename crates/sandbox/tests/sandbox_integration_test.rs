//! Sandbox integration tests.
//!
//! Tests the full pipeline: SandboxManager → SandboxEngine / FileOps /
//! InteractiveBridge → MockBackend. These tests do NOT require Docker; the
//! mock backend runs commands against a temporary host directory.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cloudrepl_core::config::SandboxConfig;
use cloudrepl_core::{Error, OwnerId, StreamKind};
use cloudrepl_sandbox::{
    BufferSink, ChannelSink, EntryType, ExecRequest, MockBackend, SandboxManager, SessionState,
};
use cloudrepl_store::InMemoryIdentityStore;

// =============================================================================
// Helpers
// =============================================================================

struct Fixture {
    _root: tempfile::TempDir,
    backend: MockBackend,
    manager: SandboxManager,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let backend = MockBackend::new();
    let config = SandboxConfig {
        host_root: root.path().to_path_buf(),
        ..Default::default()
    };
    let identity = Arc::new(InMemoryIdentityStore::open());
    let manager = SandboxManager::new(Arc::new(backend.clone()), identity, config);
    Fixture {
        _root: root,
        backend,
        manager,
    }
}

fn u1() -> OwnerId {
    OwnerId::new("u1")
}

async fn read_to_string(manager: &SandboxManager, owner: &OwnerId, path: &str) -> String {
    let sink = BufferSink::new();
    manager
        .read_file(owner, path, Some(&sink), &CancellationToken::new())
        .await
        .unwrap();
    sink.stdout_lossy().await
}

// =============================================================================
// 1. End-to-end file scenario
// =============================================================================

#[tokio::test]
async fn test_write_read_list_remove() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();

    f.manager.init_project(&owner, &cancel).await.unwrap();

    let status = f
        .manager
        .write_file(&owner, "/work/a.txt", b"hello", None, &cancel)
        .await
        .unwrap();
    assert!(status.success());

    assert_eq!(read_to_string(&f.manager, &owner, "/work/a.txt").await, "hello");

    let entries = f
        .manager
        .list_files(&owner, "/work", None, &cancel)
        .await
        .unwrap();
    let entry = entries
        .iter()
        .find(|e| e.name == "a.txt")
        .expect("a.txt should be listed");
    assert_eq!(entry.entry_type, EntryType::File);
    assert_eq!(entry.size, 5);

    f.manager
        .remove_file(&owner, "/work/a.txt", None, &cancel)
        .await
        .unwrap();
    let entries = f
        .manager
        .list_files(&owner, "/work", None, &cancel)
        .await
        .unwrap();
    assert!(entries.iter().all(|e| e.name != "a.txt"));
}

// =============================================================================
// 2. File operations
// =============================================================================

#[tokio::test]
async fn test_binary_and_chunked_writes() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();
    f.manager.init_project(&owner, &cancel).await.unwrap();

    // Larger than one write chunk, with every byte value.
    let content: Vec<u8> = (0..150_000u32).map(|i| (i % 256) as u8).collect();
    f.manager
        .write_file(&owner, "blob.bin", &content, None, &cancel)
        .await
        .unwrap();

    let sink = BufferSink::new();
    f.manager
        .read_file(&owner, "blob.bin", Some(&sink), &cancel)
        .await
        .unwrap();
    assert_eq!(sink.stdout().await, content);

    // Overwrite truncates.
    f.manager
        .write_file(&owner, "blob.bin", b"short", None, &cancel)
        .await
        .unwrap();
    assert_eq!(read_to_string(&f.manager, &owner, "blob.bin").await, "short");
}

#[tokio::test]
async fn test_names_with_spaces_survive_listing() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();
    f.manager.init_project(&owner, &cancel).await.unwrap();

    f.manager
        .write_file(&owner, "my notes.txt", b"x", None, &cancel)
        .await
        .unwrap();
    f.manager
        .create_dir(&owner, "src dir/nested", None, &cancel)
        .await
        .unwrap();
    f.manager
        .write_file(&owner, ".hidden", b"", None, &cancel)
        .await
        .unwrap();

    let entries = f
        .manager
        .list_files(&owner, "/work", None, &cancel)
        .await
        .unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["my notes.txt", "src dir", ".hidden"]);
    assert_eq!(entries[1].entry_type, EntryType::Dir);
    assert_eq!(entries[2].size, 0);
    assert_eq!(entries[2].entry_type, EntryType::File);
}

#[tokio::test]
async fn test_stat_search_and_rename() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();
    f.manager.init_project(&owner, &cancel).await.unwrap();

    f.manager
        .write_file(&owner, "app.js", b"let a = 1;\nconsole.log(a);\nlet b = a;\n", None, &cancel)
        .await
        .unwrap();

    let stat = f
        .manager
        .stat_file(&owner, "app.js", None, &cancel)
        .await
        .unwrap();
    assert_eq!(stat.name, "/work/app.js");
    assert_eq!(stat.entry_type, EntryType::File);
    assert_eq!(stat.size, 38);
    assert!(stat.mode.starts_with('-'));

    let sink = BufferSink::new();
    let status = f
        .manager
        .search_in_file(&owner, "app.js", "let", Some(&sink), &cancel)
        .await
        .unwrap();
    assert!(status.success());
    assert_eq!(sink.stdout_lossy().await, "1:let a = 1;\n3:let b = a;\n");

    f.manager.create_dir(&owner, "lib", None, &cancel).await.unwrap();
    f.manager
        .rename(&owner, "app.js", "lib", None, &cancel)
        .await
        .unwrap();
    assert_eq!(
        read_to_string(&f.manager, &owner, "lib/app.js").await,
        "let a = 1;\nconsole.log(a);\nlet b = a;\n"
    );
}

#[tokio::test]
async fn test_search_term_is_literal() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();
    f.manager.init_project(&owner, &cancel).await.unwrap();

    f.manager
        .write_file(&owner, "q.txt", b"a.b\naxb\n$(id)\n", None, &cancel)
        .await
        .unwrap();

    let sink = BufferSink::new();
    f.manager
        .search_in_file(&owner, "q.txt", "a.b", Some(&sink), &cancel)
        .await
        .unwrap();
    assert_eq!(sink.stdout_lossy().await, "1:a.b\n");

    let sink = BufferSink::new();
    f.manager
        .search_in_file(&owner, "q.txt", "$(id)", Some(&sink), &cancel)
        .await
        .unwrap();
    assert_eq!(sink.stdout_lossy().await, "3:$(id)\n");
}

#[tokio::test]
async fn test_stat_missing_file() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();
    f.manager.init_project(&owner, &cancel).await.unwrap();

    let stderr = BufferSink::new();
    let result = f
        .manager
        .stat_file(&owner, "nope.txt", Some(&stderr), &cancel)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert!(stderr.stderr_lossy().await.contains("can't stat"));
}

#[tokio::test]
async fn test_read_missing_file_reports_stderr() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();
    f.manager.init_project(&owner, &cancel).await.unwrap();

    let sink = BufferSink::new();
    let status = f
        .manager
        .read_file(&owner, "ghost.txt", Some(&sink), &cancel)
        .await
        .unwrap();
    assert_eq!(status.exit_code, Some(1));
    assert!(sink.stderr_lossy().await.contains("No such file or directory"));
}

// =============================================================================
// 3. Routing and isolation
// =============================================================================

#[tokio::test]
async fn test_operations_without_sandbox_fail() {
    let f = fixture();
    let result = f
        .manager
        .read_file(&u1(), "a.txt", None, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::SandboxNotFound(_))));
    assert_eq!(f.backend.container_count().await, 0);
}

#[tokio::test]
async fn test_unknown_user_rejected() {
    let root = tempfile::tempdir().unwrap();
    let backend = MockBackend::new();
    let identity = Arc::new(InMemoryIdentityStore::new());
    let manager = SandboxManager::new(
        Arc::new(backend.clone()),
        identity,
        SandboxConfig {
            host_root: root.path().to_path_buf(),
            ..Default::default()
        },
    );

    let result = manager.init_project(&u1(), &CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::UserNotFound(_))));
    assert_eq!(backend.container_count().await, 0);
}

#[tokio::test]
async fn test_owners_are_isolated() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let alice = OwnerId::new("alice");
    let bob = OwnerId::new("bob");

    let a = f.manager.init_project(&alice, &cancel).await.unwrap();
    let b = f.manager.init_project(&bob, &cancel).await.unwrap();
    assert_ne!(a.id, b.id);

    f.manager
        .write_file(&alice, "secret.txt", b"alice", None, &cancel)
        .await
        .unwrap();

    let sink = BufferSink::new();
    let status = f
        .manager
        .read_file(&bob, "secret.txt", Some(&sink), &cancel)
        .await
        .unwrap();
    assert!(!status.success());
    assert!(sink.stdout().await.is_empty());
}

#[tokio::test]
async fn test_files_survive_sandbox_recreation() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();

    f.manager.init_project(&owner, &cancel).await.unwrap();
    f.manager
        .write_file(&owner, "keep.txt", b"persisted", None, &cancel)
        .await
        .unwrap();

    f.manager.destroy(&owner, &cancel).await.unwrap();
    assert!(matches!(
        f.manager.sandbox_for(&owner),
        Err(Error::SandboxNotFound(_))
    ));

    f.manager.init_project(&owner, &cancel).await.unwrap();
    assert_eq!(read_to_string(&f.manager, &owner, "keep.txt").await, "persisted");
}

#[tokio::test]
async fn test_exec_passthrough() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();
    f.manager.init_project(&owner, &cancel).await.unwrap();

    let sink = BufferSink::new();
    let status = f
        .manager
        .exec(&owner, &ExecRequest::new(["echo", "hi"]), Some(&sink), &cancel)
        .await
        .unwrap();
    assert!(status.success());
    assert_eq!(sink.stdout_lossy().await, "hi\n");
}

// =============================================================================
// 4. Lifecycle
// =============================================================================

#[tokio::test]
async fn test_destroy_twice_reports_not_found() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let sandbox = f.manager.init_project(&u1(), &cancel).await.unwrap();

    f.manager.engine().destroy_sandbox(&sandbox.id, &cancel).await.unwrap();
    let again = f.manager.engine().destroy_sandbox(&sandbox.id, &cancel).await;
    assert!(matches!(again, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_stop_all_closes_everything() {
    let f = fixture();
    let cancel = CancellationToken::new();
    f.manager.init_project(&OwnerId::new("a"), &cancel).await.unwrap();
    f.manager.init_project(&OwnerId::new("b"), &cancel).await.unwrap();

    let (sink, _out) = ChannelSink::channel(16);
    let (_in_tx, in_rx) = mpsc::channel(16);
    let mut terminal = f
        .manager
        .start_terminal(&OwnerId::new("a"), in_rx, Arc::new(sink), &cancel)
        .await
        .unwrap();

    let report = f.manager.stop_all(&cancel).await.unwrap();
    assert_eq!(report.stopped.len(), 2);
    assert!(report.is_clean());
    assert_eq!(f.backend.running_count().await, 0);
    assert_eq!(f.backend.container_count().await, 0);

    tokio::time::timeout(Duration::from_secs(5), terminal.wait())
        .await
        .unwrap();
    assert!(f.manager.sandbox_for(&OwnerId::new("a")).is_err());
}

#[tokio::test]
async fn test_background_process_outlives_request() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();
    f.manager.init_project(&owner, &cancel).await.unwrap();

    let (sink, mut out) = ChannelSink::channel(16);
    let exec = f
        .manager
        .spawn_process(&owner, &ExecRequest::new(["echo", "listening"]), Arc::new(sink), &cancel)
        .await
        .unwrap();

    let (kind, chunk) = tokio::time::timeout(Duration::from_secs(5), out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kind, StreamKind::Stdout);
    assert_eq!(chunk, Bytes::from_static(b"listening\n"));

    let long = f
        .manager
        .spawn_process(
            &owner,
            &ExecRequest::new(["sleep", "30"]),
            Arc::new(BufferSink::new()),
            &cancel,
        )
        .await
        .unwrap();
    assert_ne!(exec, long);
    assert!(f.manager.stop_process(&long));

    assert!(matches!(
        f.manager
            .spawn_process(
                &OwnerId::new("nobody"),
                &ExecRequest::new(["true"]),
                Arc::new(BufferSink::new()),
                &cancel,
            )
            .await,
        Err(Error::SandboxNotFound(_))
    ));
}

// =============================================================================
// 5. Interactive terminal
// =============================================================================

#[tokio::test]
async fn test_terminal_single_flight_keeps_first_session() {
    let f = fixture();
    let cancel = CancellationToken::new();
    let owner = u1();
    f.manager.init_project(&owner, &cancel).await.unwrap();

    let (sink, mut out) = ChannelSink::channel(64);
    let (in_tx, in_rx) = mpsc::channel(16);
    let _terminal = f
        .manager
        .start_terminal(&owner, in_rx, Arc::new(sink), &cancel)
        .await
        .unwrap();
    assert_eq!(f.manager.terminal_state(&owner).unwrap(), SessionState::Attached);

    in_tx.send(Bytes::from_static(b"before-1\n")).await.unwrap();
    expect_output(&mut out, "before-1\n").await;

    let (other_sink, _other_out) = ChannelSink::channel(16);
    let (_other_tx, other_rx) = mpsc::channel(16);
    let rejected = f
        .manager
        .start_terminal(&owner, other_rx, Arc::new(other_sink), &cancel)
        .await;
    assert!(matches!(rejected, Err(Error::AlreadyAttached(_))));

    in_tx.send(Bytes::from_static(b"after-2\n")).await.unwrap();
    expect_output(&mut out, "after-2\n").await;

    assert!(f.manager.resize_terminal(&owner, 30, 100).await.unwrap());
    assert!(f.manager.stop_terminal(&owner).unwrap());
}

async fn expect_output(out: &mut mpsc::Receiver<(StreamKind, Bytes)>, expected: &str) {
    let mut got = Vec::new();
    while got.len() < expected.len() {
        let (kind, chunk) = tokio::time::timeout(Duration::from_secs(5), out.recv())
            .await
            .expect("timed out waiting for output")
            .expect("output closed");
        assert_eq!(kind, StreamKind::Stdout);
        got.extend_from_slice(&chunk);
    }
    assert_eq!(String::from_utf8_lossy(&got), expected);
}
