//! End-to-end notification tests
//!
//! A laptop changes the shared profile; a phone of the same user receives
//! the notifications and decides, against its own directory, whether a
//! local file event is needed.

use sharetree::crypto::{PeerId, SignedEnvelope};
use sharetree::dht::{DirectMessage, MemoryDht};
use sharetree::error::SyncError;
use sharetree::notification::{FileEvent, FileEventKind};
use sharetree::node::PeerNode;
use sharetree::operations::FileOperation;
use sharetree::process::LoggingListener;
use sharetree::profile::{NoBackoff, TransactionPolicy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Peer {
    node: PeerNode,
    root: TempDir,
    inbox: mpsc::UnboundedReceiver<DirectMessage>,
    events: mpsc::UnboundedReceiver<FileEvent>,
}

impl Peer {
    async fn join(dht: &MemoryDht, crypto: &Arc<SignedEnvelope>, id: &str) -> Self {
        let root = TempDir::new().unwrap();
        let (node, events) = PeerNode::new(
            PeerId::new(id),
            Arc::new(dht.clone()),
            crypto.clone(),
            TransactionPolicy::default(),
        );
        let node = node.with_backoff(Arc::new(NoBackoff));
        let inbox = dht.register_peer(node.peer_id());
        node.login("profile:alice", "alice", root.path().to_path_buf())
            .await
            .unwrap();
        Self {
            node,
            root,
            inbox,
            events,
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn run(&self, operation: FileOperation) {
        let ops = self.node.file_operations().unwrap();
        let report = ops.execute(operation, Arc::new(LoggingListener)).await;
        assert!(report.is_success(), "{:?}", report.outcome);
    }

    async fn next_message(&mut self) -> DirectMessage {
        tokio::time::timeout(Duration::from_secs(2), self.inbox.recv())
            .await
            .expect("no notification arrived")
            .unwrap()
    }

    /// Receive the next message and handle it, returning the raised event.
    async fn receive(&mut self) -> Option<FileEvent> {
        let message = self.next_message().await;
        let event = self.node.notification_handler().handle(message).await.unwrap();
        assert_eq!(self.events.try_recv().ok(), event);
        event
    }
}

fn event(kind: FileEventKind, path: &Path, is_file: bool) -> Option<FileEvent> {
    Some(FileEvent {
        kind,
        path: path.to_path_buf(),
        is_file,
    })
}

#[tokio::test]
async fn test_changes_reach_the_other_peer() {
    let dht = MemoryDht::new();
    let crypto = Arc::new(SignedEnvelope::generate());
    let mut laptop = Peer::join(&dht, &crypto, "laptop").await;
    let mut phone = Peer::join(&dht, &crypto, "phone").await;
    let ops = laptop.node.file_operations().unwrap();

    // add: the phone does not have the file yet
    let report = laptop.write("report.txt", "v1");
    laptop.run(ops.add(&report).unwrap()).await;
    assert_eq!(
        phone.receive().await,
        event(FileEventKind::Added, &phone.path("report.txt"), true)
    );
    phone.write("report.txt", "v1");

    // add of content the phone already has: nothing to do
    let same = laptop.write("same.txt", "shared");
    phone.write("same.txt", "shared");
    laptop.run(ops.add(&same).unwrap()).await;
    assert_eq!(phone.receive().await, None);

    // update
    laptop.write("report.txt", "v2");
    laptop.run(ops.update(&report).unwrap()).await;
    assert_eq!(
        phone.receive().await,
        event(FileEventKind::Updated, &phone.path("report.txt"), true)
    );
    phone.write("report.txt", "v2");

    // add of a folder
    let archive = laptop.path("archive");
    std::fs::create_dir_all(&archive).unwrap();
    laptop.run(ops.add(&archive).unwrap()).await;
    assert_eq!(
        phone.receive().await,
        event(FileEventKind::Added, &phone.path("archive"), false)
    );
    std::fs::create_dir_all(phone.path("archive")).unwrap();

    // move
    let archived = laptop.path("archive/report.txt");
    std::fs::rename(&report, &archived).unwrap();
    laptop.run(ops.move_to(&report, &archived).unwrap()).await;
    assert_eq!(
        phone.receive().await,
        event(
            FileEventKind::Moved {
                from: phone.path("report.txt")
            },
            &phone.path("archive/report.txt"),
            true
        )
    );
    std::fs::rename(phone.path("report.txt"), phone.path("archive/report.txt")).unwrap();

    // remove
    std::fs::remove_file(&archived).unwrap();
    laptop.run(ops.remove(&archived).unwrap()).await;
    let message = phone.next_message().await;
    let handler = phone.node.notification_handler();
    assert_eq!(
        handler.handle(message.clone()).await.unwrap(),
        event(FileEventKind::Removed, &phone.path("archive/report.txt"), true)
    );
    assert!(phone.events.try_recv().is_ok());
    std::fs::remove_file(phone.path("archive/report.txt")).unwrap();

    // the same remove again finds nothing left to do
    assert_eq!(handler.handle(message).await.unwrap(), None);
    assert!(phone.events.try_recv().is_err());

    // the sender never notifies itself
    assert!(laptop.inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_remove_of_missing_local_file_raises_nothing() {
    let dht = MemoryDht::new();
    let crypto = Arc::new(SignedEnvelope::generate());
    let laptop = Peer::join(&dht, &crypto, "laptop").await;
    let mut phone = Peer::join(&dht, &crypto, "phone").await;
    let ops = laptop.node.file_operations().unwrap();

    let path = laptop.write("draft.txt", "draft");
    laptop.run(ops.add(&path).unwrap()).await;
    assert!(phone.receive().await.is_some());

    laptop.run(ops.remove(&path).unwrap()).await;
    assert_eq!(phone.receive().await, None);
}

#[tokio::test]
async fn test_remove_of_node_never_seen_uses_its_last_place() {
    let dht = MemoryDht::new();
    let crypto = Arc::new(SignedEnvelope::generate());
    let laptop = Peer::join(&dht, &crypto, "laptop").await;
    let mut phone = Peer::join(&dht, &crypto, "phone").await;
    let ops = laptop.node.file_operations().unwrap();

    let path = laptop.write("draft.txt", "draft");
    laptop.run(ops.add(&path).unwrap()).await;
    // the phone misses the add but got the file some other way
    phone.next_message().await;
    phone.write("draft.txt", "draft");

    laptop.run(ops.remove(&path).unwrap()).await;
    assert_eq!(
        phone.receive().await,
        event(FileEventKind::Removed, &phone.path("draft.txt"), true)
    );
}

#[tokio::test]
async fn test_remove_under_unknown_parent_is_not_found() {
    let dht = MemoryDht::new();
    let crypto = Arc::new(SignedEnvelope::generate());
    let laptop = Peer::join(&dht, &crypto, "laptop").await;
    let mut phone = Peer::join(&dht, &crypto, "phone").await;
    let ops = laptop.node.file_operations().unwrap();

    let docs = laptop.path("docs");
    std::fs::create_dir_all(&docs).unwrap();
    laptop.run(ops.add(&docs).unwrap()).await;
    let draft = laptop.write("docs/draft.txt", "draft");
    laptop.run(ops.add(&draft).unwrap()).await;
    // the phone misses both adds
    phone.next_message().await;
    phone.next_message().await;

    laptop.run(ops.remove(&draft).unwrap()).await;
    let message = phone.next_message().await;
    let result = phone.node.notification_handler().handle(message).await;
    assert!(matches!(result, Err(SyncError::NotFound(_))));
    assert!(phone.events.try_recv().is_err());
}

#[tokio::test]
async fn test_move_with_unknown_origin_is_an_add() {
    let dht = MemoryDht::new();
    let crypto = Arc::new(SignedEnvelope::generate());
    let laptop = Peer::join(&dht, &crypto, "laptop").await;
    let mut phone = Peer::join(&dht, &crypto, "phone").await;
    let ops = laptop.node.file_operations().unwrap();

    let path = laptop.write("a.txt", "a");
    laptop.run(ops.add(&path).unwrap()).await;
    // the phone misses the add
    phone.next_message().await;

    let renamed = laptop.path("b.txt");
    std::fs::rename(&path, &renamed).unwrap();
    laptop.run(ops.move_to(&path, &renamed).unwrap()).await;

    assert_eq!(
        phone.receive().await,
        event(FileEventKind::Added, &phone.path("b.txt"), true)
    );
}

#[tokio::test]
async fn test_logged_out_peer_drops_messages() {
    let dht = MemoryDht::new();
    let crypto = Arc::new(SignedEnvelope::generate());
    let laptop = Peer::join(&dht, &crypto, "laptop").await;
    let mut phone = Peer::join(&dht, &crypto, "phone").await;
    let ops = laptop.node.file_operations().unwrap();

    phone.node.logout();
    let path = laptop.write("a.txt", "a");
    laptop.run(ops.add(&path).unwrap()).await;

    let message = phone.next_message().await;
    let result = phone.node.notification_handler().handle(message).await;
    assert!(matches!(result, Err(SyncError::SessionUnavailable)));
    assert!(phone.events.try_recv().is_err());
}

#[tokio::test]
async fn test_listen_loop_delivers_events() {
    let dht = MemoryDht::new();
    let crypto = Arc::new(SignedEnvelope::generate());
    let laptop = Peer::join(&dht, &crypto, "laptop").await;
    let phone = Peer::join(&dht, &crypto, "phone").await;
    let Peer {
        node: phone_node,
        root: phone_root,
        inbox: phone_inbox,
        events: mut phone_events,
    } = phone;
    let _listener = phone_node.listen(phone_inbox);
    let ops = laptop.node.file_operations().unwrap();

    let path = laptop.write("photo.jpg", "pixels");
    laptop.run(ops.add(&path).unwrap()).await;

    let received = tokio::time::timeout(Duration::from_secs(2), phone_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.kind, FileEventKind::Added);
    assert_eq!(received.path, phone_root.path().join("photo.jpg"));
}
