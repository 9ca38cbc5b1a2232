//! # File Operations
//!
//! Add, remove, move and update are each built as a process whose steps
//! inspect the local file system and then change the shared profile through
//! one optimistic transaction. Every profile step carries a rollback that
//! reverts its change with another transaction.
//!
//! When the whole process succeeds and it actually changed the profile, the
//! other authorized peers are notified.

use crate::crypto::{NodeKey, PeerId};
use crate::error::{Result, SyncError};
use crate::fingerprint::{self, Fingerprint};
use crate::index::{split_tree_path, DetachedSubtree, NewNode};
use crate::notification::{NotificationDispatcher, NotificationKind, NotificationMessage};
use crate::process::{self, ProcessComponent, ProcessFailure, ProcessListener, ProcessReport, ProcessStep, SequentialProcess};
use crate::profile::{Modification, UserProfile};
use crate::session::Session;
use crate::snapshot::FileTreeSnapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Notification to send once the owning process has succeeded.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub message: NotificationMessage,
    pub recipients: Vec<PeerId>,
}

type PendingSlot = Arc<Mutex<Option<PendingNotification>>>;

/// A ready-to-run file operation.
pub struct FileOperation {
    process: ProcessComponent,
    pending: PendingSlot,
}

impl FileOperation {
    pub fn name(&self) -> &str {
        self.process.name()
    }

    /// Run `component` after the profile change. If it fails, the change is
    /// rolled back and no one is notified.
    pub fn then(self, component: impl Into<ProcessComponent>) -> Self {
        let name = self.process.name().to_string();
        Self {
            process: SequentialProcess::new(name).then(self.process).then(component).into(),
            pending: self.pending,
        }
    }
}

/// What the local file system holds at an added path.
#[derive(Debug, Clone)]
enum LocalContent {
    File { fingerprint: Fingerprint, size: u64 },
    /// A folder with its descendants as (path relative to the folder, node).
    Folder { entries: Vec<(String, NewNode)> },
}

#[derive(Clone)]
pub struct FileOperations {
    session: Arc<Session>,
    dispatcher: NotificationDispatcher,
}

impl FileOperations {
    pub fn new(session: Arc<Session>, dispatcher: NotificationDispatcher) -> Self {
        Self { session, dispatcher }
    }

    /// Run `operation`, notify peers on success and report to `listener`.
    pub async fn execute(&self, operation: FileOperation, listener: Arc<dyn ProcessListener>) -> ProcessReport {
        let notifying = NotifyOnSuccess {
            dispatcher: self.dispatcher.clone(),
            pending: operation.pending.clone(),
            inner: listener,
        };
        process::run(operation.process, &notifying).await
    }

    /// Add the file or folder at `path` (folders with their whole content).
    pub fn add(&self, path: &Path) -> Result<FileOperation> {
        let tree_path = self.session.tree_path_of(path)?;
        let (parent_path, name) = split_tree_path(&tree_path)?;
        let pending: PendingSlot = Arc::default();
        let content: Arc<Mutex<Option<LocalContent>>> = Arc::default();
        let key = NodeKey::generate();

        let inspect = {
            let local = path.to_path_buf();
            let content = content.clone();
            ProcessStep::new("inspect local content", move || {
                let local = local.clone();
                let content = content.clone();
                async move {
                    let found = tokio::task::spawn_blocking(move || inspect_local(&local))
                        .await
                        .map_err(|e| SyncError::InvalidOperation(format!("inspection task failed: {}", e)))??;
                    *content.lock() = Some(found);
                    Ok(())
                }
            })
        };

        let session = self.session.clone();
        let rollback_session = self.session.clone();
        let slot = pending.clone();
        let update = ProcessStep::new("add to profile", move || {
            let session = session.clone();
            let content = content.clone();
            let slot = slot.clone();
            let parent_path = parent_path.clone();
            let name = name.clone();
            async move {
                let content = content
                    .lock()
                    .clone()
                    .ok_or_else(|| SyncError::InvalidOperation("local content was not inspected".to_string()))?;

                let committed = session
                    .store()
                    .update(|profile| {
                        let parent = profile.tree.find_by_path(&parent_path)?;
                        insert_content(profile, parent, key, &name, &content)?;
                        Ok(Modification::Commit)
                    })
                    .await?;

                info!("Added {} to the profile", committed.tree.resolve_path(&key)?);
                stage_notification(&session, &committed, NotificationKind::Add, &key, &slot)
            }
        })
        .with_rollback(move || {
            let session = rollback_session.clone();
            async move {
                session
                    .store()
                    .update(|profile| match profile.tree.remove(&key) {
                        Ok(_) => Ok(Modification::Commit),
                        Err(SyncError::NotFound(_)) => Ok(Modification::Abort),
                        Err(e) => Err(e),
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(FileOperation {
            process: SequentialProcess::new(format!("add {}", tree_path))
                .then(inspect)
                .then(update)
                .into(),
            pending,
        })
    }

    /// Remove the node at `path` (and its subtree) from the profile.
    pub fn remove(&self, path: &Path) -> Result<FileOperation> {
        let tree_path = self.session.tree_path_of(path)?;
        let pending: PendingSlot = Arc::default();
        let detached: Arc<Mutex<Option<DetachedSubtree>>> = Arc::default();

        let session = self.session.clone();
        let rollback_session = self.session.clone();
        let rollback_detached = detached.clone();
        let slot = pending.clone();
        let target = tree_path.clone();
        let step = ProcessStep::new("remove from profile", move || {
            let session = session.clone();
            let detached = detached.clone();
            let slot = slot.clone();
            let target = target.clone();
            async move {
                let mut removed = None;
                let committed = session
                    .store()
                    .update(|profile| {
                        let key = profile.tree.find_by_path(&target)?;
                        removed = Some(profile.tree.remove(&key)?);
                        Ok(Modification::Commit)
                    })
                    .await?;

                let subtree = removed.ok_or_else(|| SyncError::not_found(target.clone()))?;
                let top = subtree
                    .top()
                    .cloned()
                    .ok_or_else(|| SyncError::not_found(target.clone()))?;
                *detached.lock() = Some(subtree);

                info!("Removed {} from the profile", target);
                session.remember(&committed);
                *slot.lock() = Some(PendingNotification {
                    message: NotificationMessage::for_node(NotificationKind::Remove, &top)?,
                    recipients: committed.other_peers(session.peer_id()),
                });
                Ok(())
            }
        })
        .with_rollback(move || {
            let session = rollback_session.clone();
            let detached = rollback_detached.clone();
            async move {
                let saved = detached.lock().clone();
                let Some(subtree) = saved else {
                    return Ok(());
                };
                session
                    .store()
                    .update(|profile| {
                        profile.tree.restore(subtree.clone())?;
                        Ok(Modification::Commit)
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(FileOperation {
            process: SequentialProcess::new(format!("remove {}", tree_path)).then(step).into(),
            pending,
        })
    }

    /// Move or rename the node at `from` to `to`.
    pub fn move_to(&self, from: &Path, to: &Path) -> Result<FileOperation> {
        let source = self.session.tree_path_of(from)?;
        let destination = self.session.tree_path_of(to)?;
        let (dest_parent, dest_name) = split_tree_path(&destination)?;
        let pending: PendingSlot = Arc::default();
        let origin: Arc<Mutex<Option<(NodeKey, NodeKey, String)>>> = Arc::default();

        let session = self.session.clone();
        let rollback_session = self.session.clone();
        let rollback_origin = origin.clone();
        let slot = pending.clone();
        let src = source.clone();
        let step = ProcessStep::new("move in profile", move || {
            let session = session.clone();
            let origin = origin.clone();
            let slot = slot.clone();
            let src = src.clone();
            let dest_parent = dest_parent.clone();
            let dest_name = dest_name.clone();
            async move {
                let mut moved = None;
                let committed = session
                    .store()
                    .update(|profile| {
                        let key = profile.tree.find_by_path(&src)?;
                        let node = profile.tree.get(&key)?;
                        let old_parent = node
                            .parent
                            .ok_or_else(|| SyncError::InvalidOperation("the root cannot be moved".to_string()))?;
                        let old_name = node.name.clone();
                        let new_parent = profile.tree.find_by_path(&dest_parent)?;
                        if old_parent == new_parent && old_name == dest_name {
                            moved = None;
                            return Ok(Modification::Abort);
                        }
                        profile.tree.move_node(&key, new_parent, &dest_name)?;
                        moved = Some((key, old_parent, old_name));
                        Ok(Modification::Commit)
                    })
                    .await?;

                let Some((key, old_parent, old_name)) = moved else {
                    debug!("{} is already at its destination, nothing to move", src);
                    return Ok(());
                };
                *origin.lock() = Some((key, old_parent, old_name));

                info!("Moved {} to {}", src, committed.tree.resolve_path(&key)?);
                stage_notification(&session, &committed, NotificationKind::Move, &key, &slot)
            }
        })
        .with_rollback(move || {
            let session = rollback_session.clone();
            let origin = rollback_origin.clone();
            async move {
                let saved = origin.lock().clone();
                let Some((key, old_parent, old_name)) = saved else {
                    return Ok(());
                };
                session
                    .store()
                    .update(|profile| {
                        profile.tree.move_node(&key, old_parent, &old_name)?;
                        Ok(Modification::Commit)
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(FileOperation {
            process: SequentialProcess::new(format!("move {} to {}", source, destination))
                .then(step)
                .into(),
            pending,
        })
    }

    /// Record new content for the file at `path`. Touching a file without
    /// changing its content leaves the profile alone.
    pub fn update(&self, path: &Path) -> Result<FileOperation> {
        let tree_path = self.session.tree_path_of(path)?;
        let pending: PendingSlot = Arc::default();
        let content: Arc<Mutex<Option<(Fingerprint, u64)>>> = Arc::default();
        let previous: Arc<Mutex<Option<(NodeKey, Option<Fingerprint>, u64)>>> = Arc::default();

        let inspect = {
            let local = path.to_path_buf();
            let content = content.clone();
            ProcessStep::new("fingerprint file", move || {
                let local = local.clone();
                let content = content.clone();
                async move {
                    if local.is_dir() {
                        return Err(SyncError::InvalidOperation(format!(
                            "{} is a folder, not a file",
                            local.display()
                        )));
                    }
                    if !local.exists() {
                        return Err(SyncError::not_found(local.display().to_string()));
                    }
                    let digest = fingerprint::fingerprint_file_async(&local).await?;
                    let size = tokio::fs::metadata(&local)
                        .await
                        .map_err(|e| SyncError::integrity(&local, e))?
                        .len();
                    *content.lock() = Some((digest, size));
                    Ok(())
                }
            })
        };

        let session = self.session.clone();
        let rollback_session = self.session.clone();
        let rollback_previous = previous.clone();
        let slot = pending.clone();
        let target = tree_path.clone();
        let step = ProcessStep::new("update profile", move || {
            let session = session.clone();
            let content = content.clone();
            let previous = previous.clone();
            let slot = slot.clone();
            let target = target.clone();
            async move {
                let (digest, size) = content
                    .lock()
                    .clone()
                    .ok_or_else(|| SyncError::InvalidOperation("file was not fingerprinted".to_string()))?;

                let mut replaced = None;
                let committed = session
                    .store()
                    .update(|profile| {
                        let key = profile.tree.find_by_path(&target)?;
                        let node = profile.tree.get(&key)?;
                        if fingerprint::equal(node.fingerprint(), Some(&digest)) {
                            replaced = None;
                            return Ok(Modification::Abort);
                        }
                        let (old_digest, old_size) = profile.tree.update_file(&key, Some(digest.clone()), size)?;
                        replaced = Some((key, old_digest, old_size));
                        Ok(Modification::Commit)
                    })
                    .await?;

                let Some((key, old_digest, old_size)) = replaced else {
                    debug!("{} is unchanged, nothing to update", target);
                    return Ok(());
                };
                *previous.lock() = Some((key, old_digest, old_size));

                info!("Updated {} in the profile", target);
                stage_notification(&session, &committed, NotificationKind::Update, &key, &slot)
            }
        })
        .with_rollback(move || {
            let session = rollback_session.clone();
            let previous = rollback_previous.clone();
            async move {
                let saved = previous.lock().clone();
                let Some((key, old_digest, old_size)) = saved else {
                    return Ok(());
                };
                session
                    .store()
                    .update(|profile| {
                        profile.tree.update_file(&key, old_digest.clone(), old_size)?;
                        Ok(Modification::Commit)
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(FileOperation {
            process: SequentialProcess::new(format!("update {}", tree_path))
                .then(inspect)
                .then(step)
                .into(),
            pending,
        })
    }
}

/// Remember the committed profile and queue the notification for `key`.
fn stage_notification(
    session: &Session,
    committed: &UserProfile,
    kind: NotificationKind,
    key: &NodeKey,
    slot: &PendingSlot,
) -> Result<()> {
    session.remember(committed);
    let node = committed.tree.get(key)?;
    *slot.lock() = Some(PendingNotification {
        message: NotificationMessage::for_node(kind, node)?,
        recipients: committed.other_peers(session.peer_id()),
    });
    Ok(())
}

fn inspect_local(path: &Path) -> Result<LocalContent> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SyncError::not_found(path.display().to_string()),
        _ => SyncError::integrity(path, e),
    })?;
    if metadata.file_type().is_symlink() {
        return Err(SyncError::InvalidOperation(format!(
            "{} is a symbolic link, links are not shared",
            path.display()
        )));
    }

    if !metadata.is_dir() {
        return Ok(LocalContent::File {
            fingerprint: fingerprint::fingerprint_file(path)?,
            size: metadata.len(),
        });
    }

    let snapshot = FileTreeSnapshot::capture(path)?;
    let mut entries = Vec::with_capacity(snapshot.len());
    for (relative, digest) in &snapshot.entries {
        let node = if relative.ends_with('/') {
            NewNode::Folder
        } else {
            let local: PathBuf = relative
                .split('/')
                .filter(|p| !p.is_empty())
                .fold(path.to_path_buf(), |acc, part| acc.join(part));
            let size = std::fs::symlink_metadata(&local)
                .map_err(|e| SyncError::integrity(&local, e))?
                .len();
            NewNode::File {
                fingerprint: Some(digest.clone()),
                size,
            }
        };
        entries.push((relative.trim_end_matches('/').to_string(), node));
    }
    Ok(LocalContent::Folder { entries })
}

/// Insert `content` as `name` under `parent`, with fresh keys for descendants.
fn insert_content(
    profile: &mut UserProfile,
    parent: NodeKey,
    key: NodeKey,
    name: &str,
    content: &LocalContent,
) -> Result<()> {
    match content {
        LocalContent::File { fingerprint, size } => profile.tree.insert(
            parent,
            key,
            name,
            NewNode::File {
                fingerprint: Some(fingerprint.clone()),
                size: *size,
            },
        ),
        LocalContent::Folder { entries } => {
            profile.tree.insert(parent, key, name, NewNode::Folder)?;
            // entries are sorted, so every folder precedes its children
            let mut keys: HashMap<&str, NodeKey> = HashMap::new();
            for (relative, node) in entries {
                let (parent_rel, child_name) = split_tree_path(relative)?;
                let child_parent = if parent_rel == "/" {
                    key
                } else {
                    *keys
                        .get(parent_rel.as_str())
                        .ok_or_else(|| SyncError::not_found(parent_rel.clone()))?
                };
                let child_key = NodeKey::generate();
                profile.tree.insert(child_parent, child_key, &child_name, node.clone())?;
                keys.insert(relative.as_str(), child_key);
            }
            Ok(())
        }
    }
}

/// Sends the staged notification before passing the outcome on.
struct NotifyOnSuccess {
    dispatcher: NotificationDispatcher,
    pending: PendingSlot,
    inner: Arc<dyn ProcessListener>,
}

impl ProcessListener for NotifyOnSuccess {
    fn on_success(&self) {
        if let Some(pending) = self.pending.lock().take() {
            debug!(
                "Notifying {} peer(s) about {:?}",
                pending.recipients.len(),
                pending.message.kind
            );
            self.dispatcher.dispatch(&pending.recipients, &pending.message);
        }
        self.inner.on_success();
    }

    fn on_failure(&self, failure: &ProcessFailure) {
        self.pending.lock().take();
        self.inner.on_failure(failure);
    }
}
