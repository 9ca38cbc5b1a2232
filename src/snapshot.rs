//! # File Tree Snapshots
//!
//! A snapshot maps every path below a local root to its content fingerprint.
//! It is built by walking the directory once and is used to compare local
//! state against the shared index or against an earlier snapshot.
//!
//! Keys are root-relative, `/`-separated and start with `/`. Directory keys
//! end with `/` and carry the empty fingerprint. Symbolic links are left out.

use crate::error::{Result, SyncError};
use crate::fingerprint::{self, Fingerprint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Name of the per-root metadata file, never part of a snapshot.
pub const META_FILE_NAME: &str = ".sharetree";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTreeSnapshot {
    pub taken_at: chrono::DateTime<chrono::Utc>,
    pub entries: BTreeMap<String, Fingerprint>,
}

/// Differences between two snapshots, keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

impl FileTreeSnapshot {
    /// Walk `root` and fingerprint everything below it.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk failed"));
                SyncError::integrity(path, source)
            })?;

            let relative = match entry.path().strip_prefix(root) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            if relative == Path::new(META_FILE_NAME) {
                continue;
            }
            // Links are not shared, whatever they point at.
            if entry.path_is_symlink() {
                debug!("Skipping symbolic link {}", entry.path().display());
                continue;
            }

            let mut key = to_tree_path(relative);
            let digest = if entry.file_type().is_dir() {
                key.push('/');
                Fingerprint::empty()
            } else {
                fingerprint::fingerprint_file(entry.path())?
            };
            entries.insert(key, digest);
        }

        debug!("Captured snapshot of {} ({} entries)", root.display(), entries.len());
        Ok(Self {
            taken_at: chrono::Utc::now(),
            entries,
        })
    }

    pub fn get(&self, path: &str) -> Option<&Fingerprint> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// What changed going from `self` to `newer`.
    pub fn diff(&self, newer: &FileTreeSnapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();

        for (path, digest) in &newer.entries {
            match self.entries.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if !fingerprint::equal(Some(old), Some(digest)) => {
                    diff.modified.push(path.clone())
                }
                Some(_) => {}
            }
        }
        for path in self.entries.keys() {
            if !newer.entries.contains_key(path) {
                diff.removed.push(path.clone());
            }
        }

        diff
    }

    /// Pairs `(from, to)` of removed and added files with identical content.
    /// Such pairs were moved or renamed rather than changed.
    pub fn moved_candidates(&self, newer: &FileTreeSnapshot, diff: &SnapshotDiff) -> Vec<(String, String)> {
        let mut removed_by_digest: HashMap<&Fingerprint, Vec<&String>> = HashMap::new();
        for path in &diff.removed {
            if let Some(digest) = self.entries.get(path) {
                if !digest.is_empty() {
                    removed_by_digest.entry(digest).or_default().push(path);
                }
            }
        }

        let mut moves = Vec::new();
        for path in &diff.added {
            let Some(digest) = newer.entries.get(path) else { continue };
            if let Some(candidates) = removed_by_digest.get_mut(digest) {
                if let Some(from) = candidates.pop() {
                    moves.push((from.clone(), path.clone()));
                }
            }
        }
        moves
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        info!("Saved snapshot to {}", path.display());
        Ok(())
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Turn a relative filesystem path into a `/`-rooted tree path.
pub fn to_tree_path(relative: &Path) -> String {
    let mut out = String::new();
    for component in relative.components() {
        if let std::path::Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
