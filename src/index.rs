//! # Index Tree
//!
//! In-memory representation of the shared file tree. Nodes live in a single
//! map keyed by [`NodeKey`]; a folder owns its children through its
//! name-to-key map and every node points back to its parent by key only, so
//! the tree has one owner per node and cannot form reference cycles.
//!
//! All operations are local and synchronous. Persistence and conflict
//! handling belong to [`crate::profile::ProfileStore`].

use crate::crypto::NodeKey;
use crate::error::{Result, SyncError};
use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Folder {
        children: BTreeMap<String, NodeKey>,
    },
    File {
        fingerprint: Option<Fingerprint>,
        size: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexNode {
    pub key: NodeKey,
    pub name: String,
    pub parent: Option<NodeKey>,
    pub kind: NodeKind,
}

impl IndexNode {
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    pub fn is_folder(&self) -> bool {
        !self.is_file()
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match &self.kind {
            NodeKind::File { fingerprint, .. } => fingerprint.as_ref(),
            NodeKind::Folder { .. } => None,
        }
    }
}

/// Content of a node to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewNode {
    Folder,
    File {
        fingerprint: Option<Fingerprint>,
        size: u64,
    },
}

/// A subtree cut out of the tree by [`IndexTree::remove`], in pre-order.
/// Feeding it to [`IndexTree::restore`] puts it back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedSubtree {
    pub nodes: Vec<IndexNode>,
}

impl DetachedSubtree {
    pub fn top(&self) -> Option<&IndexNode> {
        self.nodes.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTree {
    root: NodeKey,
    nodes: HashMap<NodeKey, IndexNode>,
}

impl IndexTree {
    pub fn new() -> Self {
        Self::with_root(NodeKey::generate())
    }

    pub fn with_root(root: NodeKey) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            IndexNode {
                key: root,
                name: String::new(),
                parent: None,
                kind: NodeKind::Folder {
                    children: BTreeMap::new(),
                },
            },
        );
        Self { root, nodes }
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn get(&self, key: &NodeKey) -> Result<&IndexNode> {
        self.nodes
            .get(key)
            .ok_or_else(|| SyncError::not_found(format!("node {}", key)))
    }

    fn get_mut(&mut self, key: &NodeKey) -> Result<&mut IndexNode> {
        self.nodes
            .get_mut(key)
            .ok_or_else(|| SyncError::not_found(format!("node {}", key)))
    }

    fn children_of(&self, key: &NodeKey) -> Result<&BTreeMap<String, NodeKey>> {
        match &self.get(key)?.kind {
            NodeKind::Folder { children } => Ok(children),
            NodeKind::File { .. } => Err(SyncError::InvalidOperation(format!(
                "{} is a file, not a folder",
                self.resolve_path(key)?
            ))),
        }
    }

    fn children_of_mut(&mut self, key: &NodeKey) -> Result<&mut BTreeMap<String, NodeKey>> {
        match &mut self.get_mut(key)?.kind {
            NodeKind::Folder { children } => Ok(children),
            NodeKind::File { .. } => Err(SyncError::InvalidOperation(format!(
                "node {} is a file, not a folder",
                key
            ))),
        }
    }

    pub fn children(&self, key: &NodeKey) -> Result<Vec<NodeKey>> {
        Ok(self.children_of(key)?.values().copied().collect())
    }

    pub fn child_by_name(&self, parent: &NodeKey, name: &str) -> Result<Option<NodeKey>> {
        Ok(self.children_of(parent)?.get(name).copied())
    }

    /// Insert a new node named `name` below `parent`.
    pub fn insert(&mut self, parent: NodeKey, key: NodeKey, name: &str, node: NewNode) -> Result<()> {
        validate_name(name)?;
        if self.nodes.contains_key(&key) {
            return Err(SyncError::InvalidOperation(format!("node {} already exists", key)));
        }
        if self.children_of(&parent)?.contains_key(name) {
            return Err(SyncError::NameConflict {
                parent: self.resolve_path(&parent)?,
                name: name.to_string(),
            });
        }

        let kind = match node {
            NewNode::Folder => NodeKind::Folder {
                children: BTreeMap::new(),
            },
            NewNode::File { fingerprint, size } => NodeKind::File { fingerprint, size },
        };

        self.children_of_mut(&parent)?.insert(name.to_string(), key);
        self.nodes.insert(
            key,
            IndexNode {
                key,
                name: name.to_string(),
                parent: Some(parent),
                kind,
            },
        );
        Ok(())
    }

    /// Remove a node and, for folders, everything below it.
    pub fn remove(&mut self, key: &NodeKey) -> Result<DetachedSubtree> {
        if *key == self.root {
            return Err(SyncError::InvalidOperation("the root cannot be removed".to_string()));
        }

        let node = self.get(key)?;
        let parent = node.parent.ok_or_else(|| SyncError::not_found(format!("parent of {}", key)))?;
        let name = node.name.clone();

        let order = self.walk(key)?;
        self.children_of_mut(&parent)?.remove(&name);

        let nodes = order
            .iter()
            .filter_map(|k| self.nodes.remove(k))
            .collect();
        Ok(DetachedSubtree { nodes })
    }

    /// Reattach a subtree previously returned by [`IndexTree::remove`].
    pub fn restore(&mut self, subtree: DetachedSubtree) -> Result<()> {
        let top = subtree
            .top()
            .ok_or_else(|| SyncError::InvalidOperation("empty subtree".to_string()))?;
        let parent = top
            .parent
            .ok_or_else(|| SyncError::InvalidOperation("subtree has no parent".to_string()))?;

        if self.children_of(&parent)?.contains_key(&top.name) {
            return Err(SyncError::NameConflict {
                parent: self.resolve_path(&parent)?,
                name: top.name.clone(),
            });
        }
        if let Some(existing) = subtree.nodes.iter().find(|n| self.nodes.contains_key(&n.key)) {
            return Err(SyncError::InvalidOperation(format!(
                "node {} already exists",
                existing.key
            )));
        }

        let (top_key, top_name) = (top.key, top.name.clone());
        self.children_of_mut(&parent)?.insert(top_name, top_key);
        for node in subtree.nodes {
            self.nodes.insert(node.key, node);
        }
        Ok(())
    }

    /// Move a node below `new_parent` under `new_name`.
    pub fn move_node(&mut self, key: &NodeKey, new_parent: NodeKey, new_name: &str) -> Result<()> {
        validate_name(new_name)?;
        if *key == self.root {
            return Err(SyncError::InvalidOperation("the root cannot be moved".to_string()));
        }

        let node = self.get(key)?;
        let old_parent = node.parent.ok_or_else(|| SyncError::not_found(format!("parent of {}", key)))?;
        let old_name = node.name.clone();

        if old_parent == new_parent && old_name == new_name {
            return Ok(());
        }
        if let Some(existing) = self.children_of(&new_parent)?.get(new_name) {
            if existing != key {
                return Err(SyncError::NameConflict {
                    parent: self.resolve_path(&new_parent)?,
                    name: new_name.to_string(),
                });
            }
        }
        if self.is_ancestor_or_self(key, &new_parent)? {
            return Err(SyncError::InvalidOperation(format!(
                "cannot move {} below itself",
                self.resolve_path(key)?
            )));
        }

        self.children_of_mut(&old_parent)?.remove(&old_name);
        self.children_of_mut(&new_parent)?.insert(new_name.to_string(), *key);
        let node = self.get_mut(key)?;
        node.parent = Some(new_parent);
        node.name = new_name.to_string();
        Ok(())
    }

    /// Replace a file's fingerprint and size, returning the previous values.
    pub fn update_file(
        &mut self,
        key: &NodeKey,
        fingerprint: Option<Fingerprint>,
        size: u64,
    ) -> Result<(Option<Fingerprint>, u64)> {
        match &mut self.get_mut(key)?.kind {
            NodeKind::File {
                fingerprint: current,
                size: current_size,
            } => {
                let previous = (current.take(), *current_size);
                *current = fingerprint;
                *current_size = size;
                Ok(previous)
            }
            NodeKind::Folder { .. } => Err(SyncError::InvalidOperation(format!(
                "node {} is a folder, not a file",
                key
            ))),
        }
    }

    /// Absolute tree path of a node, e.g. `/docs/report.pdf`. The root is `/`.
    pub fn resolve_path(&self, key: &NodeKey) -> Result<String> {
        let mut parts = Vec::new();
        let mut current = self.get(key)?;
        while let Some(parent) = current.parent {
            parts.push(current.name.as_str());
            current = self.get(&parent)?;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    /// Local filesystem location of a node below `root`.
    pub fn local_path(&self, root: &Path, key: &NodeKey) -> Result<PathBuf> {
        let tree_path = self.resolve_path(key)?;
        let mut path = root.to_path_buf();
        for part in tree_path.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        Ok(path)
    }

    /// Find a node by its absolute tree path.
    pub fn find_by_path(&self, path: &str) -> Result<NodeKey> {
        let mut current = self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = self
                .children_of(&current)
                .ok()
                .and_then(|children| children.get(part).copied())
                .ok_or_else(|| SyncError::not_found(format!("path {}", path)))?;
        }
        Ok(current)
    }

    /// Keys of a subtree in pre-order, starting with `key`.
    pub fn walk(&self, key: &NodeKey) -> Result<Vec<NodeKey>> {
        let mut order = Vec::new();
        let mut stack = vec![*key];
        while let Some(next) = stack.pop() {
            let node = self.get(&next)?;
            order.push(next);
            if let NodeKind::Folder { children } = &node.kind {
                stack.extend(children.values().rev().copied());
            }
        }
        Ok(order)
    }

    fn is_ancestor_or_self(&self, ancestor: &NodeKey, key: &NodeKey) -> Result<bool> {
        let mut current = Some(*key);
        while let Some(k) = current {
            if k == *ancestor {
                return Ok(true);
            }
            current = self.get(&k)?.parent;
        }
        Ok(false)
    }
}

impl Default for IndexTree {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(SyncError::InvalidOperation(format!("invalid node name '{}'", name)));
    }
    Ok(())
}

/// Split `/a/b/c` into (`/a/b`, `c`).
pub fn split_tree_path(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) if idx + 1 < trimmed.len() => {
            let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
            Ok((parent.to_string(), trimmed[idx + 1..].to_string()))
        }
        _ => Err(SyncError::InvalidOperation(format!("'{}' has no file name", path))),
    }
}
