//! In-memory hierarchical namespace with versions and transaction ids.

use std::collections::BTreeSet;
use std::collections::HashMap;

use bytes::Bytes;

use crate::constants::ROOT_PATH;
use crate::constants::SEQUENTIAL_SUFFIX_WIDTH;
use crate::path;
use crate::CreateMode;
use crate::NodeError;
use crate::Stat;

type TreeResult<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One applied mutation, in transaction order
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    pub zxid: u64,
    pub path: String,
    pub kind: ChangeKind,
    pub payload: Option<Bytes>,
    pub version: Option<u64>,
}

#[derive(Debug)]
struct Znode {
    data: Bytes,
    stat: Stat,
    children: BTreeSet<String>,
    /// Next suffix handed to a sequential child
    next_sequence: u64,
}

impl Znode {
    fn new(
        data: Bytes,
        zxid: u64,
        ephemeral_owner: Option<u64>,
    ) -> Self {
        Self {
            data,
            stat: Stat {
                version: 0,
                cversion: 0,
                czxid: zxid,
                mzxid: zxid,
                num_children: 0,
                ephemeral_owner,
            },
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct DataTree {
    nodes: HashMap<String, Znode>,
    last_zxid: u64,
}

impl Default for DataTree {
    fn default() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_PATH.to_string(), Znode::new(Bytes::new(), 0, None));
        Self {
            nodes,
            last_zxid: 0,
        }
    }
}

impl DataTree {
    pub(crate) fn last_zxid(&self) -> u64 {
        self.last_zxid
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Creates `path` and, with `create_parents`, every missing ancestor.
    ///
    /// All preconditions are checked before anything is mutated.
    pub(crate) fn create(
        &mut self,
        path: &str,
        payload: Bytes,
        mode: CreateMode,
        create_parents: bool,
        owner: u64,
    ) -> TreeResult<(String, Vec<Change>)> {
        path::validate_path(path)?;
        if path == ROOT_PATH {
            return Err(NodeError::NodeExists(path.to_string()));
        }

        let parent = path::parent(path).unwrap_or(ROOT_PATH);
        let missing: Vec<&str> = path::ancestors(path)
            .take_while(|p| !self.nodes.contains_key(*p))
            .collect();
        if !missing.is_empty() && !create_parents {
            return Err(NodeError::NoNode(parent.to_string()));
        }

        let existing_ancestor = path::ancestors(path)
            .find(|p| self.nodes.contains_key(*p))
            .unwrap_or(ROOT_PATH);
        if self.nodes[existing_ancestor].stat.ephemeral_owner.is_some() {
            return Err(NodeError::NoChildrenForEphemerals(existing_ancestor.to_string()));
        }
        if !mode.is_sequential() && self.nodes.contains_key(path) {
            return Err(NodeError::NodeExists(path.to_string()));
        }

        let mut changes = Vec::with_capacity(missing.len() + 1);
        for ancestor in missing.into_iter().rev() {
            changes.push(self.insert(ancestor.to_string(), Bytes::new(), None));
        }

        let actual = if mode.is_sequential() {
            let parent_node = self
                .nodes
                .get_mut(parent)
                .ok_or_else(|| NodeError::NoNode(parent.to_string()))?;
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            format!("{path}{sequence:0width$}", width = SEQUENTIAL_SUFFIX_WIDTH)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(NodeError::NodeExists(actual));
        }

        let ephemeral_owner = mode.is_ephemeral().then_some(owner);
        changes.push(self.insert(actual.clone(), payload, ephemeral_owner));
        Ok((actual, changes))
    }

    /// Removes `path`; with `recursive` the whole subtree goes, deepest nodes first
    pub(crate) fn delete(
        &mut self,
        path: &str,
        recursive: bool,
    ) -> TreeResult<Vec<Change>> {
        path::validate_path(path)?;
        if path == ROOT_PATH {
            return Err(NodeError::InvalidPath {
                path: path.to_string(),
                reason: "the root node cannot be deleted".to_string(),
            });
        }
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| NodeError::NoNode(path.to_string()))?;
        if !node.children.is_empty() && !recursive {
            return Err(NodeError::NotEmpty(path.to_string()));
        }

        let mut doomed = Vec::new();
        self.collect_post_order(path, &mut doomed);
        Ok(doomed.into_iter().map(|p| self.remove(&p)).collect())
    }

    pub(crate) fn read(
        &self,
        path: &str,
    ) -> TreeResult<(Bytes, Stat)> {
        path::validate_path(path)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| NodeError::NoNode(path.to_string()))?;
        Ok((node.data.clone(), node.stat))
    }

    pub(crate) fn write(
        &mut self,
        path: &str,
        payload: Bytes,
        expected_version: Option<u64>,
    ) -> TreeResult<(Stat, Change)> {
        path::validate_path(path)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| NodeError::NoNode(path.to_string()))?;
        if let Some(expected) = expected_version {
            if expected != node.stat.version {
                return Err(NodeError::VersionConflict {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                });
            }
        }

        self.last_zxid += 1;
        node.data = payload.clone();
        node.stat.version += 1;
        node.stat.mzxid = self.last_zxid;

        let change = Change {
            zxid: self.last_zxid,
            path: path.to_string(),
            kind: ChangeKind::Updated,
            payload: Some(payload),
            version: Some(node.stat.version),
        };
        Ok((node.stat, change))
    }

    /// Child names in lexicographic order
    pub(crate) fn children(
        &self,
        path: &str,
    ) -> TreeResult<Vec<String>> {
        path::validate_path(path)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| NodeError::NoNode(path.to_string()))?;
        Ok(node.children.iter().cloned().collect())
    }

    pub(crate) fn exists(
        &self,
        path: &str,
    ) -> TreeResult<Option<Stat>> {
        path::validate_path(path)?;
        Ok(self.nodes.get(path).map(|n| n.stat))
    }

    /// Removes every ephemeral node owned by `session_id`
    pub(crate) fn remove_ephemerals(
        &mut self,
        session_id: u64,
    ) -> Vec<Change> {
        let mut owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == Some(session_id))
            .map(|(p, _)| p.clone())
            .collect();
        owned.sort();
        // ephemeral nodes are leaves, so any order is valid; sorted keeps events stable
        owned.iter().map(|p| self.remove(p)).collect()
    }

    fn insert(
        &mut self,
        path: String,
        payload: Bytes,
        ephemeral_owner: Option<u64>,
    ) -> Change {
        self.last_zxid += 1;
        let zxid = self.last_zxid;

        if let Some(parent) = path::parent(&path).and_then(|p| self.nodes.get_mut(p)) {
            parent.children.insert(path::name(&path).to_string());
            parent.stat.cversion += 1;
            parent.stat.num_children = parent.children.len() as u32;
        }
        self.nodes
            .insert(path.clone(), Znode::new(payload.clone(), zxid, ephemeral_owner));

        Change {
            zxid,
            path,
            kind: ChangeKind::Created,
            payload: Some(payload),
            version: Some(0),
        }
    }

    fn remove(
        &mut self,
        path: &str,
    ) -> Change {
        self.last_zxid += 1;
        self.nodes.remove(path);
        if let Some(parent) = path::parent(path).and_then(|p| self.nodes.get_mut(p)) {
            parent.children.remove(path::name(path));
            parent.stat.cversion += 1;
            parent.stat.num_children = parent.children.len() as u32;
        }

        Change {
            zxid: self.last_zxid,
            path: path.to_string(),
            kind: ChangeKind::Deleted,
            payload: None,
            version: None,
        }
    }

    fn collect_post_order(
        &self,
        path: &str,
        out: &mut Vec<String>,
    ) {
        if let Some(node) = self.nodes.get(path) {
            for child in &node.children {
                self.collect_post_order(&path::join(path, child), out);
            }
        }
        out.push(path.to_string());
    }
}

#[cfg(test)]
mod data_tree_test;
