//! Data trees, structural diffs, and the schema validation seam.
//!
//! The engine moves configuration and operational data around as
//! [`DataTree`] values: ordered trees keyed by path-segment text, with an
//! optional scalar [`DataValue`] per node. A committed or proposed mutation
//! is a [`ChangeSet`] — a deterministic, path-ordered list of
//! create/delete/modify operations produced by diffing two trees. Change
//! subscribers read a change set through the restartable [`ChangeIter`].
//!
//! Schema knowledge lives outside the engine; the [`SubtreeValidator`]
//! trait is the seam through which provider-returned subtrees are checked.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::xpath::{split_segments, XPathError, XPathFilter};

// ---------------------------------------------------------------------------
// DatastoreKind
// ---------------------------------------------------------------------------

/// The datastores a change subscription can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatastoreKind {
    /// The active configuration.
    Running,
    /// Configuration loaded at startup.
    Startup,
    /// Scratch configuration staged for a later commit.
    Candidate,
    /// Operational state (explicitly pushed layer).
    Operational,
}

impl fmt::Display for DatastoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Startup => "startup",
            Self::Candidate => "candidate",
            Self::Operational => "operational",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// DataValue
// ---------------------------------------------------------------------------

/// Scalar node value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    /// String leaf.
    String(String),
    /// Signed integer leaf.
    Int64(i64),
    /// Unsigned integer leaf.
    Uint64(u64),
    /// Decimal leaf.
    Decimal(f64),
    /// Boolean leaf.
    Bool(bool),
    /// Presence leaf carrying no value.
    Empty,
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Uint64(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Empty => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// DataTree
// ---------------------------------------------------------------------------

/// One node of a [`DataTree`].
///
/// The node's name is the key under which it is stored in its parent, so
/// it is not duplicated here. Children are ordered by segment text for
/// deterministic traversal and diffing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataNode {
    /// Scalar value, if this node is a leaf (or presence container).
    pub value: Option<DataValue>,
    /// Child nodes keyed by segment text (`if[name='eth0']`, `mtu`, ...).
    pub children: BTreeMap<String, DataNode>,
}

impl DataNode {
    /// Returns `true` if the node has neither value nor children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }
}

/// A schema-rooted tree of data keyed by path segments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTree {
    root: DataNode,
}

impl DataTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the tree holds no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Returns the (anonymous) root node.
    #[must_use]
    pub fn root(&self) -> &DataNode {
        &self.root
    }

    /// Looks up the node at an absolute path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&DataNode> {
        let segs = split_segments(path).ok()?;
        let mut node = &self.root;
        for seg in &segs {
            node = node.children.get(seg)?;
        }
        Some(node)
    }

    /// Looks up the value at an absolute path.
    #[must_use]
    pub fn get_value(&self, path: &str) -> Option<&DataValue> {
        self.get(path).and_then(|n| n.value.as_ref())
    }

    /// Sets the value at an absolute path, creating intermediate nodes.
    ///
    /// # Errors
    ///
    /// Returns [`XPathError`] if the path cannot be parsed.
    pub fn set(&mut self, path: &str, value: Option<DataValue>) -> Result<(), XPathError> {
        let segs = split_segments(path)?;
        let mut node = &mut self.root;
        for seg in &segs {
            node = node.children.entry(seg.clone()).or_default();
        }
        node.value = value;
        Ok(())
    }

    /// Removes the subtree at an absolute path.
    ///
    /// Returns `true` if a node existed there.
    ///
    /// # Errors
    ///
    /// Returns [`XPathError`] if the path cannot be parsed.
    pub fn remove(&mut self, path: &str) -> Result<bool, XPathError> {
        let segs = split_segments(path)?;
        let Some((last, parents)) = segs.split_last() else {
            return Ok(false);
        };
        let mut node = &mut self.root;
        for seg in parents {
            match node.children.get_mut(seg) {
                Some(n) => node = n,
                None => return Ok(false),
            }
        }
        Ok(node.children.remove(last).is_some())
    }

    /// Merges a subtree under `parent_path`, creating the parent chain.
    ///
    /// Incoming values overwrite existing ones; children are merged
    /// recursively.
    ///
    /// # Errors
    ///
    /// Returns [`XPathError`] if the parent path cannot be parsed.
    pub fn merge_subtree(&mut self, parent_path: &str, subtree: &DataTree) -> Result<(), XPathError> {
        let target = if parent_path == "/" {
            &mut self.root
        } else {
            let segs = split_segments(parent_path)?;
            let mut node = &mut self.root;
            for seg in &segs {
                node = node.children.entry(seg.clone()).or_default();
            }
            node
        };
        merge_node(target, &subtree.root);
        Ok(())
    }

    /// Flattens the tree into `(path, value)` pairs in path order.
    #[must_use]
    pub fn to_paths(&self) -> Vec<(String, Option<DataValue>)> {
        let mut out = Vec::new();
        collect_paths(&self.root, &mut String::new(), &mut out);
        out
    }

    /// Returns a pruned copy keeping only nodes the filter covers.
    ///
    /// Ancestors of kept nodes are recreated as bare containers.
    #[must_use]
    pub fn filtered(&self, filter: &XPathFilter) -> DataTree {
        let mut out = DataTree::new();
        for (path, value) in self.to_paths() {
            if filter.covers(&path) {
                // Paths from to_paths always parse.
                let _ = out.set(&path, value);
            }
        }
        out
    }

    /// Lists the concrete child segment texts of the node at `path`
    /// whose parsed name matches `name` (list-instance expansion).
    #[must_use]
    pub fn child_instances(&self, path: &str, name: &str) -> Vec<String> {
        let node = if path == "/" {
            Some(&self.root)
        } else {
            self.get(path)
        };
        let Some(node) = node else {
            return Vec::new();
        };
        node.children
            .keys()
            .filter(|key| {
                crate::xpath::Segment::parse(key).is_ok_and(|seg| seg.name == *name)
            })
            .cloned()
            .collect()
    }
}

fn merge_node(dst: &mut DataNode, src: &DataNode) {
    if src.value.is_some() {
        dst.value = src.value.clone();
    }
    for (key, child) in &src.children {
        merge_node(dst.children.entry(key.clone()).or_default(), child);
    }
}

fn collect_paths(
    node: &DataNode,
    prefix: &mut String,
    out: &mut Vec<(String, Option<DataValue>)>,
) {
    for (key, child) in &node.children {
        let len = prefix.len();
        prefix.push('/');
        prefix.push_str(key);
        out.push((prefix.clone(), child.value.clone()));
        collect_paths(child, prefix, out);
        prefix.truncate(len);
    }
}

// ---------------------------------------------------------------------------
// ChangeOp / ChangeSet
// ---------------------------------------------------------------------------

/// One node-level operation of a change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeOp {
    /// A node was (or is to be) created.
    Create {
        /// Absolute node path.
        path: String,
        /// Value of the created node.
        value: Option<DataValue>,
    },
    /// A node was (or is to be) deleted, along with its subtree.
    Delete {
        /// Absolute node path.
        path: String,
        /// Value the node had before deletion.
        old_value: Option<DataValue>,
    },
    /// A node's value changed.
    Modify {
        /// Absolute node path.
        path: String,
        /// Previous value.
        old_value: Option<DataValue>,
        /// New value.
        value: Option<DataValue>,
    },
}

impl ChangeOp {
    /// Returns the path the operation concerns.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. } | Self::Delete { path, .. } | Self::Modify { path, .. } => {
                path
            }
        }
    }
}

/// A deterministic, path-ordered list of [`ChangeOp`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    ops: Vec<ChangeOp>,
}

impl ChangeSet {
    /// Creates an empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a change set from an explicit operation list.
    #[must_use]
    pub fn from_ops(ops: Vec<ChangeOp>) -> Self {
        Self { ops }
    }

    /// Diffs two trees, producing creates, deletes, and modifies in path
    /// order. Applying the result to `old` yields `new`.
    #[must_use]
    pub fn from_trees(old: &DataTree, new: &DataTree) -> Self {
        let old_paths: BTreeMap<String, Option<DataValue>> = old.to_paths().into_iter().collect();
        let new_paths: BTreeMap<String, Option<DataValue>> = new.to_paths().into_iter().collect();

        let mut ops = Vec::new();
        for (path, old_value) in &old_paths {
            match new_paths.get(path) {
                None => ops.push(ChangeOp::Delete {
                    path: path.clone(),
                    old_value: old_value.clone(),
                }),
                Some(new_value) if new_value != old_value => ops.push(ChangeOp::Modify {
                    path: path.clone(),
                    old_value: old_value.clone(),
                    value: new_value.clone(),
                }),
                Some(_) => {}
            }
        }
        for (path, value) in &new_paths {
            if !old_paths.contains_key(path) {
                ops.push(ChangeOp::Create {
                    path: path.clone(),
                    value: value.clone(),
                });
            }
        }
        ops.sort_by(|a, b| a.path().cmp(b.path()));
        Self { ops }
    }

    /// Presents an entire tree as creates (parents before children).
    ///
    /// Applying the result to an empty tree reproduces `tree` exactly.
    #[must_use]
    pub fn as_creates(tree: &DataTree) -> Self {
        let ops = tree
            .to_paths()
            .into_iter()
            .map(|(path, value)| ChangeOp::Create { path, value })
            .collect();
        Self { ops }
    }

    /// Applies the change set to a tree.
    ///
    /// # Errors
    ///
    /// Returns [`XPathError`] if an operation path cannot be parsed.
    pub fn apply(&self, tree: &mut DataTree) -> Result<(), XPathError> {
        for op in &self.ops {
            match op {
                ChangeOp::Create { path, value } | ChangeOp::Modify { path, value, .. } => {
                    tree.set(path, value.clone())?;
                }
                ChangeOp::Delete { path, .. } => {
                    tree.remove(path)?;
                }
            }
        }
        Ok(())
    }

    /// Appends an operation (used by update-phase edits).
    pub fn push(&mut self, op: ChangeOp) {
        self.ops.push(op);
    }

    /// Returns the operations in order.
    #[must_use]
    pub fn ops(&self) -> &[ChangeOp] {
        &self.ops
    }

    /// Returns `true` if the set holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns `true` if at least one changed path is covered by the
    /// filter.
    #[must_use]
    pub fn touches(&self, filter: &XPathFilter) -> bool {
        self.ops.iter().any(|op| filter.covers(op.path()))
    }

    /// Opens a restartable iterator, optionally narrowed to a filter.
    #[must_use]
    pub fn iter_filtered(&self, filter: Option<&XPathFilter>) -> ChangeIter {
        let ops = match filter {
            Some(f) => self
                .ops
                .iter()
                .filter(|op| f.covers(op.path()))
                .cloned()
                .collect(),
            None => self.ops.clone(),
        };
        ChangeIter { ops, pos: 0 }
    }
}

// ---------------------------------------------------------------------------
// ChangeIter
// ---------------------------------------------------------------------------

/// Restartable iterator over a change set.
///
/// Change callbacks may walk the changes several times within one event;
/// [`ChangeIter::restart`] rewinds to the first operation.
#[derive(Debug, Clone)]
pub struct ChangeIter {
    ops: Vec<ChangeOp>,
    pos: usize,
}

impl ChangeIter {
    /// Returns the next operation, or `None` at the end.
    pub fn next_op(&mut self) -> Option<ChangeOp> {
        let op = self.ops.get(self.pos).cloned();
        if op.is_some() {
            self.pos += 1;
        }
        op
    }

    /// Rewinds to the first operation.
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    /// Returns the number of operations visible to this iterator.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if no operation is visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Iterator for ChangeIter {
    type Item = ChangeOp;

    fn next(&mut self) -> Option<ChangeOp> {
        self.next_op()
    }
}

// ---------------------------------------------------------------------------
// SubtreeValidator
// ---------------------------------------------------------------------------

/// Schema seam: validates provider-returned subtrees.
///
/// The engine has no schema knowledge of its own; the embedding layer
/// supplies an implementation backed by its schema context. Operational
/// reads fail with a validation error when a provider subtree is rejected.
pub trait SubtreeValidator: Send + Sync {
    /// Validates `subtree` as data rooted under `parent_path`.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first schema violation.
    fn validate(&self, parent_path: &str, subtree: &DataTree) -> Result<(), String>;
}

/// Validator accepting every subtree.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SubtreeValidator for AcceptAll {
    fn validate(&self, _parent_path: &str, _subtree: &DataTree) -> Result<(), String> {
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
