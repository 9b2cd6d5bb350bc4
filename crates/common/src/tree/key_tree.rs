use std::fmt::Write as _;

use crate::wire::Record;

use super::node::{NodeKind, NodeType, TreeNode, RELATIVE_ROOT, ROOT_NAME};

/// What `append` does when the key already holds a value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Fail with [`TreeError::DuplicateKey`] and leave the tree untouched
    #[default]
    Reject,
    /// Replace the stored payload
    Overwrite,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("empty key path")]
    EmptyPath,
}

/// Hierarchical view over a flat, slash-delimited key space.
///
/// Invariants kept by every operation:
///  - a node holds a value iff its path was appended and not removed since
///  - a node has children iff some stored key lies strictly below it
///  - child names are unique under a parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTree<T> {
    root: TreeNode<T>,
    policy: DuplicatePolicy,
    len: usize,
}

impl<T> Default for KeyTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> KeyTree<T> {
    pub fn new() -> Self {
        Self::with_policy(DuplicatePolicy::default())
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            root: TreeNode::directory(ROOT_NAME, String::new()),
            policy,
            len: 0,
        }
    }

    pub fn root(&self) -> &TreeNode<T> {
        &self.root
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Number of stored keys (`File` and `FileDirectory` nodes)
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `stat` at `paths`, creating directories along the way.
    ///
    /// An existing `Directory` at the path becomes a `FileDirectory`; an
    ///  existing value is handled according to the tree's [`DuplicatePolicy`].
    pub fn append<S: AsRef<str>>(&mut self, paths: &[S], stat: T) -> Result<(), TreeError> {
        if paths.is_empty() {
            return Err(TreeError::EmptyPath);
        }
        let Some(children) = self.root.children_mut() else {
            return Err(TreeError::EmptyPath);
        };
        if append_in(children, "/", paths, stat, self.policy)? {
            self.len += 1;
        }
        Ok(())
    }

    /// Replace the payload of an existing value.
    ///  Returns `false`, leaving the tree untouched, if there is none.
    pub fn change<S: AsRef<str>>(&mut self, paths: &[S], stat: T) -> bool {
        match self.node_mut(paths) {
            Some(node) => node.set_stat(stat),
            None => false,
        }
    }

    /// `change` if the key is stored, `append` otherwise
    pub fn upsert<S: AsRef<str>>(&mut self, paths: &[S], stat: T) -> Result<(), TreeError> {
        if self.get(paths).is_some() {
            self.change(paths, stat);
            Ok(())
        } else {
            self.append(paths, stat)
        }
    }

    /// Delete the value at `paths`. Descendants are never removed: a
    ///  `FileDirectory` only loses its payload.
    ///
    /// Directories left without children are pruned and a `FileDirectory`
    ///  left without children becomes a `File`. Returns `false` if no value
    ///  was stored at the path.
    pub fn remove<S: AsRef<str>>(&mut self, paths: &[S]) -> bool {
        if paths.is_empty() {
            return false;
        }
        let Some(children) = self.root.children_mut() else {
            return false;
        };
        let removed = remove_in(children, paths);
        if removed {
            self.len -= 1;
        }
        removed
    }

    pub fn node<S: AsRef<str>>(&self, paths: &[S]) -> Option<&TreeNode<T>> {
        let mut node = &self.root;
        for segment in paths {
            node = node.child(segment.as_ref())?;
        }
        Some(node)
    }

    pub fn get<S: AsRef<str>>(&self, paths: &[S]) -> Option<&T> {
        self.node(paths)?.stat()
    }

    fn node_mut<S: AsRef<str>>(&mut self, paths: &[S]) -> Option<&mut TreeNode<T>> {
        if paths.is_empty() {
            return None;
        }
        let mut node = &mut self.root;
        for segment in paths {
            let children = node.children_mut()?;
            let index = TreeNode::position(children, segment.as_ref())?;
            node = &mut children[index];
        }
        Some(node)
    }

    /// Every stored value with its full path, depth-first
    pub fn leaves(&self) -> Vec<(&str, &T)> {
        let mut leaves = Vec::with_capacity(self.len);
        self.root.walk(&mut |node, _| {
            if let Some(stat) = node.stat() {
                leaves.push((node.full_path(), stat));
            }
        });
        leaves
    }

    /// Indented text form: `name` for values, `name/` for directories,
    ///  `name/*` for keys that are also directories
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.root.walk(&mut |node, depth| {
            let marker = match node.kind() {
                NodeKind::File(_) => "",
                NodeKind::Directory(_) if depth == 0 || node.name() == RELATIVE_ROOT => "",
                NodeKind::Directory(_) => "/",
                NodeKind::FileDirectory(_, _) => "/*",
            };
            let _ = writeln!(out, "{:indent$}{}{}", "", node.name(), marker, indent = depth * 2);
        });
        out
    }
}

impl KeyTree<Record> {
    pub fn append_record(&mut self, record: Record) -> Result<(), TreeError> {
        let paths = record.paths();
        self.append(&paths, record)
    }

    pub fn upsert_record(&mut self, record: Record) -> Result<(), TreeError> {
        let paths = record.paths();
        self.upsert(&paths, record)
    }

    pub fn change_record(&mut self, record: Record) -> bool {
        let paths = record.paths();
        self.change(&paths, record)
    }

    pub fn remove_key(&mut self, key: &[u8]) -> bool {
        self.remove(&super::key_to_paths(key))
    }

    pub fn get_key(&self, key: &[u8]) -> Option<&Record> {
        self.get(&super::key_to_paths(key))
    }
}

/// Key of the node for `segment` under a parent whose children start with
///  `prefix`, and the prefix of that node's own children
fn child_paths(prefix: &str, segment: &str) -> (String, String) {
    if prefix == "/" && segment == RELATIVE_ROOT {
        return (String::new(), String::new());
    }
    let path = format!("{prefix}{segment}");
    let below = format!("{path}/");
    (path, below)
}

/// Returns whether a new key was stored
fn append_in<T, S: AsRef<str>>(
    children: &mut Vec<TreeNode<T>>,
    prefix: &str,
    paths: &[S],
    stat: T,
    policy: DuplicatePolicy,
) -> Result<bool, TreeError> {
    let Some((segment, rest)) = paths.split_first() else {
        return Err(TreeError::EmptyPath);
    };
    let segment = segment.as_ref();
    let index = TreeNode::position(children, segment);
    let (path, below) = child_paths(prefix, segment);

    if rest.is_empty() {
        let Some(index) = index else {
            children.push(TreeNode::file(segment, path, stat));
            return Ok(true);
        };
        let child = &mut children[index];
        if !child.is_file() {
            TreeNode::transform(child, |node| node.with_stat(stat));
            return Ok(true);
        }
        return match policy {
            DuplicatePolicy::Reject => Err(TreeError::DuplicateKey(child.full_path().to_string())),
            DuplicatePolicy::Overwrite => {
                child.set_stat(stat);
                Ok(false)
            }
        };
    }

    let index = match index {
        Some(index) => index,
        None => {
            children.push(TreeNode::directory(segment, path));
            children.len() - 1
        }
    };
    let child = &mut children[index];
    if !child.is_dir() {
        TreeNode::transform(child, TreeNode::into_parent);
    }
    match child.children_mut() {
        Some(grandchildren) => append_in(grandchildren, &below, rest, stat, policy),
        None => Err(TreeError::EmptyPath),
    }
}

fn remove_in<T, S: AsRef<str>>(children: &mut Vec<TreeNode<T>>, paths: &[S]) -> bool {
    let Some((segment, rest)) = paths.split_first() else {
        return false;
    };
    let Some(index) = TreeNode::position(children, segment.as_ref()) else {
        return false;
    };

    if rest.is_empty() {
        let child = &mut children[index];
        match (child.node_type(), child.children().is_empty()) {
            (NodeType::Directory, _) => return false,
            (NodeType::FileDirectory, false) => {
                TreeNode::transform(child, TreeNode::without_stat);
            }
            _ => {
                children.remove(index);
            }
        }
        return true;
    }

    let child = &mut children[index];
    let Some(grandchildren) = child.children_mut() else {
        return false;
    };
    if !remove_in(grandchildren, rest) {
        return false;
    }
    if grandchildren.is_empty() {
        if child.is_file() {
            TreeNode::transform(child, TreeNode::into_leaf);
        } else {
            children.remove(index);
        }
    }
    true
}
