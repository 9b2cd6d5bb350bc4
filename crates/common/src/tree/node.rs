/// Name given to nodes for an empty path segment, including the root
pub const ROOT_NAME: &str = "/";

/// Top-level node holding keys that do not start with `/`.
///  No split segment contains a `/`, so no stored key can name it.
pub const RELATIVE_ROOT: &str = "./";

/// Payload-free view of a node's shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
    FileDirectory,
}

/// What a node holds.
///
/// A `FileDirectory` is a key that is both a stored value and a strict
///  prefix of other stored keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind<T> {
    File(T),
    Directory(Vec<TreeNode<T>>),
    FileDirectory(T, Vec<TreeNode<T>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode<T> {
    name: String,
    full_path: String,
    kind: NodeKind<T>,
}

impl<T> TreeNode<T> {
    pub(crate) fn file(segment: &str, full_path: String, stat: T) -> Self {
        Self {
            name: node_name(segment),
            full_path,
            kind: NodeKind::File(stat),
        }
    }

    pub(crate) fn directory(segment: &str, full_path: String) -> Self {
        Self {
            name: node_name(segment),
            full_path,
            kind: NodeKind::Directory(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store key this node stands for
    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub fn kind(&self) -> &NodeKind<T> {
        &self.kind
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::File(_) => NodeType::File,
            NodeKind::Directory(_) => NodeType::Directory,
            NodeKind::FileDirectory(_, _) => NodeType::FileDirectory,
        }
    }

    /// The stored payload, for `File` and `FileDirectory` nodes
    pub fn stat(&self) -> Option<&T> {
        match &self.kind {
            NodeKind::File(stat) | NodeKind::FileDirectory(stat, _) => Some(stat),
            NodeKind::Directory(_) => None,
        }
    }

    pub fn children(&self) -> &[TreeNode<T>] {
        match &self.kind {
            NodeKind::File(_) => &[],
            NodeKind::Directory(children) | NodeKind::FileDirectory(_, children) => children,
        }
    }

    pub fn child(&self, segment: &str) -> Option<&TreeNode<T>> {
        self.children().iter().find(|child| child.matches(segment))
    }

    pub fn is_file(&self) -> bool {
        self.stat().is_some()
    }

    pub fn is_dir(&self) -> bool {
        !matches!(self.kind, NodeKind::File(_))
    }

    /// Pre-order, depth-first visit of this node and its descendants
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a TreeNode<T>, usize)) {
        self.walk_at(0, visit);
    }

    fn walk_at<'a>(&'a self, depth: usize, visit: &mut impl FnMut(&'a TreeNode<T>, usize)) {
        visit(self, depth);
        for child in self.children() {
            child.walk_at(depth + 1, visit);
        }
    }

    pub(crate) fn matches(&self, segment: &str) -> bool {
        self.name == segment || (self.name == ROOT_NAME && segment.is_empty())
    }

    pub(crate) fn position(children: &[TreeNode<T>], segment: &str) -> Option<usize> {
        children.iter().position(|child| child.matches(segment))
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut Vec<TreeNode<T>>> {
        match &mut self.kind {
            NodeKind::File(_) => None,
            NodeKind::Directory(children) | NodeKind::FileDirectory(_, children) => {
                Some(children)
            }
        }
    }

    pub(crate) fn set_stat(&mut self, stat: T) -> bool {
        match &mut self.kind {
            NodeKind::File(current) | NodeKind::FileDirectory(current, _) => {
                *current = stat;
                true
            }
            NodeKind::Directory(_) => false,
        }
    }

    /// Attach a value, keeping any children
    pub(crate) fn with_stat(self, stat: T) -> Self {
        let kind = match self.kind {
            NodeKind::File(_) => NodeKind::File(stat),
            NodeKind::Directory(children) | NodeKind::FileDirectory(_, children) => {
                NodeKind::FileDirectory(stat, children)
            }
        };
        Self { kind, ..self }
    }

    /// Make room for children, keeping any value
    pub(crate) fn into_parent(self) -> Self {
        let kind = match self.kind {
            NodeKind::File(stat) => NodeKind::FileDirectory(stat, Vec::new()),
            other => other,
        };
        Self { kind, ..self }
    }

    /// Drop the value, keeping the children
    pub(crate) fn without_stat(self) -> Self {
        let kind = match self.kind {
            NodeKind::File(_) => NodeKind::Directory(Vec::new()),
            NodeKind::FileDirectory(_, children) => NodeKind::Directory(children),
            other => other,
        };
        Self { kind, ..self }
    }

    /// Drop the (empty) children list, keeping the value
    pub(crate) fn into_leaf(self) -> Self {
        let kind = match self.kind {
            NodeKind::FileDirectory(stat, children) if children.is_empty() => NodeKind::File(stat),
            other => other,
        };
        Self { kind, ..self }
    }

    /// Replace the node in `slot` with `f` applied to it
    pub(crate) fn transform(slot: &mut TreeNode<T>, f: impl FnOnce(TreeNode<T>) -> TreeNode<T>) {
        let node = std::mem::replace(slot, TreeNode::directory("", String::new()));
        *slot = f(node);
    }
}

fn node_name(segment: &str) -> String {
    if segment.is_empty() {
        ROOT_NAME.to_string()
    } else {
        segment.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_segment_named_as_root() {
        let node: TreeNode<()> = TreeNode::directory("", "/".to_string());
        assert_eq!(node.name(), ROOT_NAME);
        assert!(node.matches(""));
        assert!(node.matches("/"));
        assert!(!node.matches("a"));
    }

    #[test]
    fn test_transitions_keep_children() {
        let mut dir: TreeNode<u32> = TreeNode::directory("a", "/a".to_string());
        dir.children_mut()
            .unwrap()
            .push(TreeNode::file("b", "/a/b".to_string(), 2));

        let file_dir = dir.with_stat(1);
        assert_eq!(file_dir.node_type(), NodeType::FileDirectory);
        assert_eq!(file_dir.stat(), Some(&1));
        assert_eq!(file_dir.children().len(), 1);

        let dir = file_dir.without_stat();
        assert_eq!(dir.node_type(), NodeType::Directory);
        assert_eq!(dir.children()[0].stat(), Some(&2));
    }

    #[test]
    fn test_file_becomes_parent_then_leaf() {
        let file = TreeNode::file("a", "/a".to_string(), 1u8);
        let parent = file.into_parent();
        assert_eq!(parent.node_type(), NodeType::FileDirectory);
        assert!(parent.children().is_empty());
        assert_eq!(parent.into_leaf().node_type(), NodeType::File);
    }
}
