mod key_tree;
mod node;

pub use key_tree::{DuplicatePolicy, KeyTree, TreeError};
pub use node::{NodeKind, NodeType, TreeNode, RELATIVE_ROOT, ROOT_NAME};

use crate::wire::encoding;

/// Split a store key into tree path segments.
///
/// The key is decoded (lossily for non UTF-8 bytes) and split on `/`; the
///  leading empty segment of a key starting with `/` is dropped. Keys without
///  a leading `/` are placed under [`RELATIVE_ROOT`] so that `a` and `/a`
///  stay distinct. Inner empty segments are kept and map to nodes named
///  [`ROOT_NAME`].
pub fn key_to_paths(key: &[u8]) -> Vec<String> {
    let text = encoding::display(key);
    if text.is_empty() {
        return Vec::new();
    }
    match text.strip_prefix('/') {
        Some(rest) => rest.split('/').map(str::to_string).collect(),
        None => std::iter::once(RELATIVE_ROOT)
            .chain(text.split('/'))
            .map(str::to_string)
            .collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_to_paths() {
        assert_eq!(key_to_paths(b"/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(key_to_paths(b"a/b"), vec![RELATIVE_ROOT, "a", "b"]);
        assert_eq!(key_to_paths(b"/a//b"), vec!["a", "", "b"]);
        assert_eq!(key_to_paths(b"/a/"), vec!["a", ""]);
        assert!(key_to_paths(b"").is_empty());
        assert_eq!(key_to_paths(b"/"), vec![""]);
        assert_ne!(key_to_paths(b"a"), key_to_paths(b"/a"));
    }

    #[test]
    fn test_key_to_paths_lossy() {
        let paths = key_to_paths(b"/k\xff/v");
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1], "v");
        assert!(paths[0].starts_with('k'));
    }
}
