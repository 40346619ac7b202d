//! The in-memory hierarchical key/value tree that the state machine
//! consumes. The tree's own full read/write API is out of scope; only the
//! handful of operations the state machine's `Command::Tree` needs are
//! implemented here.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum TreeOp {
    Write { path: String, contents: Vec<u8> },
    Read { path: String },
    Remove { path: String },
    List { path: String },
    MakeDirectory { path: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum TreeResult {
    Ok,
    Contents(Vec<u8>),
    Listing(Vec<String>),
    Error(TreeError),
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, thiserror::Error)]
pub enum TreeError {
    #[error("path {0} does not exist")]
    LookupError(String),
    #[error("path {0} is a directory")]
    TypeError(String),
    #[error("path {0} already exists")]
    Conflict(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Node {
    File(Vec<u8>),
    Directory(BTreeMap<String, Node>),
}

/// Serialized form of the tree, used in the snapshot body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeSnapshot {
    entries: Vec<(String, Vec<u8>)>,
}

#[derive(Clone, Debug, Default)]
pub struct Tree {
    root: BTreeMap<String, Node>,
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, op: &TreeOp) -> TreeResult {
        match op {
            TreeOp::Write { path, contents } => self.write(path, contents.clone()),
            TreeOp::Read { path } => self.read(path),
            TreeOp::Remove { path } => self.remove(path),
            TreeOp::List { path } => self.list(path),
            TreeOp::MakeDirectory { path } => self.mkdir(path),
        }
    }

    fn write(&mut self, path: &str, contents: Vec<u8>) -> TreeResult {
        let parts = split(path);
        let Some((last, dirs)) = parts.split_last() else {
            return TreeResult::Error(TreeError::TypeError(path.to_string()));
        };
        let mut cur = &mut self.root;
        for d in dirs {
            let entry = cur.entry(d.to_string()).or_insert_with(|| Node::Directory(BTreeMap::new()));
            match entry {
                Node::Directory(m) => cur = m,
                Node::File(_) => return TreeResult::Error(TreeError::TypeError(path.to_string())),
            }
        }
        cur.insert(last.to_string(), Node::File(contents));
        TreeResult::Ok
    }

    fn lookup(&self, path: &str) -> Option<&Node> {
        let parts = split(path);
        let mut cur = &self.root;
        let Some((last, dirs)) = parts.split_last() else {
            return None;
        };
        for d in dirs {
            match cur.get(*d) {
                Some(Node::Directory(m)) => cur = m,
                _ => return None,
            }
        }
        cur.get(*last)
    }

    fn read(&self, path: &str) -> TreeResult {
        match self.lookup(path) {
            Some(Node::File(bytes)) => TreeResult::Contents(bytes.clone()),
            Some(Node::Directory(_)) => TreeResult::Error(TreeError::TypeError(path.to_string())),
            None => TreeResult::Error(TreeError::LookupError(path.to_string())),
        }
    }

    fn remove(&mut self, path: &str) -> TreeResult {
        let parts = split(path);
        let Some((last, dirs)) = parts.split_last() else {
            return TreeResult::Error(TreeError::TypeError(path.to_string()));
        };
        let mut cur = &mut self.root;
        for d in dirs {
            match cur.get_mut(*d) {
                Some(Node::Directory(m)) => cur = m,
                _ => return TreeResult::Error(TreeError::LookupError(path.to_string())),
            }
        }
        match cur.remove(*last) {
            Some(_) => TreeResult::Ok,
            None => TreeResult::Error(TreeError::LookupError(path.to_string())),
        }
    }

    fn list(&self, path: &str) -> TreeResult {
        match self.lookup_dir(path) {
            Some(m) => TreeResult::Listing(m.keys().cloned().collect()),
            None => TreeResult::Error(TreeError::LookupError(path.to_string())),
        }
    }

    fn lookup_dir(&self, path: &str) -> Option<&BTreeMap<String, Node>> {
        if path.is_empty() || path == "/" {
            return Some(&self.root);
        }
        match self.lookup(path) {
            Some(Node::Directory(m)) => Some(m),
            _ => None,
        }
    }

    fn mkdir(&mut self, path: &str) -> TreeResult {
        let parts = split(path);
        let mut cur = &mut self.root;
        for (i, d) in parts.iter().enumerate() {
            let entry = cur.entry(d.to_string()).or_insert_with(|| Node::Directory(BTreeMap::new()));
            match entry {
                Node::Directory(m) => cur = m,
                Node::File(_) if i + 1 == parts.len() => {
                    return TreeResult::Error(TreeError::Conflict(path.to_string()))
                }
                Node::File(_) => return TreeResult::Error(TreeError::TypeError(path.to_string())),
            }
        }
        TreeResult::Ok
    }

    fn flatten_into(map: &BTreeMap<String, Node>, prefix: &str, out: &mut Vec<(String, Vec<u8>)>) {
        for (name, node) in map {
            let path = format!("{prefix}/{name}");
            match node {
                Node::File(bytes) => out.push((path, bytes.clone())),
                Node::Directory(m) => Self::flatten_into(m, &path, out),
            }
        }
    }

    /// Serializes into a flat `(path, contents)` listing for the snapshot body.
    pub fn to_snapshot(&self) -> TreeSnapshot {
        let mut entries = Vec::new();
        Self::flatten_into(&self.root, "", &mut entries);
        TreeSnapshot { entries }
    }

    pub fn from_snapshot(snapshot: TreeSnapshot) -> Self {
        let mut tree = Tree::new();
        for (path, contents) in snapshot.entries {
            tree.write(&path, contents);
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut tree = Tree::new();
        assert_eq!(tree.write("/a/b", b"hello".to_vec()), TreeResult::Ok);
        assert_eq!(tree.read("/a/b"), TreeResult::Contents(b"hello".to_vec()));
    }

    #[test]
    fn read_missing_is_lookup_error() {
        let tree = Tree::new();
        assert_eq!(tree.read("/nope"), TreeResult::Error(TreeError::LookupError("/nope".into())));
    }

    #[test]
    fn snapshot_round_trips() {
        let mut tree = Tree::new();
        tree.write("/a", b"1".to_vec());
        tree.write("/b/c", b"2".to_vec());
        let snap = tree.to_snapshot();
        let restored = Tree::from_snapshot(snap);
        assert_eq!(restored.read("/a"), TreeResult::Contents(b"1".to_vec()));
        assert_eq!(restored.read("/b/c"), TreeResult::Contents(b"2".to_vec()));
    }

    #[test]
    fn list_root() {
        let mut tree = Tree::new();
        tree.write("/a", b"1".to_vec());
        tree.write("/b", b"2".to_vec());
        let TreeResult::Listing(mut names) = tree.list("/") else { panic!("expected listing") };
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
