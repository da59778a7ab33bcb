//! The class-path collaborator (spec.md §6): `getStream(logicalName)
//! -> optional byte stream`. This core treats it as an external
//! interface — only a minimal directory-backed implementation ships
//! here; an archive/zip reader is explicitly out of scope (spec.md
//! §1) and left as a documented extension point.

use std::fs;
use std::path::PathBuf;

/// Looks up raw class bytes by logical name (`pkg/Cls`, no
/// extension). The first matching entry wins, scanning the
/// registered roots left to right — spec.md §4.1: "the leftmost
/// producer that answers wins."
pub trait ClassPath: Send + Sync {
    fn get_stream(&self, logical_name: &str) -> Option<Vec<u8>>;
}

/// Reads `.class` files out of an ordered list of directories, the
/// way a `:`/`;`-separated `CLASSPATH` of directories resolves.
pub struct DirClassPath {
    roots: Vec<PathBuf>,
}

impl DirClassPath {
    pub fn new(roots: impl IntoIterator<Item = String>) -> Self {
        DirClassPath {
            roots: roots.into_iter().map(PathBuf::from).collect(),
        }
    }
}

impl ClassPath for DirClassPath {
    fn get_stream(&self, logical_name: &str) -> Option<Vec<u8>> {
        for root in &self.roots {
            let path = root.join(format!("{logical_name}.class"));
            if let Ok(bytes) = fs::read(&path) {
                return Some(bytes);
            }
        }
        None
    }
}

/// A class-path backed by an in-memory map, used in tests and by the
/// GC/interpreter test harness to avoid touching the filesystem for
/// hand-assembled classes.
#[derive(Default)]
pub struct MemoryClassPath {
    entries: rustc_hash::FxHashMap<String, Vec<u8>>,
}

impl MemoryClassPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, logical_name: impl Into<String>, bytes: Vec<u8>) {
        self.entries.insert(logical_name.into(), bytes);
    }
}

impl ClassPath for MemoryClassPath {
    fn get_stream(&self, logical_name: &str) -> Option<Vec<u8>> {
        self.entries.get(logical_name).cloned()
    }
}

/// Combines several class-path collaborators, querying them in
/// order and returning the first hit — spec.md §4.1's leftmost-wins
/// lookup rule, generalized past a single directory list so
/// `DirClassPath` roots and a bootstrap `MemoryClassPath` (for
/// synthesized primitive/array bookkeeping classes, if ever needed)
/// can be composed.
pub struct CompositeClassPath {
    sources: Vec<Box<dyn ClassPath>>,
}

impl CompositeClassPath {
    pub fn new(sources: Vec<Box<dyn ClassPath>>) -> Self {
        CompositeClassPath { sources }
    }
}

impl ClassPath for CompositeClassPath {
    fn get_stream(&self, logical_name: &str) -> Option<Vec<u8>> {
        self.sources.iter().find_map(|s| s.get_stream(logical_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_class_path_round_trips() {
        let mut cp = MemoryClassPath::new();
        cp.insert("pkg/Cls", vec![1, 2, 3]);
        assert_eq!(cp.get_stream("pkg/Cls"), Some(vec![1, 2, 3]));
        assert_eq!(cp.get_stream("pkg/Other"), None);
    }

    #[test]
    fn composite_returns_first_match() {
        let mut a = MemoryClassPath::new();
        a.insert("A", vec![1]);
        let mut b = MemoryClassPath::new();
        b.insert("A", vec![2]);
        b.insert("B", vec![3]);
        let composite = CompositeClassPath::new(vec![Box::new(a), Box::new(b)]);
        assert_eq!(composite.get_stream("A"), Some(vec![1]));
        assert_eq!(composite.get_stream("B"), Some(vec![3]));
    }
}
