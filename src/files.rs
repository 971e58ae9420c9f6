//! Built-in computations over a directory tree.
//!
//! Paths in keys and results are relative to the root the computation was
//! created with; the empty path names the root itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::engine::{ComputationEnvironment, GraphTransformer};
use crate::key::{ComputeKey, KeySet, key_set};

const GLOB_OPTS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// The entries of a single directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DirectoryListKey(pub Utf8PathBuf);

impl DirectoryListKey {
    pub fn root() -> Self {
        Self(Utf8PathBuf::new())
    }
}

impl ComputeKey for DirectoryListKey {
    type Output = DirectoryList;
}

/// Entries of a directory by kind, each sorted. Symbolic links are never
/// followed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryList {
    pub files: Vec<Utf8PathBuf>,
    pub directories: Vec<Utf8PathBuf>,
    pub symlinks: Vec<Utf8PathBuf>,
}

/// Lists directories below `root`, skipping entries matching any of the
/// ignore patterns.
pub struct DirectoryListComputation {
    root: Utf8PathBuf,
    ignore: Vec<Pattern>,
}

impl DirectoryListComputation {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore: Vec::new(),
        }
    }

    /// Skips entries whose relative path matches `pattern`.
    pub fn ignore(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.ignore.push(Pattern::new(pattern)?);
        Ok(self)
    }

    fn is_ignored(&self, path: &Utf8Path) -> bool {
        self.ignore
            .iter()
            .any(|pattern| pattern.matches_with(path.as_str(), GLOB_OPTS))
    }
}

impl GraphTransformer for DirectoryListComputation {
    type Key = DirectoryListKey;

    fn discover_deps(&self, _: &DirectoryListKey, _: &ComputationEnvironment) -> anyhow::Result<KeySet> {
        Ok(KeySet::new())
    }

    fn transform(
        &self,
        key: &DirectoryListKey,
        _: &ComputationEnvironment,
    ) -> anyhow::Result<DirectoryList> {
        let dir = self.root.join(&key.0);
        let mut list = DirectoryList::default();

        let entries = dir
            .read_dir_utf8()
            .with_context(|| format!("Couldn't list directory {dir}"))?;

        for entry in entries {
            let entry = entry.with_context(|| format!("Couldn't list directory {dir}"))?;
            let path = key.0.join(entry.file_name());

            if self.is_ignored(&path) {
                continue;
            }

            let file_type = entry
                .file_type()
                .with_context(|| format!("Couldn't stat {path}"))?;

            if file_type.is_symlink() {
                list.symlinks.push(path);
            } else if file_type.is_dir() {
                list.directories.push(path);
            } else {
                list.files.push(path);
            }
        }

        list.files.sort();
        list.directories.sort();
        list.symlinks.sort();

        Ok(list)
    }
}

/// Everything below a directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileTreeKey(pub Utf8PathBuf);

impl FileTreeKey {
    pub fn root() -> Self {
        Self(Utf8PathBuf::new())
    }
}

impl ComputeKey for FileTreeKey {
    type Output = FileTree;
}

#[derive(Debug)]
pub struct FileTree {
    pub path: Utf8PathBuf,
    pub list: Arc<DirectoryList>,
    pub children: BTreeMap<Utf8PathBuf, Arc<FileTree>>,
}

impl FileTree {
    /// Every file in this tree, sorted.
    pub fn all_files(&self) -> Vec<Utf8PathBuf> {
        let mut files = Vec::new();
        self.collect_files(&mut files);
        files.sort();
        files
    }

    fn collect_files(&self, files: &mut Vec<Utf8PathBuf>) {
        files.extend(self.list.files.iter().cloned());
        for child in self.children.values() {
            child.collect_files(files);
        }
    }
}

/// Builds a [`FileTree`] out of directory listings. Requires a
/// [`DirectoryListComputation`] registered with the same engine.
///
/// Each tree first lists its own directory, then depends on the trees of its
/// subdirectories.
pub struct FileTreeComputation;

impl GraphTransformer for FileTreeComputation {
    type Key = FileTreeKey;

    fn discover_preliminary_deps(&self, key: &FileTreeKey) -> anyhow::Result<KeySet> {
        Ok(key_set([DirectoryListKey(key.0.clone())]))
    }

    fn discover_deps(&self, key: &FileTreeKey, env: &ComputationEnvironment) -> anyhow::Result<KeySet> {
        let list = env.get_dep(&DirectoryListKey(key.0.clone()))?;
        Ok(key_set(list.directories.iter().cloned().map(FileTreeKey)))
    }

    fn transform(&self, key: &FileTreeKey, env: &ComputationEnvironment) -> anyhow::Result<FileTree> {
        let list = env.get_dep_arc(&DirectoryListKey(key.0.clone()))?;

        let mut children = BTreeMap::new();
        for dir in &list.directories {
            let child = env.get_dep_arc(&FileTreeKey(dir.clone()))?;
            children.insert(dir.clone(), child);
        }

        Ok(FileTree {
            path: key.0.clone(),
            list,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{GraphEngine, for_each_strategy};
    use std::fs;

    fn fixture() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        fs::write(root.join("BUILD"), "").unwrap();
        fs::create_dir_all(root.join("src/lib")).unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(root.join("src/lib/mod.rs"), "").unwrap();
        fs::create_dir_all(root.join("target/debug")).unwrap();
        fs::write(root.join("target/debug/out"), "").unwrap();

        (dir, root)
    }

    fn paths(items: &[&str]) -> Vec<Utf8PathBuf> {
        items.iter().map(Utf8PathBuf::from).collect()
    }

    #[test]
    fn test_directory_list() {
        let (_dir, root) = fixture();
        let engine = GraphEngine::builder()
            .stage(DirectoryListComputation::new(root))
            .build()
            .unwrap();

        let list = engine.compute_unchecked(DirectoryListKey::root()).unwrap();
        assert_eq!(list.files, paths(&["BUILD"]));
        assert_eq!(list.directories, paths(&["src", "target"]));
        assert!(list.symlinks.is_empty());

        let src = engine
            .compute_unchecked(DirectoryListKey("src".into()))
            .unwrap();
        assert_eq!(src.files, paths(&["src/main.rs"]));
        assert_eq!(src.directories, paths(&["src/lib"]));
    }

    #[test]
    fn test_ignore_patterns() {
        let (_dir, root) = fixture();
        let listing = DirectoryListComputation::new(root)
            .ignore("target")
            .unwrap()
            .ignore("*.rs")
            .unwrap();

        let engine = GraphEngine::builder().stage(listing).build().unwrap();

        let list = engine.compute_unchecked(DirectoryListKey::root()).unwrap();
        assert_eq!(list.directories, paths(&["src"]));

        // `*` does not cross directories.
        let src = engine
            .compute_unchecked(DirectoryListKey("src".into()))
            .unwrap();
        assert_eq!(src.files, paths(&["src/main.rs"]));
    }

    #[test]
    fn test_missing_directory() {
        let (_dir, root) = fixture();
        let engine = GraphEngine::builder()
            .stage(DirectoryListComputation::new(root))
            .build()
            .unwrap();

        let err = engine
            .compute_unchecked(DirectoryListKey("nope".into()))
            .unwrap_err();
        assert!(err.to_string().starts_with("Couldn't list directory"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed() {
        let (_dir, root) = fixture();
        std::os::unix::fs::symlink(root.join("src"), root.join("link")).unwrap();

        let engine = GraphEngine::builder()
            .stage(DirectoryListComputation::new(root))
            .stage(FileTreeComputation)
            .build()
            .unwrap();

        let list = engine.compute_unchecked(DirectoryListKey::root()).unwrap();
        assert_eq!(list.symlinks, paths(&["link"]));

        let tree = engine.compute_unchecked(FileTreeKey::root()).unwrap();
        assert!(!tree.children.contains_key(Utf8Path::new("link")));
    }

    #[test]
    fn test_file_tree() {
        let (_dir, root) = fixture();

        for_each_strategy(
            |builder| {
                builder
                    .stage(DirectoryListComputation::new(root.clone()))
                    .stage(FileTreeComputation)
            },
            |strategy, engine| {
                let tree = engine.compute_unchecked(FileTreeKey::root()).unwrap();

                assert_eq!(
                    tree.all_files(),
                    paths(&["BUILD", "src/lib/mod.rs", "src/main.rs", "target/debug/out"]),
                    "{strategy:?}"
                );

                let src = &tree.children[Utf8Path::new("src")];
                assert_eq!(src.path, "src");
                assert_eq!(src.children.len(), 1);

                // Subtrees are shared with direct requests.
                let direct = engine
                    .compute_unchecked(FileTreeKey("src".into()))
                    .unwrap();
                assert!(Arc::ptr_eq(src, &direct));
            },
        );
    }
}
