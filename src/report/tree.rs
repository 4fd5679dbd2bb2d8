use nix::unistd::Pid;
use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
};

use crate::oplog::OperationLog;

/// Where and by whom a file was last accessed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Access {
    pub sequence: usize,
    pub thread_id: Pid,
    pub thread_name: String,
}

/// A directory or file in a [`DirectoryTree`].
#[derive(Debug, Default)]
pub struct Node {
    name: String,
    path: PathBuf,
    access: Option<Access>,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn new(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    /// Set on nodes that were accessed as files.
    pub fn access(&self) -> Option<&Access> {
        self.access.as_ref()
    }

    #[must_use]
    /// A node is a file when it was accessed and nothing was recorded below
    /// it.
    pub fn is_file(&self) -> bool {
        self.access.is_some() && self.children.is_empty()
    }

    #[must_use]
    /// Children, directories first, each group ordered by name.
    pub fn children(&self) -> Vec<&Node> {
        let mut ret: Vec<&Node> = self.children.values().collect();
        ret.sort_by(|a, b| a.is_file().cmp(&b.is_file()).then_with(|| a.name.cmp(&b.name)));
        ret
    }
}

/// Accessed files arranged by directory, rooted at `/`.
#[derive(Debug)]
pub struct DirectoryTree {
    root: Node,
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self {
            root: Node::new("/".to_string(), PathBuf::from("/")),
        }
    }
}

impl DirectoryTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    /// Tree of every operation in `log`.
    pub fn from_log(log: &OperationLog) -> Self {
        let mut tree = Self::new();
        for op in log {
            tree.insert(
                op.path(),
                Access {
                    sequence: op.sequence(),
                    thread_id: op.thread_id(),
                    thread_name: op.thread_name().to_string(),
                },
            );
        }
        tree
    }

    /// Add `path`, creating intermediate directories. Accessing the same
    /// file again replaces its access with the latest one.
    pub fn insert(&mut self, path: &Path, access: Access) {
        let mut node = &mut self.root;
        let mut current = PathBuf::from("/");
        let mut touched = false;
        for component in path.components() {
            let Component::Normal(part) = component else {
                continue;
            };
            current.push(part);
            let name = part.to_string_lossy().into_owned();
            node = node
                .children
                .entry(name.clone())
                .or_insert_with(|| Node::new(name, current.clone()));
            touched = true;
        }

        if touched {
            node.access = Some(access);
        }
    }

    #[must_use]
    pub fn root(&self) -> &Node {
        &self.root
    }

    #[must_use]
    /// Number of accessed files.
    pub fn file_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            if node.access.is_some() {
                count += 1;
            }
            stack.extend(node.children.values());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(sequence: usize) -> Access {
        Access {
            sequence,
            thread_id: Pid::from_raw(10),
            thread_name: "cat".to_string(),
        }
    }

    fn child<'a>(node: &'a Node, name: &str) -> &'a Node {
        node.children()
            .into_iter()
            .find(|child| child.name() == name)
            .expect("child")
    }

    #[test]
    fn test_insert_builds_directories() {
        let mut tree = DirectoryTree::new();
        tree.insert(Path::new("/tmp/project/src/main.rs"), access(1));

        let tmp = child(tree.root(), "tmp");
        assert!(!tmp.is_file());
        let project = child(tmp, "project");
        assert_eq!(project.path(), Path::new("/tmp/project"));
        let main = child(child(project, "src"), "main.rs");
        assert!(main.is_file());
        assert_eq!(main.path(), Path::new("/tmp/project/src/main.rs"));
        assert_eq!(main.access().map(|a| a.sequence), Some(1));
        assert_eq!(tree.file_count(), 1);
    }

    #[test]
    fn test_directories_sort_before_files() {
        let mut tree = DirectoryTree::new();
        tree.insert(Path::new("/p/a.txt"), access(1));
        tree.insert(Path::new("/p/z/inner.txt"), access(2));
        tree.insert(Path::new("/p/b.txt"), access(3));
        tree.insert(Path::new("/p/c/inner.txt"), access(4));

        let p = child(tree.root(), "p");
        let names: Vec<&str> = p.children().into_iter().map(Node::name).collect();
        assert_eq!(names, ["c", "z", "a.txt", "b.txt"]);
    }

    #[test]
    fn test_reaccess_keeps_latest() {
        let mut log = OperationLog::new();
        log.append(Pid::from_raw(1), PathBuf::from("/d/f"), "a".into());
        log.append(Pid::from_raw(2), PathBuf::from("/d/f"), "b".into());

        let tree = DirectoryTree::from_log(&log);
        let file = child(child(tree.root(), "d"), "f");
        let latest = file.access().expect("accessed");
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.thread_id, Pid::from_raw(2));
        assert_eq!(latest.thread_name, "b");
        assert_eq!(tree.file_count(), 1);
    }

    #[test]
    fn test_root_path_is_ignored() {
        let mut tree = DirectoryTree::new();
        tree.insert(Path::new("/"), access(1));
        assert!(tree.root().access().is_none());
        assert!(tree.root().children().is_empty());
    }
}
