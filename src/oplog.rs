use nix::unistd::Pid;
use serde::Serializer;
use serde_derive::Serialize;
use std::path::{Path, PathBuf};

/// One successful, in-scope file open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileOperation {
    owner: i32,
    #[serde(serialize_with = "lossy")]
    path: PathBuf,
    sequence: usize,
    thread_id: i32,
    thread_name: String,
}

// Names are arbitrary bytes; reports carry them lossily.
fn lossy<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&path.to_string_lossy())
}

impl FileOperation {
    #[must_use]
    pub fn owner(&self) -> Pid {
        Pid::from_raw(self.owner)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    /// 1-based position in the run, dense across every traced id.
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    #[must_use]
    pub fn thread_id(&self) -> Pid {
        Pid::from_raw(self.thread_id)
    }

    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }
}

/// Append-only list of file operations.
///
/// Sequence numbers are assigned at append time as `len + 1`, so they stay
/// gap-free and strictly increasing however many ids interleave. Entries are
/// never mutated or removed.
#[derive(Debug, Default)]
pub struct OperationLog {
    operations: Vec<FileOperation>,
}

impl OperationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open of `path` performed by `owner`.
    ///
    /// # Returns
    ///
    /// The freshly appended operation, carrying its sequence number.
    pub fn append(
        &mut self,
        owner: Pid,
        path: PathBuf,
        thread_name: String,
    ) -> &FileOperation {
        let sequence = self.operations.len() + 1;
        self.operations.push(FileOperation {
            owner: owner.as_raw(),
            path,
            sequence,
            thread_id: owner.as_raw(),
            thread_name,
        });
        &self.operations[sequence - 1]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileOperation> {
        self.operations.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[FileOperation] {
        &self.operations
    }
}

impl<'a> IntoIterator for &'a OperationLog {
    type Item = &'a FileOperation;
    type IntoIter = std::slice::Iter<'a, FileOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.iter()
    }
}
