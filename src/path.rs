use std::{
    env, fs,
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
};

/// Prefixes that are always in scope, whatever the base directory.
pub const ALWAYS_ALLOWED: [&str; 3] = ["/lib", "/proc", "/etc/ld.so.cache"];

/// Which file operations are kept in the operation log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scope {
    base_dir: Option<PathBuf>,
    filtering: bool,
}

impl Scope {
    #[must_use]
    /// Keep only paths at or under `base_dir` (plus [`ALWAYS_ALLOWED`]).
    pub fn within(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
            filtering: true,
        }
    }

    #[must_use]
    /// Keep every path.
    pub fn everything() -> Self {
        Self {
            base_dir: None,
            filtering: false,
        }
    }

    #[must_use]
    /// Same base directory, filtering turned off. This is the global override.
    pub fn unfiltered(self) -> Self {
        Self {
            filtering: false,
            ..self
        }
    }

    #[must_use]
    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    #[must_use]
    pub fn filtering(&self) -> bool {
        self.filtering
    }

    #[must_use]
    /// Whether filtering applies at all: enabled and a base directory set.
    pub fn is_active(&self) -> bool {
        self.filtering && self.base_dir.is_some()
    }
}

/// Normalize `path` without touching the filesystem: `.` components are
/// dropped and `..` pops the previous component, never above the root.
#[must_use]
pub fn lexical(path: &Path) -> PathBuf {
    let mut ret = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::CurDir => {}
            Component::RootDir => ret.push(Component::RootDir),
            Component::ParentDir => match ret.components().next_back() {
                Some(Component::Normal(_)) => {
                    ret.pop();
                }
                Some(Component::RootDir) => {}
                _ => ret.push(Component::ParentDir),
            },
            Component::Normal(part) => ret.push(part),
        }
    }
    ret
}

/// Turn `path` into an absolute, normalized path.
///
/// Symbolic links are resolved when the target exists. Otherwise a relative
/// path is joined to the current working directory and normalized
/// lexically. An empty input yields an empty path.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        return PathBuf::new();
    }

    if let Ok(resolved) = fs::canonicalize(path) {
        return resolved;
    }

    if path.is_relative() {
        if let Ok(cwd) = env::current_dir() {
            let full = cwd.join(path);
            return fs::canonicalize(&full).unwrap_or_else(|_| lexical(&full));
        }
    }

    lexical(path)
}

/// Join `relative` onto `base`, unless it is already absolute or empty.
#[must_use]
pub fn resolve_relative(base: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() || relative.is_absolute() {
        return relative.to_path_buf();
    }
    normalize(&base.join(relative))
}

fn always_allowed(path: &Path) -> bool {
    let bytes = path.as_os_str().as_bytes();
    ALWAYS_ALLOWED
        .iter()
        .any(|prefix| bytes.starts_with(prefix.as_bytes()))
}

/// Whether `path` lies at or under the scope's base directory.
///
/// Always true when filtering is disabled or no base directory is set. The
/// [`ALWAYS_ALLOWED`] prefixes match as plain string prefixes; the base
/// directory comparison is component-wise on normalized paths.
#[must_use]
pub fn within_scope(path: &Path, scope: &Scope) -> bool {
    let Some(base_dir) = scope.base_dir() else {
        return true;
    };
    if !scope.filtering() {
        return true;
    }
    if always_allowed(path) {
        return true;
    }

    let path = normalize(path);
    let base_dir = normalize(base_dir);
    if path.as_os_str().is_empty() || base_dir.as_os_str().is_empty() {
        return false;
    }

    path.starts_with(&base_dir)
}
