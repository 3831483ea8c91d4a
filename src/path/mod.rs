//! Path-resolution machinery.
//!
//! Resolution is a collaboration between a driver ([`resolve`]) that parses a
//! pathname string and a walker that knows what the traversed components
//! mean. Walkers implement [`ScopeWalker`] (called once per pathname string,
//! deciding what absolute vs relative means) and [`ComponentWalker`] (called
//! per component). A walker can hand back a symlink target, which the driver
//! splices into the remaining path and re-resolves through the walker's
//! parent scope.

pub mod resolve;
pub mod virtual_root;
pub mod walker;

use std::fmt;

use thiserror::Error;

use crate::cas::CasError;

pub use resolve::{PathBuilder, resolve};
pub use virtual_root::VirtualRootScopeWalkerFactory;
pub use walker::{
    AbsoluteScopeWalker, ComponentWalker, DirectoryOrSymlink, FollowSymlink,
    LoopDetectingScopeWalker, MAX_SYMLINK_FOLLOWS, RelativeScopeWalker, ScopeWalker,
    VoidComponentWalker, VoidScopeWalker,
};

/// A single validated pathname component: non-empty, slash-free, and neither
/// `.` nor `..`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Component(String);

impl Component {
    pub fn new(name: &str) -> Option<Self> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return None;
        }
        Some(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("path does not exist")]
    NotFound,

    #[error("path component is not a directory")]
    NotADirectory,

    #[error("too many levels of symbolic links")]
    SymlinkLoop,

    #[error("path resolves to a location outside the output path")]
    OutsideOutputPath,

    #[error("path is absolute, while a relative path was expected")]
    UnexpectedAbsolute,

    #[error("path is relative, while an absolute path was expected")]
    UnexpectedRelative,

    #[error("{0}")]
    InvalidPath(String),

    #[error(transparent)]
    Storage(#[from] CasError),
}

impl ResolveError {
    /// Closest errno for callers speaking the filesystem vocabulary.
    pub fn errno(&self) -> i32 {
        match self {
            ResolveError::NotFound => libc::ENOENT,
            ResolveError::NotADirectory => libc::ENOTDIR,
            ResolveError::SymlinkLoop => libc::ELOOP,
            ResolveError::OutsideOutputPath
            | ResolveError::UnexpectedAbsolute
            | ResolveError::UnexpectedRelative
            | ResolveError::InvalidPath(_) => libc::EINVAL,
            ResolveError::Storage(_) => libc::EIO,
        }
    }
}
