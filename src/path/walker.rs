//! Walker traits and the generic walkers shared by all resolution flavors.

use async_trait::async_trait;

use crate::path::{Component, ResolveError};

/// A symlink handed back to the driver: `target` is spliced in front of the
/// remaining path and re-resolved through `parent`.
pub struct FollowSymlink {
    pub parent: Box<dyn ScopeWalker>,
    pub target: String,
}

pub enum DirectoryOrSymlink {
    Directory {
        child: Box<dyn ComponentWalker>,
        /// Whether a later `..` may undo this step in the recorded path. Walks
        /// through territory the walker does not control record `..` literally
        /// instead.
        reversible: bool,
    },
    Symlink(FollowSymlink),
}

/// Called once per pathname string being resolved (the original path and
/// every symlink target).
pub trait ScopeWalker: Send {
    fn on_scope(self: Box<Self>, absolute: bool) -> Result<Box<dyn ComponentWalker>, ResolveError>;
}

/// Called per pathname component. Lookups may materialize lazy directories,
/// which is why entering components is asynchronous.
#[async_trait]
pub trait ComponentWalker: Send {
    async fn on_directory(
        self: Box<Self>,
        name: &Component,
    ) -> Result<DirectoryOrSymlink, ResolveError>;

    async fn on_terminal(
        self: Box<Self>,
        name: &Component,
    ) -> Result<Option<FollowSymlink>, ResolveError>;

    fn on_up(self: Box<Self>) -> Result<Box<dyn ComponentWalker>, ResolveError>;
}

/// Terminal handling for walkers that treat the last component like any other
/// directory (prefix creation wants the terminal to be a directory too).
pub async fn on_terminal_via_on_directory(
    walker: Box<dyn ComponentWalker>,
    name: &Component,
) -> Result<Option<FollowSymlink>, ResolveError> {
    match walker.on_directory(name).await? {
        DirectoryOrSymlink::Directory { .. } => Ok(None),
        DirectoryOrSymlink::Symlink(follow) => Ok(Some(follow)),
    }
}

/// Accepts every component without tracking anything. Used where only the
/// recorded path matters, and to swallow the remainder of paths that left the
/// tree the real walker controls.
pub struct VoidComponentWalker;

#[async_trait]
impl ComponentWalker for VoidComponentWalker {
    async fn on_directory(
        self: Box<Self>,
        _name: &Component,
    ) -> Result<DirectoryOrSymlink, ResolveError> {
        Ok(DirectoryOrSymlink::Directory {
            child: Box::new(VoidComponentWalker),
            reversible: false,
        })
    }

    async fn on_terminal(
        self: Box<Self>,
        _name: &Component,
    ) -> Result<Option<FollowSymlink>, ResolveError> {
        Ok(None)
    }

    fn on_up(self: Box<Self>) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        Ok(Box::new(VoidComponentWalker))
    }
}

/// Scope walker accepting both absolute and relative paths, walking them into
/// the void.
pub struct VoidScopeWalker;

impl ScopeWalker for VoidScopeWalker {
    fn on_scope(self: Box<Self>, _absolute: bool) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        Ok(Box::new(VoidComponentWalker))
    }
}

/// Rejects absolute paths, passing relative ones through to `inner`.
pub struct RelativeScopeWalker {
    inner: Box<dyn ComponentWalker>,
}

impl RelativeScopeWalker {
    pub fn new(inner: Box<dyn ComponentWalker>) -> Self {
        Self { inner }
    }
}

impl ScopeWalker for RelativeScopeWalker {
    fn on_scope(self: Box<Self>, absolute: bool) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        if absolute {
            return Err(ResolveError::UnexpectedAbsolute);
        }
        Ok(self.inner)
    }
}

/// Rejects relative paths, passing absolute ones through to `inner`.
pub struct AbsoluteScopeWalker {
    inner: Box<dyn ComponentWalker>,
}

impl AbsoluteScopeWalker {
    pub fn new(inner: Box<dyn ComponentWalker>) -> Self {
        Self { inner }
    }
}

impl ScopeWalker for AbsoluteScopeWalker {
    fn on_scope(self: Box<Self>, absolute: bool) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        if !absolute {
            return Err(ResolveError::UnexpectedRelative);
        }
        Ok(self.inner)
    }
}

/// Symlink expansions allowed per resolution, matching the kernel's limit.
pub const MAX_SYMLINK_FOLLOWS: u32 = 40;

/// Wraps a walker chain, counting every symlink expansion that passes through
/// it and failing once the budget runs out.
pub struct LoopDetectingScopeWalker {
    inner: Box<dyn ScopeWalker>,
    remaining: u32,
}

impl LoopDetectingScopeWalker {
    pub fn new(inner: Box<dyn ScopeWalker>) -> Self {
        Self {
            inner,
            remaining: MAX_SYMLINK_FOLLOWS,
        }
    }

    fn with_budget(inner: Box<dyn ScopeWalker>, remaining: u32) -> Self {
        Self { inner, remaining }
    }
}

impl ScopeWalker for LoopDetectingScopeWalker {
    fn on_scope(self: Box<Self>, absolute: bool) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        let remaining = self.remaining;
        let inner = self.inner.on_scope(absolute)?;
        Ok(Box::new(LoopDetectingComponentWalker { inner, remaining }))
    }
}

struct LoopDetectingComponentWalker {
    inner: Box<dyn ComponentWalker>,
    remaining: u32,
}

impl LoopDetectingComponentWalker {
    fn follow(follow: FollowSymlink, remaining: u32) -> Result<FollowSymlink, ResolveError> {
        if remaining == 0 {
            return Err(ResolveError::SymlinkLoop);
        }
        Ok(FollowSymlink {
            parent: Box::new(LoopDetectingScopeWalker::with_budget(
                follow.parent,
                remaining - 1,
            )),
            target: follow.target,
        })
    }
}

#[async_trait]
impl ComponentWalker for LoopDetectingComponentWalker {
    async fn on_directory(
        self: Box<Self>,
        name: &Component,
    ) -> Result<DirectoryOrSymlink, ResolveError> {
        let remaining = self.remaining;
        match self.inner.on_directory(name).await? {
            DirectoryOrSymlink::Directory { child, reversible } => {
                Ok(DirectoryOrSymlink::Directory {
                    child: Box::new(LoopDetectingComponentWalker {
                        inner: child,
                        remaining,
                    }),
                    reversible,
                })
            }
            DirectoryOrSymlink::Symlink(follow) => {
                Ok(DirectoryOrSymlink::Symlink(Self::follow(follow, remaining)?))
            }
        }
    }

    async fn on_terminal(
        self: Box<Self>,
        name: &Component,
    ) -> Result<Option<FollowSymlink>, ResolveError> {
        let remaining = self.remaining;
        match self.inner.on_terminal(name).await? {
            Some(follow) => Ok(Some(Self::follow(follow, remaining)?)),
            None => Ok(None),
        }
    }

    fn on_up(self: Box<Self>) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        let remaining = self.remaining;
        let inner = self.inner.on_up()?;
        Ok(Box::new(LoopDetectingComponentWalker { inner, remaining }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::resolve::{PathBuilder, resolve};

    /// Every terminal is a symlink pointing back at itself.
    struct SelfLink;

    impl ScopeWalker for SelfLink {
        fn on_scope(
            self: Box<Self>,
            _absolute: bool,
        ) -> Result<Box<dyn ComponentWalker>, ResolveError> {
            Ok(self)
        }
    }

    #[async_trait]
    impl ComponentWalker for SelfLink {
        async fn on_directory(
            self: Box<Self>,
            _name: &Component,
        ) -> Result<DirectoryOrSymlink, ResolveError> {
            Ok(DirectoryOrSymlink::Directory {
                child: self,
                reversible: true,
            })
        }

        async fn on_terminal(
            self: Box<Self>,
            _name: &Component,
        ) -> Result<Option<FollowSymlink>, ResolveError> {
            Ok(Some(FollowSymlink {
                parent: self,
                target: "again".to_string(),
            }))
        }

        fn on_up(self: Box<Self>) -> Result<Box<dyn ComponentWalker>, ResolveError> {
            Ok(self)
        }
    }

    #[tokio::test]
    async fn endless_symlink_chains_are_cut_off() {
        let mut builder = PathBuilder::relative();
        let err = resolve(
            "again",
            Box::new(LoopDetectingScopeWalker::new(Box::new(SelfLink))),
            &mut builder,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResolveError::SymlinkLoop));
    }

    #[tokio::test]
    async fn finite_chains_stay_under_the_budget() {
        // Void walkers never produce symlinks; the detector is transparent.
        let mut builder = PathBuilder::relative();
        resolve(
            "a/b/c",
            Box::new(LoopDetectingScopeWalker::new(Box::new(VoidScopeWalker))),
            &mut builder,
        )
        .await
        .unwrap();
        assert_eq!(builder.to_string(), "a/b/c");
    }
}
