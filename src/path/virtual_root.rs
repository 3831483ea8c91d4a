//! Re-anchoring of absolute paths that point back into the output path.
//!
//! Symlinks created by build actions routinely carry absolute targets such as
//! `/home/user/.cache/bazel/.../execroot/out/bin/tool`. When such a target
//! falls inside the output path (or one of its declared aliases), resolution
//! must continue inside the managed tree instead of reporting the path as
//! external. The factory captures the output path and aliases once per build;
//! the walkers it produces intercept every absolute scope and try to match
//! the declared prefixes component by component.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::path::walker::{ComponentWalker, DirectoryOrSymlink, FollowSymlink, ScopeWalker};
use crate::path::{Component, ResolveError, VoidComponentWalker};

struct RootPattern {
    /// Components of the output path or alias, matched literally.
    components: Vec<Component>,
    /// Where the pattern re-enters the tree, relative to the output path
    /// root. Empty for the output path itself.
    replacement: Vec<Component>,
}

pub struct VirtualRootScopeWalkerFactory {
    patterns: Arc<Vec<RootPattern>>,
}

impl VirtualRootScopeWalkerFactory {
    pub fn new(
        output_path: &str,
        aliases: &HashMap<String, String>,
    ) -> Result<Self, ResolveError> {
        let root = parse_absolute(output_path)?;
        if root.is_empty() {
            return Err(ResolveError::InvalidPath(
                "output path must not be the filesystem root".to_string(),
            ));
        }
        let mut patterns = vec![RootPattern {
            components: root,
            replacement: Vec::new(),
        }];
        for (alias, subpath) in aliases {
            let components = parse_absolute(alias)?;
            if components.is_empty() {
                return Err(ResolveError::InvalidPath(
                    "alias path must not be the filesystem root".to_string(),
                ));
            }
            patterns.push(RootPattern {
                components,
                replacement: parse_relative(subpath)?,
            });
        }
        Ok(Self {
            patterns: Arc::new(patterns),
        })
    }

    /// Wrap a walker chain so absolute scopes are matched against the
    /// declared prefixes before anything reaches `base`.
    pub fn wrap(&self, base: Box<dyn ScopeWalker>) -> Box<dyn ScopeWalker> {
        Box::new(VirtualRootScopeWalker {
            patterns: self.patterns.clone(),
            base,
        })
    }
}

fn parse_absolute(path: &str) -> Result<Vec<Component>, ResolveError> {
    if !path.starts_with('/') {
        return Err(ResolveError::UnexpectedRelative);
    }
    parse_components(path)
}

fn parse_relative(path: &str) -> Result<Vec<Component>, ResolveError> {
    if path.starts_with('/') {
        return Err(ResolveError::UnexpectedAbsolute);
    }
    parse_components(path)
}

fn parse_components(path: &str) -> Result<Vec<Component>, ResolveError> {
    let mut out = Vec::new();
    for part in path.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        let component = Component::new(part).ok_or_else(|| {
            ResolveError::InvalidPath(format!("path {path:?} contains component {part:?}"))
        })?;
        out.push(component);
    }
    Ok(out)
}

struct VirtualRootScopeWalker {
    patterns: Arc<Vec<RootPattern>>,
    base: Box<dyn ScopeWalker>,
}

impl ScopeWalker for VirtualRootScopeWalker {
    fn on_scope(self: Box<Self>, absolute: bool) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        if absolute {
            // Start matching the declared prefixes from their first component.
            let candidates = (0..self.patterns.len()).map(|i| (i, 0)).collect();
            Ok(Box::new(MatchingWalker {
                patterns: self.patterns,
                candidates,
                base: self.base,
            }))
        } else {
            // Relative scopes stay wherever the underlying walker is; keep
            // wrapping so later absolute symlink targets are still matched.
            let patterns = self.patterns.clone();
            let inner = self.base.on_scope(false)?;
            Ok(Box::new(PassThroughWalker { patterns, inner }))
        }
    }
}

/// Component walker for paths known to be inside the tree. Rewraps children
/// and symlink parents so the virtual root applies to every later scope.
struct PassThroughWalker {
    patterns: Arc<Vec<RootPattern>>,
    inner: Box<dyn ComponentWalker>,
}

impl PassThroughWalker {
    fn wrap_follow(patterns: Arc<Vec<RootPattern>>, follow: FollowSymlink) -> FollowSymlink {
        FollowSymlink {
            parent: Box::new(VirtualRootScopeWalker {
                patterns,
                base: follow.parent,
            }),
            target: follow.target,
        }
    }
}

#[async_trait]
impl ComponentWalker for PassThroughWalker {
    async fn on_directory(
        self: Box<Self>,
        name: &Component,
    ) -> Result<DirectoryOrSymlink, ResolveError> {
        let patterns = self.patterns.clone();
        match self.inner.on_directory(name).await? {
            DirectoryOrSymlink::Directory { child, reversible } => {
                Ok(DirectoryOrSymlink::Directory {
                    child: Box::new(PassThroughWalker {
                        patterns,
                        inner: child,
                    }),
                    reversible,
                })
            }
            DirectoryOrSymlink::Symlink(follow) => Ok(DirectoryOrSymlink::Symlink(
                Self::wrap_follow(patterns, follow),
            )),
        }
    }

    async fn on_terminal(
        self: Box<Self>,
        name: &Component,
    ) -> Result<Option<FollowSymlink>, ResolveError> {
        let patterns = self.patterns.clone();
        match self.inner.on_terminal(name).await? {
            Some(follow) => Ok(Some(Self::wrap_follow(patterns, follow))),
            None => Ok(None),
        }
    }

    fn on_up(self: Box<Self>) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        let patterns = self.patterns.clone();
        let inner = self.inner.on_up()?;
        Ok(Box::new(PassThroughWalker { patterns, inner }))
    }
}

/// Component walker for an absolute scope whose fate is still undecided:
/// either the path turns out to be a declared prefix and resolution re-enters
/// the tree, or matching fails and the rest of the path is walked into the
/// void so the caller can report it as external.
struct MatchingWalker {
    patterns: Arc<Vec<RootPattern>>,
    /// `(pattern index, components already matched)`.
    candidates: Vec<(usize, usize)>,
    base: Box<dyn ScopeWalker>,
}

/// Advance all candidates by `name`, returning the pattern that was completed
/// by it, if any.
fn advance(
    patterns: &[RootPattern],
    candidates: &mut Vec<(usize, usize)>,
    name: &Component,
) -> Option<usize> {
    let mut completed = None;
    candidates.retain_mut(|(idx, consumed)| {
        let pattern = &patterns[*idx];
        if pattern.components[*consumed] != *name {
            return false;
        }
        *consumed += 1;
        if *consumed == pattern.components.len() && completed.is_none() {
            completed = Some(*idx);
        }
        true
    });
    completed
}

impl MatchingWalker {
    /// Hand resolution back to the underlying walker at the output path root
    /// and walk it down the pattern's replacement path.
    async fn reenter(
        patterns: Arc<Vec<RootPattern>>,
        base: Box<dyn ScopeWalker>,
        pattern: usize,
    ) -> Result<Reentered, ResolveError> {
        let mut inner = base.on_scope(true)?;
        for component in &patterns[pattern].replacement {
            match inner.on_directory(component).await? {
                DirectoryOrSymlink::Directory { child, .. } => inner = child,
                DirectoryOrSymlink::Symlink(follow) => {
                    return Ok(Reentered::Symlink(PassThroughWalker::wrap_follow(
                        patterns, follow,
                    )));
                }
            }
        }
        Ok(Reentered::Directory(Box::new(PassThroughWalker {
            patterns,
            inner,
        })))
    }
}

enum Reentered {
    Directory(Box<dyn ComponentWalker>),
    Symlink(FollowSymlink),
}

#[async_trait]
impl ComponentWalker for MatchingWalker {
    async fn on_directory(
        self: Box<Self>,
        name: &Component,
    ) -> Result<DirectoryOrSymlink, ResolveError> {
        let mut this = *self;
        if let Some(pattern) = advance(&this.patterns, &mut this.candidates, name) {
            let child = match MatchingWalker::reenter(this.patterns, this.base, pattern).await? {
                Reentered::Directory(child) => child,
                Reentered::Symlink(follow) => {
                    return Ok(DirectoryOrSymlink::Symlink(follow));
                }
            };
            return Ok(DirectoryOrSymlink::Directory {
                child,
                reversible: true,
            });
        }
        if this.candidates.is_empty() {
            // No prefix can match anymore: the path is outside the tree.
            return Ok(DirectoryOrSymlink::Directory {
                child: Box::new(VoidComponentWalker),
                reversible: false,
            });
        }
        Ok(DirectoryOrSymlink::Directory {
            child: Box::new(this),
            reversible: true,
        })
    }

    async fn on_terminal(
        self: Box<Self>,
        name: &Component,
    ) -> Result<Option<FollowSymlink>, ResolveError> {
        let mut this = *self;
        if let Some(pattern) = advance(&this.patterns, &mut this.candidates, name) {
            // The path is exactly a declared prefix: the result is the
            // directory the pattern re-enters at.
            return match MatchingWalker::reenter(this.patterns, this.base, pattern).await? {
                Reentered::Directory(_) => Ok(None),
                Reentered::Symlink(follow) => Ok(Some(follow)),
            };
        }
        Ok(None)
    }

    fn on_up(self: Box<Self>) -> Result<Box<dyn ComponentWalker>, ResolveError> {
        // `..` can no longer match a declared prefix literally.
        Ok(Box::new(VoidComponentWalker))
    }
}
