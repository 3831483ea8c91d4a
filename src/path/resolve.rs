//! The resolution driver and the trace of where it ended up.

use crate::path::walker::{DirectoryOrSymlink, ScopeWalker};
use crate::path::{Component, ResolveError};

/// Records the path a resolution has traversed so far. The driver keeps it in
/// sync with the walker, which gives callers a normalized rendering of how
/// far resolution got: for error messages, and for returning the residual
/// path of a resolution that left the managed tree.
#[derive(Clone, Debug, Default)]
pub struct PathBuilder {
    absolute: bool,
    components: Vec<String>,
    /// Components below this index were entered irreversibly; `..` past them
    /// is recorded literally instead of popping.
    irreversible: usize,
}

impl PathBuilder {
    pub fn relative() -> Self {
        Self::default()
    }

    pub(crate) fn enter_scope(&mut self, absolute: bool) {
        if absolute {
            self.absolute = true;
            self.components.clear();
            self.irreversible = 0;
        }
    }

    pub fn push(&mut self, name: &Component, reversible: bool) {
        self.components.push(name.as_str().to_string());
        if !reversible {
            self.irreversible = self.components.len();
        }
    }

    pub(crate) fn up(&mut self) {
        if self.components.len() > self.irreversible {
            self.components.pop();
        } else if !self.absolute || !self.components.is_empty() {
            // Above the root of a relative path, or above an irreversible
            // component: keep the `..` verbatim.
            self.components.push("..".to_string());
            self.irreversible = self.components.len();
        }
        // `..` at the root of an absolute path stays at the root.
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }
}

impl std::fmt::Display for PathBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.absolute {
            write!(f, "/{}", self.components.join("/"))
        } else if self.components.is_empty() {
            f.write_str(".")
        } else {
            f.write_str(&self.components.join("/"))
        }
    }
}

enum Step {
    Up,
    Directory(Component),
    Terminal(Component),
}

/// Pathname strings still to be processed; symlink expansion pushes the
/// target on top of whatever remained of the path that contained the link.
struct ResolverState {
    stack: Vec<String>,
}

impl ResolverState {
    fn new(path: &str) -> Self {
        Self {
            stack: vec![path.to_string()],
        }
    }

    fn push_target(&mut self, target: String) {
        self.stack.push(target);
    }

    /// Whether the string about to be processed is absolute, consuming its
    /// leading slashes.
    fn current_is_absolute(&mut self) -> bool {
        match self.stack.last_mut() {
            Some(top) if top.starts_with('/') => {
                *top = top.trim_start_matches('/').to_string();
                true
            }
            _ => false,
        }
    }

    /// Whether any real component remains anywhere on the stack.
    fn has_more_components(&self) -> bool {
        self.stack.iter().any(|path| {
            path.split('/')
                .any(|part| !part.is_empty() && part != ".")
        })
    }

    fn next_component(&mut self) -> Result<Option<Step>, ResolveError> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };
            let trimmed = top.trim_start_matches('/');
            if trimmed.len() != top.len() {
                *top = trimmed.to_string();
            }
            if top.is_empty() {
                self.stack.pop();
                continue;
            }
            let name = match top.find('/') {
                Some(idx) => {
                    let name = top[..idx].to_string();
                    *top = top[idx + 1..].to_string();
                    name
                }
                None => {
                    let name = std::mem::take(top);
                    self.stack.pop();
                    name
                }
            };
            if name == "." {
                continue;
            }
            if name == ".." {
                return Ok(Some(Step::Up));
            }
            let component = Component::new(&name)
                .ok_or_else(|| ResolveError::InvalidPath(format!("invalid component {name:?}")))?;
            return Ok(Some(if self.has_more_components() {
                Step::Directory(component)
            } else {
                Step::Terminal(component)
            }));
        }
    }
}

/// Resolve `path` against a walker chain, keeping `builder` in sync with the
/// traversal. Returns once the terminal component has been handled or the
/// path turned out to consist of directories only.
pub async fn resolve(
    path: &str,
    scope_walker: Box<dyn ScopeWalker>,
    builder: &mut PathBuilder,
) -> Result<(), ResolveError> {
    let mut state = ResolverState::new(path);
    let mut scope_walker = scope_walker;
    'scopes: loop {
        let absolute = state.current_is_absolute();
        builder.enter_scope(absolute);
        let mut walker = scope_walker.on_scope(absolute)?;
        loop {
            let Some(step) = state.next_component()? else {
                return Ok(());
            };
            match step {
                Step::Up => {
                    walker = walker.on_up()?;
                    builder.up();
                }
                Step::Directory(name) => match walker.on_directory(&name).await? {
                    DirectoryOrSymlink::Directory { child, reversible } => {
                        builder.push(&name, reversible);
                        walker = child;
                    }
                    DirectoryOrSymlink::Symlink(follow) => {
                        state.push_target(follow.target);
                        scope_walker = follow.parent;
                        continue 'scopes;
                    }
                },
                Step::Terminal(name) => match walker.on_terminal(&name).await? {
                    None => {
                        builder.push(&name, true);
                        return Ok(());
                    }
                    Some(follow) => {
                        state.push_target(follow.target);
                        scope_walker = follow.parent;
                        continue 'scopes;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::walker::{
        AbsoluteScopeWalker, RelativeScopeWalker, VoidComponentWalker, VoidScopeWalker,
    };

    async fn render(path: &str) -> String {
        let mut builder = PathBuilder::relative();
        resolve(path, Box::new(VoidScopeWalker), &mut builder)
            .await
            .unwrap();
        builder.to_string()
    }

    #[tokio::test]
    async fn builder_normalizes_relative_paths() {
        assert_eq!(render("a/b/c").await, "a/b/c");
        assert_eq!(render("a//b/./c").await, "a/b/c");
        assert_eq!(render("").await, ".");
        assert_eq!(render(".").await, ".");
    }

    #[tokio::test]
    async fn builder_records_irreversible_dotdot() {
        // The void walker enters components irreversibly, so `..` cannot undo
        // them and is recorded literally.
        assert_eq!(render("a/../b").await, "a/../b");
        assert_eq!(render("../x").await, "../x");
    }

    #[tokio::test]
    async fn builder_resets_on_absolute_scope() {
        assert_eq!(render("/tmp//x/").await, "/tmp/x");
        assert_eq!(render("/").await, "/");
    }

    #[tokio::test]
    async fn scope_kind_is_enforced() {
        let mut builder = PathBuilder::relative();
        let err = resolve(
            "/abs",
            Box::new(RelativeScopeWalker::new(Box::new(VoidComponentWalker))),
            &mut builder,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResolveError::UnexpectedAbsolute));

        let err = resolve(
            "rel",
            Box::new(AbsoluteScopeWalker::new(Box::new(VoidComponentWalker))),
            &mut builder,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResolveError::UnexpectedRelative));
    }
}
