//! Per-principal path sandbox.
//!
//! Tool arguments that name a filesystem path (`path`, `file`, `directory`,
//! `dir`, `cwd`, `workdir`) are resolved through this module before a tool
//! handler ever sees them. The property that matters to callers is simple:
//! [`Sandbox::resolve_path`] either returns an absolute path *inside* the
//! principal's root, or `None`. There is no third outcome where a clever
//! relative path walks out of the root — callers that need a prefix-escape
//! guarantee get it from `resolve_path` alone, never from inspecting the
//! returned path after the fact.
//!
//! This is a different problem from OS-level capability sandboxing (seccomp,
//! Landlock, Seatbelt): it's a logical jail applied to tool-call arguments
//! before they reach a handler, not a kernel-enforced boundary around a
//! worker process.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Well-known argument keys that name a filesystem path.
pub const PATH_ARGUMENT_KEYS: &[&str] = &["path", "file", "directory", "dir", "cwd", "workdir"];

/// Sentinel written back into a tool-call's arguments when a path argument
/// fails to resolve inside the sandbox root. Handlers must treat this value
/// as "refused", never try to reinterpret it.
pub const ESCAPE_SENTINEL: &str = "__sandbox_denied__";

/// Per-principal root directory used to resolve path-bearing tool arguments.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// `root` need not exist yet; it is only used as a prefix for
    /// containment checks, never created or read by this type.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `candidate` (relative or absolute) against this sandbox's
    /// root and verify the result stays inside it.
    ///
    /// Resolution is purely lexical: `.` and `..` components are collapsed
    /// without touching the filesystem, so this works for paths that don't
    /// exist yet (e.g. a file a tool is about to create). The containment
    /// check is a component-wise prefix comparison, not a string
    /// `starts_with`, so `/sandbox-evil` is never mistaken for a path
    /// inside `/sandbox`.
    pub fn resolve_path(&self, candidate: &str) -> Option<PathBuf> {
        let candidate_path = Path::new(candidate);
        let joined = if candidate_path.is_absolute() {
            candidate_path.to_path_buf()
        } else {
            self.root.join(candidate_path)
        };

        let resolved = lexically_normalize(&joined);
        let root = lexically_normalize(&self.root);

        if is_contained(&root, &resolved) {
            Some(resolved)
        } else {
            None
        }
    }

    /// Rewrite every well-known path key in `args` through [`resolve_path`].
    /// Keys that fail to resolve are replaced with [`ESCAPE_SENTINEL`]
    /// rather than removed, so a handler can distinguish "not provided"
    /// from "provided but denied".
    pub fn rewrite_arguments(&self, args: &mut serde_json::Value) {
        let Some(obj) = args.as_object_mut() else {
            return;
        };

        for key in PATH_ARGUMENT_KEYS {
            if let Some(value) = obj.get_mut(*key) {
                let Some(candidate) = value.as_str() else {
                    continue;
                };
                match self.resolve_path(candidate) {
                    Some(resolved) => {
                        *value = serde_json::Value::String(resolved.to_string_lossy().into_owned())
                    }
                    None => {
                        tracing::warn!(key = *key, candidate, "path argument escaped sandbox root");
                        *value = serde_json::Value::String(ESCAPE_SENTINEL.to_string());
                    }
                }
            }
        }
    }
}

fn lexically_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                // Only pop a real directory component, never climb past root
                // via a bare `..` with nothing preceding it.
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !matches!(out.components().next_back(), Some(Component::RootDir)) {
                    out.push(component);
                }
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// `candidate` is contained in `root` iff every component of `root` is a
/// prefix of `candidate`'s components — a true component-wise comparison,
/// which avoids the classic `/root-evil`-starts-with-`/root` bug that a
/// plain string `starts_with` would fall into.
fn is_contained(root: &Path, candidate: &Path) -> bool {
    let mut root_components = root.components();
    let mut candidate_components = candidate.components();

    loop {
        match root_components.next() {
            Some(rc) => match candidate_components.next() {
                Some(cc) if cc == rc => continue,
                _ => return false,
            },
            None => return true,
        }
    }
}

/// Registry of per-principal sandboxes, lazily created under a shared data
/// directory (`<data_dir>/<principal_id>`).
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    data_dir: PathBuf,
    sandboxes: sandbox_map::SandboxMap,
}

mod sandbox_map {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct SandboxMap(Mutex<HashMap<String, Sandbox>>);

    impl SandboxMap {
        pub fn get_or_create(&self, principal_id: &str, make_root: impl FnOnce() -> PathBuf) -> Sandbox {
            let mut guard = self.0.lock().unwrap();
            guard
                .entry(principal_id.to_string())
                .or_insert_with(|| Sandbox::new(make_root()))
                .clone()
        }
    }
}

impl SandboxRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sandboxes: Default::default(),
        }
    }

    pub fn for_principal(&self, principal_id: &str) -> Sandbox {
        let data_dir = self.data_dir.clone();
        let principal_id_owned = principal_id.to_string();
        self.sandboxes
            .get_or_create(principal_id, move || data_dir.join(principal_id_owned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_path_inside_root() {
        let sandbox = Sandbox::new("/sandbox/alice");
        let resolved = sandbox.resolve_path("notes/todo.md").unwrap();
        assert_eq!(resolved, PathBuf::from("/sandbox/alice/notes/todo.md"));
    }

    #[test]
    fn refuses_dotdot_escape() {
        let sandbox = Sandbox::new("/sandbox/alice");
        assert!(sandbox.resolve_path("../bob/secret.txt").is_none());
        assert!(sandbox.resolve_path("../../etc/passwd").is_none());
    }

    #[test]
    fn refuses_prefix_ambiguous_sibling() {
        // `/sandbox/alice-evil` must not be treated as inside `/sandbox/alice`
        // even though the string has the right prefix.
        let sandbox = Sandbox::new("/sandbox/alice");
        assert!(sandbox.resolve_path("/sandbox/alice-evil/x").is_none());
    }

    #[test]
    fn accepts_absolute_path_inside_root() {
        let sandbox = Sandbox::new("/sandbox/alice");
        let resolved = sandbox.resolve_path("/sandbox/alice/deep/file").unwrap();
        assert_eq!(resolved, PathBuf::from("/sandbox/alice/deep/file"));
    }

    #[test]
    fn refuses_absolute_path_outside_root() {
        let sandbox = Sandbox::new("/sandbox/alice");
        assert!(sandbox.resolve_path("/etc/shadow").is_none());
    }

    #[test]
    fn dotdot_that_stays_inside_root_is_allowed() {
        let sandbox = Sandbox::new("/sandbox/alice");
        let resolved = sandbox.resolve_path("sub/../notes.md").unwrap();
        assert_eq!(resolved, PathBuf::from("/sandbox/alice/notes.md"));
    }

    #[test]
    fn rewrite_arguments_replaces_escape_with_sentinel() {
        let sandbox = Sandbox::new("/sandbox/alice");
        let mut args = serde_json::json!({ "path": "../../etc/passwd", "other": "kept" });
        sandbox.rewrite_arguments(&mut args);
        assert_eq!(args["path"], ESCAPE_SENTINEL);
        assert_eq!(args["other"], "kept");
    }

    #[test]
    fn rewrite_arguments_resolves_in_place() {
        let sandbox = Sandbox::new("/sandbox/alice");
        let mut args = serde_json::json!({ "file": "a.txt" });
        sandbox.rewrite_arguments(&mut args);
        assert_eq!(args["file"], "/sandbox/alice/a.txt");
    }

    #[test]
    fn registry_reuses_sandbox_for_same_principal() {
        let registry = SandboxRegistry::new("/data");
        let a = registry.for_principal("alice");
        let b = registry.for_principal("alice");
        assert_eq!(a.root(), b.root());
        assert_eq!(a.root(), Path::new("/data/alice"));
    }
}
