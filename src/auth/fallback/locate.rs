//! Host probing: search roots, helper directories and PATH lookups

use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory names the interactive login helper may live under.
pub const HELPER_DIR_NAMES: &[&str] = &["teams-token", "teams-token-cli"];

/// Marks the root of the checkout that vendors the helpers as submodules.
pub const REPO_MARKER: &str = ".gitmodules";

/// What the fallback runner can see of the current host.
#[derive(Debug, Clone)]
pub struct HostProbe {
    search_roots: Vec<PathBuf>,
    path_var: Option<OsString>,
}

impl HostProbe {
    /// Probe the running process: working directory, executable directory and
    /// the enclosing repository root, plus `$PATH`.
    pub fn discover() -> Self {
        let cwd = env::current_dir().ok();
        let exe_dir = executable_dir();
        Self {
            search_roots: candidate_search_roots(cwd, exe_dir),
            path_var: env::var_os("PATH"),
        }
    }

    pub fn new(search_roots: Vec<PathBuf>, path_var: Option<OsString>) -> Self {
        Self {
            search_roots,
            path_var,
        }
    }

    pub fn search_roots(&self) -> &[PathBuf] {
        &self.search_roots
    }

    /// First `<root>/<name>` directory, roots in order, names in order.
    pub fn find_dir(&self, names: &[&str]) -> Option<PathBuf> {
        self.search_roots.iter().find_map(|root| {
            names
                .iter()
                .map(|name| root.join(name))
                .find(|path| path.is_dir())
        })
    }

    /// Resolve `program` against the probed `$PATH`.
    pub fn which(&self, program: &str) -> Option<PathBuf> {
        let path_var = self.path_var.as_ref()?;
        env::split_paths(path_var)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }
}

/// Regular file with any execute bit set.
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn executable_dir() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    let exe = fs::canonicalize(&exe).unwrap_or(exe);
    exe.parent().map(Path::to_path_buf)
}

/// Working directory, executable directory, then the first ancestor of
/// either that carries the repository marker. Duplicates are dropped.
pub(crate) fn candidate_search_roots(cwd: Option<PathBuf>, exe_dir: Option<PathBuf>) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = cwd.into_iter().chain(exe_dir).collect();
    if let Some(repo_root) = find_repo_root(&roots) {
        roots.push(repo_root);
    }

    let mut seen = HashSet::new();
    roots
        .into_iter()
        .filter(|root| !root.as_os_str().is_empty())
        .filter(|root| seen.insert(root.clone()))
        .collect()
}

fn find_repo_root(starts: &[PathBuf]) -> Option<PathBuf> {
    starts.iter().find_map(|start| {
        start
            .ancestors()
            // Stop before the filesystem root
            .take_while(|dir| dir.parent().is_some())
            .find(|dir| dir.join(REPO_MARKER).is_file())
            .map(Path::to_path_buf)
    })
}
