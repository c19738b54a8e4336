//! Resource materialization: ensure a resource's content is present and
//! current on local storage.
//!
//! The production implementation shells out to the `git` and `npm` CLIs,
//! which handle authentication, proxies, and incremental transfer far
//! better than any reimplementation would. Every materialization is
//! idempotent: a cached checkout inside the configured fetch window is
//! returned without touching the network, an older one is updated in
//! place (`git fetch` + `reset`, or a fresh `npm install` into the same
//! prefix).
//!
//! Cache layout under the data directory:
//!
//! ```text
//! <data_dir>/repos/<hash12>-<name>/        git checkouts
//! <data_dir>/npm/<hash12>/node_modules/…   npm installs
//! ```

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use crate::reference::ResourceRef;

/// Marker file touched after a successful fetch; its mtime drives the
/// freshness check.
const FETCH_MARKER: &str = ".askrepo-fetched";

/// What went wrong while fetching a resource. `kind` is machine-readable
/// so callers can decide whether a retry is worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// DNS, connect, or transfer failure.
    Network,
    /// Authentication or authorization rejected by the remote.
    Auth,
    /// The repository, package, or local path does not exist.
    NotFound,
    /// The underlying tool is missing or failed for another reason.
    Tool,
    /// Local filesystem error.
    Io,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Network => "network",
            FetchErrorKind::Auth => "auth",
            FetchErrorKind::NotFound => "not_found",
            FetchErrorKind::Tool => "tool",
            FetchErrorKind::Io => "io",
        }
    }
}

/// Failure while fetching a resource. `Clone` so one failure can be
/// delivered to every waiter of a shared build.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct MaterializeError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl MaterializeError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Ensures one resource exists on local storage and returns its root.
///
/// Implementations must be idempotent and incremental: repeated calls for
/// an unchanged reference must not re-fetch when the existing copy passes
/// a freshness check, and must update in place otherwise.
#[async_trait]
pub trait Materializer: Send + Sync {
    async fn materialize(&self, resource: &ResourceRef) -> Result<PathBuf, MaterializeError>;
}

/// Materializer backed by the `git` and `npm` command-line tools.
pub struct CliMaterializer {
    data_dir: PathBuf,
    /// A checkout fetched within this window is reused without network I/O.
    fetch_window: Duration,
}

impl CliMaterializer {
    pub fn new(data_dir: impl Into<PathBuf>, fetch_window: Duration) -> Self {
        Self {
            data_dir: data_dir.into(),
            fetch_window,
        }
    }

    /// The cache roots this materializer writes under, for `cache clear`.
    pub fn cache_roots(data_dir: &Path) -> [PathBuf; 2] {
        [data_dir.join("repos"), data_dir.join("npm")]
    }

    fn repo_dir(&self, name: &str, url: &str) -> PathBuf {
        self.data_dir
            .join("repos")
            .join(format!("{}-{}", short_hash(url), sanitize(name)))
    }

    fn npm_dir(&self, spec: &str) -> PathBuf {
        self.data_dir.join("npm").join(short_hash(spec))
    }

    /// Where this resource lives (or would live) on local storage,
    /// without fetching anything. Used for status listings.
    pub fn cache_dir(&self, resource: &ResourceRef) -> PathBuf {
        match resource {
            ResourceRef::Local { path, .. } => path.clone(),
            ResourceRef::Git { name, url, .. } => self.repo_dir(name, url),
            ResourceRef::Npm {
                package, version, ..
            } => {
                let spec = match version {
                    Some(v) => format!("{}@{}", package, v),
                    None => package.clone(),
                };
                self.npm_dir(&spec).join("node_modules").join(package)
            }
        }
    }
}

#[async_trait]
impl Materializer for CliMaterializer {
    async fn materialize(&self, resource: &ResourceRef) -> Result<PathBuf, MaterializeError> {
        match resource {
            ResourceRef::Local { path, .. } => materialize_local(path),
            ResourceRef::Git {
                name, url, branch, ..
            } => {
                let dest = self.repo_dir(name, url);
                let url = url.clone();
                let branch = branch.clone();
                let window = self.fetch_window;
                run_blocking(move || fetch_git(&url, branch.as_deref(), &dest, window)).await
            }
            ResourceRef::Npm {
                package, version, ..
            } => {
                let spec = match version {
                    Some(v) => format!("{}@{}", package, v),
                    None => package.clone(),
                };
                let prefix = self.npm_dir(&spec);
                let package = package.clone();
                let window = self.fetch_window;
                run_blocking(move || fetch_npm(&spec, &package, &prefix, window)).await
            }
        }
    }
}

/// Run a blocking fetch on the tokio blocking pool.
async fn run_blocking<F>(f: F) -> Result<PathBuf, MaterializeError>
where
    F: FnOnce() -> Result<PathBuf, MaterializeError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        MaterializeError::new(FetchErrorKind::Io, format!("fetch task failed: {}", e))
    })?
}

fn materialize_local(path: &Path) -> Result<PathBuf, MaterializeError> {
    let canonical = std::fs::canonicalize(path).map_err(|_| {
        MaterializeError::new(
            FetchErrorKind::NotFound,
            format!("local path does not exist: {}", path.display()),
        )
    })?;
    if !canonical.is_dir() {
        return Err(MaterializeError::new(
            FetchErrorKind::NotFound,
            format!("local path is not a directory: {}", path.display()),
        ));
    }
    Ok(canonical)
}

/// Clone on first use, update in place afterwards, skip the network
/// entirely when the checkout is inside the fetch window.
fn fetch_git(
    url: &str,
    branch: Option<&str>,
    dest: &Path,
    window: Duration,
) -> Result<PathBuf, MaterializeError> {
    if dest.join(".git").exists() {
        if marker_fresh(dest, window) {
            return Ok(dest.to_path_buf());
        }
        git_update(dest, branch)?;
    } else {
        clear_partial_checkout(dest)?;
        git_clone(url, branch, dest)?;
    }
    touch_marker(dest)?;
    Ok(dest.to_path_buf())
}

/// A destination without `.git` is a checkout that died mid-clone.
/// `git clone` refuses a non-empty destination, so remove the leftovers
/// and let the clone start from scratch.
fn clear_partial_checkout(dest: &Path) -> Result<(), MaterializeError> {
    if !dest.exists() {
        return Ok(());
    }
    std::fs::remove_dir_all(dest).map_err(|e| {
        MaterializeError::new(
            FetchErrorKind::Io,
            format!(
                "failed to remove partial checkout {}: {}",
                dest.display(),
                e
            ),
        )
    })
}

fn git_clone(url: &str, branch: Option<&str>, dest: &Path) -> Result<(), MaterializeError> {
    std::fs::create_dir_all(dest).map_err(|e| {
        MaterializeError::new(
            FetchErrorKind::Io,
            format!("failed to create {}: {}", dest.display(), e),
        )
    })?;

    let mut cmd = Command::new("git");
    cmd.args(["clone", "--single-branch", "--depth", "1"]);
    if let Some(branch) = branch {
        cmd.args(["--branch", branch]);
    }
    cmd.arg(url);
    cmd.arg(dest);
    run_tool(cmd, "git clone", classify_git_stderr)
}

fn git_update(repo_dir: &Path, branch: Option<&str>) -> Result<(), MaterializeError> {
    match branch {
        Some(branch) => {
            let mut fetch = Command::new("git");
            fetch.args(["fetch", "origin", branch]).current_dir(repo_dir);
            run_tool(fetch, "git fetch", classify_git_stderr)?;

            let remote_ref = format!("origin/{}", branch);
            let mut reset = Command::new("git");
            reset
                .args(["reset", "--hard", &remote_ref])
                .current_dir(repo_dir);
            run_tool(reset, "git reset", classify_git_stderr)
        }
        None => {
            let mut pull = Command::new("git");
            pull.args(["pull", "--ff-only"]).current_dir(repo_dir);
            run_tool(pull, "git pull", classify_git_stderr)
        }
    }
}

/// Install the package into a dedicated prefix; the package root is
/// `node_modules/<package>` below it. npm itself is incremental, so a
/// repeated install of the same spec is cheap.
fn fetch_npm(
    spec: &str,
    package: &str,
    prefix: &Path,
    window: Duration,
) -> Result<PathBuf, MaterializeError> {
    let package_root = prefix.join("node_modules").join(package);
    if package_root.exists() && marker_fresh(prefix, window) {
        return Ok(package_root);
    }

    std::fs::create_dir_all(prefix).map_err(|e| {
        MaterializeError::new(
            FetchErrorKind::Io,
            format!("failed to create {}: {}", prefix.display(), e),
        )
    })?;

    let mut cmd = Command::new("npm");
    cmd.args(["install", "--prefix"])
        .arg(prefix)
        .arg(spec)
        .args(["--no-save", "--no-audit", "--no-fund"]);
    run_tool(cmd, "npm install", classify_npm_stderr)?;

    if !package_root.exists() {
        return Err(MaterializeError::new(
            FetchErrorKind::Tool,
            format!("npm install succeeded but {} is missing", package_root.display()),
        ));
    }
    touch_marker(prefix)?;
    Ok(package_root)
}

fn run_tool(
    mut cmd: Command,
    what: &str,
    classify: fn(&str) -> FetchErrorKind,
) -> Result<(), MaterializeError> {
    let output = cmd.output().map_err(|e| {
        MaterializeError::new(
            FetchErrorKind::Tool,
            format!("failed to execute {}: {} (is it installed?)", what, e),
        )
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        return Err(MaterializeError::new(
            classify(stderr),
            format!("{} failed: {}", what, stderr),
        ));
    }
    Ok(())
}

/// Map git stderr to an error kind. Matching on message text is fragile
/// but it is all the porcelain gives us.
fn classify_git_stderr(stderr: &str) -> FetchErrorKind {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("could not read username")
        || lower.contains("403")
    {
        FetchErrorKind::Auth
    } else if lower.contains("repository not found")
        || lower.contains("not found")
        || lower.contains("404")
    {
        FetchErrorKind::NotFound
    } else if lower.contains("could not resolve host")
        || lower.contains("unable to access")
        || lower.contains("connection")
        || lower.contains("timed out")
    {
        FetchErrorKind::Network
    } else {
        FetchErrorKind::Tool
    }
}

fn classify_npm_stderr(stderr: &str) -> FetchErrorKind {
    let lower = stderr.to_lowercase();
    if lower.contains("e404") || lower.contains("404 not found") {
        FetchErrorKind::NotFound
    } else if lower.contains("e401") || lower.contains("e403") {
        FetchErrorKind::Auth
    } else if lower.contains("enotfound")
        || lower.contains("etimedout")
        || lower.contains("econnrefused")
        || lower.contains("network")
    {
        FetchErrorKind::Network
    } else {
        FetchErrorKind::Tool
    }
}

fn marker_fresh(dir: &Path, window: Duration) -> bool {
    let marker = dir.join(FETCH_MARKER);
    match std::fs::metadata(&marker).and_then(|m| m.modified()) {
        Ok(mtime) => SystemTime::now()
            .duration_since(mtime)
            .map(|age| age < window)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn touch_marker(dir: &Path) -> Result<(), MaterializeError> {
    std::fs::write(dir.join(FETCH_MARKER), b"").map_err(|e| {
        MaterializeError::new(
            FetchErrorKind::Io,
            format!("failed to write fetch marker in {}: {}", dir.display(), e),
        )
    })
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ResourceRef;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_directory_materializes_in_place() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();

        let m = CliMaterializer::new(tmp.path().join("data"), Duration::from_secs(60));
        let r = ResourceRef::Local {
            name: "docs".into(),
            path: docs.clone(),
        };
        let path = m.materialize(&r).await.unwrap();
        assert_eq!(path, std::fs::canonicalize(&docs).unwrap());
    }

    #[tokio::test]
    async fn missing_local_path_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let m = CliMaterializer::new(tmp.path().join("data"), Duration::from_secs(60));
        let r = ResourceRef::Local {
            name: "gone".into(),
            path: tmp.path().join("gone"),
        };
        let err = m.materialize(&r).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::NotFound);
    }

    #[test]
    fn git_stderr_classification() {
        assert_eq!(
            classify_git_stderr("fatal: Authentication failed for 'https://…'"),
            FetchErrorKind::Auth
        );
        assert_eq!(
            classify_git_stderr("ERROR: Repository not found."),
            FetchErrorKind::NotFound
        );
        assert_eq!(
            classify_git_stderr("fatal: unable to access 'https://…': Could not resolve host"),
            FetchErrorKind::Network
        );
        assert_eq!(classify_git_stderr("fatal: some other thing"), FetchErrorKind::Tool);
    }

    #[test]
    fn npm_stderr_classification() {
        assert_eq!(classify_npm_stderr("npm ERR! code E404"), FetchErrorKind::NotFound);
        assert_eq!(classify_npm_stderr("npm ERR! code E401"), FetchErrorKind::Auth);
        assert_eq!(classify_npm_stderr("npm ERR! code ENOTFOUND"), FetchErrorKind::Network);
        assert_eq!(classify_npm_stderr("npm ERR! weird"), FetchErrorKind::Tool);
    }

    #[test]
    fn partial_checkout_is_removed_before_cloning() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("repo");

        // Interrupted clone: files on disk but no .git yet.
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("half-written"), "x").unwrap();
        clear_partial_checkout(&dest).unwrap();
        assert!(!dest.exists(), "leftovers must be gone before the clone");

        // Absent destination is fine too.
        clear_partial_checkout(&dest).unwrap();
    }

    #[test]
    fn fresh_checkout_is_returned_without_running_git() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("repo");
        std::fs::create_dir_all(dest.join(".git")).unwrap();
        touch_marker(&dest).unwrap();

        // An unreachable URL proves no network command runs.
        let path = fetch_git(
            "https://invalid.invalid/org/repo",
            None,
            &dest,
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(path, dest);
    }

    #[test]
    fn marker_freshness() {
        let tmp = TempDir::new().unwrap();
        assert!(!marker_fresh(tmp.path(), Duration::from_secs(60)));
        touch_marker(tmp.path()).unwrap();
        assert!(marker_fresh(tmp.path(), Duration::from_secs(60)));
        assert!(!marker_fresh(tmp.path(), Duration::ZERO));
    }

    #[test]
    fn cache_dirs_are_distinct_per_target() {
        let m = CliMaterializer::new("/data", Duration::from_secs(60));
        assert_ne!(
            m.repo_dir("svelte", "https://github.com/sveltejs/svelte"),
            m.repo_dir("svelte", "https://github.com/other/svelte")
        );
        assert_ne!(m.npm_dir("react@19.0.0"), m.npm_dir("react@18.0.0"));
    }
}
