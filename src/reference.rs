//! Resource reference normalization.
//!
//! Turns raw user-supplied strings into canonical, typed [`ResourceRef`]s.
//! Accepted forms:
//!
//! | Input | Result |
//! |-------|--------|
//! | a configured resource name | the configured reference, unchanged |
//! | `https://github.com/org/repo` (sub-paths, `/tree/...`, `.git` stripped) | `Git` |
//! | `git@host:org/repo.git` (scp-style) | `Git` |
//! | `npm:<package>[@version]` | `Npm`, verbatim |
//! | `https://www.npmjs.com/package/<name>/v/<version>` | `Npm` |
//! | a filesystem path (absolute, `./`, `~`, or containing `/`) | `Local` |
//!
//! Everything else — notably any non-`https` URL scheme — fails with
//! [`InvalidReference`]. Normalization is a pure function: no I/O, no
//! existence checks, deterministic for a given input.

use std::collections::HashMap;
use std::path::PathBuf;

/// A canonical, typed reference to an external resource.
///
/// The `name` is the addressing key inside a collection: two references
/// with different names but the same target are treated as distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    /// A git repository, fetched over https.
    Git {
        name: String,
        /// Canonical https URL: no sub-paths, no `/tree/...`, no `.git`.
        url: String,
        branch: Option<String>,
        /// Repo-relative sub-paths the question should focus on
        /// (derived from a `/tree/<branch>/<path>` URL suffix).
        search_paths: Vec<String>,
    },
    /// An npm package, canonical form `npm:<package>[@version]`.
    Npm {
        name: String,
        package: String,
        version: Option<String>,
    },
    /// A directory on the local filesystem.
    Local { name: String, path: PathBuf },
}

impl ResourceRef {
    /// The addressing name of this resource within a collection.
    pub fn name(&self) -> &str {
        match self {
            ResourceRef::Git { name, .. } => name,
            ResourceRef::Npm { name, .. } => name,
            ResourceRef::Local { name, .. } => name,
        }
    }

    /// Short kind label for tables and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceRef::Git { .. } => "git",
            ResourceRef::Npm { .. } => "npm",
            ResourceRef::Local { .. } => "local",
        }
    }

    /// Canonical display form of the target (round-trips npm specs).
    pub fn target(&self) -> String {
        match self {
            ResourceRef::Git { url, branch, .. } => match branch {
                Some(b) => format!("{} ({})", url, b),
                None => url.clone(),
            },
            ResourceRef::Npm {
                package, version, ..
            } => match version {
                Some(v) => format!("npm:{}@{}", package, v),
                None => format!("npm:{}", package),
            },
            ResourceRef::Local { path, .. } => path.display().to_string(),
        }
    }
}

/// Raw input did not match any accepted resource-reference grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a recognized resource reference: '{raw}' ({reason})")]
pub struct InvalidReference {
    /// The offending input, verbatim.
    pub raw: String,
    pub reason: String,
}

impl InvalidReference {
    fn new(raw: &str, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

/// Normalize a raw string into a [`ResourceRef`].
///
/// `known` is the configured name → reference table; an input that exactly
/// matches a configured name is returned as that reference without further
/// parsing.
pub fn normalize(
    raw: &str,
    known: &HashMap<String, ResourceRef>,
) -> Result<ResourceRef, InvalidReference> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(InvalidReference::new(raw, "empty string"));
    }

    if let Some(r) = known.get(raw) {
        return Ok(r.clone());
    }

    if let Some(spec) = raw.strip_prefix("npm:") {
        return parse_npm_spec(raw, spec);
    }

    if let Some(rest) = raw.strip_prefix("https://") {
        return parse_https(raw, rest);
    }

    // Only secure transport is accepted for remote references.
    if let Some(pos) = raw.find("://") {
        return Err(InvalidReference::new(
            raw,
            format!("unsupported URL scheme '{}' (only https)", &raw[..pos]),
        ));
    }

    if looks_like_scp(raw) {
        return parse_scp(raw);
    }

    if looks_like_path(raw) {
        let path = PathBuf::from(raw);
        let name = final_segment(raw)
            .ok_or_else(|| InvalidReference::new(raw, "path has no final segment"))?;
        return Ok(ResourceRef::Local {
            name: name.to_string(),
            path,
        });
    }

    Err(InvalidReference::new(
        raw,
        "not a known resource name, URL, npm spec, or path",
    ))
}

/// Parse `npm:<package>[@version]`, handling scoped packages
/// (`npm:@types/node@22.10.1`): the version separator is the last `@`
/// past the start of the package part.
fn parse_npm_spec(raw: &str, spec: &str) -> Result<ResourceRef, InvalidReference> {
    if spec.is_empty() {
        return Err(InvalidReference::new(raw, "empty npm package"));
    }
    let (package, version) = match spec.rfind('@') {
        Some(0) | None => (spec.to_string(), None),
        Some(pos) => (spec[..pos].to_string(), Some(spec[pos + 1..].to_string())),
    };
    if package.is_empty() || version.as_deref() == Some("") {
        return Err(InvalidReference::new(raw, "malformed npm spec"));
    }
    Ok(ResourceRef::Npm {
        name: package.clone(),
        package,
        version,
    })
}

/// Parse an https URL: either a package-registry web URL or a git hosting
/// URL to canonicalize.
fn parse_https(raw: &str, rest: &str) -> Result<ResourceRef, InvalidReference> {
    let (host, path) = match rest.split_once('/') {
        Some((h, p)) => (h, p),
        None => (rest, ""),
    };
    if host.is_empty() {
        return Err(InvalidReference::new(raw, "URL has no host"));
    }

    let segments: Vec<&str> = path
        .trim_end_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    // Registry web URL: https://<registry>/package/<name>/v/<version>
    if let Some(npm) = parse_registry_url(&segments) {
        return Ok(npm);
    }

    // Git hosting URL: https://host/org/repo[/tree/<branch>/<path...>]
    if segments.len() < 2 {
        return Err(InvalidReference::new(
            raw,
            "git URL needs an owner and a repository segment",
        ));
    }
    let org = segments[0];
    let repo = segments[1].trim_end_matches(".git");
    if repo.is_empty() {
        return Err(InvalidReference::new(raw, "empty repository segment"));
    }

    let mut branch = None;
    let mut search_paths = Vec::new();
    if segments.len() > 2 && segments[2] == "tree" && segments.len() > 3 {
        branch = Some(segments[3].to_string());
        if segments.len() > 4 {
            search_paths.push(segments[4..].join("/"));
        }
    }
    // Any other trailing segments (blob links, issues, ...) are stripped.

    Ok(ResourceRef::Git {
        name: repo.to_string(),
        url: format!("https://{}/{}/{}", host, org, repo),
        branch,
        search_paths,
    })
}

/// Recognize `/package/<name>/v/<version>` registry paths, including
/// scoped package names that span two segments.
fn parse_registry_url(segments: &[&str]) -> Option<ResourceRef> {
    if segments.first() != Some(&"package") {
        return None;
    }
    let rest = &segments[1..];
    // The package name is everything up to a "v" marker followed by a version.
    let v_pos = rest.iter().rposition(|s| *s == "v")?;
    if v_pos == 0 || v_pos + 2 != rest.len() {
        return None;
    }
    let package = rest[..v_pos].join("/");
    let version = rest[v_pos + 1];
    if package.is_empty() || version.is_empty() {
        return None;
    }
    Some(ResourceRef::Npm {
        name: package.clone(),
        package,
        version: Some(version.to_string()),
    })
}

/// scp-style shorthand: `user@host:path`, no scheme, `@` before the `:`,
/// and the colon is not a Windows drive letter.
fn looks_like_scp(raw: &str) -> bool {
    match (raw.find('@'), raw.find(':')) {
        (Some(at), Some(colon)) => at > 0 && colon > at + 1 && !raw[..at].contains('/'),
        _ => false,
    }
}

fn parse_scp(raw: &str) -> Result<ResourceRef, InvalidReference> {
    let (_user, rest) = raw
        .split_once('@')
        .ok_or_else(|| InvalidReference::new(raw, "malformed scp reference"))?;
    let (host, path) = rest
        .split_once(':')
        .ok_or_else(|| InvalidReference::new(raw, "malformed scp reference"))?;
    let path = path.trim_matches('/').trim_end_matches(".git");
    if host.is_empty() || path.is_empty() {
        return Err(InvalidReference::new(raw, "malformed scp reference"));
    }
    let name = final_segment(path)
        .ok_or_else(|| InvalidReference::new(raw, "scp path has no repository segment"))?;
    Ok(ResourceRef::Git {
        name: name.to_string(),
        url: format!("https://{}/{}", host, path),
        branch: None,
        search_paths: Vec::new(),
    })
}

/// A string reads as a filesystem path when it is absolute, home-relative,
/// explicitly relative, or contains a separator. A bare token is rejected —
/// it is far more likely a typo'd resource name than a directory.
fn looks_like_path(raw: &str) -> bool {
    raw.starts_with('/')
        || raw.starts_with("./")
        || raw.starts_with("../")
        || raw.starts_with("~/")
        || raw == "."
        || raw == ".."
        || raw.contains('/')
}

fn final_segment(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit('/')
        .find(|s| !s.is_empty() && *s != "." && *s != "..")
}
