//! Collections: fingerprint keys and on-disk manifests.
//!
//! A collection is the materialized union of one or more resources,
//! addressed by a fingerprint of their names. The fingerprint is
//! order-independent and stable across processes, so any permutation of
//! the same name set maps to the same on-disk collection.
//!
//! Each built collection persists a `manifest.json` in its directory. The
//! manifest carries a `complete` marker that is only ever written `true`
//! after a successful build; an interrupted build leaves no usable
//! manifest behind and is rebuilt from scratch on the next request.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// File name of the per-collection metadata file.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Compute the collection key for a set of resource names.
///
/// Names are deduplicated and sorted lexicographically (case-sensitive)
/// before hashing, so the key depends only on the set, never on request
/// order. The key does not encode versions or branches — re-resolving a
/// name to newer upstream content keeps the same key, a staleness
/// trade-off bounded by the cache TTL.
pub fn collection_key<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
    names.sort();
    names.dedup();

    let mut hasher = Sha256::new();
    hasher.update(names.join("\n").as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// A ready, materialized collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub key: String,
    /// On-disk root holding the manifest.
    pub path: PathBuf,
    /// Resource names in request order.
    pub resource_names: Vec<String>,
    pub built_at: DateTime<Utc>,
}

/// One materialized resource recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    /// Materialized root of this resource on local storage.
    pub path: PathBuf,
    /// Sub-paths (relative to `path`) the question should focus on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<String>,
}

/// On-disk metadata for a built collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub key: String,
    pub resources: Vec<ManifestEntry>,
    pub built_at: DateTime<Utc>,
    /// Written `true` only after every resource materialized successfully.
    #[serde(default)]
    pub complete: bool,
}

impl Manifest {
    /// Build the [`Collection`] view of this manifest rooted at `dir`.
    pub fn to_collection(&self, dir: &Path) -> Collection {
        Collection {
            key: self.key.clone(),
            path: dir.to_path_buf(),
            resource_names: self.resources.iter().map(|r| r.name.clone()).collect(),
            built_at: self.built_at,
        }
    }
}

/// Write a manifest into `dir` (creating the directory if needed).
pub fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create collection directory: {}", dir.display()))?;
    let json = serde_json::to_string_pretty(manifest)?;
    let path = dir.join(MANIFEST_FILE);
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
    Ok(())
}

/// Read a usable manifest from `dir`.
///
/// Returns `None` when the manifest is missing, unparseable, marked
/// incomplete, or references materialized paths that no longer exist —
/// all of which mean the collection must be rebuilt.
pub fn read_manifest(dir: &Path) -> Option<Manifest> {
    let raw = std::fs::read_to_string(dir.join(MANIFEST_FILE)).ok()?;
    let manifest: Manifest = serde_json::from_str(&raw).ok()?;
    if !manifest.complete {
        return None;
    }
    if manifest.resources.iter().any(|r| !r.path.exists()) {
        return None;
    }
    Some(manifest)
}
