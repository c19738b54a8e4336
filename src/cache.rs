//! The collection build cache.
//!
//! Coordinates resolution, materialization, and reuse of collections.
//! The central guarantee is *single-flight*: at most one build runs per
//! collection key at any instant, and every concurrent requester for
//! that key awaits the same build and observes the identical terminal
//! outcome.
//!
//! The entry table is the only mutable shared state. Each key maps to a
//! `Ready` collection or an in-flight build handle (a `watch` channel);
//! all table mutations happen atomically under one lock, so a lookup
//! never observes a half-registered entry. Builds run on a detached task
//! that watches its own channel: when the last waiter drops its receiver
//! the build aborts and unregisters itself, so cancelling one request
//! never kills a build another request still needs.
//!
//! Across restarts only collections persisted on disk are reused, via the
//! manifest's completeness marker — an in-memory handle from a crashed
//! process can never poison a later run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::collection::{collection_key, write_manifest, Collection, Manifest, ManifestEntry};
use crate::fetch::{MaterializeError, Materializer};
use crate::progress::{FetchEvent, ProgressReporter};
use crate::reference::{normalize, InvalidReference, ResourceRef};

/// A request to load (build or reuse) a collection.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Resource names or raw references; resolved via the configured table.
    pub resource_names: Vec<String>,
    /// Suppress side-channel fetch progress on stderr.
    pub quiet: bool,
}

/// Terminal failure of a whole collection load. Partial collections are
/// never returned: the first resolution or fetch failure fails the
/// request, and the same error is delivered to every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("no resources requested")]
    Empty,
    #[error(transparent)]
    Resolution(#[from] InvalidReference),
    #[error("duplicate resource name '{0}' refers to different targets")]
    DuplicateName(String),
    #[error("failed to fetch '{name}': {error}")]
    Materialize {
        name: String,
        error: MaterializeError,
    },
    #[error("collection build was cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
}

/// What a build broadcasts to its waiters: `None` while in flight, then
/// exactly one terminal result.
type BuildSignal = Option<Result<Collection, BuildError>>;

enum Entry {
    Ready(Collection),
    Building(Arc<watch::Sender<BuildSignal>>),
}

/// The collection build cache. Construct once at process start and share
/// via `Arc` — there is no global state.
pub struct CollectionCache {
    resources: HashMap<String, ResourceRef>,
    data_dir: PathBuf,
    ttl: Duration,
    materializer: Arc<dyn Materializer>,
    entries: Mutex<HashMap<String, Entry>>,
    /// Bumped by `clear`; a build that started before a clear finishes
    /// normally but is not re-inserted into the table.
    generation: AtomicU64,
}

impl CollectionCache {
    pub fn new(
        resources: HashMap<String, ResourceRef>,
        data_dir: impl Into<PathBuf>,
        ttl: Duration,
        materializer: Arc<dyn Materializer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resources,
            data_dir: data_dir.into(),
            ttl,
            materializer,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// Root directory for built collections.
    pub fn collections_dir(&self) -> PathBuf {
        self.data_dir.join("collections")
    }

    /// The configured name → reference table (read-only).
    pub fn resources(&self) -> &HashMap<String, ResourceRef> {
        &self.resources
    }

    /// Load a collection: resolve, then reuse a fresh cached build, join
    /// an in-flight one, or start a new build.
    pub async fn load(self: &Arc<Self>, req: LoadRequest) -> Result<Collection, BuildError> {
        if req.resource_names.is_empty() {
            return Err(BuildError::Empty);
        }

        // Resolution is pure and never suspends; any failure aborts the
        // whole request before the cache is touched.
        let mut refs: Vec<ResourceRef> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        for raw in &req.resource_names {
            let r = normalize(raw, &self.resources)?;
            if let Some(prev) = refs.iter().find(|prev| prev.name() == r.name()) {
                if *prev != r {
                    return Err(BuildError::DuplicateName(r.name().to_string()));
                }
                // Identical duplicate: collapse.
                continue;
            }
            names.push(r.name().to_string());
            refs.push(r);
        }

        let key = collection_key(&names);

        let mut attempts = 0;
        loop {
            attempts += 1;

            // Fast path under the lock; no I/O happens while it is held.
            let subscribed = {
                let mut entries = self.entries();
                match entries.get(&key) {
                    Some(Entry::Ready(c)) if self.is_fresh(c) => return Ok(c.clone()),
                    Some(Entry::Building(tx)) => Some(tx.subscribe()),
                    // A stale Ready entry is treated as absent.
                    Some(Entry::Ready(_)) | None => {
                        entries.remove(&key);
                        None
                    }
                }
            };

            let rx = match subscribed {
                Some(rx) => rx,
                None => {
                    // Consult the on-disk manifest with the lock released,
                    // then re-check the table: another task may have
                    // revived or started building this key meanwhile.
                    let revived = self.revive_from_disk(&key);

                    let mut entries = self.entries();
                    match entries.get(&key) {
                        Some(Entry::Ready(c)) if self.is_fresh(c) => return Ok(c.clone()),
                        Some(Entry::Building(tx)) => tx.subscribe(),
                        _ => {
                            if let Some(c) = revived {
                                entries.insert(key.clone(), Entry::Ready(c.clone()));
                                return Ok(c);
                            }
                            let (tx, rx) = watch::channel(None);
                            let tx = Arc::new(tx);
                            entries.insert(key.clone(), Entry::Building(Arc::clone(&tx)));
                            self.spawn_build(
                                tx,
                                key.clone(),
                                names.clone(),
                                refs.clone(),
                                req.quiet,
                            );
                            rx
                        }
                    }
                }
            };

            match await_build(rx).await {
                Some(result) => return result,
                // The build was cancelled between our lookup and
                // subscribe; its entry is gone, so retry from scratch.
                None if attempts >= 4 => return Err(BuildError::Cancelled),
                None => continue,
            }
        }
    }

    /// Remove all cache entries and delete their on-disk roots. Builds
    /// already in flight are not interrupted; they complete, resolve
    /// their waiters, and are then evicted via the generation check.
    pub async fn clear(&self) -> anyhow::Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut entries = self.entries();
            entries.retain(|_, e| matches!(e, Entry::Building(_)));
        }

        remove_dir_if_present(&self.collections_dir())?;
        for root in crate::fetch::CliMaterializer::cache_roots(&self.data_dir) {
            remove_dir_if_present(&root)?;
        }
        Ok(())
    }

    fn spawn_build(
        self: &Arc<Self>,
        tx: Arc<watch::Sender<BuildSignal>>,
        key: String,
        names: Vec<String>,
        refs: Vec<ResourceRef>,
        quiet: bool,
    ) {
        let this = Arc::clone(self);
        let generation = self.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let build = Arc::clone(&this).build(key.clone(), names, refs, quiet);
            tokio::select! {
                // All receivers gone: the last waiter cancelled. Drop the
                // build and unregister so the next request starts fresh.
                _ = tx.closed() => {
                    this.remove_building(&key);
                }
                result = build => {
                    this.finish(&key, generation, &result);
                    let _ = tx.send(Some(result));
                }
            }
        });
    }

    /// Materialize every resource concurrently, then assemble the
    /// collection directory and manifest. The manifest's `complete`
    /// marker is only ever written after total success.
    async fn build(
        self: Arc<Self>,
        key: String,
        names: Vec<String>,
        refs: Vec<ResourceRef>,
        quiet: bool,
    ) -> Result<Collection, BuildError> {
        let reporter: Arc<dyn ProgressReporter> = Arc::from(crate::progress::reporter_for(quiet));

        let mut set = JoinSet::new();
        for r in refs {
            let materializer = Arc::clone(&self.materializer);
            let reporter = Arc::clone(&reporter);
            set.spawn(async move {
                reporter.report(FetchEvent::Fetching {
                    name: r.name().to_string(),
                    target: r.target(),
                });
                let result = materializer.materialize(&r).await;
                if result.is_ok() {
                    reporter.report(FetchEvent::Fetched {
                        name: r.name().to_string(),
                    });
                }
                (r, result)
            });
        }

        let mut materialized: HashMap<String, (PathBuf, Vec<String>)> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            let (r, result) = joined
                .map_err(|e| BuildError::Internal(format!("fetch task failed: {}", e)))?;
            match result {
                Ok(path) => {
                    let search_paths = match &r {
                        ResourceRef::Git { search_paths, .. } => search_paths.clone(),
                        _ => Vec::new(),
                    };
                    materialized.insert(r.name().to_string(), (path, search_paths));
                }
                // First failure fails the whole build; dropping the
                // JoinSet aborts the remaining fetches.
                Err(error) => {
                    return Err(BuildError::Materialize {
                        name: r.name().to_string(),
                        error,
                    })
                }
            }
        }

        let mut entries = Vec::with_capacity(names.len());
        for name in &names {
            let (path, search_paths) = materialized.get(name).cloned().ok_or_else(|| {
                BuildError::Internal(format!("no materialized path for '{}'", name))
            })?;
            entries.push(ManifestEntry {
                name: name.clone(),
                path,
                search_paths,
            });
        }

        let dir = self.collections_dir().join(&key);
        let manifest = Manifest {
            key,
            resources: entries,
            built_at: Utc::now(),
            complete: true,
        };
        write_manifest(&dir, &manifest)
            .map_err(|e| BuildError::Internal(format!("failed to write manifest: {}", e)))?;
        Ok(manifest.to_collection(&dir))
    }

    /// Promote or evict a finished build, atomically with lookups.
    fn finish(&self, key: &str, generation: u64, result: &Result<Collection, BuildError>) {
        let cleared = self.generation.load(Ordering::SeqCst) != generation;
        let mut entries = self.entries();
        match result {
            Ok(c) if !cleared => {
                entries.insert(key.to_string(), Entry::Ready(c.clone()));
            }
            Ok(c) => {
                // The cache was cleared mid-build: deliver the result to
                // waiters but do not keep it, in memory or on disk.
                entries.remove(key);
                drop(entries);
                let _ = std::fs::remove_dir_all(&c.path);
            }
            Err(_) => {
                // Failures are never cached; the next request retries.
                entries.remove(key);
            }
        }
    }

    fn remove_building(&self, key: &str) {
        let mut entries = self.entries();
        if matches!(entries.get(key), Some(Entry::Building(_))) {
            entries.remove(key);
        }
    }

    fn revive_from_disk(&self, key: &str) -> Option<Collection> {
        let dir = self.collections_dir().join(key);
        let manifest = crate::collection::read_manifest(&dir)?;
        let collection = manifest.to_collection(&dir);
        self.is_fresh(&collection).then_some(collection)
    }

    fn is_fresh(&self, c: &Collection) -> bool {
        match (Utc::now() - c.built_at).to_std() {
            Ok(age) => age < self.ttl,
            // built_at in the future means clock skew; keep the entry.
            Err(_) => true,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Await the shared outcome of an in-flight build. `None` means the
/// build's channel closed without a result (it was cancelled by its
/// last waiter); the caller retries.
async fn await_build(
    mut rx: watch::Receiver<BuildSignal>,
) -> Option<Result<Collection, BuildError>> {
    match rx.wait_for(|signal| signal.is_some()).await {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    }
}

fn remove_dir_if_present(dir: &Path) -> anyhow::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::anyhow!("failed to remove {}: {}", dir.display(), e)),
    }
}
