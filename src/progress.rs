//! Side-channel progress reporting for collection builds.
//!
//! Fetch progress is emitted on **stderr** so stdout stays parseable for
//! scripts. Resources within one build fetch concurrently, so no ordering
//! is promised between events for distinct resources.

use std::io::Write;

/// A single progress event during a collection build.
#[derive(Clone, Debug)]
pub enum FetchEvent {
    /// A resource fetch has started.
    Fetching { name: String, target: String },
    /// A resource is materialized on disk.
    Fetched { name: String },
}

/// Reports build progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: FetchEvent);
}

/// Human-friendly progress: `fetch svelte  https://github.com/... ...`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: FetchEvent) {
        let line = match &event {
            FetchEvent::Fetching { name, target } => {
                format!("fetch {}  {} ...\n", name, target)
            }
            FetchEvent::Fetched { name } => format!("fetch {}  done\n", name),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// No-op reporter for `quiet` requests and non-TTY environments.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: FetchEvent) {}
}

/// Pick a reporter: silent when asked to be quiet or when stderr is not a
/// terminal, otherwise human-readable.
pub fn reporter_for(quiet: bool) -> Box<dyn ProgressReporter> {
    if quiet || !atty::is(atty::Stream::Stderr) {
        Box::new(NoProgress)
    } else {
        Box::new(StderrProgress)
    }
}
