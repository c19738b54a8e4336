//! # askrepo
//!
//! Ask natural-language questions against the source of git
//! repositories, npm packages, and local directories.
//!
//! askrepo fetches the requested resources, assembles them into a
//! *collection* on disk, and grounds a configured model in that
//! collection. Collections are cached by a content-derived key:
//! identical resource sets share one build, across concurrent requests
//! and process restarts.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐   ┌─────────────┐
//! │ References │──▶│  Build Cache   │──▶│ Collections │
//! │ git/npm/fs │   │ single-flight │   │  manifest    │
//! └────────────┘   └───────────────┘   └──────┬──────┘
//!                                             │
//!                          ┌──────────────────┤
//!                          ▼                  ▼
//!                    ┌──────────┐       ┌──────────┐
//!                    │   CLI    │       │   HTTP   │
//!                    │(askrepo) │       │  (SSE)   │
//!                    └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! askrepo fetch svelte                          # pre-warm a collection
//! askrepo ask "how does reactivity work?" -r svelte
//! askrepo ask "..." -r svelte --stream          # incremental output
//! askrepo serve                                 # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`reference`] | Resource reference normalization |
//! | [`collection`] | Collection keys and on-disk manifests |
//! | [`fetch`] | Resource materialization (git, npm, local) |
//! | [`cache`] | Single-flight collection build cache |
//! | [`stream`] | Typed answer event stream and wire codec |
//! | [`provider`] | Answer provider abstraction |
//! | [`server`] | HTTP server |
//! | [`config`] | TOML configuration parsing |

pub mod cache;
pub mod collection;
pub mod config;
pub mod fetch;
pub mod progress;
pub mod provider;
pub mod reference;
pub mod server;
pub mod stream;
