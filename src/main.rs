//! # askrepo CLI
//!
//! The `askrepo` binary answers natural-language questions against the
//! source of git repositories, npm packages, and local directories.
//! Resources are fetched once, assembled into a cached *collection*, and
//! reused across questions.
//!
//! ## Usage
//!
//! ```bash
//! askrepo --config ./config/askrepo.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `askrepo ask "<question>" -r <resource>...` | Ask a question against resources |
//! | `askrepo fetch <resource>...` | Build (or reuse) a collection without asking |
//! | `askrepo resources` | List configured named resources |
//! | `askrepo cache clear` | Drop all cached collections and checkouts |
//! | `askrepo serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Ask against a configured resource name
//! askrepo ask "how does reactivity work?" -r svelte
//!
//! # Raw references work too
//! askrepo ask "what does this package export?" -r npm:left-pad@1.3.0
//!
//! # Stream the answer token by token
//! askrepo ask "summarize the build pipeline" -r svelte --stream
//!
//! # Pre-warm a collection
//! askrepo fetch svelte npm:@types/node@22.10.1
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use askrepo::cache::{CollectionCache, LoadRequest};
use askrepo::config;
use askrepo::fetch::{self, CliMaterializer};
use askrepo::provider;
use askrepo::server;
use askrepo::stream::StreamEvent;

/// askrepo — ask questions about the source of repos and packages.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/askrepo.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "askrepo",
    about = "Ask natural-language questions against git repos, npm packages, and local directories",
    version,
    long_about = "askrepo fetches the requested resources (git repositories, npm packages, local \
    directories), assembles them into a cached collection, and asks a configured model questions \
    grounded in that collection. Identical resource sets share one cached build, including across \
    concurrent requests and process restarts."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/askrepo.toml`. Data directory, cache, model,
    /// server, and named-resource settings are read from this file.
    #[arg(long, global = true, default_value = "./config/askrepo.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Ask a question against one or more resources.
    ///
    /// Resources are configured names or raw references (git URL,
    /// `npm:` spec, or local path). The collection is built on first
    /// use and reused while fresh.
    Ask {
        /// The question to ask.
        question: String,

        /// Resource to include (repeatable).
        #[arg(short = 'r', long = "resource", required = true)]
        resources: Vec<String>,

        /// Print the answer incrementally as the model produces it.
        #[arg(long)]
        stream: bool,

        /// Suppress fetch progress on stderr.
        #[arg(long)]
        quiet: bool,
    },

    /// Build (or reuse) a collection without asking anything.
    ///
    /// Useful for pre-warming the cache. Prints the collection key and
    /// its on-disk location.
    Fetch {
        /// Resources to include: configured names or raw references.
        #[arg(required = true)]
        resources: Vec<String>,

        /// Suppress fetch progress on stderr.
        #[arg(long)]
        quiet: bool,
    },

    /// List configured named resources.
    Resources,

    /// Manage the collection cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Start the HTTP server.
    ///
    /// Binds to the address configured in `[server].bind` and exposes
    /// `POST /ask`, `POST /cache/clear`, and `GET /health`.
    Serve,
}

/// Cache management subcommands.
#[derive(Subcommand)]
enum CacheAction {
    /// Delete all cached collections, repo checkouts, and npm installs.
    ///
    /// Builds already in flight finish for their current waiters but
    /// are not kept.
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let materializer = Arc::new(CliMaterializer::new(&cfg.data.dir, cfg.cache.fetch_window()));
    let cache = CollectionCache::new(
        config::resource_table(&cfg)?,
        &cfg.data.dir,
        cfg.cache.ttl(),
        Arc::clone(&materializer) as Arc<dyn fetch::Materializer>,
    );

    match cli.command {
        Commands::Ask {
            question,
            resources,
            stream,
            quiet,
        } => {
            run_ask(&cfg, &cache, question, resources, stream, quiet).await?;
        }
        Commands::Fetch { resources, quiet } => {
            run_fetch(&cache, resources, quiet).await?;
        }
        Commands::Resources => {
            run_resources(&cache, &materializer);
        }
        Commands::Cache { action } => match action {
            CacheAction::Clear => {
                cache.clear().await?;
                println!("Cache cleared.");
            }
        },
        Commands::Serve => {
            let provider = provider::create_provider(&cfg.model)?;
            server::run_server(&cfg, cache, provider).await?;
        }
    }

    Ok(())
}

async fn run_ask(
    cfg: &config::Config,
    cache: &Arc<CollectionCache>,
    question: String,
    resources: Vec<String>,
    stream: bool,
    quiet: bool,
) -> Result<()> {
    let provider = provider::create_provider(&cfg.model)?;
    let collection = cache
        .load(LoadRequest {
            resource_names: resources,
            quiet,
        })
        .await?;

    if !stream {
        let answer = provider.ask(&collection, &question).await?;
        println!("{}", answer);
        return Ok(());
    }

    let mut rx = provider.ask_stream(&collection, &question).await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextDelta { delta } => {
                stdout.write_all(delta.as_bytes())?;
                stdout.flush()?;
            }
            StreamEvent::Error { message, hint, .. } => match hint {
                Some(hint) => bail!("{} ({})", message, hint),
                None => bail!("{}", message),
            },
            StreamEvent::Done => break,
            StreamEvent::Meta { .. } => {}
        }
    }
    println!();
    Ok(())
}

async fn run_fetch(
    cache: &Arc<CollectionCache>,
    resources: Vec<String>,
    quiet: bool,
) -> Result<()> {
    let collection = cache
        .load(LoadRequest {
            resource_names: resources,
            quiet,
        })
        .await?;

    println!("collection {}", collection.key);
    println!("  path      {}", collection.path.display());
    println!("  resources {}", collection.resource_names.join(", "));
    Ok(())
}

fn run_resources(cache: &Arc<CollectionCache>, materializer: &CliMaterializer) {
    let mut names: Vec<&String> = cache.resources().keys().collect();
    names.sort();

    println!("{:<20} {:<8} {:<12} TARGET", "NAME", "KIND", "STATUS");
    for name in names {
        let r = &cache.resources()[name];
        let status = if materializer.cache_dir(r).exists() {
            "fetched"
        } else {
            "not fetched"
        };
        println!("{:<20} {:<8} {:<12} {}", name, r.kind(), status, r.target());
    }
}
