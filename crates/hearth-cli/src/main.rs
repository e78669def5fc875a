//! hearth command-line tool.
//!
//! Reads the local cache directly and, for `pull` and `replay`, runs a
//! short-lived agent against the configured remote.
//!
//! ```bash
//! hearth inspect app:public home
//! hearth pending
//! hearth seeds 0192f0c1e6a47c3e8d6b2a4f5e7d9c1b
//! hearth pull user:ab12 prefs
//! hearth replay
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use hearth_agent::{CacheDb, HttpRemote, SharedCache, shared_context_bus, spawn_agent};
use hearth_types::{AgentMessage, PageId, PageMessage, ScopeKey};

use crate::config::HearthConfig;

#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(about = "Inspect and drive a hearth local sync cache")]
struct Args {
    /// Config file (default: $HEARTH_CONFIG, then ~/.config/hearth/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache database, overriding the config file
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print cached documents of a scope, or one document's collections
    Inspect {
        scope: String,
        document: Option<String>,
    },
    /// List batch-updates the remote has not acknowledged
    Pending,
    /// Print a page's persisted request seed
    Seeds { page: String },
    /// Refresh a document from the remote into the cache
    Pull { scope: String, document: String },
    /// Re-send pending batch-updates
    Replay,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = HearthConfig::load(args.config.as_deref())?;
    let cache_path = config.cache_path(args.cache.as_deref())?;
    let cache = open_cache(&cache_path)?;

    let output = match args.command {
        Command::Inspect { scope, document } => inspect(&cache, &scope, document.as_deref())?,
        Command::Pending => pending(&cache)?,
        Command::Seeds { page } => seeds(&cache, &page)?,
        Command::Pull { scope, document } => pull(&config, cache, &scope, &document).await?,
        Command::Replay => replay(&config, cache).await?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn open_cache(path: &Path) -> Result<SharedCache> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = CacheDb::open(path).with_context(|| format!("opening cache {}", path.display()))?;
    tracing::debug!(path = %path.display(), "cache opened");
    Ok(db.into_shared())
}

fn parse_scope(scope: &str) -> Result<ScopeKey> {
    scope
        .parse()
        .with_context(|| format!("invalid scope key {scope:?}"))
}

fn inspect(cache: &SharedCache, scope: &str, document: Option<&str>) -> Result<Value> {
    let scope = parse_scope(scope)?;
    let db = cache.lock();
    if let Some(document) = document {
        return Ok(json!({
            "scope": scope,
            "document": document,
            "version": db.version(&scope, document)?,
            "collections": db.document(&scope, document)?,
        }));
    }

    let mut documents = Vec::new();
    for name in db.scope_documents(&scope)? {
        documents.push(json!({
            "document": name,
            "version": db.version(&scope, &name)?,
            "collections": db.collection_names(&scope, &name)?,
        }));
    }
    Ok(json!({
        "scope": scope,
        "loaded": db.is_loaded(&scope)?,
        "documents": documents,
    }))
}

fn pending(cache: &SharedCache) -> Result<Value> {
    let rows = cache.lock().pending()?;
    Ok(Value::Array(
        rows.into_iter()
            .map(|w| {
                json!({
                    "id": w.id,
                    "scope": w.scope,
                    "document": w.document,
                    "collection": w.collection,
                    "property": w.property,
                    "op": w.op,
                })
            })
            .collect(),
    ))
}

fn seeds(cache: &SharedCache, page: &str) -> Result<Value> {
    let page = PageId::parse(page).with_context(|| format!("invalid page id {page:?}"))?;
    let seed = cache.lock().load_seed(page)?;
    Ok(serde_json::to_value(seed)?)
}

fn remote(config: &HearthConfig) -> Result<Arc<HttpRemote>> {
    let url = config.remote_url()?;
    let remote = HttpRemote::with_timeout(url, config.agent.http_timeout())
        .with_context(|| format!("remote {url}"))?;
    Ok(Arc::new(remote))
}

async fn pull(
    config: &HearthConfig,
    cache: SharedCache,
    scope: &str,
    document: &str,
) -> Result<Value> {
    let scope = parse_scope(scope)?;
    let bus = shared_context_bus(config.agent.bus_capacity());
    let agent = spawn_agent(cache.clone(), remote(config)?, bus, config.agent.clone());

    let page = PageId::new();
    let mut link = agent.connect(page).await?;
    agent.send(
        page,
        PageMessage::RefreshData {
            scope_key: scope.clone(),
            document: document.to_string(),
            collections: None,
        },
    )?;
    agent.settle().await?;

    let mut changed = Vec::new();
    while let Some(message) = link.try_recv() {
        if let AgentMessage::DataUpdate { keys, .. } = message {
            changed.extend(keys.into_iter().map(|(_, collection)| collection));
        }
    }
    agent.disconnect(page)?;

    let version = cache.lock().version(&scope, document)?;
    Ok(json!({
        "scope": scope,
        "document": document,
        "version": version,
        "changed": changed,
    }))
}

async fn replay(config: &HearthConfig, cache: SharedCache) -> Result<Value> {
    let bus = shared_context_bus(config.agent.bus_capacity());
    let agent = spawn_agent(cache, remote(config)?, bus, config.agent.clone());
    let report = agent.replay_pending().await?;
    Ok(serde_json::to_value(report)?)
}
