//! mark-node: personal data node daemon and CLI
//!
//! `init` creates the node key and user feed, `serve` runs the sync
//! coordinator and the peer HTTP surface, the rest are maintenance commands.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use mark_node::api::{create_router, ApiState};
use mark_node::app::Bookmarks;
use mark_node::config::{Config, StorageBackend};
use mark_node::entities::EntityDb;
use mark_node::feed::NodeKey;
use mark_node::storage::{MemoryStore, SqliteStore, Store};
use mark_node::sync::{Announcer, HttpPeerClient, PeerClient, Pub, SyncCoordinator};

#[derive(Parser)]
#[command(name = "mark-node")]
#[command(about = "Personal data node with signed feeds and gossip sync")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mark-node.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "MARK_DATA_DIR")]
    data_dir: Option<String>,

    /// Public URL advertised to peers
    #[arg(long, env = "MARK_URL")]
    url: Option<String>,

    /// HTTP port
    #[arg(short, long, env = "MARK_PORT")]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the node key and user feed
    Init,
    /// Run the sync coordinator and serve peers
    Serve {
        /// Additional pubs to register before the first round
        #[arg(long = "pub")]
        pubs: Vec<String>,
    },
    /// Print every key and value in the store
    Dump,
    /// Rebuild the indexes from stored feeds
    Rebuild {
        /// Also re-create and re-sign the user feed
        #[arg(long)]
        user_feed: bool,
    },
    /// Manage bookmarks in the local feed
    #[command(subcommand)]
    Bookmark(BookmarkCommand),
}

#[derive(Subcommand)]
enum BookmarkCommand {
    /// Add a bookmark
    Add {
        url: String,
        #[arg(long, default_value = "")]
        title: String,
    },
    /// List bookmarks from every known feed
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mark_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(std::path::Path::new(&cli.config))
        .with_context(|| format!("loading config {}", cli.config))?;

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }
    if let Some(url) = cli.url {
        config.node.url = Some(url);
    }
    if let Some(port) = cli.port {
        config.api.http_port = port;
    }

    info!("Data dir: {}", config.node.data_dir.display());

    match cli.command {
        Command::Init => init(&config),
        Command::Serve { pubs } => {
            config.node.bootstrap_pubs.extend(pubs);
            serve(config).await
        }
        Command::Dump => {
            let db = open_db(&config)?;
            for (key, value) in db.dump()? {
                println!("{} = {}", key, value);
            }
            Ok(())
        }
        Command::Rebuild { user_feed } => {
            let db = open_db(&config)?;
            if user_feed {
                db.rebuild_user_feed()?;
            }
            let feeds = db.rebuild_indexes()?;
            println!("Rebuilt indexes from {} feeds", feeds);
            Ok(())
        }
        Command::Bookmark(cmd) => {
            let bookmarks = Bookmarks::new(Arc::new(open_db(&config)?));
            match cmd {
                BookmarkCommand::Add { url, title } => {
                    println!("{}", bookmarks.add(&url, &title)?);
                }
                BookmarkCommand::List => {
                    for entity in bookmarks.list()? {
                        let b = entity.record;
                        println!("{}\t{}\t{}", entity.id, b.url, b.title);
                    }
                }
            }
            Ok(())
        }
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.storage.backend {
        StorageBackend::Sqlite => {
            let path = config.db_path();
            Arc::new(
                SqliteStore::open(&path)
                    .with_context(|| format!("opening database at {}", path.display()))?,
            )
        }
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

fn load_key(config: &Config) -> anyhow::Result<NodeKey> {
    std::fs::create_dir_all(&config.node.data_dir).context("creating data directory")?;
    let path = config.key_path();
    NodeKey::load_or_generate(&path).with_context(|| format!("loading node key {}", path.display()))
}

fn open_db(config: &Config) -> anyhow::Result<EntityDb> {
    let key = load_key(config)?;
    Ok(EntityDb::new(open_store(config)?, key))
}

fn init(config: &Config) -> anyhow::Result<()> {
    let db = open_db(config)?;
    let signed = db.ensure_user_feed()?;
    db.put_self(&Pub::new(config.public_url()))?;
    println!("Node ready, feed {} ({} ops)", db.fingerprint(), signed.length()?);
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let key = load_key(&config)?;
    let store = open_store(&config)?;

    let client: Arc<dyn PeerClient> = Arc::new(HttpPeerClient::new(config.sync.peer_timeout()));
    let (queue, announcer) = Announcer::channel(client.clone(), config.sync.announce_queue_capacity);
    let db = Arc::new(EntityDb::new(store, key).with_announcer(queue));

    db.ensure_user_feed()?;
    let url = config.public_url();
    db.put_self(&Pub::new(url.clone()))?;
    for bootstrap in &config.node.bootstrap_pubs {
        if bootstrap != &url && db.get_pub(bootstrap)?.is_none() {
            db.put_pub(&Pub::new(bootstrap.clone()))?;
            info!(url = %bootstrap, "Registered bootstrap pub");
        }
    }
    db.rebuild_indexes()?;
    info!(fingerprint = %db.fingerprint(), url = %url, "Node identity");

    tokio::spawn(announcer.run());

    let (sync_handle, coordinator) = SyncCoordinator::new(
        db.clone(),
        client,
        config.sync.freshness(),
        config.sync.interval(),
        Some(url),
    );
    tokio::spawn(coordinator.run());

    let app = create_router(ApiState::new(db).with_sync(sync_handle));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.http_port));
    info!("Serving peers on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
