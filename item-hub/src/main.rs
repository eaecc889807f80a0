use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use item_hub_core::acl::PermissionLedger;
use item_hub_core::auth::Hs256Verifier;
use item_hub_core::bulk::Coordinator;
use item_hub_core::events::{BusSink, EventBus};
use item_hub_core::limits::TreeLimits;
use item_hub_core::storage::ItemStore;

use item_hub::api;

#[derive(Parser)]
#[command(name = "item-hub", about = "Hierarchical item service")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: String,

    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// HS256 secret for bearer-token verification.
    #[arg(long, default_value = "dev-secret")]
    auth_secret: String,

    /// Bulk worker pool size.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Bulk task queue depth.
    #[arg(long, default_value_t = 64)]
    queue_depth: usize,

    #[arg(long)]
    max_tree_levels: Option<usize>,

    #[arg(long)]
    max_children: Option<usize>,

    #[arg(long)]
    max_descendants_move: Option<usize>,

    #[arg(long)]
    max_descendants_copy: Option<usize>,

    #[arg(long)]
    max_descendants_delete: Option<usize>,

    #[arg(long)]
    max_targets_per_request: Option<usize>,
}

impl Args {
    fn limits(&self) -> TreeLimits {
        let mut limits = TreeLimits::default();
        if let Some(value) = self.max_tree_levels {
            limits.max_tree_levels = value;
        }
        if let Some(value) = self.max_children {
            limits.max_children = value;
        }
        if let Some(value) = self.max_descendants_move {
            limits.max_descendants_move = value;
        }
        if let Some(value) = self.max_descendants_copy {
            limits.max_descendants_copy = value;
        }
        if let Some(value) = self.max_descendants_delete {
            limits.max_descendants_delete = value;
        }
        if let Some(value) = self.max_targets_per_request {
            limits.max_targets_per_request = value;
        }
        limits
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let limits = args.limits();

    let store = Arc::new(RwLock::new(ItemStore::open(&args.data_dir)?));
    let ledger = Arc::new(RwLock::new(PermissionLedger::open(&args.data_dir)?));
    let events = EventBus::new();
    let sink = Arc::new(BusSink::new(events.clone()));
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&store),
        Arc::clone(&ledger),
        limits.clone(),
        events.clone(),
        sink,
        args.workers,
        args.queue_depth,
    ));
    let verifier = Arc::new(Hs256Verifier::new(&args.auth_secret));

    let app = api::router(store, ledger, coordinator, limits, events, verifier)
        .route("/health", axum::routing::get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&args.bind).await?;
    tracing::info!(addr = %args.bind, "listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
