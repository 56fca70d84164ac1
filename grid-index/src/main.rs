// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::sync::Arc;

use grid_index::config::IndexConfig;
use grid_index::grid::MemoryGrid;
use grid_index::structures::{BTree, Catalog, GridContext, Txn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_INDEX: &str = "orders_by_id";

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grid_index=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match IndexConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Loaded configuration: node_capacity={}, max_node_bytes={}, op_timeout={:?}",
        config.node_capacity,
        config.max_node_bytes,
        config.op_timeout
    );

    let grid = MemoryGrid::new();
    let context = match GridContext::new(Arc::new(grid.clone()), config) {
        Ok(context) => context,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let catalog = Catalog::new(&context);
    match catalog.bootstrap().await {
        Ok(root) => tracing::info!("Catalog ready at root {}", root.root_id),
        Err(e) => {
            tracing::error!("Failed to bootstrap catalog: {e}");
            std::process::exit(1);
        }
    }

    if let Err(e) = populate(&context, &catalog).await {
        tracing::error!("Failed to populate {DEMO_INDEX}: {e}");
        std::process::exit(1);
    }

    // Reopen through the catalog, as a separate process would.
    let index: BTree<u64, String> = match catalog.open_index(DEMO_INDEX).await {
        Ok(Some(index)) => index,
        Ok(None) => {
            tracing::error!("Index {DEMO_INDEX} is not registered");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to open {DEMO_INDEX}: {e}");
            std::process::exit(1);
        }
    };

    let values = match index.range(&25, &40).await {
        Ok(cursor) => cursor.collect().await,
        Err(e) => Err(e),
    };
    match values {
        Ok(values) => tracing::info!("Range 25..=40 of {DEMO_INDEX}: {values:?}"),
        Err(e) => {
            tracing::error!("Range scan failed: {e}");
            std::process::exit(1);
        }
    }

    let stats = grid.stats();
    tracing::info!(
        "Grid: {} records, {} gets, {} sets, {} commits",
        grid.record_count(),
        stats.gets,
        stats.sets,
        stats.commits
    );
}

async fn populate(
    context: &GridContext,
    catalog: &Catalog,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut txn = Txn::begin(context);
    let index: BTree<u64, String> = BTree::create(context, &mut txn)?;
    for id in 0..50u64 {
        index.put(id, Some(format!("order_{id}")), &mut txn).await?;
    }
    catalog.register(DEMO_INDEX, index.id(), &mut txn).await?;
    txn.commit().await?;

    tracing::info!(
        "Indexed {} orders at height {}",
        index.count().await?,
        index.height().await?
    );
    Ok(())
}
