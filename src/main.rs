use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use tablebook::compactor::compact_if_due;
use tablebook::config::Config;
use tablebook::engine::Engine;
use tablebook::model::{Booking, SlotOccupancy, Table, User};
use tablebook::pg::PgStore;
use tablebook::store::Directory;

#[derive(Serialize)]
struct Snapshot {
    users: Vec<User>,
    tables: Vec<Table>,
    bookings: Vec<Booking>,
    occupancy: Vec<SlotOccupancy>,
}

async fn snapshot(store: &dyn Directory) -> Result<Snapshot, tablebook::Error> {
    let tables = store.list_tables().await?;
    let mut occupancy = Vec::new();
    for table in &tables {
        occupancy.extend(store.slot_occupancy(table.id).await?);
    }
    Ok(Snapshot {
        users: store.list_users().await?,
        tables,
        bookings: store.list_bookings().await?,
        occupancy,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    tablebook::observability::init(config.metrics_port)?;

    let snapshot = match &config.database_url {
        Some(url) => {
            info!("store: postgres (pool size {})", config.pool_size);
            let store = PgStore::connect(url, config.pool_size)?;
            store.migrate().await?;
            snapshot(&store).await?
        }
        None => {
            std::fs::create_dir_all(&config.data_dir)?;
            let wal_path = config.wal_path();
            info!("store: embedded, wal at {}", wal_path.display());
            let engine = Arc::new(Engine::new(wal_path)?);
            if compact_if_due(&engine, config.compact_threshold).await? {
                info!("compacted WAL on startup");
            }
            snapshot(&engine).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
