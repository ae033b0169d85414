//! Stowage - mirror a database into an in-memory store and watch it.
//!
//! Connects to `DATABASE_URL`, loads the configured store, then keeps it in
//! sync with auto-load and logs every change until interrupted.

use stowage_persister::{ChangeOrigin, Config, MemoryStore, PersistError, Persister, ReactiveStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stowage=info,stowage_persister=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        poll_ms = config.poll_interval.as_millis() as u64,
        "Starting Stowage"
    );

    let driver = stowage_persister::db::connect(&config.database_url, config.notify_channel.as_deref()).await?;
    let store = MemoryStore::new_shared();
    let persister = Persister::new(
        store.clone(),
        driver.clone(),
        config.persister.clone(),
        config.persister_options(),
    )?;

    match persister.load().await {
        Ok(report) => {
            for warning in &report.warnings {
                tracing::warn!(warning = %warning, "Skipped row");
            }
        }
        Err(PersistError::PartialLoadFailure { failed, applied }) => {
            for failure in &failed {
                tracing::error!(failure = %failure, "Table failed to load");
            }
            tracing::warn!(applied = applied.len(), "Loaded with failures");
        }
        Err(e) => return Err(e.into()),
    }

    let content = store.get_content();
    tracing::info!(
        tables = content.tables.len(),
        rows = content.row_count(),
        values = content.values.len(),
        "Store loaded"
    );

    let mut changes = store.subscribe();
    persister.start_auto_load().await?;

    loop {
        tokio::select! {
            event = changes.recv() => {
                let Some(event) = event else { break };
                if event.origin == ChangeOrigin::Load {
                    tracing::info!(tables = ?event.tables, values = event.values, "Store changed from database");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    persister.destroy();
    tracing::info!(stats = %serde_json::to_string(&persister.stats())?, "Final stats");
    driver.close().await;

    Ok(())
}
