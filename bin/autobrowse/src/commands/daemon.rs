use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::bridge::CommandBridge;

/// Restore schedules, run the scheduler and eviction sweep until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let app = super::open_app().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = app.start_background(&shutdown_tx).await?;
    info!(base = %app.paths.base.display(), "autobrowse daemon running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(());
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    app.shutdown().await;
    Ok(())
}

/// Serve the JSON-lines bridge on stdin/stdout while the scheduler runs.
pub async fn bridge() -> anyhow::Result<()> {
    let app = Arc::new(super::open_app().await?);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = app.start_background(&shutdown_tx).await?;

    let bridge = Arc::new(CommandBridge::new(app.clone()));
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = bridge.serve(stdin, stdout) => {
            if let Err(e) = result {
                warn!(error = %e, "Bridge input failed");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }
    app.shutdown().await;
    Ok(())
}
