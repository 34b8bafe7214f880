use std::sync::Arc;

use anyhow::Context;
use tokio::{signal, sync::mpsc};
use tracing::{error, info};

use dairy_wms as wms;
use wms::services::factory::{ServiceContainer, ServiceFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = wms::config::load_config().context("failed to load configuration")?;
    wms::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = wms::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        wms::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = wms::events::EventSender::new(event_tx);
    let event_task = tokio::spawn(wms::events::process_events(event_rx));

    let factory = ServiceFactory::new(db_arc.clone(), event_sender, &cfg);
    let services = ServiceContainer::new(&factory);

    let expiry_task = if cfg.expiry_check_enabled {
        Some(
            services
                .expiry_check
                .clone()
                .spawn_periodic(cfg.expiry_check_interval()),
        )
    } else {
        info!("Batch expiry check disabled");
        None
    };

    info!(environment = %cfg.environment, "Dairy WMS core started");
    shutdown_signal().await?;
    info!("Shutdown signal received");

    if let Some(task) = expiry_task {
        task.abort();
    }
    event_task.abort();
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install signal handler")?;
        sigterm.recv().await;
        Ok(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        res = ctrl_c => res,
        res = terminate => res,
    }
}
