mod admission;
mod catalog;
mod config;
mod error;
mod handlers;
mod monitor;
mod orchestrator;
mod state;
mod store;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use worker::SshExecutor;

use crate::config::{Config, StoreKind};
use crate::state::AppState;
use crate::store::{FileTaskStore, MemoryTaskStore, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env opcional
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("master=debug,worker=debug,tower_http=info")
        }))
        .init();

    let config = Config::from_env();

    let store: Arc<dyn TaskStore> = match &config.store {
        StoreKind::Memory => {
            info!("tareas en memoria");
            Arc::new(MemoryTaskStore::new())
        }
        StoreKind::File(dir) => {
            let store = FileTaskStore::open(dir)
                .with_context(|| format!("no se pudo abrir {}", dir.display()))?;
            store
                .recover_interrupted()
                .context("recuperando tareas interrumpidas")?;
            info!("tareas en {}", dir.display());
            Arc::new(store)
        }
    };

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, store, Arc::new(SshExecutor::new()))
        .await
        .context("iniciando control de admisión")?;

    // router HTTP
    let app = handlers::build_router(state.clone());

    // mantenimiento en segundo plano
    let housekeeping_state = state.clone();
    tokio::spawn(async move {
        monitor::run_housekeeping_loop(housekeeping_state).await;
    });

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {bind_addr}"))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("apagando master");
    })
    .await?;

    Ok(())
}
