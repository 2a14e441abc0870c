// master/src/state.rs

use std::sync::Arc;
use worker::RemoteExecutor;

use crate::admission::{AdmissionController, AdmissionError};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::store::TaskStore;

/// Servicios compartidos por los handlers. Se arma una vez en `main`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub admission: Arc<AdmissionController>,
    pub catalog: Arc<Catalog>,
}

impl AppState {
    pub async fn new(
        config: Config,
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Result<Self, AdmissionError> {
        let admission = AdmissionController::open(&config.rate_limit).await?;
        Ok(Self::assemble(config, store, executor, admission))
    }

    pub fn assemble(
        config: Config,
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn RemoteExecutor>,
        admission: AdmissionController,
    ) -> Self {
        let orchestrator = Orchestrator::new(
            store,
            executor,
            config.ssh.clone(),
            config.scripts_base_url.clone(),
            config.task_max_duration,
        );
        let catalog = Catalog::new(config.data_dir.clone(), config.default_lang.clone());

        Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            admission: Arc::new(admission),
            catalog: Arc::new(catalog),
        }
    }
}
