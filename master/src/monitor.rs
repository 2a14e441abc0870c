use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::state::AppState;
use crate::store::blocking;

/// Las entradas del log de admisión se guardan un día como máximo.
pub const REQUEST_LOG_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Loop de mantenimiento:
/// - borra registros terminales que nadie consultó
/// - poda el log de peticiones del control de admisión
pub async fn run_housekeeping_loop(state: AppState) {
    let every = state.config.housekeeping_interval;
    loop {
        sleep(every).await;
        sweep_once(&state).await;
    }
}

/// Una pasada. Los errores se registran y el loop sigue.
pub async fn sweep_once(state: &AppState) {
    let max_age = state.config.task_max_age;
    match blocking(state.orchestrator.store(), move |s| s.sweep(max_age)).await {
        Ok(0) => debug!("sin tareas viejas para borrar"),
        Ok(n) => info!("{} tareas terminadas sin reclamar borradas", n),
        Err(e) => warn!("error limpiando tareas: {}", e),
    }

    if let Err(e) = state.admission.cleanup_old_records(REQUEST_LOG_MAX_AGE).await {
        warn!("error limpiando log de admisión: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::config::Config;
    use crate::store::{MemoryTaskStore, TaskStore};
    use common::{Fingerprint, TaskStatus};
    use std::sync::Arc;
    use worker::fake::FakeExecutor;

    #[tokio::test]
    async fn pasada_borra_terminales_viejos() {
        let mut config = Config::for_tests();
        config.task_max_age = Duration::from_millis(1);

        let store = Arc::new(MemoryTaskStore::new());
        let done = Fingerprint::compute("a", "10.0.0.1", "x", "");
        let running = Fingerprint::compute("b", "10.0.0.1", "x", "");
        store.begin(&done).unwrap();
        store.finish(&done, TaskStatus::Completed).unwrap();
        store.begin(&running).unwrap();

        let admission = AdmissionController::open(&config.rate_limit).await.unwrap();
        let state = AppState::assemble(
            config,
            store.clone(),
            Arc::new(FakeExecutor::new(vec![])),
            admission,
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        sweep_once(&state).await;

        assert!(store.consume(&done).unwrap().is_none());
        assert!(store.consume(&running).unwrap().is_some());
    }
}
