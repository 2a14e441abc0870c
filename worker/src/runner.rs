use common::sanitize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::executor::{RemoteExecutor, Target};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Ejecución síncrona (en primer plano) de un comando remoto.
///
/// A diferencia del orquestador HTTP, acá sí hay cancelación: el token se
/// revisa entre trozo y trozo de salida y, si se dispara, se cierra la sesión
/// aunque el proceso remoto siga escribiendo.
pub async fn run_interactive<F>(
    executor: &dyn RemoteExecutor,
    target: &Target,
    command: &str,
    cancel: &CancellationToken,
    mut on_output: F,
) -> RunOutcome
where
    F: FnMut(&str),
{
    on_output(&format!(
        "Connecting to {}:{} via SSH...\n",
        target.host, target.port
    ));

    let connected = tokio::select! {
        _ = cancel.cancelled() => return RunOutcome::Cancelled,
        res = executor.connect(target) => res,
    };
    let mut session = match connected {
        Ok(s) => s,
        Err(e) => return RunOutcome::Failed(e.to_string()),
    };

    let mut execution = match session.execute(command).await {
        Ok(ex) => ex,
        Err(e) => {
            session.close().await;
            return RunOutcome::Failed(e.to_string());
        }
    };

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("cancelación pedida, cerrando sesión con {}", target.host);
                session.close().await;
                return RunOutcome::Cancelled;
            }
            chunk = execution.next_chunk() => chunk,
        };
        match chunk {
            Some(c) => on_output(&sanitize(&c)),
            None => break,
        }
    }

    let outcome = match execution.exit_code().await {
        Ok(0) => RunOutcome::Completed,
        Ok(code) => RunOutcome::Failed(format!("Script exited with status {code}")),
        Err(e) => {
            warn!("ejecución en {} falló: {}", target.host, e);
            RunOutcome::Failed(e.to_string())
        }
    };
    session.close().await;
    outcome
}
