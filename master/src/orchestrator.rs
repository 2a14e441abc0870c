//! Orquestador de tareas: convierte una ejecución remota larga y síncrona
//! en un trabajo en segundo plano, idempotente y consultable por fingerprint.

use common::shell::build_install_command;
use common::{sanitize, Fingerprint, JobRequest, JobSpec, TaskRecord, TaskStatus};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use worker::{ExecError, RemoteExecutor, Session, Target};

use crate::config::SshConfig;
use crate::store::{blocking, StoreError, TaskStore};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),

    #[error("Task not found")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] StoreError),
}

pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn RemoteExecutor>,
    ssh: SshConfig,
    scripts_base_url: String,
    max_duration: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn RemoteExecutor>,
        ssh: SshConfig,
        scripts_base_url: String,
        max_duration: Option<Duration>,
    ) -> Self {
        Self {
            store,
            executor,
            ssh,
            scripts_base_url,
            max_duration,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Valida, calcula el fingerprint y, si no hay un trabajo igual en
    /// curso, lanza uno nuevo. Vuelve enseguida en ambos casos.
    pub async fn submit(&self, req: JobRequest) -> Result<Fingerprint, OrchestratorError> {
        let spec = req.validate().map_err(OrchestratorError::Validation)?;
        self.submit_spec(spec).await
    }

    pub async fn submit_spec(&self, spec: JobSpec) -> Result<Fingerprint, OrchestratorError> {
        let fp = spec.fingerprint();

        let key = fp.clone();
        if !blocking(&self.store, move |s| s.begin(&key)).await? {
            debug!("tarea {} ya en curso, se reutiliza", fp);
            return Ok(fp);
        }

        info!("tarea {} creada: script {} en {}", fp, spec.script, spec.host);

        let job = BackgroundJob {
            store: self.store.clone(),
            executor: self.executor.clone(),
            target: Target {
                host: spec.host,
                port: self.ssh.port,
                username: self.ssh.user.clone(),
                credential: spec.credential,
                connect_timeout: self.ssh.connect_timeout,
            },
            command: build_install_command(&self.scripts_base_url, &spec.script, &spec.extra),
            fingerprint: fp.clone(),
            max_duration: self.max_duration,
        };
        tokio::spawn(job.run());

        Ok(fp)
    }

    /// Estado y salida acumulada. Un registro terminal se entrega una sola
    /// vez: la siguiente consulta da `NotFound`.
    pub async fn poll(&self, fp: &Fingerprint) -> Result<TaskRecord, OrchestratorError> {
        let key = fp.clone();
        let mut record = blocking(&self.store, move |s| s.consume(&key))
            .await?
            .ok_or(OrchestratorError::NotFound)?;
        if let Cow::Owned(clean) = sanitize(&record.output) {
            record.output = clean;
        }
        if record.status.is_terminal() {
            info!("tarea {} entregada con estado {:?}", fp, record.status);
        }
        Ok(record)
    }
}

/// Cómo terminó la parte remota de un trabajo.
enum RunEnd {
    Exited(i32),
    Failed(ExecError),
    TimedOut(Duration),
}

/// Único dueño de las mutaciones de su fingerprint hasta el estado final.
struct BackgroundJob {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn RemoteExecutor>,
    target: Target,
    command: String,
    fingerprint: Fingerprint,
    max_duration: Option<Duration>,
}

impl BackgroundJob {
    async fn run(self) {
        let fp = &self.fingerprint;
        info!("tarea {}: conectando a {}:{}", fp, self.target.host, self.target.port);

        let end = match self.executor.connect(&self.target).await {
            Ok(mut session) => {
                let end = self.stream(session.as_mut()).await;
                session.close().await;
                end
            }
            Err(e) => RunEnd::Failed(e),
        };

        let (status, suffix) = match end {
            RunEnd::Exited(0) => (TaskStatus::Completed, None),
            RunEnd::Exited(code) => (
                TaskStatus::Error,
                Some(format!("\nScript exited with status {code}\n")),
            ),
            RunEnd::Failed(e) => (TaskStatus::Error, Some(format!("\nError: {e}\n"))),
            RunEnd::TimedOut(limit) => (
                TaskStatus::Error,
                Some(format!(
                    "\nError: execution exceeded the limit of {} seconds\n",
                    limit.as_secs()
                )),
            ),
        };

        if let Some(msg) = suffix {
            self.append(msg).await;
        }
        let key = fp.clone();
        match blocking(&self.store, move |s| s.finish(&key, status)).await {
            Ok(()) => info!("tarea {} terminada: {:?}", fp, status),
            Err(e) => error!("tarea {}: no se pudo guardar el estado final: {}", fp, e),
        }
    }

    async fn stream(&self, session: &mut dyn Session) -> RunEnd {
        let mut execution = match session.execute(&self.command).await {
            Ok(ex) => ex,
            Err(e) => return RunEnd::Failed(e),
        };

        let deadline = self.max_duration.map(|d| Instant::now() + d);

        loop {
            let chunk = tokio::select! {
                _ = wait_until(deadline) => {
                    warn!("tarea {}: límite de duración alcanzado", self.fingerprint);
                    return RunEnd::TimedOut(self.max_duration.unwrap_or_default());
                }
                chunk = execution.next_chunk() => chunk,
            };
            match chunk {
                Some(c) => self.append(sanitize(&c).into_owned()).await,
                None => break,
            }
        }

        match execution.exit_code().await {
            Ok(code) => RunEnd::Exited(code),
            Err(e) => RunEnd::Failed(e),
        }
    }

    // Un fallo del almacén no corta la ejecución remota: se registra y sigue.
    async fn append(&self, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        let key = self.fingerprint.clone();
        if let Err(e) = blocking(&self.store, move |s| s.append(&key, &chunk)).await {
            error!("tarea {}: no se pudo guardar salida: {}", self.fingerprint, e);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
