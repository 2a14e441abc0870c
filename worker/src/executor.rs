//! Contrato del ejecutor remoto.
//!
//! El orquestador sólo conoce estos tipos: abrir sesión, lanzar un comando,
//! leer la salida por trozos y recoger el código de salida.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Parámetros de conexión a un host.
#[derive(Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: String,
    pub connect_timeout: Duration,
}

// La credencial no se imprime nunca.
impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("SSH authentication failed. Please check the password.")]
    Auth,

    #[error("SSH connection error: {0}")]
    Transport(String),

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Una ejecución en curso: salida en vivo + código de salida al final.
///
/// La salida se cierra cuando el proceso remoto deja de escribir; recién
/// entonces tiene sentido esperar `exit_code`.
pub struct Execution {
    output: mpsc::Receiver<String>,
    exit: oneshot::Receiver<Result<i32, ExecError>>,
}

impl Execution {
    pub fn new(
        output: mpsc::Receiver<String>,
        exit: oneshot::Receiver<Result<i32, ExecError>>,
    ) -> Self {
        Self { output, exit }
    }

    /// Siguiente trozo de salida, `None` cuando se agotó.
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.output.recv().await
    }

    pub async fn exit_code(self) -> Result<i32, ExecError> {
        self.exit.await.unwrap_or_else(|_| {
            Err(ExecError::Transport(
                "session ended without exit status".to_string(),
            ))
        })
    }
}

#[async_trait]
pub trait Session: Send {
    async fn execute(&mut self, command: &str) -> Result<Execution, ExecError>;

    /// Idempotente; se puede llamar también después de un error.
    async fn close(&mut self);
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>, ExecError>;
}
