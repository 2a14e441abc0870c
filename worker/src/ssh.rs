//! Ejecutor SSH sobre el cliente `ssh` del sistema.
//!
//! La contraseña se pasa a `sshpass` por la variable `SSHPASS`, nunca por
//! argumentos. Se fuerza pty (`-tt`) para que los scripts se comporten como
//! en una terminal; la salida resultante trae colores que limpia el
//! orquestador.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::executor::{ExecError, Execution, RemoteExecutor, Session, Target};

/// Código de `sshpass` cuando la contraseña es rechazada.
const SSHPASS_BAD_PASSWORD: i32 = 5;
/// Código de `ssh` para errores propios (conexión, protocolo).
const SSH_CLIENT_ERROR: i32 = 255;

const OUTPUT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct SshExecutor {
    sshpass_bin: String,
}

impl SshExecutor {
    pub fn new() -> Self {
        Self {
            sshpass_bin: "sshpass".to_string(),
        }
    }

    /// Para instalaciones con `sshpass` fuera del PATH.
    pub fn with_sshpass(bin: impl Into<String>) -> Self {
        Self {
            sshpass_bin: bin.into(),
        }
    }
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>, ExecError> {
        // Chequeo de alcance con timeout acotado; la autenticación real la
        // hace `ssh` al ejecutar.
        let addr = (target.host.as_str(), target.port);
        match tokio::time::timeout(target.connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => return Err(ExecError::Timeout(target.host.clone())),
            Ok(Err(e)) => return Err(ExecError::Transport(e.to_string())),
            Ok(Ok(_probe)) => {}
        }

        debug!("host {}:{} alcanzable", target.host, target.port);
        Ok(Box::new(SshSession {
            target: target.clone(),
            sshpass_bin: self.sshpass_bin.clone(),
            kill: None,
        }))
    }
}

struct SshSession {
    target: Target,
    sshpass_bin: String,
    kill: Option<oneshot::Sender<()>>,
}

impl SshSession {
    fn command(&self, remote_command: &str) -> Command {
        let t = &self.target;
        let mut cmd = Command::new(&self.sshpass_bin);
        cmd.arg("-e")
            .arg("ssh")
            .arg("-tt")
            .args(["-p", &t.port.to_string()])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "PubkeyAuthentication=no"])
            .args(["-o", "PreferredAuthentications=password,keyboard-interactive"])
            .args(["-o", "LogLevel=ERROR"])
            .args([
                "-o",
                &format!("ConnectTimeout={}", t.connect_timeout.as_secs().max(1)),
            ])
            .arg(format!("{}@{}", t.username, t.host))
            .arg(remote_command)
            .env("SSHPASS", &t.credential)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Session for SshSession {
    async fn execute(&mut self, command: &str) -> Result<Execution, ExecError> {
        let mut child = self.command(command).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::Transport(format!("ssh client not available: {e}"))
            } else {
                ExecError::Io(e)
            }
        })?;

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        self.kill = Some(kill_tx);

        let last_stderr = Arc::new(Mutex::new(String::new()));
        let stdout_task = tokio::spawn(pump(child.stdout.take(), tx.clone(), None));
        let stderr_task = tokio::spawn(pump(child.stderr.take(), tx, Some(last_stderr.clone())));
        let host = self.target.host.clone();

        tokio::spawn(async move {
            // Si la sesión se cierra (o se suelta) antes de terminar, matamos el proceso.
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            let last_line = last_stderr.lock().map(|s| s.clone()).unwrap_or_default();
            let result = match status {
                Ok(status) => classify_exit(status.code(), &last_line, &host),
                Err(e) => Err(ExecError::Io(e)),
            };
            let _ = exit_tx.send(result);
        });

        Ok(Execution::new(rx, exit_rx))
    }

    async fn close(&mut self) {
        if let Some(kill) = self.kill.take() {
            // Si el proceso ya terminó el receptor no existe; da igual.
            let _ = kill.send(());
        }
    }
}

/// Lee líneas (con su `\n`) y las reenvía; opcionalmente guarda la última
/// línea no vacía para diagnosticar errores del cliente ssh.
async fn pump<R: AsyncRead + Unpin>(
    stream: Option<R>,
    tx: mpsc::Sender<String>,
    last_line: Option<Arc<Mutex<String>>>,
) {
    let Some(stream) = stream else { return };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&buf).into_owned();
                if let Some(last) = &last_line {
                    if !chunk.trim().is_empty() {
                        if let Ok(mut l) = last.lock() {
                            *l = chunk.trim().to_string();
                        }
                    }
                }
                if tx.send(chunk).await.is_err() {
                    // nadie escucha ya
                    break;
                }
            }
            Err(e) => {
                warn!("error leyendo salida remota: {}", e);
                break;
            }
        }
    }
}

fn classify_exit(code: Option<i32>, last_stderr: &str, host: &str) -> Result<i32, ExecError> {
    match code {
        Some(SSHPASS_BAD_PASSWORD) => Err(ExecError::Auth),
        Some(SSH_CLIENT_ERROR) => {
            if last_stderr.to_ascii_lowercase().contains("timed out") {
                Err(ExecError::Timeout(host.to_string()))
            } else if last_stderr.contains("Permission denied") {
                Err(ExecError::Auth)
            } else if last_stderr.is_empty() {
                Err(ExecError::Transport(format!(
                    "ssh exited with status {SSH_CLIENT_ERROR}"
                )))
            } else {
                Err(ExecError::Transport(last_stderr.to_string()))
            }
        }
        Some(code) => Ok(code),
        None => Err(ExecError::Transport(
            "remote session terminated by signal".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clasifica_codigos_de_salida() {
        assert!(matches!(classify_exit(Some(0), "", "h"), Ok(0)));
        assert!(matches!(classify_exit(Some(3), "", "h"), Ok(3)));
        assert!(matches!(classify_exit(Some(5), "", "h"), Err(ExecError::Auth)));
        assert!(matches!(
            classify_exit(Some(255), "ssh: connect to host h port 22: Connection timed out", "h"),
            Err(ExecError::Timeout(h)) if h == "h"
        ));
        assert!(matches!(
            classify_exit(Some(255), "root@h: Permission denied (password).", "h"),
            Err(ExecError::Auth)
        ));
        assert!(matches!(
            classify_exit(Some(255), "Connection refused", "h"),
            Err(ExecError::Transport(m)) if m == "Connection refused"
        ));
        assert!(matches!(classify_exit(None, "", "h"), Err(ExecError::Transport(_))));
    }

    #[test]
    fn target_no_muestra_la_credencial() {
        let t = Target {
            host: "10.0.0.5".into(),
            port: 22,
            username: "root".into(),
            credential: "s3cret".into(),
            connect_timeout: Duration::from_secs(1),
        };
        let dbg = format!("{t:?}");
        assert!(dbg.contains("10.0.0.5"));
        assert!(!dbg.contains("s3cret"));
    }

    #[tokio::test]
    async fn connect_a_puerto_cerrado_es_error_de_transporte() {
        // Puerto 1 en loopback: no hay nadie escuchando.
        let t = Target {
            host: "127.0.0.1".into(),
            port: 1,
            username: "root".into(),
            credential: "x".into(),
            connect_timeout: Duration::from_secs(2),
        };
        let err = SshExecutor::new().connect(&t).await.err().unwrap();
        assert!(matches!(err, ExecError::Transport(_) | ExecError::Timeout(_)));
    }
}
