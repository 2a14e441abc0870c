//! Ejecutor en memoria que reproduce un guion de pasos. Sólo para tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::executor::{ExecError, Execution, RemoteExecutor, Session, Target};

#[derive(Clone)]
pub enum FakeStep {
    /// Emite un trozo de salida.
    Chunk(String),
    /// Se queda esperando hasta que el test haga `notify_one`.
    Wait(Arc<Notify>),
    /// Termina con este código de salida.
    Exit(i32),
    /// Termina con un error de transporte.
    Fail(String),
}

pub struct FakeExecutor {
    steps: Vec<FakeStep>,
    connect_error: Option<fn(&Target) -> ExecError>,
    pub connects: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub commands: Arc<Mutex<Vec<String>>>,
}

impl FakeExecutor {
    pub fn new(steps: Vec<FakeStep>) -> Self {
        Self {
            steps,
            connect_error: None,
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Ejecutor cuyo `connect` siempre falla.
    pub fn failing(connect_error: fn(&Target) -> ExecError) -> Self {
        Self {
            connect_error: Some(connect_error),
            ..Self::new(Vec::new())
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>, ExecError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(make_err) = self.connect_error {
            return Err(make_err(target));
        }
        Ok(Box::new(FakeSession {
            steps: self.steps.clone(),
            closes: self.closes.clone(),
            commands: self.commands.clone(),
            task: None,
            closed: false,
        }))
    }
}

struct FakeSession {
    steps: Vec<FakeStep>,
    closes: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
    task: Option<tokio::task::JoinHandle<()>>,
    closed: bool,
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&mut self, command: &str) -> Result<Execution, ExecError> {
        if let Ok(mut cmds) = self.commands.lock() {
            cmds.push(command.to_string());
        }

        let (tx, rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = oneshot::channel();
        let steps = self.steps.clone();

        self.task = Some(tokio::spawn(async move {
            let mut result = Ok(0);
            for step in steps {
                match step {
                    FakeStep::Chunk(c) => {
                        if tx.send(c).await.is_err() {
                            return;
                        }
                    }
                    FakeStep::Wait(n) => n.notified().await,
                    FakeStep::Exit(code) => {
                        result = Ok(code);
                        break;
                    }
                    FakeStep::Fail(msg) => {
                        result = Err(ExecError::Transport(msg));
                        break;
                    }
                }
            }
            drop(tx);
            let _ = exit_tx.send(result);
        }));

        Ok(Execution::new(rx, exit_rx))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
