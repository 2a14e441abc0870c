pub mod executor;
pub mod runner;
pub mod ssh;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use executor::{ExecError, Execution, RemoteExecutor, Session, Target};
pub use runner::{run_interactive, RunOutcome};
pub use ssh::SshExecutor;
