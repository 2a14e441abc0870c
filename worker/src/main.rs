use anyhow::{bail, Result};
use clap::Parser;
use common::job::{is_valid_host, is_valid_script_name};
use common::shell::{build_install_command, DEFAULT_SCRIPTS_BASE_URL};
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use worker::{run_interactive, RunOutcome, SshExecutor, Target};

/// Instala un script en un servidor remoto en primer plano.
/// Ctrl-C corta la instalación y cierra la conexión.
#[derive(Parser)]
#[command(name = "worker")]
#[command(about = "Ejecuta un script de instalación por SSH y muestra la salida en vivo")]
struct Args {
    /// Nombre del script (sin .sh)
    #[arg(value_name = "SCRIPT")]
    script: String,

    /// IP del servidor
    #[arg(long)]
    host: String,

    /// Contraseña SSH (mejor por variable de entorno)
    #[arg(long, env = "SSH_PASSWORD", hide_env_values = true)]
    password: String,

    /// Argumentos extra para el script (ej: dominio)
    #[arg(long, default_value = "")]
    extra: String,

    #[arg(long, env = "SSH_PORT", default_value_t = 22)]
    port: u16,

    #[arg(long, env = "SSH_USER", default_value = "root")]
    user: String,

    #[arg(long, env = "SSH_CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    connect_timeout: u64,

    #[arg(long, env = "SCRIPTS_BASE_URL", default_value = DEFAULT_SCRIPTS_BASE_URL)]
    scripts_base_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("worker=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if !is_valid_script_name(&args.script) {
        bail!("Invalid script_name format");
    }
    if !is_valid_host(&args.host) {
        bail!("Invalid server_ip format");
    }

    let target = Target {
        host: args.host,
        port: args.port,
        username: args.user,
        credential: args.password,
        connect_timeout: Duration::from_secs(args.connect_timeout),
    };
    let command = build_install_command(&args.scripts_base_url, &args.script, &args.extra);

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    info!("ejecutando script {} en {}", args.script, target.host);
    let executor = SshExecutor::new();
    let mut stdout = std::io::stdout();
    let outcome = run_interactive(&executor, &target, &command, &cancel, |chunk| {
        let _ = stdout.write_all(chunk.as_bytes());
        let _ = stdout.flush();
    })
    .await;

    match outcome {
        RunOutcome::Completed => {
            println!("\nInstallation completed successfully");
            Ok(())
        }
        RunOutcome::Cancelled => {
            eprintln!("\nInstallation stopped by user");
            std::process::exit(130);
        }
        RunOutcome::Failed(msg) => {
            eprintln!("\nError: {msg}");
            std::process::exit(1);
        }
    }
}
