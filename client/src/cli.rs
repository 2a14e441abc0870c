use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::{
    BlockRequest, BlockedList, ErrorBody, JobAccepted, JobRequest, JobStatusResponse,
    StatsResponse, TaskStatus, UnblockRequest, UnblockResponse,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::Write;
use std::time::Duration;

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para lanzar instalaciones y administrar el master")]
struct Cli {
    #[arg(long, env = "MASTER_URL", default_value = "http://localhost:8080", global = true)]
    master_url: String,

    #[arg(long, env = "API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lanza la instalación de un script en un servidor
    Submit {
        #[arg(value_name = "SCRIPT")]
        script: String,

        #[arg(long)]
        host: String,

        /// Contraseña SSH del servidor
        #[arg(long, env = "SSH_PASSWORD", hide_env_values = true)]
        password: String,

        /// Argumentos extra para el script
        #[arg(long)]
        extra: Option<String>,

        /// Espera hasta el final mostrando la salida
        #[arg(long)]
        wait: bool,

        /// Segundos entre consultas con --wait
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
    /// Estado y salida de una tarea (si terminó, se consume)
    Status {
        #[arg(value_name = "FINGERPRINT")]
        fingerprint: String,
    },
    /// Orígenes bloqueados
    Blocked,
    /// Bloquea un origen
    Block {
        #[arg(value_name = "SOURCE")]
        source: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        permanent: bool,
        /// Duración en horas (default del master: 1)
        #[arg(long)]
        hours: Option<f64>,
    },
    /// Quita el bloqueo de un origen
    Unblock {
        #[arg(value_name = "SOURCE")]
        source: String,
    },
    /// Últimas peticiones registradas
    Stats {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Peticiones de un origen en la ventana actual
    Count {
        #[arg(value_name = "SOURCE")]
        source: String,
    },
    /// Catálogo de scripts (o uno solo si se da el nombre)
    Scripts {
        #[arg(value_name = "NAME")]
        name: Option<String>,
        #[arg(long)]
        lang: Option<String>,
    },
}

struct MasterClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl MasterClient {
    fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("X-API-Key", key),
            None => req,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.auth(self.http.get(self.url(path))).send().await?;
        decode(resp).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self.auth(self.http.post(self.url(path))).json(body).send().await?;
        decode(resp).await
    }
}

/// Cuerpo de éxito, o el mensaje de error del master.
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let text = resp.text().await.unwrap_or_default();
    bail!("{}", error_message(status.as_u16(), &text))
}

fn error_message(status: u16, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) => match err.count {
            Some(count) => format!("{} ({}, {} peticiones)", err.error, err.code, count),
            None => format!("{} ({})", err.error, err.code),
        },
        Err(_) => format!("el master respondió {status}"),
    }
}

/// Parte nueva de la salida respecto de lo ya impreso.
fn unseen<'a>(output: &'a str, printed: usize) -> &'a str {
    output.get(printed..).unwrap_or("")
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let master = MasterClient::new(&cli.master_url, cli.api_key);

    match cli.command {
        Commands::Submit {
            script,
            host,
            password,
            extra,
            wait,
            interval,
        } => {
            let req = JobRequest {
                script: Some(script),
                host: Some(host),
                credential: Some(password),
                extra,
            };
            let accepted: JobAccepted = master.post("/api/v1/jobs", &req).await?;
            println!("Tarea aceptada: {}", accepted.fingerprint);

            if wait {
                let path = format!("/api/v1/jobs/{}", accepted.fingerprint);
                let mut printed = 0;
                loop {
                    let job: JobStatusResponse = master.get(&path).await?;
                    print!("{}", unseen(&job.output, printed));
                    let _ = std::io::stdout().flush();
                    printed = job.output.len();

                    match job.status {
                        TaskStatus::Processing => {
                            tokio::time::sleep(Duration::from_secs(interval.max(1))).await
                        }
                        TaskStatus::Completed => {
                            println!("\nInstalación completada");
                            break;
                        }
                        TaskStatus::Error => bail!("la instalación terminó con error"),
                    }
                }
            }
        }

        Commands::Status { fingerprint } => {
            let job: JobStatusResponse = master.get(&format!("/api/v1/jobs/{fingerprint}")).await?;
            println!("Tarea {}", job.fingerprint);
            println!("  estado: {:?}", job.status);
            println!("  salida:\n{}", job.output);
        }

        Commands::Blocked => {
            let list: BlockedList = master.get("/api/v1/admission/blocked").await?;
            if list.blocked.is_empty() {
                println!("(ningún origen bloqueado)");
            }
            for b in list.blocked {
                let until = match (b.permanent, b.expires_at) {
                    (true, _) | (false, None) => "permanente".to_string(),
                    (false, Some(t)) => format!("hasta {t}"),
                };
                println!("{:<40} {:<24} {}", b.source, until, b.reason);
            }
        }

        Commands::Block {
            source,
            reason,
            permanent,
            hours,
        } => {
            let req = BlockRequest {
                source: source.clone(),
                reason,
                permanent,
                duration_hours: hours,
            };
            let _: Value = master.post("/api/v1/admission/block", &req).await?;
            println!("Origen {source} bloqueado");
        }

        Commands::Unblock { source } => {
            let resp: UnblockResponse = master
                .post("/api/v1/admission/unblock", &UnblockRequest { source: source.clone() })
                .await?;
            if resp.unblocked {
                println!("Origen {source} desbloqueado");
            } else {
                println!("Origen {source} no estaba bloqueado");
            }
        }

        Commands::Stats { source, limit } => {
            let mut path = format!("/api/v1/admission/stats?limit={limit}");
            if let Some(src) = source {
                path.push_str(&format!("&source={src}"));
            }
            let stats: StatsResponse = master.get(&path).await?;
            for e in stats.requests {
                println!("{}  {:<40} {}", e.timestamp, e.source, e.endpoint);
            }
        }

        Commands::Count { source } => {
            let v: Value = master.get(&format!("/api/v1/admission/count/{source}")).await?;
            println!("{}: {} peticiones en la ventana actual", source, v["count"]);
        }

        Commands::Scripts { name, lang } => {
            let query = lang.map(|l| format!("?lang={l}")).unwrap_or_default();
            let path = match &name {
                Some(n) => format!("/api/v1/scripts/{n}{query}"),
                None => format!("/api/v1/scripts{query}"),
            };
            let v: Value = master.get(&path).await?;
            let pretty = match name {
                Some(_) => serde_json::to_string_pretty(&v["result"])?,
                None => serde_json::to_string_pretty(&v["scripts"])?,
            };
            println!("{pretty}");
        }
    }

    Ok(())
}
