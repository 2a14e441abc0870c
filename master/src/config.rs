use common::shell::DEFAULT_SCRIPTS_BASE_URL;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Dónde guardar los registros de tareas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    File(PathBuf),
    Memory,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u64,
    pub window: Duration,
    /// Ruta del sqlite, o `:memory:`.
    pub db_path: String,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub port: u16,
    pub user: String,
    pub connect_timeout: Duration,
}

/// Configuración del master, leída una vez de variables de entorno.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// Vacío = autenticación desactivada.
    pub api_key: String,
    pub store: StoreKind,
    pub task_max_age: Duration,
    /// `None` = sin límite de duración.
    pub task_max_duration: Option<Duration>,
    pub housekeeping_interval: Duration,
    pub rate_limit: RateLimitConfig,
    pub trust_forwarded_for: bool,
    pub scripts_base_url: String,
    pub ssh: SshConfig,
    pub data_dir: PathBuf,
    pub default_lang: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let store = match env_string("TASK_STORE", "file").as_str() {
            "memory" => StoreKind::Memory,
            _ => StoreKind::File(PathBuf::from(env_string("TASKS_DIR", "./tasks"))),
        };

        let max_duration_secs: u64 = env_or("TASK_MAX_DURATION_SECS", 7200);

        Self {
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:8080"),
            api_key: env_string("API_KEY", ""),
            store,
            task_max_age: Duration::from_secs(env_or("TASK_MAX_AGE_SECS", 3600)),
            task_max_duration: (max_duration_secs > 0)
                .then(|| Duration::from_secs(max_duration_secs)),
            housekeeping_interval: Duration::from_secs(
                env_or("HOUSEKEEPING_INTERVAL_SECS", 60u64).max(1),
            ),
            rate_limit: RateLimitConfig {
                enabled: env_flag("RATE_LIMIT_ENABLED", true),
                max_requests: env_or("RATE_LIMIT_MAX_REQUESTS", 10),
                window: Duration::from_secs(env_or("RATE_LIMIT_WINDOW_SECS", 60u64).max(1)),
                db_path: env_string("RATE_LIMIT_DB", "rate_limiter.db"),
            },
            trust_forwarded_for: env_flag("TRUST_FORWARDED_FOR", false),
            scripts_base_url: env_string("SCRIPTS_BASE_URL", DEFAULT_SCRIPTS_BASE_URL),
            ssh: SshConfig {
                port: env_or("SSH_PORT", 22),
                user: env_string("SSH_USER", "root"),
                connect_timeout: Duration::from_secs(env_or("SSH_CONNECT_TIMEOUT_SECS", 30)),
            },
            data_dir: PathBuf::from(env_string("DATA_DIR", ".")),
            default_lang: env_string("DEFAULT_LANG", "ru"),
        }
    }

    /// Configuración para tests: todo en memoria, sin auth.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            api_key: String::new(),
            store: StoreKind::Memory,
            task_max_age: Duration::from_secs(3600),
            task_max_duration: None,
            housekeeping_interval: Duration::from_secs(60),
            rate_limit: RateLimitConfig {
                enabled: true,
                max_requests: 3,
                window: Duration::from_secs(60),
                db_path: ":memory:".to_string(),
            },
            trust_forwarded_for: false,
            scripts_base_url: "https://scripts.test".to_string(),
            ssh: SshConfig {
                port: 22,
                user: "root".to_string(),
                connect_timeout: Duration::from_secs(1),
            },
            data_dir: PathBuf::from("."),
            default_lang: "ru".to_string(),
        }
    }
}
