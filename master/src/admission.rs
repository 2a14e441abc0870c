//! Control de admisión: ventana deslizante por origen, bloqueo automático
//! al pasarse del límite y bloqueos manuales (permanentes o con vencimiento).
//!
//! Todo queda en sqlite: `request_log` (una fila por petición admitida) y
//! `blocked_sources` (a lo sumo un bloqueo por origen).

use chrono::{DateTime, Utc};
use common::{AdmissionDecision, BlockedSource, RequestLogEntry};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RateLimitConfig;

/// Duración del bloqueo automático y de los manuales sin duración.
pub const BLOCK_DURATION: Duration = Duration::from_secs(3600);

/// El log se poda dentro de cada chequeo por encima de este horizonte.
const LOG_RETENTION: Duration = Duration::from_secs(3600);

pub const DEFAULT_STATS_LIMIT: u32 = 100;
pub const MAX_STATS_LIMIT: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("admission storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Fuente de la hora actual; en tests se reemplaza por un reloj manual.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct AdmissionController {
    max_requests: u64,
    window: Duration,
    clock: Arc<dyn Clock>,
    /// `None` = desactivado: todo pasa y no se toca la base.
    pool: Option<SqlitePool>,
    // check-contar-bloquear tiene que ser atómico
    lock: Mutex<()>,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(if ms > 0 {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

impl AdmissionController {
    pub async fn open(cfg: &RateLimitConfig) -> Result<Self, AdmissionError> {
        Self::with_clock(cfg, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        cfg: &RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AdmissionError> {
        let pool = if cfg.enabled {
            let pool = connect(&cfg.db_path).await?;
            init_schema(&pool).await?;
            info!(
                "control de admisión activo: máx {} peticiones cada {}s",
                cfg.max_requests,
                cfg.window.as_secs()
            );
            Some(pool)
        } else {
            info!("control de admisión desactivado");
            None
        };

        Ok(Self {
            max_requests: cfg.max_requests,
            window: cfg.window,
            clock,
            pool,
            lock: Mutex::new(()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Decide si `source` puede seguir y, si puede, registra la petición.
    pub async fn check_and_record(
        &self,
        source: &str,
        endpoint: &str,
    ) -> Result<AdmissionDecision, AdmissionError> {
        let Some(pool) = &self.pool else {
            return Ok(AdmissionDecision::allow(0));
        };

        let _guard = self.lock.lock().await;
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let mut tx = pool.begin().await?;

        if let Some(reason) = live_block(&mut tx, source, now_ms).await? {
            tx.commit().await?;
            debug!("origen {} bloqueado: {}", source, reason);
            return Ok(AdmissionDecision::deny(0, reason));
        }

        sqlx::query("INSERT INTO request_log (source, endpoint, ts_ms) VALUES (?, ?, ?)")
            .bind(source)
            .bind(endpoint)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

        let count = count_since(&mut tx, source, now_ms.saturating_sub(millis(self.window))).await?;

        sqlx::query("DELETE FROM request_log WHERE ts_ms < ?")
            .bind(now_ms.saturating_sub(millis(LOG_RETENTION)))
            .execute(&mut *tx)
            .await?;

        if count > self.max_requests {
            let reason = format!(
                "Rate limit exceeded: {} requests in {} seconds",
                count,
                self.window.as_secs()
            );
            upsert_block(
                &mut tx,
                source,
                &reason,
                now_ms,
                Some(now_ms.saturating_add(millis(BLOCK_DURATION))),
                false,
            )
            .await?;
            tx.commit().await?;
            warn!("origen {} bloqueado: {}", source, reason);
            return Ok(AdmissionDecision::deny(count, reason));
        }

        tx.commit().await?;
        Ok(AdmissionDecision::allow(count))
    }

    /// Crea o reemplaza el bloqueo de `source`. `false` si está desactivado.
    pub async fn block(
        &self,
        source: &str,
        reason: Option<&str>,
        permanent: bool,
        duration: Option<Duration>,
    ) -> Result<bool, AdmissionError> {
        let Some(pool) = &self.pool else {
            return Ok(false);
        };

        let reason = reason.filter(|r| !r.trim().is_empty()).unwrap_or("Manual block");
        let now_ms = self.clock.now().timestamp_millis();
        let expires_ms = if permanent {
            None
        } else {
            Some(now_ms.saturating_add(millis(duration.unwrap_or(BLOCK_DURATION))))
        };

        let _guard = self.lock.lock().await;
        let mut conn = pool.acquire().await?;
        upsert_block(&mut conn, source, reason, now_ms, expires_ms, permanent).await?;
        info!("origen {} bloqueado: {}", source, reason);
        Ok(true)
    }

    /// `true` si había un bloqueo y se borró.
    pub async fn unblock(&self, source: &str) -> Result<bool, AdmissionError> {
        let Some(pool) = &self.pool else {
            return Ok(false);
        };

        let _guard = self.lock.lock().await;
        let res = sqlx::query("DELETE FROM blocked_sources WHERE source = ?")
            .bind(source)
            .execute(pool)
            .await?;
        let removed = res.rows_affected() > 0;
        if removed {
            info!("origen {} desbloqueado", source);
        }
        Ok(removed)
    }

    /// Bloqueos guardados, los más recientes primero. Los temporales vencidos
    /// siguen apareciendo hasta que un chequeo los borre.
    pub async fn list_blocked(&self) -> Result<Vec<BlockedSource>, AdmissionError> {
        let Some(pool) = &self.pool else {
            return Ok(Vec::new());
        };

        let rows: Vec<(String, String, i64, Option<i64>, i64)> = sqlx::query_as(
            "SELECT source, reason, blocked_at_ms, expires_at_ms, permanent
             FROM blocked_sources
             ORDER BY blocked_at_ms DESC",
        )
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(source, reason, blocked_at, expires_at, permanent)| BlockedSource {
                source,
                reason,
                blocked_at: from_millis(blocked_at),
                expires_at: expires_at.map(from_millis),
                permanent: permanent != 0,
            })
            .collect())
    }

    /// Últimas peticiones registradas, opcionalmente de un solo origen.
    pub async fn stats(
        &self,
        source: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RequestLogEntry>, AdmissionError> {
        let Some(pool) = &self.pool else {
            return Ok(Vec::new());
        };
        let limit = i64::from(limit.clamp(1, MAX_STATS_LIMIT));

        let rows: Vec<(String, String, i64)> = match source {
            Some(src) => {
                sqlx::query_as(
                    "SELECT source, endpoint, ts_ms FROM request_log
                     WHERE source = ?
                     ORDER BY ts_ms DESC, id DESC
                     LIMIT ?",
                )
                .bind(src)
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT source, endpoint, ts_ms FROM request_log
                     ORDER BY ts_ms DESC, id DESC
                     LIMIT ?",
                )
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|(source, endpoint, ts)| RequestLogEntry {
                source,
                endpoint,
                timestamp: from_millis(ts),
            })
            .collect())
    }

    /// Peticiones de `source` dentro de la ventana actual, sin registrar nada.
    pub async fn request_count(&self, source: &str) -> Result<u64, AdmissionError> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let now_ms = self.clock.now().timestamp_millis();
        let mut conn = pool.acquire().await?;
        Ok(count_since(&mut conn, source, now_ms.saturating_sub(millis(self.window))).await?)
    }

    /// Borra del log las entradas más viejas que `max_age`.
    pub async fn cleanup_old_records(&self, max_age: Duration) -> Result<u64, AdmissionError> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };

        let _guard = self.lock.lock().await;
        let cutoff = self.clock.now().timestamp_millis().saturating_sub(millis(max_age));
        let res = sqlx::query("DELETE FROM request_log WHERE ts_ms < ?")
            .bind(cutoff)
            .execute(pool)
            .await?;
        let removed = res.rows_affected();
        if removed > 0 {
            info!("{} registros viejos de peticiones borrados", removed);
        }
        Ok(removed)
    }
}

async fn connect(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if db_path == ":memory:" {
        // Una sola conexión que nunca se recicla: la base vive con ella.
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        return SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await;
    }

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(10));
    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await
}

async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS request_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            ts_ms INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_request_log_source_ts
            ON request_log(source, ts_ms)",
        "CREATE TABLE IF NOT EXISTS blocked_sources (
            source TEXT PRIMARY KEY,
            reason TEXT NOT NULL,
            blocked_at_ms INTEGER NOT NULL,
            expires_at_ms INTEGER,
            permanent INTEGER NOT NULL DEFAULT 0
        )",
    ];
    for stmt in statements {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

/// Motivo del bloqueo vigente de `source`, si lo hay. Un bloqueo temporal
/// vencido se borra acá mismo.
async fn live_block(
    conn: &mut SqliteConnection,
    source: &str,
    now_ms: i64,
) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String, Option<i64>, i64)> = sqlx::query_as(
        "SELECT reason, expires_at_ms, permanent FROM blocked_sources WHERE source = ?",
    )
    .bind(source)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((reason, expires_at, permanent)) = row else {
        return Ok(None);
    };

    if permanent == 0 {
        if let Some(exp) = expires_at {
            // vigente hasta el instante de vencimiento inclusive
            if now_ms > exp {
                sqlx::query("DELETE FROM blocked_sources WHERE source = ?")
                    .bind(source)
                    .execute(&mut *conn)
                    .await?;
                debug!("bloqueo vencido de {} eliminado", source);
                return Ok(None);
            }
        }
    }
    Ok(Some(reason))
}

async fn count_since(
    conn: &mut SqliteConnection,
    source: &str,
    since_ms: i64,
) -> Result<u64, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM request_log WHERE source = ? AND ts_ms > ?")
            .bind(source)
            .bind(since_ms)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count.max(0) as u64)
}

async fn upsert_block(
    conn: &mut SqliteConnection,
    source: &str,
    reason: &str,
    blocked_at_ms: i64,
    expires_at_ms: Option<i64>,
    permanent: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR REPLACE INTO blocked_sources
            (source, reason, blocked_at_ms, expires_at_ms, permanent)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(source)
    .bind(reason)
    .bind(blocked_at_ms)
    .bind(expires_at_ms)
    .bind(i64::from(permanent))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Reloj que sólo avanza cuando el test lo pide.
#[cfg(test)]
pub struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self(std::sync::Mutex::new(Utc::now()))
    }

    pub fn advance(&self, d: Duration) {
        let mut now = self.0.lock().unwrap();
        *now += chrono::Duration::from_std(d).unwrap();
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}
