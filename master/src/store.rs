//! Almacén de registros de tareas.
//!
//! Un registro por fingerprint vivo: status + salida acumulada. Las
//! mutaciones de un mismo fingerprint se serializan con un lock por shard;
//! fingerprints distintos casi nunca comparten shard, así que trabajos no
//! relacionados no se bloquean entre sí.

use chrono::{DateTime, Utc};
use common::{Fingerprint, TaskRecord, TaskStatus};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    fs::{self, OpenOptions},
    hash::{Hash, Hasher},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tracing::{info, warn};

const NUM_SHARDS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt task record {0}: {1}")]
    Corrupt(String, String),

    #[error("task record {0} not found")]
    Missing(String),

    #[error("task record {0} is already final")]
    Finalized(String),

    #[error("task store lock poisoned")]
    Poisoned,

    #[error("task store worker failed: {0}")]
    Worker(String),
}

pub trait TaskStore: Send + Sync {
    /// Crea un registro `Processing` vacío, salvo que ya exista uno en
    /// `Processing`. `true` = creado: quien llama pasa a ser el único dueño
    /// de ese fingerprint. Un registro terminal sin reclamar se reemplaza.
    fn begin(&self, fp: &Fingerprint) -> Result<bool, StoreError>;

    /// Agrega salida a un registro en `Processing`.
    fn append(&self, fp: &Fingerprint, chunk: &str) -> Result<(), StoreError>;

    /// Transición a un estado terminal. Sólo una vez.
    fn finish(&self, fp: &Fingerprint, status: TaskStatus) -> Result<(), StoreError>;

    /// Lee el registro. Si es terminal se borra en la misma sección crítica
    /// (lectura de un solo uso); si está en `Processing` queda intacto.
    fn consume(&self, fp: &Fingerprint) -> Result<Option<TaskRecord>, StoreError>;

    /// Borra registros terminales nunca reclamados, más viejos que `max_age`.
    fn sweep(&self, max_age: Duration) -> Result<usize, StoreError>;
}

/// Corre `op` en el pool bloqueante de tokio: `FileTaskStore` hace I/O de
/// disco bajo un mutex de std y no debe frenar los hilos del runtime.
pub async fn blocking<T, F>(store: &Arc<dyn TaskStore>, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn TaskStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
}

/// Locks repartidos por hash del fingerprint.
struct Shards<T> {
    shards: Vec<Mutex<T>>,
}

impl<T: Default> Shards<T> {
    fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(T::default())).collect(),
        }
    }

    fn lock(&self, key: &str) -> Result<MutexGuard<'_, T>, StoreError> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[idx].lock().map_err(|_| StoreError::Poisoned)
    }
}

/* ---------------- memoria ---------------- */

struct MemEntry {
    status: TaskStatus,
    output: String,
    updated_at: Instant,
}

/// Almacén en memoria: se pierde al reiniciar.
pub struct MemoryTaskStore {
    shards: Shards<HashMap<String, MemEntry>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            shards: Shards::new(),
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore for MemoryTaskStore {
    fn begin(&self, fp: &Fingerprint) -> Result<bool, StoreError> {
        let mut map = self.shards.lock(fp.as_str())?;
        if let Some(entry) = map.get(fp.as_str()) {
            if entry.status == TaskStatus::Processing {
                return Ok(false);
            }
        }
        map.insert(
            fp.as_str().to_string(),
            MemEntry {
                status: TaskStatus::Processing,
                output: String::new(),
                updated_at: Instant::now(),
            },
        );
        Ok(true)
    }

    fn append(&self, fp: &Fingerprint, chunk: &str) -> Result<(), StoreError> {
        let mut map = self.shards.lock(fp.as_str())?;
        let entry = map
            .get_mut(fp.as_str())
            .ok_or_else(|| StoreError::Missing(fp.to_string()))?;
        if entry.status.is_terminal() {
            return Err(StoreError::Finalized(fp.to_string()));
        }
        entry.output.push_str(chunk);
        Ok(())
    }

    fn finish(&self, fp: &Fingerprint, status: TaskStatus) -> Result<(), StoreError> {
        let mut map = self.shards.lock(fp.as_str())?;
        let entry = map
            .get_mut(fp.as_str())
            .ok_or_else(|| StoreError::Missing(fp.to_string()))?;
        if entry.status.is_terminal() {
            return Err(StoreError::Finalized(fp.to_string()));
        }
        entry.status = status;
        entry.updated_at = Instant::now();
        Ok(())
    }

    fn consume(&self, fp: &Fingerprint) -> Result<Option<TaskRecord>, StoreError> {
        let mut map = self.shards.lock(fp.as_str())?;
        let Some(entry) = map.get(fp.as_str()) else {
            return Ok(None);
        };
        let record = TaskRecord {
            fingerprint: fp.clone(),
            status: entry.status,
            output: entry.output.clone(),
        };
        if record.status.is_terminal() {
            map.remove(fp.as_str());
        }
        Ok(Some(record))
    }

    fn sweep(&self, max_age: Duration) -> Result<usize, StoreError> {
        let mut removed = 0;
        for shard in &self.shards.shards {
            let mut map = shard.lock().map_err(|_| StoreError::Poisoned)?;
            let before = map.len();
            map.retain(|_, e| !(e.status.is_terminal() && e.updated_at.elapsed() > max_age));
            removed += before - map.len();
        }
        Ok(removed)
    }
}

/* ---------------- archivos ---------------- */

/// Cabecera de un registro en disco (`<fp>.json`); la salida va aparte en
/// `<fp>.out` y sólo se le agregan bytes al final.
#[derive(Debug, Serialize, Deserialize)]
struct RecordMeta {
    status: TaskStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Almacén durable: dos archivos por tarea dentro de `dir`.
pub struct FileTaskStore {
    dir: PathBuf,
    locks: Shards<()>,
}

impl FileTaskStore {
    /// Abre (creando si hace falta) el directorio de tareas.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Shards::new(),
        })
    }

    fn meta_path(&self, fp: &str) -> PathBuf {
        self.dir.join(format!("{fp}.json"))
    }

    fn output_path(&self, fp: &str) -> PathBuf {
        self.dir.join(format!("{fp}.out"))
    }

    fn read_meta(&self, fp: &str) -> Result<Option<RecordMeta>, StoreError> {
        match fs::read(self.meta_path(fp)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(fp.to_string(), e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Escribe la cabecera vía archivo temporal + rename, nunca a medias.
    fn write_meta(&self, fp: &str, meta: &RecordMeta) -> Result<(), StoreError> {
        let tmp = self.dir.join(format!("{fp}.json.tmp"));
        let bytes = serde_json::to_vec(meta)
            .map_err(|e| StoreError::Corrupt(fp.to_string(), e.to_string()))?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.meta_path(fp))?;
        Ok(())
    }

    fn read_output(&self, fp: &str) -> Result<String, StoreError> {
        match fs::read(self.output_path(fp)) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_files(&self, fp: &str) -> Result<(), StoreError> {
        for path in [self.meta_path(fp), self.output_path(fp)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Fingerprints con cabecera en disco.
    fn stored_fingerprints(&self) -> Vec<String> {
        let pattern = format!("{}/*.json", self.dir.display());
        let Ok(paths) = glob(&pattern) else {
            return Vec::new();
        };
        paths
            .flatten()
            .filter_map(|p| fingerprint_of(&p))
            .collect()
    }

    /// Los registros que quedaron en `Processing` de un proceso anterior no
    /// tienen dueño: se cierran como `Error` para que no bloqueen su
    /// fingerprint para siempre.
    pub fn recover_interrupted(&self) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for fp in self.stored_fingerprints() {
            let _guard = self.locks.lock(&fp)?;
            let meta = match self.read_meta(&fp) {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(e) => {
                    warn!("ignorando registro {}: {}", fp, e);
                    continue;
                }
            };
            if meta.status != TaskStatus::Processing {
                continue;
            }
            self.append_raw(&fp, "\nTask interrupted by server restart\n")?;
            self.write_meta(
                &fp,
                &RecordMeta {
                    status: TaskStatus::Error,
                    updated_at: Utc::now(),
                    ..meta
                },
            )?;
            recovered += 1;
        }
        if recovered > 0 {
            info!("{} tareas interrumpidas marcadas como ERROR", recovered);
        }
        Ok(recovered)
    }

    fn append_raw(&self, fp: &str, chunk: &str) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.output_path(fp))?;
        file.write_all(chunk.as_bytes())?;
        Ok(())
    }
}

fn fingerprint_of(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

impl TaskStore for FileTaskStore {
    fn begin(&self, fp: &Fingerprint) -> Result<bool, StoreError> {
        let key = fp.as_str();
        let _guard = self.locks.lock(key)?;

        if let Some(meta) = self.read_meta(key)? {
            if meta.status == TaskStatus::Processing {
                return Ok(false);
            }
        }

        // Salida vacía primero, cabecera después.
        fs::write(self.output_path(key), b"")?;
        let now = Utc::now();
        self.write_meta(
            key,
            &RecordMeta {
                status: TaskStatus::Processing,
                created_at: now,
                updated_at: now,
            },
        )?;
        Ok(true)
    }

    fn append(&self, fp: &Fingerprint, chunk: &str) -> Result<(), StoreError> {
        let key = fp.as_str();
        let _guard = self.locks.lock(key)?;
        match self.read_meta(key)? {
            None => Err(StoreError::Missing(key.to_string())),
            Some(meta) if meta.status.is_terminal() => Err(StoreError::Finalized(key.to_string())),
            Some(_) => self.append_raw(key, chunk),
        }
    }

    fn finish(&self, fp: &Fingerprint, status: TaskStatus) -> Result<(), StoreError> {
        let key = fp.as_str();
        let _guard = self.locks.lock(key)?;
        let meta = self
            .read_meta(key)?
            .ok_or_else(|| StoreError::Missing(key.to_string()))?;
        if meta.status.is_terminal() {
            return Err(StoreError::Finalized(key.to_string()));
        }
        self.write_meta(
            key,
            &RecordMeta {
                status,
                updated_at: Utc::now(),
                ..meta
            },
        )
    }

    fn consume(&self, fp: &Fingerprint) -> Result<Option<TaskRecord>, StoreError> {
        let key = fp.as_str();
        let _guard = self.locks.lock(key)?;
        let Some(meta) = self.read_meta(key)? else {
            return Ok(None);
        };
        let record = TaskRecord {
            fingerprint: fp.clone(),
            status: meta.status,
            output: self.read_output(key)?,
        };
        if record.status.is_terminal() {
            self.remove_files(key)?;
        }
        Ok(Some(record))
    }

    fn sweep(&self, max_age: Duration) -> Result<usize, StoreError> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut removed = 0;
        for fp in self.stored_fingerprints() {
            let _guard = self.locks.lock(&fp)?;
            match self.read_meta(&fp) {
                Ok(Some(meta)) if meta.status.is_terminal() && meta.updated_at < cutoff => {
                    self.remove_files(&fp)?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("ignorando registro {}: {}", fp, e),
            }
        }
        Ok(removed)
    }
}
