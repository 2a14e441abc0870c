//! Catálogo de scripts: archivos `data_<lang>.json` en `DATA_DIR`, cada uno
//! un arreglo de objetos con al menos `script_name`.

use glob::glob;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Data file not found")]
    DataFileNotFound,

    #[error("Script with script_name \"{0}\" not found")]
    ScriptNotFound(String),

    #[error("Invalid JSON format in data file: {0}")]
    InvalidJson(String),

    #[error("I/O error reading data file: {0}")]
    Io(#[from] io::Error),
}

pub struct Catalog {
    data_dir: PathBuf,
    default_lang: String,
}

impl Catalog {
    pub fn new(data_dir: impl Into<PathBuf>, default_lang: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            default_lang: default_lang.into(),
        }
    }

    /// Archivo del idioma pedido, o el del idioma por defecto si no existe.
    fn data_file(&self, lang: Option<&str>) -> PathBuf {
        let wanted = lang
            .filter(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(&self.default_lang);
        let path = self.data_dir.join(format!("data_{wanted}.json"));
        if path.exists() {
            return path;
        }
        self.data_dir.join(format!("data_{}.json", self.default_lang))
    }

    pub fn list(&self, lang: Option<&str>) -> Result<Vec<Value>, CatalogError> {
        load(&self.data_file(lang))
    }

    pub fn get(&self, name: &str, lang: Option<&str>) -> Result<Value, CatalogError> {
        self.list(lang)?
            .into_iter()
            .find(|s| s.get("script_name").and_then(Value::as_str) == Some(name))
            .ok_or_else(|| CatalogError::ScriptNotFound(name.to_string()))
    }

    /// Idiomas con archivo de datos presente.
    pub fn languages(&self) -> Vec<String> {
        let pattern = format!("{}/data_*.json", self.data_dir.display());
        let Ok(paths) = glob(&pattern) else {
            return Vec::new();
        };
        let mut langs: Vec<String> = paths
            .flatten()
            .filter_map(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.strip_prefix("data_"))
                    .map(|s| s.to_string())
            })
            .collect();
        langs.sort();
        langs
    }
}

fn load(path: &Path) -> Result<Vec<Value>, CatalogError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CatalogError::DataFileNotFound),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(|e| CatalogError::InvalidJson(e.to_string()))
}
