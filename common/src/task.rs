use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identidad de un trabajo: digest SHA-256 (hex) de la tupla completa
/// (script, host, credencial, extra). No hay otro id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Calcula el fingerprint de una tupla.
    ///
    /// Cada campo va prefijado con su longitud, así ("ab", "c") y ("a", "bc")
    /// nunca producen el mismo digest.
    pub fn compute(script: &str, host: &str, credential: &str, extra: &str) -> Self {
        let mut hasher = Sha256::new();
        for field in [script, host, credential, extra] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    /// Acepta sólo 64 caracteres hex en minúscula.
    pub fn parse(raw: &str) -> Option<Self> {
        let ok = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        ok.then(|| Fingerprint(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    /// Completed y Error son finales: no hay transición de salida.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Processing)
    }
}

/// Estado durable de un trabajo: status + salida acumulada.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub fingerprint: Fingerprint,
    pub status: TaskStatus,
    pub output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismo_input_mismo_fingerprint() {
        let a = Fingerprint::compute("demo", "10.0.0.5", "x", "");
        let b = Fingerprint::compute("demo", "10.0.0.5", "x", "");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn cualquier_campo_distinto_cambia_el_fingerprint() {
        let base = Fingerprint::compute("demo", "10.0.0.5", "x", "extra");
        assert_ne!(base, Fingerprint::compute("demo2", "10.0.0.5", "x", "extra"));
        assert_ne!(base, Fingerprint::compute("demo", "10.0.0.6", "x", "extra"));
        assert_ne!(base, Fingerprint::compute("demo", "10.0.0.5", "y", "extra"));
        assert_ne!(base, Fingerprint::compute("demo", "10.0.0.5", "x", "other"));
    }

    #[test]
    fn los_limites_entre_campos_importan() {
        let a = Fingerprint::compute("ab", "c", "", "");
        let b = Fingerprint::compute("a", "bc", "", "");
        assert_ne!(a, b);
    }

    #[test]
    fn parse_valida_formato() {
        let fp = Fingerprint::compute("demo", "10.0.0.5", "x", "");
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp));
        assert!(Fingerprint::parse("invalid-task-id").is_none());
        assert!(Fingerprint::parse(&"A".repeat(64)).is_none());
        assert!(Fingerprint::parse("").is_none());
    }

    #[test]
    fn status_terminales() {
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
    }

    #[test]
    fn status_se_serializa_en_mayusculas() {
        let s = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(s, "\"PROCESSING\"");
    }
}
