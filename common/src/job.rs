use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::task::{Fingerprint, TaskStatus};

/// Cuerpo de `POST /api/v1/jobs`.
///
/// Los campos son opcionales para poder responder con la lista de los que
/// faltan en vez de un error genérico de deserialización.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(alias = "script_name")]
    pub script: Option<String>,
    #[serde(alias = "server_ip")]
    pub host: Option<String>,
    #[serde(alias = "server_root_password")]
    pub credential: Option<String>,
    #[serde(default, alias = "additional", skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

/// Petición ya validada, lista para el orquestador.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub script: String,
    pub host: String,
    pub credential: String,
    pub extra: String,
}

impl JobSpec {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.script, &self.host, &self.credential, &self.extra)
    }
}

impl JobRequest {
    /// Valida campos obligatorios, nombre de script y host.
    pub fn validate(self) -> Result<JobSpec, String> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());

        let missing: Vec<&str> = [
            ("script", present(&self.script)),
            ("host", present(&self.host)),
            ("credential", present(&self.credential)),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(format!("Missing required fields: {}", missing.join(", ")));
        }

        let script = self.script.unwrap_or_default();
        let host = self.host.unwrap_or_default();

        if !is_valid_script_name(&script) {
            return Err("Invalid script_name format".to_string());
        }
        if !is_valid_host(&host) {
            return Err("Invalid server_ip format".to_string());
        }

        Ok(JobSpec {
            script,
            host,
            credential: self.credential.unwrap_or_default(),
            extra: self.extra.unwrap_or_default().trim().to_string(),
        })
    }
}

/// Sólo alfanuméricos, guion y guion bajo.
pub fn is_valid_script_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// IPv4 o IPv6 literal.
pub fn is_valid_host(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAccepted {
    pub success: bool,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub success: bool,
    pub fingerprint: Fingerprint,
    pub status: TaskStatus,
    pub output: String,
}
