use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resultado de consultar el control de admisión.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub count: u64,
    pub reason: Option<String>,
}

impl AdmissionDecision {
    pub fn allow(count: u64) -> Self {
        Self {
            allowed: true,
            count,
            reason: None,
        }
    }

    pub fn deny(count: u64, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            count,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedSource {
    pub source: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    /// `None` en bloqueos permanentes.
    pub expires_at: Option<DateTime<Utc>>,
    pub permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub source: String,
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub source: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default, rename = "durationHours", alias = "duration_hours")]
    pub duration_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnblockRequest {
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnblockResponse {
    pub success: bool,
    pub unblocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedList {
    pub success: bool,
    pub blocked: Vec<BlockedSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub success: bool,
    pub requests: Vec<RequestLogEntry>,
}
