pub mod admission;
pub mod job;
pub mod sanitize;
pub mod shell;
pub mod task;

pub use admission::{
    AdmissionDecision, BlockRequest, BlockedList, BlockedSource, RequestLogEntry,
    StatsResponse, UnblockRequest, UnblockResponse,
};
pub use job::{JobAccepted, JobRequest, JobSpec, JobStatusResponse};
pub use sanitize::sanitize;
pub use task::{Fingerprint, TaskRecord, TaskStatus};

/// Respuesta genérica de error de la API.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}
