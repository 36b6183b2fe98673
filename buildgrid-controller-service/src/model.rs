use buildgrid_common::model::{
    BuildId, BuildStatus, LogSeverity, Platform, TokenSecret, WorkerCapabilities, WorkerId,
    WorkerStatus,
};
use chrono::{DateTime, Utc};
use poem_openapi::Object;
use serde::{Deserialize, Serialize};

/// One build job as the controller sees it. The authoritative copy lives in
/// the store; this is the decoded row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    pub id: BuildId,
    pub platform: Platform,
    pub status: BuildStatus,
    pub worker_id: Option<WorkerId>,
    pub submitted_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub source_path: String,
    pub credentials_path: Option<String>,
    pub result_path: Option<String>,
    pub failure_reason: Option<String>,
    pub access_token: TokenSecret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    pub session_token: TokenSecret,
    pub session_expires_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub completed_builds: u64,
    pub failed_builds: u64,
    pub created_at: DateTime<Utc>,
    pub shutdown_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLogEntry {
    pub build_id: BuildId,
    pub severity: LogSeverity,
    pub message: String,
    pub inserted_at: DateTime<Utc>,
}

/// The credential the gateway extracted for submitter-facing build routes.
#[derive(Debug, Clone)]
pub enum SubmitterAuth {
    AdminKey(String),
    BuildToken(TokenSecret),
}

// ------------------------------------------------------------------------
// API DTOs. All timestamps are RFC 3339 strings.
// ------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct BuildSubmitQuery {
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct BuildCreatedResponse {
    pub id: BuildId,
    pub status: BuildStatus,
    pub build_token: TokenSecret,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct BuildStatusResponse {
    pub id: BuildId,
    pub platform: Platform,
    pub status: BuildStatus,
    pub worker_id: Option<WorkerId>,
    pub submitted_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
    pub has_result: bool,
}

impl From<&Build> for BuildStatusResponse {
    fn from(build: &Build) -> Self {
        Self {
            id: build.id,
            platform: build.platform,
            status: build.status,
            worker_id: build.worker_id,
            submitted_at: build.submitted_at,
            assigned_at: build.assigned_at,
            started_at: build.started_at,
            completed_at: build.completed_at,
            failure: build.failure_reason.clone(),
            has_result: build.result_path.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct BuildLogEntryView {
    pub severity: LogSeverity,
    pub message: String,
    pub inserted_at: DateTime<Utc>,
}

impl From<&BuildLogEntry> for BuildLogEntryView {
    fn from(entry: &BuildLogEntry) -> Self {
        Self {
            severity: entry.severity,
            message: entry.message.clone(),
            inserted_at: entry.inserted_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct WorkerRegistrationRequest {
    pub name: String,
    pub capabilities: WorkerCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct WorkerRegisteredResponse {
    pub worker_id: WorkerId,
    pub session_token: TokenSecret,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct JobAssignment {
    pub build_id: BuildId,
    pub platform: Platform,
    pub source_handle: String,
    pub bootstrap_otp: TokenSecret,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct PollResponse {
    pub session_token: TokenSecret,
    pub job: Option<JobAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct WorkerResultQuery {
    pub build_id: BuildId,
    pub success: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct OutcomeResponse {
    pub build_id: BuildId,
    pub status: BuildStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct WorkerView {
    pub worker_id: WorkerId,
    pub name: String,
    pub status: WorkerStatus,
    pub capabilities: WorkerCapabilities,
    pub last_seen: DateTime<Utc>,
    pub completed_builds: u64,
    pub failed_builds: u64,
    pub created_at: DateTime<Utc>,
    pub shutdown_at: Option<DateTime<Utc>>,
}

impl From<&Worker> for WorkerView {
    fn from(worker: &Worker) -> Self {
        Self {
            worker_id: worker.id,
            name: worker.name.clone(),
            status: worker.status,
            capabilities: worker.capabilities.clone(),
            last_seen: worker.last_seen,
            completed_builds: worker.completed_builds,
            failed_builds: worker.failed_builds,
            created_at: worker.created_at,
            shutdown_at: worker.shutdown_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct UnregisterResponse {
    pub worker_id: WorkerId,
    pub released_builds: Vec<BuildId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct GuestTokenResponse {
    pub guest_token: TokenSecret,
    pub expires_at: DateTime<Utc>,
}

/// The decoded credential bundle handed to the guest environment. The guest
/// never sees the archive layout, only these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct SecureCredentialsResponse {
    /// base64 encoded signing key bytes
    pub key: String,
    pub password: String,
    /// base64 encoded provisioning profiles
    pub profiles: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: u64,
    pub active: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct WorkerCounts {
    pub idle: u64,
    pub building: u64,
    pub offline: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct HealthcheckResponse {
    pub status: String,
    pub queue: QueueCounts,
    pub workers: WorkerCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
}

/// The handle a worker uses to tell the guest where to fetch the source
/// bundle from.
pub fn source_handle(build_id: &BuildId) -> String {
    format!("/v1/builds/{build_id}/source")
}
