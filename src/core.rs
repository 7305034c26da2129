// src/core.rs
//
// =============================================================================
// CAMPUSGRID: CORE SCHEMA AUTHORITY (v 0.1 )
// =============================================================================
//
// The shared vocabulary of the grid.
// This file defines the strict data contracts between the Manager, the
// Workers, and the persistence layer.
//
// Design Principles:
// 1. One source of truth: every entity that crosses a process boundary
//    (wire or database) is declared here.
// 2. Epoch-millisecond timestamps everywhere (i64), never naive datetimes.
// 3. Status enums with explicit text mappings so the database stays
//    readable with plain sqlite3.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current wall time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// 1. USERS & ROLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Grid administrator.
    Coordinator,
    /// Owns worker machines, earns credits.
    Worker,
    /// Submits jobs, spends credits.
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Worker => "worker",
            Role::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "coordinator" => Some(Role::Coordinator),
            "worker" => Some(Role::Worker),
            "user" => Some(Role::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    /// SHA-256 hex digest. Never the cleartext.
    pub password_hash: String,
    pub email: Option<String>,
    pub role: Role,
    /// Invariant: always equals the sum of this user's transaction amounts.
    pub credits: i64,
    pub created_at_ms: i64,
    pub last_login_ms: Option<i64>,
}

// ============================================================================
// 2. WORKERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Offline,
    Online,
    Busy,
    /// Excluded from dispatch until resumed. Survives reconnects.
    Paused,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Offline => "offline",
            WorkerStatus::Online => "online",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offline" => Some(WorkerStatus::Offline),
            "online" => Some(WorkerStatus::Online),
            "busy" => Some(WorkerStatus::Busy),
            "paused" => Some(WorkerStatus::Paused),
            _ => None,
        }
    }
}

/// Hardware capabilities reported once at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpecs {
    pub cpu_cores: u32,
    pub cpu_model: String,
    pub ram_gb: f64,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub gpu_memory_gb: Option<f64>,
    #[serde(default)]
    pub has_docker: bool,
}

impl Default for WorkerSpecs {
    /// Documented fallbacks when probing fails entirely.
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            cpu_model: "Unknown".into(),
            ram_gb: 4.0,
            gpu_name: None,
            gpu_memory_gb: None,
            has_docker: false,
        }
    }
}

/// The durable worker row. Liveness (`online`/`busy`) is authoritative only
/// while the manager holds a live session; `offline`/`paused` persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Option<Uuid>,
    pub status: WorkerStatus,
    pub specs: WorkerSpecs,
    pub last_heartbeat_ms: Option<i64>,
    pub jobs_completed: i64,
    pub credits_earned: i64,
    pub created_at_ms: i64,
}

// ============================================================================
// 3. JOBS & THE QUEUE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Terminal jobs are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub title: String,
    pub submitter_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub status: JobStatus,
    /// 1..=10, higher dispatches first.
    pub priority: u8,
    pub code: String,
    pub requirements: Option<String>,
    pub cpu_required: u32,
    pub ram_required_gb: f64,
    pub gpu_required: bool,
    pub timeout_seconds: u64,
    pub credit_cost: i64,
    pub credit_reward: i64,
    pub result_output: Option<String>,
    pub error_log: Option<String>,
    /// Times this job has been returned to the queue after its worker died.
    pub requeue_count: u32,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

/// What a submitter provides. Everything else (id, cost, timestamps) is
/// derived at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub title: String,
    pub code: String,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default = "JobRequest::default_cpu")]
    pub cpu_required: u32,
    #[serde(default = "JobRequest::default_ram")]
    pub ram_required_gb: f64,
    #[serde(default)]
    pub gpu_required: bool,
    #[serde(default = "JobRequest::default_priority")]
    pub priority: u8,
    #[serde(default = "JobRequest::default_timeout")]
    pub timeout_seconds: u64,
}

impl JobRequest {
    fn default_cpu() -> u32 {
        1
    }
    fn default_ram() -> f64 {
        1.0
    }
    fn default_priority() -> u8 {
        5
    }
    fn default_timeout() -> u64 {
        300
    }

    pub fn new(title: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            code: code.into(),
            requirements: None,
            cpu_required: Self::default_cpu(),
            ram_required_gb: Self::default_ram(),
            gpu_required: false,
            priority: Self::default_priority(),
            timeout_seconds: Self::default_timeout(),
        }
    }
}

// ============================================================================
// 4. CREDITS & AUDIT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Debit at submission.
    JobSubmitted,
    /// Credit to the worker owner on success.
    JobCompleted,
    /// Reserved: returned credits. Current policy never refunds.
    JobRefunded,
    /// Starting balance and manual top-ups.
    AdminGrant,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::JobSubmitted => "job_submitted",
            TransactionKind::JobCompleted => "job_completed",
            TransactionKind::JobRefunded => "job_refunded",
            TransactionKind::AdminGrant => "admin_grant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "job_submitted" => Some(TransactionKind::JobSubmitted),
            "job_completed" => Some(TransactionKind::JobCompleted),
            "job_refunded" => Some(TransactionKind::JobRefunded),
            "admin_grant" => Some(TransactionKind::AdminGrant),
            _ => None,
        }
    }
}

/// Append-only. The user's balance is the sum of these rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: i64,
    pub user_id: Uuid,
    pub amount: i64,
    pub kind: TransactionKind,
    pub job_id: Option<Uuid>,
    pub description: String,
    pub created_at_ms: i64,
}

/// Append-only audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: i64,
    pub event_type: String,
    pub actor_id: Option<Uuid>,
    pub details: String,
    pub created_at_ms: i64,
}

// ============================================================================
// 5. VIEW MODELS (Dashboard-facing)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub queue_depth: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub username: String,
    pub credits_earned: i64,
    pub jobs_completed: i64,
}

// ============================================================================
// 6. JOB ARTIFACTS
// ============================================================================

/// A file produced by a job, carried over the wire base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    pub size: u64,
    /// Base64 of the raw bytes. Capped at 10 MiB pre-encoding by the sandbox.
    pub content: String,
}

// ============================================================================
// 7. COST MODEL
// ============================================================================

/// Pure pricing rule for a job submission.
///
/// `5 + 2*cpu + floor(ram) + 10*gpu + floor(timeout/60)`, clamped below by
/// `min_cost`. The reward paid to the worker owner equals the cost.
pub fn job_cost(cpu: u32, ram_gb: f64, gpu: bool, timeout_seconds: u64, min_cost: i64) -> i64 {
    let base = 5_i64
        + 2 * cpu as i64
        + ram_gb.floor() as i64
        + if gpu { 10 } else { 0 }
        + (timeout_seconds / 60) as i64;
    base.max(min_cost)
}
