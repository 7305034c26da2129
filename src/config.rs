// src/config.rs
//
// =============================================================================
// CAMPUSGRID: CONFIGURATION (v 0.1 )
// =============================================================================
//
// Recognized options for both halves of the grid, with environment-variable
// fallbacks so deployments can be wired without flags:
//
//   MANAGER_HOST / MANAGER_PORT   where workers connect
//   SERVER_HOST / SERVER_PORT     where the manager listens
//   WORKER_NAME / OWNER_TOKEN     worker identity
//   USE_DOCKER                    prefer the container sandbox ("true"/"false")
//
// CLI flags (src/main.rs) override anything read here.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// 1. MANAGER
// ============================================================================

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Listen address for worker connections.
    pub host: String,
    pub port: u16,
    /// SQLite file backing all durable state.
    pub db_path: PathBuf,
    /// Root for `job_outputs/<job_id>/` artifact directories.
    pub data_dir: PathBuf,
    /// Max silence before a worker is forcibly disconnected.
    pub heartbeat_timeout: Duration,
    /// Cadence of the background liveness sweep.
    pub health_check_interval: Duration,
    /// Per-read socket timeout. Kept well above the worker heartbeat
    /// interval so slow peers are not mistaken for dead ones.
    pub read_timeout: Duration,
    /// Balance granted to newly created users.
    pub starting_credits: i64,
    /// Floor applied by the cost function.
    pub min_job_cost: i64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: env_str("SERVER_HOST", "0.0.0.0"),
            port: env_u16("SERVER_PORT", 9999),
            db_path: PathBuf::from("campus_compute.db"),
            data_dir: PathBuf::from("."),
            heartbeat_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            starting_credits: 100,
            min_job_cost: 5,
        }
    }
}

// ============================================================================
// 2. WORKER
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub manager_host: String,
    pub manager_port: u16,
    /// Human-readable name shown on the dashboard.
    pub name: String,
    /// Username of the credit-earning owner. Empty = unowned.
    pub owner_token: String,
    pub heartbeat_interval: Duration,
    /// Safety cap: job timeouts are clamped to this many seconds.
    pub max_job_timeout: u64,
    /// Sleep between polls when the queue is empty.
    pub idle_poll: Duration,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let default_name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| format!("worker_{}", std::process::id()));

        Self {
            manager_host: env_str("MANAGER_HOST", "localhost"),
            manager_port: env_u16("MANAGER_PORT", 9999),
            name: env_str("WORKER_NAME", &default_name),
            owner_token: env_str("OWNER_TOKEN", ""),
            heartbeat_interval: Duration::from_secs(30),
            max_job_timeout: 600,
            idle_poll: Duration::from_secs(5),
            sandbox: SandboxConfig::default(),
        }
    }
}

// ============================================================================
// 3. SANDBOX
// ============================================================================

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Prefer container isolation when a runtime is usable.
    pub use_container: bool,
    /// Language runtime image for container mode.
    pub image: String,
    /// Container memory cap, docker syntax.
    pub memory_limit: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            use_container: env_str("USE_DOCKER", "true").eq_ignore_ascii_case("true"),
            image: "python:3.11-slim".into(),
            memory_limit: "1g".into(),
        }
    }
}
