// src/sandbox.rs
//
// =============================================================================
// CAMPUSGRID: SANDBOX EXECUTOR (v 0.1 )
// =============================================================================
//
// Where untrusted job code actually runs.
//
// Two isolation levels behind one trait:
// 1. Container mode — a throwaway container with memory/CPU/pid caps and
//    networking disabled. Preferred whenever a runtime is usable.
// 2. Restricted mode — a subprocess in a scratch directory with a helper
//    header and a hard timeout. Fallback for machines without a runtime.
//
// Either way the job gets an OUTPUT_DIR to drop artifacts into; artifacts
// are swept, size-capped, and returned base64-encoded.

use crate::config::SandboxConfig;
use crate::core::OutputFile;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use uuid::Uuid;

/// Output files above this size are dropped with a warning.
const MAX_OUTPUT_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Cap for installing a single requirement in restricted mode.
const PIP_INSTALL_TIMEOUT: Duration = Duration::from_secs(60);

const CONTAINER_PIDS_LIMIT: u32 = 200;

// ============================================================================
// 1. OUTCOME
// ============================================================================

/// What a job run produced. `execute` never fails as a function call; every
/// internal error is folded into `success = false` with `error` set and
/// whatever stdout was captured preserved.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub files: Vec<OutputFile>,
}

impl ExecutionOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            files: Vec::new(),
        }
    }
}

// ============================================================================
// 2. WORKSPACE (Scoped Scratch Directory)
// ============================================================================

/// Per-job scratch area with a dedicated output subdirectory. Removed on
/// drop so every exit path, including panics, cleans up.
struct Workspace {
    root: PathBuf,
    output: PathBuf,
}

impl Workspace {
    fn create() -> Result<Self> {
        let root = std::env::temp_dir().join(format!("cgrid_job_{}", Uuid::new_v4()));
        let output = root.join("output");
        std::fs::create_dir_all(&output).context("Failed to create job workspace")?;
        Ok(Self { root, output })
    }

    fn script_path(&self) -> PathBuf {
        self.root.join("job.py")
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            log::warn!("Failed to remove workspace {:?}: {}", self.root, e);
        }
    }
}

// ============================================================================
// 3. THE RUNNER TRAIT (The Contract)
// ============================================================================

#[async_trait]
trait JobRunner: Send + Sync {
    /// Run the job script inside the prepared workspace, respecting the
    /// wall-clock timeout. Implementations return Err only for setup
    /// failures; job-level failures are encoded in the outcome.
    async fn run(
        &self,
        code: &str,
        requirements: Option<&str>,
        time_limit: Duration,
        workspace: &Workspace,
    ) -> Result<ExecutionOutcome>;
}

// ============================================================================
// 4. CONTAINER MODE
// ============================================================================

struct ContainerRunner {
    image: String,
    memory_limit: String,
}

#[async_trait]
impl JobRunner for ContainerRunner {
    async fn run(
        &self,
        code: &str,
        requirements: Option<&str>,
        time_limit: Duration,
        workspace: &Workspace,
    ) -> Result<ExecutionOutcome> {
        std::fs::write(workspace.script_path(), code).context("Failed to write job script")?;

        let run_cmd = match requirements {
            Some(reqs) if !reqs.trim().is_empty() => {
                std::fs::write(workspace.root.join("requirements.txt"), reqs)
                    .context("Failed to write requirements.txt")?;
                "pip install -q -r /app/requirements.txt && python /app/job.py"
            }
            _ => "python /app/job.py",
        };

        // The workspace directory name doubles as the container name so the
        // timeout path can kill it from outside.
        let container_name = workspace
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "cgrid_job".into());

        let app_mount = format!("{}:/app", workspace.root.display());
        let output_mount = format!("{}:/output", workspace.output.display());
        let pids_limit = CONTAINER_PIDS_LIMIT.to_string();

        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .args(["--name", container_name.as_str()])
            .arg("--rm")
            .args(["-v", app_mount.as_str()])
            .args(["-v", output_mount.as_str()])
            .args(["-w", "/app"])
            .args(["-e", "OUTPUT_DIR=/output"])
            .args(["-e", "PYTHONUNBUFFERED=1"])
            .args(["--memory", self.memory_limit.as_str()])
            .args(["--cpu-period", "100000"])
            .args(["--cpu-quota", "100000"])
            .args(["--pids-limit", pids_limit.as_str()])
            .args(["--network", "none"])
            .arg(&self.image)
            .args(["sh", "-c", run_cmd])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::info!("Starting container {} ({})", container_name, self.image);

        let result = timeout(time_limit, cmd.output()).await;

        let output = match result {
            Ok(io) => io.context("Failed to run container runtime")?,
            Err(_) => {
                kill_container(&container_name).await;
                return Ok(ExecutionOutcome::failure(format!(
                    "Job timed out after {} seconds",
                    time_limit.as_secs()
                )));
            }
        };

        // Container logs arrive combined: stdout first, then stderr.
        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));

        let exit_code = output.status.code().unwrap_or(-1);
        let files = collect_output_files(&workspace.output, &[]);

        Ok(ExecutionOutcome {
            success: exit_code == 0,
            output: logs,
            error: (exit_code != 0).then(|| format!("Exit code: {}", exit_code)),
            files,
        })
    }
}

/// Best-effort teardown of a container that outlived its welcome.
async fn kill_container(name: &str) {
    let _ = Command::new("docker")
        .args(["kill", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    let _ = Command::new("docker")
        .args(["rm", "-f", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

// ============================================================================
// 5. RESTRICTED MODE (Fallback)
// ============================================================================

struct RestrictedRunner;

impl RestrictedRunner {
    /// Prefix prepended to user code: points OUTPUT_DIR at the workspace
    /// and defines the two save helpers the job docs promise.
    fn wrapper_header(output_dir: &Path) -> String {
        // A JSON string literal is also a valid Python string literal,
        // which keeps exotic temp paths safe to embed.
        let dir_literal = serde_json::to_string(&output_dir.to_string_lossy())
            .unwrap_or_else(|_| "\"output\"".into());

        format!(
            r#"import os

OUTPUT_DIR = {dir_literal}
os.makedirs(OUTPUT_DIR, exist_ok=True)

def save_output(filename, content):
    path = os.path.join(OUTPUT_DIR, filename)
    with open(path, "w") as f:
        f.write(content)
    print("[OUTPUT] Saved: " + filename)
    return path

def save_binary(filename, content):
    path = os.path.join(OUTPUT_DIR, filename)
    with open(path, "wb") as f:
        f.write(content)
    print("[OUTPUT] Saved binary: " + filename)
    return path

# ============ USER CODE BELOW ============

"#
        )
    }

    async fn install_requirements(&self, requirements: &str) {
        for req in requirements.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut pip = Command::new("python3");
            pip.args(["-m", "pip", "install", "-q", req])
                .stdout(Stdio::null())
                .stderr(Stdio::null());

            match timeout(PIP_INSTALL_TIMEOUT, pip.status()).await {
                Ok(Ok(status)) if status.success() => log::info!("Installed: {}", req),
                Ok(Ok(status)) => log::warn!("pip install {} exited with {}", req, status),
                Ok(Err(e)) => log::warn!("pip install {} failed to spawn: {}", req, e),
                Err(_) => log::warn!("pip install {} timed out", req),
            }
        }
    }
}

#[async_trait]
impl JobRunner for RestrictedRunner {
    async fn run(
        &self,
        code: &str,
        requirements: Option<&str>,
        time_limit: Duration,
        workspace: &Workspace,
    ) -> Result<ExecutionOutcome> {
        if let Some(reqs) = requirements {
            self.install_requirements(reqs).await;
        }

        let script = format!("{}{}\n", Self::wrapper_header(&workspace.output), code);
        std::fs::write(workspace.script_path(), script).context("Failed to write job script")?;

        let mut cmd = Command::new("python3");
        cmd.arg(workspace.script_path())
            .current_dir(&workspace.root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(time_limit, cmd.output()).await {
            Ok(io) => io.context("Failed to spawn job interpreter")?,
            Err(_) => {
                return Ok(ExecutionOutcome::failure(format!(
                    "Job timed out after {} seconds",
                    time_limit.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        let mut full_output = stdout;
        if !stderr.is_empty() {
            full_output.push_str("\n[STDERR]\n");
            full_output.push_str(&stderr);
        }

        // Artifacts can land in OUTPUT_DIR or beside the script.
        let mut files = collect_output_files(&workspace.output, &[]);
        files.extend(collect_output_files(&workspace.root, &["job.py", "output"]));

        let success = output.status.success();
        Ok(ExecutionOutcome {
            success,
            output: full_output,
            error: (!success).then_some(stderr),
            files,
        })
    }
}

// ============================================================================
// 6. FILE COLLECTION
// ============================================================================

/// Sweep a directory for artifacts: regular files only, oversize skipped
/// with a warning, contents base64-encoded for the wire.
pub fn collect_output_files(dir: &Path, exclude: &[&str]) -> Vec<OutputFile> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();

    let mut files = Vec::new();
    for path in paths {
        let Some(filename) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if exclude.contains(&filename.as_str()) {
            continue;
        }

        let Ok(meta) = path.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        if meta.len() > MAX_OUTPUT_FILE_BYTES {
            log::warn!(
                "Output file too large, skipping: {} ({} bytes)",
                filename,
                meta.len()
            );
            continue;
        }

        match std::fs::read(&path) {
            Ok(bytes) => {
                log::info!("Collected artifact: {} ({} bytes)", filename, bytes.len());
                files.push(OutputFile {
                    filename,
                    size: meta.len(),
                    content: BASE64.encode(&bytes),
                });
            }
            Err(e) => log::warn!("Failed to read artifact {}: {}", filename, e),
        }
    }
    files
}

// ============================================================================
// 7. THE EXECUTOR (Mode Selection)
// ============================================================================

pub struct SandboxExecutor {
    runner: Box<dyn JobRunner>,
    container_mode: bool,
}

impl SandboxExecutor {
    /// Pick the strongest isolation the host supports. Container mode needs
    /// both the config preference and a live runtime.
    pub fn new(cfg: &SandboxConfig, runtime_usable: bool) -> Self {
        let container_mode = cfg.use_container && runtime_usable;
        let runner: Box<dyn JobRunner> = if container_mode {
            log::info!("Container sandbox enabled ({})", cfg.image);
            Box::new(ContainerRunner {
                image: cfg.image.clone(),
                memory_limit: cfg.memory_limit.clone(),
            })
        } else {
            log::info!("Running in restricted mode (no container runtime)");
            Box::new(RestrictedRunner)
        };

        Self {
            runner,
            container_mode,
        }
    }

    pub fn container_mode(&self) -> bool {
        self.container_mode
    }

    /// Execute one job. Infallible at the call site: setup errors become a
    /// failed outcome, and the scratch directory is removed on every path.
    pub async fn execute(
        &self,
        code: &str,
        requirements: Option<&str>,
        time_limit: Duration,
    ) -> ExecutionOutcome {
        let workspace = match Workspace::create() {
            Ok(w) => w,
            Err(e) => return ExecutionOutcome::failure(format!("Workspace setup failed: {e:#}")),
        };

        match self
            .runner
            .run(code, requirements, time_limit, &workspace)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::failure(format!("{e:#}")),
        }
    }
}
