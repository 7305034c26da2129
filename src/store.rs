// src/store.rs
//
// =============================================================================
// CAMPUSGRID: PERSISTENT STORE (v 0.1 )
// =============================================================================
//
// The durable heart of the manager.
//
// Architecture:
// - SQLite, one file, WAL journaling for multi-reader concurrency.
// - 30 s busy timeout so competing writers queue instead of failing.
// - A fresh connection per operation; SQLite serializes the write path.
// - The three composite operations (submit / dispatch / complete) each run
//   in a single IMMEDIATE transaction, so racing dispatchers are serialized
//   and a queue row is handed to at most one worker.
//
// Dashboard-facing reads (listings, stats, leaderboard) live here too; the
// web layer calls them and adds no logic of its own.

use crate::core::{
    job_cost, now_ms, ActivityEvent, CreditTransaction, Job, JobRequest, JobStatus,
    LeaderboardRow, QueueStats, Role, TransactionKind, User, WorkerRecord, WorkerSpecs,
    WorkerStatus,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// How often `complete_job` retries when the write lock is contended.
const BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF: Duration = Duration::from_millis(100);

/// A job orphaned by a dying worker goes back to the queue this many times
/// before it is declared failed.
const MAX_JOB_REQUEUES: u32 = 2;

// ============================================================================
// 1. ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("insufficient credits: balance {balance}, cost {cost}")]
    InsufficientCredits { balance: i64, cost: i64 },
    #[error("username '{0}' is already taken")]
    UsernameTaken(String),
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("unknown job {0}")]
    UnknownJob(Uuid),
    #[error("unknown worker {0}")]
    UnknownWorker(Uuid),
    #[error("worker {0} still has a running job")]
    WorkerBusy(Uuid),
    #[error("database busy after {0} retries")]
    Contended(u32),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

fn is_busy(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Db(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

// ============================================================================
// 2. TUNING & CONSTRUCTION
// ============================================================================

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Balance granted (and logged as a transaction) at user creation.
    pub starting_credits: i64,
    /// Floor for the cost function.
    pub min_job_cost: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            starting_credits: 100,
            min_job_cost: 5,
        }
    }
}

pub struct GridStore {
    path: PathBuf,
    opts: StoreOptions,
}

impl GridStore {
    pub fn open(path: impl AsRef<Path>, opts: StoreOptions) -> StoreResult<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            opts,
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=30000;",
        )?;
        Ok(conn)
    }

    fn init(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                email TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                credits INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL,
                last_login_ms INTEGER
            );

            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT,
                status TEXT NOT NULL DEFAULT 'offline',
                cpu_cores INTEGER NOT NULL DEFAULT 1,
                cpu_model TEXT NOT NULL DEFAULT 'Unknown',
                ram_gb REAL NOT NULL DEFAULT 4,
                gpu_name TEXT,
                gpu_memory_gb REAL,
                has_docker INTEGER NOT NULL DEFAULT 0,
                last_heartbeat_ms INTEGER,
                total_jobs_completed INTEGER NOT NULL DEFAULT 0,
                total_credits_earned INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                submitter_id TEXT NOT NULL,
                worker_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 5,
                code TEXT NOT NULL,
                requirements TEXT,
                cpu_required INTEGER NOT NULL DEFAULT 1,
                ram_required_gb REAL NOT NULL DEFAULT 1,
                gpu_required INTEGER NOT NULL DEFAULT 0,
                timeout_seconds INTEGER NOT NULL DEFAULT 300,
                credit_cost INTEGER NOT NULL,
                credit_reward INTEGER NOT NULL,
                result_output TEXT,
                error_log TEXT,
                requeue_count INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL,
                started_at_ms INTEGER,
                completed_at_ms INTEGER
            );

            CREATE TABLE IF NOT EXISTS job_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT UNIQUE NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                queued_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credit_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                transaction_type TEXT NOT NULL,
                job_id TEXT,
                description TEXT NOT NULL DEFAULT '',
                created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                actor_id TEXT,
                details TEXT NOT NULL DEFAULT '',
                created_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_submitter ON jobs(submitter_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_worker ON jobs(worker_id);
            CREATE INDEX IF NOT EXISTS idx_queue_order
                ON job_queue(priority DESC, queued_at_ms ASC);
            CREATE INDEX IF NOT EXISTS idx_tx_user ON credit_transactions(user_id);
            COMMIT;",
        )?;
        Ok(())
    }
}

// ============================================================================
// 3. USERS & CREDITS
// ============================================================================

pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl GridStore {
    /// Create a user with the configured starting balance. The grant is
    /// logged as a transaction so balance == sum(transactions) from row one.
    pub fn create_user(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
        role: Role,
    ) -> StoreResult<User> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: hash_password(password),
            email: email.map(str::to_string),
            role,
            credits: self.opts.starting_credits,
            created_at_ms: now_ms(),
            last_login_ms: None,
        };

        let inserted = tx.execute(
            "INSERT INTO users (id, username, password_hash, email, role, credits, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id.to_string(),
                user.username,
                user.password_hash,
                user.email,
                user.role.as_str(),
                user.credits,
                user.created_at_ms,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::UsernameTaken(username.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        record_transaction(
            &tx,
            user.id,
            self.opts.starting_credits,
            TransactionKind::AdminGrant,
            None,
            "Starting balance",
        )?;
        record_activity(
            &tx,
            "user_registered",
            Some(user.id),
            &format!("User '{}' registered", username),
        )?;

        tx.commit()?;
        Ok(user)
    }

    pub fn get_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("{USER_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                user_from_row,
            )
            .optional()?)
    }

    pub fn get_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("{USER_COLUMNS} WHERE username = ?1"),
                params![username],
                user_from_row,
            )
            .optional()?)
    }

    /// Password check for the dashboard login path. Stamps last_login on
    /// success.
    pub fn authenticate(&self, username: &str, password: &str) -> StoreResult<Option<User>> {
        let Some(mut user) = self.get_user_by_username(username)? else {
            return Ok(None);
        };
        if user.password_hash != hash_password(password) {
            return Ok(None);
        }
        let now = now_ms();
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET last_login_ms = ?1 WHERE id = ?2",
            params![now, user.id.to_string()],
        )?;
        user.last_login_ms = Some(now);
        Ok(Some(user))
    }

    /// Full audit trail for one user, oldest first. Invariant: the amounts
    /// sum to the user's current balance.
    pub fn transactions_for_user(&self, user_id: Uuid) -> StoreResult<Vec<CreditTransaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, amount, transaction_type, job_id, description, created_at_ms
             FROM credit_transactions WHERE user_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], transaction_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

// ============================================================================
// 4. JOB SUBMISSION
// ============================================================================

impl GridStore {
    /// What a submission with these demands would cost. Pure.
    pub fn calculate_cost(&self, cpu: u32, ram_gb: f64, gpu: bool, timeout_seconds: u64) -> i64 {
        job_cost(cpu, ram_gb, gpu, timeout_seconds, self.opts.min_job_cost)
    }

    /// Atomically: insert the job, enqueue it, debit the submitter, log the
    /// debit. Refused without side effects when credits are short.
    pub fn submit_job(&self, submitter_id: Uuid, req: &JobRequest) -> StoreResult<Job> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let balance: Option<i64> = tx
            .query_row(
                "SELECT credits FROM users WHERE id = ?1",
                params![submitter_id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        let balance = balance.ok_or_else(|| StoreError::UnknownUser(submitter_id.to_string()))?;

        let cost = self.calculate_cost(
            req.cpu_required,
            req.ram_required_gb,
            req.gpu_required,
            req.timeout_seconds,
        );
        if balance < cost {
            return Err(StoreError::InsufficientCredits { balance, cost });
        }

        let now = now_ms();
        let job = Job {
            id: Uuid::new_v4(),
            title: req.title.clone(),
            submitter_id,
            worker_id: None,
            status: JobStatus::Pending,
            priority: req.priority.clamp(1, 10),
            code: req.code.clone(),
            requirements: req.requirements.clone(),
            cpu_required: req.cpu_required,
            ram_required_gb: req.ram_required_gb,
            gpu_required: req.gpu_required,
            timeout_seconds: req.timeout_seconds,
            credit_cost: cost,
            credit_reward: cost,
            result_output: None,
            error_log: None,
            requeue_count: 0,
            created_at_ms: now,
            started_at_ms: None,
            completed_at_ms: None,
        };

        tx.execute(
            "INSERT INTO jobs (id, title, submitter_id, status, priority, code, requirements,
                               cpu_required, ram_required_gb, gpu_required, timeout_seconds,
                               credit_cost, credit_reward, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id.to_string(),
                job.title,
                job.submitter_id.to_string(),
                job.status.as_str(),
                job.priority as i64,
                job.code,
                job.requirements,
                job.cpu_required as i64,
                job.ram_required_gb,
                job.gpu_required,
                job.timeout_seconds as i64,
                job.credit_cost,
                job.credit_reward,
                job.created_at_ms,
            ],
        )?;
        tx.execute(
            "INSERT INTO job_queue (job_id, priority, queued_at_ms) VALUES (?1, ?2, ?3)",
            params![job.id.to_string(), job.priority as i64, now],
        )?;
        tx.execute(
            "UPDATE users SET credits = credits - ?1 WHERE id = ?2",
            params![cost, submitter_id.to_string()],
        )?;
        record_transaction(
            &tx,
            submitter_id,
            -cost,
            TransactionKind::JobSubmitted,
            Some(job.id),
            &format!("Submitted '{}'", job.title),
        )?;
        record_activity(
            &tx,
            "job_submitted",
            Some(submitter_id),
            &format!("Job '{}' ({}) queued for {} credits", job.title, job.id, cost),
        )?;

        tx.commit()?;
        Ok(job)
    }
}

// ============================================================================
// 5. DISPATCH & COMPLETION
// ============================================================================

impl GridStore {
    /// Pick the next queued job this worker can run and hand it over.
    ///
    /// Selection: highest priority first, FIFO within a priority, and only
    /// jobs whose demands fit the worker's registered specs. The select,
    /// the status flip, and the queue-row delete share one IMMEDIATE
    /// transaction, so of N workers racing for the last queue row exactly
    /// one gets it and the rest see an empty queue.
    pub fn dispatch_job(&self, worker_id: Uuid) -> StoreResult<Option<Job>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let worker: Option<(String, i64, f64, Option<String>)> = tx
            .query_row(
                "SELECT status, cpu_cores, ram_gb, gpu_name FROM workers WHERE id = ?1",
                params![worker_id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let (status, cpu_cores, ram_gb, gpu_name) =
            worker.ok_or(StoreError::UnknownWorker(worker_id))?;

        // Paused workers keep their session but are invisible to dispatch.
        if status == WorkerStatus::Paused.as_str() {
            return Ok(None);
        }

        // GPU gate: a job demanding a GPU only matches a worker that owns
        // one, i.e. whose gpu_name is non-null.
        let picked: Option<String> = tx
            .query_row(
                "SELECT j.id FROM jobs j
                 JOIN job_queue q ON q.job_id = j.id
                 WHERE j.status = 'pending'
                   AND j.cpu_required <= ?1
                   AND j.ram_required_gb <= ?2
                   AND (j.gpu_required = 0 OR ?3 IS NOT NULL)
                 ORDER BY q.priority DESC, q.queued_at_ms ASC, q.id ASC
                 LIMIT 1",
                params![cpu_cores, ram_gb, gpu_name],
                |r| r.get(0),
            )
            .optional()?;

        let Some(job_id) = picked else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET status = 'running', worker_id = ?1, started_at_ms = ?2
             WHERE id = ?3",
            params![worker_id.to_string(), now_ms(), job_id],
        )?;
        tx.execute(
            "DELETE FROM job_queue WHERE job_id = ?1",
            params![job_id],
        )?;
        tx.execute(
            "UPDATE workers SET status = 'busy' WHERE id = ?1 AND status = 'online'",
            params![worker_id.to_string()],
        )?;
        record_activity(
            &tx,
            "job_dispatched",
            None,
            &format!("Job {} dispatched to worker {}", job_id, worker_id),
        )?;

        let job = fetch_job(&tx, &job_id)?;
        tx.commit()?;
        Ok(job)
    }

    /// Persist a job result and settle credits.
    ///
    /// On success with an owned worker: credit the owner, log the reward,
    /// bump the worker's lifetime counters — all in one transaction.
    /// Retries up to 3 times when the write lock is contended.
    ///
    /// Returns false (and changes nothing) when the result is stale: the
    /// job is no longer running or no longer assigned to this worker.
    pub fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        success: bool,
        output: &str,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let mut attempt = 0;
        loop {
            match self.try_complete_job(job_id, worker_id, success, output, error) {
                Err(e) if is_busy(&e) && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    log::warn!(
                        "Store busy completing job {} (attempt {}/{})",
                        job_id,
                        attempt,
                        BUSY_RETRIES
                    );
                    std::thread::sleep(BUSY_BACKOFF * attempt);
                }
                Err(e) if is_busy(&e) => return Err(StoreError::Contended(BUSY_RETRIES)),
                other => return other,
            }
        }
    }

    fn try_complete_job(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        success: bool,
        output: &str,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = fetch_job(&tx, &job_id.to_string())?.ok_or(StoreError::UnknownJob(job_id))?;

        // Terminal jobs are immutable, and a re-queued job may already
        // belong to someone else. Either way this result is void.
        if job.status != JobStatus::Running || job.worker_id != Some(worker_id) {
            log::warn!(
                "Ignoring stale result for job {} from worker {} (status {:?})",
                job_id,
                worker_id,
                job.status
            );
            return Ok(false);
        }

        let final_status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        tx.execute(
            "UPDATE jobs SET status = ?1, result_output = ?2, error_log = ?3,
                             completed_at_ms = ?4
             WHERE id = ?5",
            params![
                final_status.as_str(),
                output,
                error,
                now_ms(),
                job_id.to_string(),
            ],
        )?;

        if success {
            let owner: Option<String> = tx
                .query_row(
                    "SELECT owner_id FROM workers WHERE id = ?1",
                    params![worker_id.to_string()],
                    |r| r.get(0),
                )
                .optional()?
                .flatten();

            if let Some(owner_id) = owner {
                let owner_uuid = parse_uuid_str(&owner_id)?;
                tx.execute(
                    "UPDATE users SET credits = credits + ?1 WHERE id = ?2",
                    params![job.credit_reward, owner_id],
                )?;
                record_transaction(
                    &tx,
                    owner_uuid,
                    job.credit_reward,
                    TransactionKind::JobCompleted,
                    Some(job_id),
                    &format!("Completed '{}'", job.title),
                )?;
                tx.execute(
                    "UPDATE workers SET total_jobs_completed = total_jobs_completed + 1,
                                        total_credits_earned = total_credits_earned + ?1
                     WHERE id = ?2",
                    params![job.credit_reward, worker_id.to_string()],
                )?;
            }
        }

        tx.execute(
            "UPDATE workers SET status = 'online' WHERE id = ?1 AND status = 'busy'",
            params![worker_id.to_string()],
        )?;
        record_activity(
            &tx,
            if success { "job_completed" } else { "job_failed" },
            None,
            &format!("Job {} finished on worker {}: {}", job_id, worker_id, final_status.as_str()),
        )?;

        tx.commit()?;
        Ok(true)
    }

    /// Recover jobs stranded by a dead worker: back to the queue at their
    /// original priority, up to the re-queue budget, then failed.
    pub fn requeue_worker_jobs(&self, worker_id: Uuid) -> StoreResult<Vec<(Uuid, JobStatus)>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let orphans: Vec<(String, i64, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, priority, requeue_count FROM jobs
                 WHERE worker_id = ?1 AND status = 'running'",
            )?;
            let rows = stmt.query_map(params![worker_id.to_string()], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get::<_, i64>(2)? as u32))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let now = now_ms();
        let mut outcomes = Vec::with_capacity(orphans.len());
        for (job_id, priority, requeues) in orphans {
            if requeues < MAX_JOB_REQUEUES {
                tx.execute(
                    "UPDATE jobs SET status = 'pending', worker_id = NULL,
                                     started_at_ms = NULL, requeue_count = requeue_count + 1
                     WHERE id = ?1",
                    params![job_id],
                )?;
                tx.execute(
                    "INSERT INTO job_queue (job_id, priority, queued_at_ms) VALUES (?1, ?2, ?3)",
                    params![job_id, priority, now],
                )?;
                record_activity(
                    &tx,
                    "job_requeued",
                    None,
                    &format!("Job {} re-queued after worker {} vanished", job_id, worker_id),
                )?;
                outcomes.push((parse_uuid_str(&job_id)?, JobStatus::Pending));
            } else {
                tx.execute(
                    "UPDATE jobs SET status = 'failed',
                                     error_log = 'Worker disconnected mid-execution',
                                     completed_at_ms = ?1
                     WHERE id = ?2",
                    params![now, job_id],
                )?;
                record_activity(
                    &tx,
                    "job_failed",
                    None,
                    &format!("Job {} failed: re-queue budget exhausted", job_id),
                )?;
                outcomes.push((parse_uuid_str(&job_id)?, JobStatus::Failed));
            }
        }

        tx.commit()?;
        Ok(outcomes)
    }
}

// ============================================================================
// 6. WORKER LIFECYCLE
// ============================================================================

impl GridStore {
    /// Register a worker at session start. Reconnects reuse the durable row
    /// matched by (name, owner) so lifetime counters survive; specs are
    /// refreshed since hardware may have changed.
    pub fn register_worker(
        &self,
        name: &str,
        owner_id: Option<Uuid>,
        specs: &WorkerSpecs,
    ) -> StoreResult<Uuid> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let owner = owner_id.map(|o| o.to_string());
        let now = now_ms();

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM workers WHERE name = ?1 AND owner_id IS ?2",
                params![name, owner],
                |r| r.get(0),
            )
            .optional()?;

        let worker_id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE workers SET status = 'online', cpu_cores = ?1, cpu_model = ?2,
                                        ram_gb = ?3, gpu_name = ?4, gpu_memory_gb = ?5,
                                        has_docker = ?6, last_heartbeat_ms = ?7
                     WHERE id = ?8",
                    params![
                        specs.cpu_cores as i64,
                        specs.cpu_model,
                        specs.ram_gb,
                        specs.gpu_name,
                        specs.gpu_memory_gb,
                        specs.has_docker,
                        now,
                        id,
                    ],
                )?;
                parse_uuid_str(&id)?
            }
            None => {
                let id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO workers (id, name, owner_id, status, cpu_cores, cpu_model,
                                          ram_gb, gpu_name, gpu_memory_gb, has_docker,
                                          last_heartbeat_ms, created_at_ms)
                     VALUES (?1, ?2, ?3, 'online', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        id.to_string(),
                        name,
                        owner,
                        specs.cpu_cores as i64,
                        specs.cpu_model,
                        specs.ram_gb,
                        specs.gpu_name,
                        specs.gpu_memory_gb,
                        specs.has_docker,
                        now,
                        now,
                    ],
                )?;
                id
            }
        };

        record_activity(
            &tx,
            "worker_registered",
            owner_id,
            &format!("Worker '{}' ({}) registered", name, worker_id),
        )?;
        tx.commit()?;
        Ok(worker_id)
    }

    pub fn update_worker_status(&self, worker_id: Uuid, status: WorkerStatus) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE workers SET status = ?1 WHERE id = ?2",
            params![status.as_str(), worker_id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownWorker(worker_id));
        }
        Ok(())
    }

    /// Take a worker out of dispatch consideration without dropping its
    /// session.
    pub fn pause_worker(&self, worker_id: Uuid) -> StoreResult<()> {
        self.update_worker_status(worker_id, WorkerStatus::Paused)
    }

    /// Clear the paused flag. The durable row falls back to `offline`; the
    /// manager re-asserts liveness on the next dispatch round-trip.
    pub fn resume_worker(&self, worker_id: Uuid) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE workers SET status = 'offline' WHERE id = ?1 AND status = 'paused'",
            params![worker_id.to_string()],
        )?;
        if changed == 0 && self.get_worker(worker_id)?.is_none() {
            return Err(StoreError::UnknownWorker(worker_id));
        }
        Ok(())
    }

    /// Delete a worker row. Refused while a running job still references
    /// it; terminal jobs keep the dangling reference for history.
    pub fn remove_worker(&self, worker_id: Uuid) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let running: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE worker_id = ?1 AND status = 'running'",
            params![worker_id.to_string()],
            |r| r.get(0),
        )?;
        if running > 0 {
            return Err(StoreError::WorkerBusy(worker_id));
        }

        let deleted = tx.execute(
            "DELETE FROM workers WHERE id = ?1",
            params![worker_id.to_string()],
        )?;
        if deleted == 0 {
            return Err(StoreError::UnknownWorker(worker_id));
        }
        record_activity(&tx, "worker_removed", None, &format!("Worker {} removed", worker_id))?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_worker(&self, worker_id: Uuid) -> StoreResult<Option<WorkerRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("{WORKER_COLUMNS} WHERE id = ?1"),
                params![worker_id.to_string()],
                worker_from_row,
            )
            .optional()?)
    }

    pub fn list_workers(&self) -> StoreResult<Vec<WorkerRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{WORKER_COLUMNS} ORDER BY created_at_ms ASC"))?;
        let rows = stmt.query_map([], worker_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

// ============================================================================
// 7. JOB & DASHBOARD READS
// ============================================================================

impl GridStore {
    pub fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let conn = self.conn()?;
        fetch_job(&conn, &job_id.to_string())
    }

    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> StoreResult<Vec<Job>> {
        let conn = self.conn()?;
        let rows = match status {
            Some(s) => {
                let mut stmt = conn.prepare(&format!(
                    "{JOB_COLUMNS} WHERE status = ?1 ORDER BY created_at_ms DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![s.as_str(), limit as i64], job_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{JOB_COLUMNS} ORDER BY created_at_ms DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], job_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    pub fn list_user_jobs(&self, user_id: Uuid, limit: usize) -> StoreResult<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{JOB_COLUMNS} WHERE submitter_id = ?1 ORDER BY created_at_ms DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string(), limit as i64], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn queue_stats(&self) -> StoreResult<QueueStats> {
        let conn = self.conn()?;
        let mut stats = QueueStats::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Running) => stats.running = count,
                Some(JobStatus::Completed) => stats.completed = count,
                Some(JobStatus::Failed) => stats.failed = count,
                None => log::warn!("Unrecognized job status in store: {}", status),
            }
        }

        stats.queue_depth = conn.query_row("SELECT COUNT(*) FROM job_queue", [], |r| r.get(0))?;
        Ok(stats)
    }

    /// Worker owners ranked by lifetime credits earned across their fleet.
    pub fn leaderboard(&self, limit: usize) -> StoreResult<Vec<LeaderboardRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT u.username,
                    SUM(w.total_credits_earned) AS earned,
                    SUM(w.total_jobs_completed) AS done
             FROM workers w
             JOIN users u ON u.id = w.owner_id
             GROUP BY u.id
             ORDER BY earned DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(LeaderboardRow {
                username: r.get(0)?,
                credits_earned: r.get(1)?,
                jobs_completed: r.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn log_activity(
        &self,
        event_type: &str,
        actor_id: Option<Uuid>,
        details: &str,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        record_activity(&conn, event_type, actor_id, details)
    }

    pub fn recent_activity(&self, limit: usize) -> StoreResult<Vec<ActivityEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_type, actor_id, details, created_at_ms
             FROM activity_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(ActivityEvent {
                id: r.get(0)?,
                event_type: r.get(1)?,
                actor_id: read_uuid_opt(r, 2)?,
                details: r.get(3)?,
                created_at_ms: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

// ============================================================================
// 8. ROW MAPPING
// ============================================================================

const USER_COLUMNS: &str = "SELECT id, username, password_hash, email, role, credits, \
                            created_at_ms, last_login_ms FROM users";

const WORKER_COLUMNS: &str = "SELECT id, name, owner_id, status, cpu_cores, cpu_model, ram_gb, \
                              gpu_name, gpu_memory_gb, has_docker, last_heartbeat_ms, \
                              total_jobs_completed, total_credits_earned, created_at_ms \
                              FROM workers";

const JOB_COLUMNS: &str = "SELECT id, title, submitter_id, worker_id, status, priority, code, \
                           requirements, cpu_required, ram_required_gb, gpu_required, \
                           timeout_seconds, credit_cost, credit_reward, result_output, \
                           error_log, requeue_count, created_at_ms, started_at_ms, \
                           completed_at_ms FROM jobs";

fn fetch_job(conn: &Connection, id: &str) -> StoreResult<Option<Job>> {
    Ok(conn
        .query_row(
            &format!("{JOB_COLUMNS} WHERE id = ?1"),
            params![id],
            job_from_row,
        )
        .optional()?)
}

fn record_transaction(
    conn: &Connection,
    user_id: Uuid,
    amount: i64,
    kind: TransactionKind,
    job_id: Option<Uuid>,
    description: &str,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO credit_transactions (user_id, amount, transaction_type, job_id,
                                          description, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id.to_string(),
            amount,
            kind.as_str(),
            job_id.map(|j| j.to_string()),
            description,
            now_ms(),
        ],
    )?;
    Ok(())
}

fn record_activity(
    conn: &Connection,
    event_type: &str,
    actor_id: Option<Uuid>,
    details: &str,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO activity_logs (event_type, actor_id, details, created_at_ms)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            event_type,
            actor_id.map(|a| a.to_string()),
            details,
            now_ms(),
        ],
    )?;
    Ok(())
}

fn parse_uuid_str(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        StoreError::Db(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        ))
    })
}

fn read_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn read_uuid_opt(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => Uuid::parse_str(&s).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
    }
}

fn parse_enum<T>(row_idx: usize, raw: &str, parsed: Option<T>) -> rusqlite::Result<T> {
    parsed.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            row_idx,
            rusqlite::types::Type::Text,
            format!("unrecognized enum value '{raw}'").into(),
        )
    })
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    let role_raw: String = row.get(4)?;
    Ok(User {
        id: read_uuid(row, 0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        email: row.get(3)?,
        role: parse_enum(4, &role_raw, Role::parse(&role_raw))?,
        credits: row.get(5)?,
        created_at_ms: row.get(6)?,
        last_login_ms: row.get(7)?,
    })
}

fn worker_from_row(row: &Row) -> rusqlite::Result<WorkerRecord> {
    let status_raw: String = row.get(3)?;
    Ok(WorkerRecord {
        id: read_uuid(row, 0)?,
        name: row.get(1)?,
        owner_id: read_uuid_opt(row, 2)?,
        status: parse_enum(3, &status_raw, WorkerStatus::parse(&status_raw))?,
        specs: WorkerSpecs {
            cpu_cores: row.get::<_, i64>(4)? as u32,
            cpu_model: row.get(5)?,
            ram_gb: row.get(6)?,
            gpu_name: row.get(7)?,
            gpu_memory_gb: row.get(8)?,
            has_docker: row.get(9)?,
        },
        last_heartbeat_ms: row.get(10)?,
        jobs_completed: row.get(11)?,
        credits_earned: row.get(12)?,
        created_at_ms: row.get(13)?,
    })
}

fn transaction_from_row(row: &Row) -> rusqlite::Result<CreditTransaction> {
    let kind_raw: String = row.get(3)?;
    Ok(CreditTransaction {
        id: row.get(0)?,
        user_id: read_uuid(row, 1)?,
        amount: row.get(2)?,
        kind: parse_enum(3, &kind_raw, TransactionKind::parse(&kind_raw))?,
        job_id: read_uuid_opt(row, 4)?,
        description: row.get(5)?,
        created_at_ms: row.get(6)?,
    })
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let status_raw: String = row.get(4)?;
    Ok(Job {
        id: read_uuid(row, 0)?,
        title: row.get(1)?,
        submitter_id: read_uuid(row, 2)?,
        worker_id: read_uuid_opt(row, 3)?,
        status: parse_enum(4, &status_raw, JobStatus::parse(&status_raw))?,
        priority: row.get::<_, i64>(5)? as u8,
        code: row.get(6)?,
        requirements: row.get(7)?,
        cpu_required: row.get::<_, i64>(8)? as u32,
        ram_required_gb: row.get(9)?,
        gpu_required: row.get(10)?,
        timeout_seconds: row.get::<_, i64>(11)? as u64,
        credit_cost: row.get(12)?,
        credit_reward: row.get(13)?,
        result_output: row.get(14)?,
        error_log: row.get(15)?,
        requeue_count: row.get::<_, i64>(16)? as u32,
        created_at_ms: row.get(17)?,
        started_at_ms: row.get(18)?,
        completed_at_ms: row.get(19)?,
    })
}
