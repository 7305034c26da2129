// src/manager.rs
//
// =============================================================================
// CAMPUSGRID: MANAGER CORE (v 0.1 )
// =============================================================================
//
// The central coordinator.
//
// Responsibilities:
// 1. Accept worker TCP sessions and run each through the session state
//    machine (register -> serve -> teardown).
// 2. Track liveness in memory: the worker table mirrors open sockets, the
//    database keeps the durable history.
// 3. Health monitor: sweep for silent workers every 30 s and force their
//    sessions closed.
// 4. Ingest job results: decode artifacts to disk, settle credits, ack.
//
// A peer fault only ever kills its own session. The accept loop is
// untouchable from the network side.

use crate::config::ManagerConfig;
use crate::core::{OutputFile, WorkerSpecs, WorkerStatus};
use crate::protocol::{FramedStream, Message};
use crate::store::GridStore;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use uuid::Uuid;

// ============================================================================
// 1. LIVE WORKER TABLE (In-Memory View)
// ============================================================================

/// A connected worker. Exists exactly as long as its TCP session.
pub struct LiveWorker {
    pub name: String,
    pub specs: WorkerSpecs,
    pub status: WorkerStatus,
    pub last_heartbeat: Instant,
    pub current_job: Option<Uuid>,
    pub jobs_completed: u64,
    pub addr: SocketAddr,
    /// Poked by the health monitor to force the session closed.
    shutdown: Arc<Notify>,
}

/// Soft cache over the durable worker rows, keyed by worker ID. Only
/// manager code mutates it; sessions and the health monitor share it
/// behind one lock.
#[derive(Default)]
pub struct WorkerTable {
    inner: Mutex<HashMap<Uuid, LiveWorker>>,
}

impl WorkerTable {
    fn register(&self, worker_id: Uuid, live: LiveWorker) {
        self.inner.lock().unwrap().insert(worker_id, live);
    }

    /// Refresh liveness. Returns true when the worker had been marked
    /// timed out and is now restored to online.
    fn heartbeat(&self, worker_id: Uuid) -> bool {
        let mut table = self.inner.lock().unwrap();
        let Some(w) = table.get_mut(&worker_id) else {
            return false;
        };
        w.last_heartbeat = Instant::now();
        if w.status == WorkerStatus::Offline {
            w.status = WorkerStatus::Online;
            return true;
        }
        false
    }

    fn set_busy(&self, worker_id: Uuid, job_id: Uuid) {
        if let Some(w) = self.inner.lock().unwrap().get_mut(&worker_id) {
            w.status = WorkerStatus::Busy;
            w.current_job = Some(job_id);
        }
    }

    fn set_idle(&self, worker_id: Uuid) {
        if let Some(w) = self.inner.lock().unwrap().get_mut(&worker_id) {
            w.status = WorkerStatus::Online;
            w.current_job = None;
            w.jobs_completed += 1;
        }
    }

    fn remove(&self, worker_id: Uuid) -> Option<LiveWorker> {
        self.inner.lock().unwrap().remove(&worker_id)
    }

    /// Mark every worker silent past the deadline as offline and return
    /// their shutdown handles; the sweep owner notifies outside the lock.
    fn collect_stale(&self, max_silence: Duration) -> Vec<(Uuid, String, Arc<Notify>)> {
        let mut table = self.inner.lock().unwrap();
        let mut stale = Vec::new();
        for (id, w) in table.iter_mut() {
            if w.last_heartbeat.elapsed() > max_silence && w.status != WorkerStatus::Offline {
                w.status = WorkerStatus::Offline;
                stale.push((*id, w.name.clone(), w.shutdown.clone()));
            }
        }
        stale
    }

    pub fn connected_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

// ============================================================================
// 2. THE SERVER
// ============================================================================

pub struct ManagerServer {
    cfg: ManagerConfig,
    store: Arc<GridStore>,
    table: Arc<WorkerTable>,
}

impl ManagerServer {
    pub fn new(cfg: ManagerConfig, store: GridStore) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            store: Arc::new(store),
            table: Arc::new(WorkerTable::default()),
        })
    }

    /// Bind the configured address and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.cfg.host, self.cfg.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind manager socket on {}", addr))?;

        log::info!("🚀 CampusGrid manager listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. Starts the health
    /// monitor as a side task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.health_monitor().await });

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_session(stream, peer).await });
                }
                Err(e) => log::error!("Accept failed: {}", e),
            }
        }
    }

    /// Periodic sweep for workers whose heartbeats stopped arriving even
    /// though the kernel still believes the socket is healthy.
    async fn health_monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.health_check_interval);
        loop {
            ticker.tick().await;
            for (worker_id, name, shutdown) in
                self.table.collect_stale(self.cfg.heartbeat_timeout)
            {
                log::warn!("⏱️ Worker '{}' ({}) heartbeat timed out", name, worker_id);
                shutdown.notify_one();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Session state machine
    // ------------------------------------------------------------------------

    async fn handle_session(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut framed = FramedStream::new(stream);

        // AWAIT_REGISTER: exactly one message, and it must be `register`.
        let first = match timeout(self.cfg.read_timeout, framed.recv()).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                log::warn!("Bad first frame from {}: {}", peer, e);
                return;
            }
            Err(_) => {
                log::warn!("Peer {} never registered, dropping", peer);
                return;
            }
        };

        let Message::Register {
            name,
            owner_token,
            specs,
        } = first
        else {
            log::warn!("Peer {} opened with a non-register message, dropping", peer);
            return;
        };

        // Owner resolution: the token is looked up as a username for now.
        // Unknown or empty tokens register the worker without an owner.
        let owner_id = if owner_token.is_empty() {
            None
        } else {
            match self.store.get_user_by_username(&owner_token) {
                Ok(user) => {
                    if user.is_none() {
                        log::warn!("Unknown owner token '{}' from {}", owner_token, peer);
                    }
                    user.map(|u| u.id)
                }
                Err(e) => {
                    log::error!("Owner lookup failed: {}", e);
                    None
                }
            }
        };

        let worker_id = match self.store.register_worker(&name, owner_id, &specs) {
            Ok(id) => id,
            Err(e) => {
                log::error!("Failed to register worker '{}': {}", name, e);
                return;
            }
        };

        let shutdown = Arc::new(Notify::new());
        self.table.register(
            worker_id,
            LiveWorker {
                name: name.clone(),
                specs,
                status: WorkerStatus::Online,
                last_heartbeat: Instant::now(),
                current_job: None,
                jobs_completed: 0,
                addr: peer,
                shutdown: shutdown.clone(),
            },
        );

        let welcome = Message::Registered {
            worker_id,
            message: format!("Welcome {}!", name),
        };
        if let Err(e) = framed.send(&welcome).await {
            log::warn!("Failed to ack registration of '{}': {}", name, e);
            self.teardown(worker_id, &name);
            return;
        }

        log::info!(
            "🔌 Worker '{}' ({}) connected from {} ({} online)",
            name,
            worker_id,
            peer.ip(),
            self.table.connected_count()
        );

        // READY: serve until the peer leaves, misbehaves, or times out.
        if let Err(e) = self.session_loop(&mut framed, worker_id, &shutdown).await {
            log::warn!("Session for '{}' ended with error: {}", name, e);
        }

        self.teardown(worker_id, &name);
    }

    async fn session_loop(
        &self,
        framed: &mut FramedStream<TcpStream>,
        worker_id: Uuid,
        shutdown: &Notify,
    ) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = shutdown.notified() => return Ok(()),
                read = timeout(self.cfg.read_timeout, framed.recv()) => match read {
                    Err(_) => anyhow::bail!("socket read timed out"),
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Err(e)) => anyhow::bail!("protocol error: {}", e),
                    Ok(Ok(Some(msg))) => msg,
                },
            };

            match msg {
                Message::Heartbeat { .. } => {
                    if self.table.heartbeat(worker_id) {
                        log::info!("Worker {} restored to online after timeout", worker_id);
                    }
                }

                Message::RequestJob { .. } => {
                    let reply = match self.store.dispatch_job(worker_id) {
                        Ok(Some(job)) => {
                            self.table.set_busy(worker_id, job.id);
                            log::info!(
                                "📤 Dispatched '{}' ({}) to worker {}",
                                job.title,
                                job.id,
                                worker_id
                            );
                            Message::Job {
                                job_id: job.id,
                                title: job.title,
                                code: job.code,
                                requirements: job.requirements,
                                timeout: job.timeout_seconds,
                                credit_reward: job.credit_reward,
                            }
                        }
                        Ok(None) => Message::NoJob,
                        Err(e) => {
                            log::error!("Dispatch failed for worker {}: {}", worker_id, e);
                            Message::NoJob
                        }
                    };
                    framed.send(&reply).await?;
                }

                Message::JobResult {
                    job_id,
                    success,
                    output,
                    error,
                    files,
                    execution_time,
                    ..
                } => {
                    let saved = self.save_job_files(job_id, &files);
                    match self
                        .store
                        .complete_job(job_id, worker_id, success, &output, error.as_deref())
                    {
                        Ok(true) => log::info!(
                            "🏁 Job {} {} in {:.2}s ({} files)",
                            job_id,
                            if success { "completed" } else { "failed" },
                            execution_time,
                            saved
                        ),
                        Ok(false) => {}
                        Err(e) => log::error!("Failed to persist result for {}: {}", job_id, e),
                    }
                    self.table.set_idle(worker_id);
                    framed.send(&Message::JobReceived { job_id }).await?;
                }

                Message::Disconnect => return Ok(()),

                // Anything manager-bound that doesn't belong in READY state.
                other => anyhow::bail!("unexpected message in ready state: {:?}", other),
            }
        }
    }

    /// CLOSED: shared exit path for every way a session can die.
    fn teardown(&self, worker_id: Uuid, name: &str) {
        self.table.remove(worker_id);

        if let Err(e) = self.store.update_worker_status(worker_id, WorkerStatus::Offline) {
            // The row may have been removed through the dashboard mid-session.
            log::debug!("Could not mark worker {} offline: {}", worker_id, e);
        }

        match self.store.requeue_worker_jobs(worker_id) {
            Ok(outcomes) => {
                for (job_id, status) in outcomes {
                    log::warn!("Orphaned job {} -> {}", job_id, status.as_str());
                }
            }
            Err(e) => log::error!("Failed to recover jobs of worker {}: {}", worker_id, e),
        }

        if let Err(e) = self.store.log_activity(
            "worker_disconnected",
            None,
            &format!("Worker '{}' ({}) disconnected", name, worker_id),
        ) {
            log::debug!("Activity log write failed: {}", e);
        }

        log::info!(
            "👋 Worker '{}' ({}) disconnected ({} online)",
            name,
            worker_id,
            self.table.connected_count()
        );
    }

    // ------------------------------------------------------------------------
    // Artifact ingest
    // ------------------------------------------------------------------------

    /// Decode result files into `job_outputs/<job_id>/`. Traversal-shaped
    /// names and undecodable payloads are skipped; the rest still land.
    fn save_job_files(&self, job_id: Uuid, files: &[OutputFile]) -> usize {
        if files.is_empty() {
            return 0;
        }

        let dir = self.output_dir(job_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            log::error!("Cannot create output dir {:?}: {}", dir, e);
            return 0;
        }

        let mut saved = 0;
        for file in files {
            if !safe_filename(&file.filename) {
                log::warn!(
                    "Rejected suspicious output filename '{}' for job {}",
                    file.filename,
                    job_id
                );
                continue;
            }
            let bytes = match BASE64.decode(&file.content) {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("Undecodable payload for '{}': {}", file.filename, e);
                    continue;
                }
            };
            match std::fs::write(dir.join(&file.filename), bytes) {
                Ok(()) => {
                    log::info!("💾 Saved {} for job {}", file.filename, job_id);
                    saved += 1;
                }
                Err(e) => log::error!("Failed to save '{}': {}", file.filename, e),
            }
        }
        saved
    }

    pub fn output_dir(&self, job_id: Uuid) -> PathBuf {
        self.cfg
            .data_dir
            .join("job_outputs")
            .join(job_id.to_string())
    }
}

/// A result filename must be a bare name: no separators, no parent hops.
pub fn safe_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}
