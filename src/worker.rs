// src/worker.rs
//
// =============================================================================
// CAMPUSGRID: WORKER CLIENT (v 0.1 )
// =============================================================================
//
// The volunteer side of the grid.
//
// Lifecycle:
// 1. Probe hardware once, connect, register, learn our worker ID.
// 2. Background task heartbeats every 30 s over the shared write half.
// 3. Main loop: request a job, run it in the sandbox, report, wait for the
//    ack. Idle-poll when the queue has nothing for us.
// 4. Ctrl-C sends a best-effort `disconnect` so the manager frees us
//    immediately instead of waiting out the heartbeat timeout.

use crate::config::WorkerConfig;
use crate::core::WorkerSpecs;
use crate::probe;
use crate::protocol::{FramedStream, Message};
use crate::sandbox::SandboxExecutor;
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

/// How long we wait for any manager reply before declaring it gone.
const REPLY_TIMEOUT: Duration = Duration::from_secs(120);

type SharedWriter = Arc<Mutex<FramedStream<OwnedWriteHalf>>>;

pub struct WorkerClient {
    cfg: WorkerConfig,
    specs: WorkerSpecs,
    executor: SandboxExecutor,
}

impl WorkerClient {
    /// Probes hardware and picks the sandbox mode. Done once; the specs are
    /// what we will claim at registration.
    pub fn new(cfg: WorkerConfig) -> Self {
        let specs = probe::probe();
        let executor = SandboxExecutor::new(&cfg.sandbox, specs.has_docker);
        Self {
            cfg,
            specs,
            executor,
        }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.cfg.manager_host, self.cfg.manager_port);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Cannot reach manager at {}", addr))?;
        let (read_half, write_half) = stream.into_split();

        let mut rx = FramedStream::new(read_half);
        let tx: SharedWriter = Arc::new(Mutex::new(FramedStream::new(write_half)));

        // REGISTER
        tx.lock()
            .await
            .send(&Message::Register {
                name: self.cfg.name.clone(),
                owner_token: self.cfg.owner_token.clone(),
                specs: self.specs.clone(),
            })
            .await?;

        let worker_id = match timeout(REPLY_TIMEOUT, rx.recv()).await {
            Ok(Ok(Some(Message::Registered { worker_id, message }))) => {
                log::info!("✅ Registered as {} ({})", worker_id, message);
                worker_id
            }
            Ok(Ok(other)) => bail!("registration rejected: {:?}", other),
            Ok(Err(e)) => return Err(e).context("registration failed"),
            Err(_) => bail!("manager did not answer the registration"),
        };

        log::info!(
            "Specs: {} cores | {:.1} GB RAM | GPU: {} | sandbox: {}",
            self.specs.cpu_cores,
            self.specs.ram_gb,
            self.specs.gpu_name.as_deref().unwrap_or("none"),
            if self.executor.container_mode() {
                "container"
            } else {
                "restricted"
            }
        );

        let running = Arc::new(AtomicBool::new(true));
        let busy = Arc::new(AtomicBool::new(false));

        // Graceful shutdown: flag down, goodbye frame out.
        {
            let running = running.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("🛑 Interrupt received, disconnecting...");
                    running.store(false, Ordering::SeqCst);
                    let _ = tx.lock().await.send(&Message::Disconnect).await;
                }
            });
        }

        // Heartbeat task. Shares the write half; frames never interleave
        // because every send holds the writer lock for the whole frame.
        let heartbeat = {
            let running = running.clone();
            let busy = busy.clone();
            let tx = tx.clone();
            let interval = self.cfg.heartbeat_interval;
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    sleep(interval).await;
                    let beat = Message::Heartbeat {
                        worker_id,
                        status: if busy.load(Ordering::SeqCst) {
                            "busy".into()
                        } else {
                            "idle".into()
                        },
                    };
                    if tx.lock().await.send(&beat).await.is_err() {
                        break;
                    }
                }
            })
        };

        log::info!("🛡️ Worker ready, waiting for jobs...");
        let result = self.job_loop(&mut rx, &tx, worker_id, &running, &busy).await;

        heartbeat.abort();
        log::info!("👋 Worker stopped");
        result
    }

    async fn job_loop(
        &self,
        rx: &mut FramedStream<tokio::net::tcp::OwnedReadHalf>,
        tx: &SharedWriter,
        worker_id: Uuid,
        running: &AtomicBool,
        busy: &AtomicBool,
    ) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            tx.lock()
                .await
                .send(&Message::RequestJob { worker_id })
                .await
                .context("manager connection lost")?;

            let reply = match timeout(REPLY_TIMEOUT, rx.recv()).await {
                Ok(Ok(Some(msg))) => msg,
                Ok(Ok(None)) => {
                    log::warn!("Manager closed the connection");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e).context("manager connection lost"),
                Err(_) => bail!("manager stopped responding"),
            };

            match reply {
                Message::Job {
                    job_id,
                    title,
                    code,
                    requirements,
                    timeout: job_timeout,
                    credit_reward,
                } => {
                    // Clamp to the local safety cap; a submitter's timeout
                    // is a request, not a command.
                    let limit =
                        Duration::from_secs(job_timeout.min(self.cfg.max_job_timeout));
                    log::info!(
                        "⚙️ Running '{}' ({}) — limit {}s, reward {} credits",
                        title,
                        job_id,
                        limit.as_secs(),
                        credit_reward
                    );

                    busy.store(true, Ordering::SeqCst);
                    let started = Instant::now();
                    let outcome = self
                        .executor
                        .execute(&code, requirements.as_deref(), limit)
                        .await;
                    let elapsed = started.elapsed().as_secs_f64();
                    busy.store(false, Ordering::SeqCst);

                    log::info!(
                        "{} '{}' in {:.2}s ({} files)",
                        if outcome.success { "✅" } else { "💥" },
                        title,
                        elapsed,
                        outcome.files.len()
                    );

                    tx.lock()
                        .await
                        .send(&Message::JobResult {
                            job_id,
                            worker_id,
                            success: outcome.success,
                            output: outcome.output,
                            error: outcome.error,
                            files: outcome.files,
                            execution_time: elapsed,
                        })
                        .await
                        .context("failed to report job result")?;

                    // The manager acks before it will hand us anything new.
                    match timeout(REPLY_TIMEOUT, rx.recv()).await {
                        Ok(Ok(Some(Message::JobReceived { .. }))) => {}
                        Ok(Ok(Some(other))) => {
                            log::warn!("Expected result ack, got {:?}", other)
                        }
                        Ok(Ok(None)) => {
                            log::warn!("Manager closed before acking the result");
                            return Ok(());
                        }
                        Ok(Err(e)) => return Err(e).context("manager connection lost"),
                        Err(_) => bail!("manager never acked the result"),
                    }
                }

                Message::NoJob => sleep(self.cfg.idle_poll).await,

                other => {
                    log::warn!("Unexpected message from manager: {:?}", other);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
        Ok(())
    }
}
