// src/main.rs
//
// =============================================================================
// CAMPUSGRID: COMMANDER & ENTRY POINT (v 0.1 )
// =============================================================================
//
// The wiring center of the grid.
//
// Modes:
// 1. MANAGER:  Boots the store, the health monitor, and the TCP accept loop.
// 2. WORKER:   Probes this machine and volunteers it to a manager.
// 3. SUBMIT:   Drops a job into the queue as a given user.
// 4. ADD-USER: Creates an account with the starting balance.
// 5. STATUS:   Quick queue / worker / job report from the store.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;

use campusgrid::core::{JobRequest, Role};
use campusgrid::{GridStore, ManagerConfig, ManagerServer, StoreOptions, WorkerClient, WorkerConfig};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "campusgrid",
    version,
    about = "P2P campus compute sharing network"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the central manager (job queue + worker coordination).
    Manager {
        /// Listen address for workers.
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// SQLite file holding all durable state.
        #[arg(long, default_value = "campus_compute.db")]
        db: PathBuf,

        /// Where job_outputs/ artifact directories are created.
        #[arg(long, default_value = ".")]
        data_dir: PathBuf,

        /// Credits granted to new users.
        #[arg(long)]
        starting_credits: Option<i64>,

        /// Floor for the job cost function.
        #[arg(long)]
        min_job_cost: Option<i64>,
    },

    /// Volunteer this machine as a worker.
    Worker {
        /// Manager host to connect to.
        #[arg(short, long)]
        manager: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Worker name shown on the dashboard (default: hostname).
        #[arg(short, long)]
        name: Option<String>,

        /// Owner username that earns the credits.
        #[arg(short, long)]
        user: Option<String>,

        /// Disable the container sandbox even if a runtime is present.
        #[arg(long)]
        no_container: bool,

        /// Override the container image.
        #[arg(long)]
        image: Option<String>,
    },

    /// Submit a job from a code file.
    Submit {
        #[arg(long, default_value = "campus_compute.db")]
        db: PathBuf,

        /// Submitting username (pays the credits).
        #[arg(long)]
        user: String,

        #[arg(long)]
        title: String,

        /// Path to the job script.
        #[arg(long)]
        file: PathBuf,

        /// Optional requirements.txt to install before the job runs.
        #[arg(long)]
        requirements: Option<PathBuf>,

        #[arg(long, default_value_t = 1)]
        cpu: u32,

        #[arg(long, default_value_t = 1.0)]
        ram: f64,

        #[arg(long)]
        gpu: bool,

        /// 1..=10, higher dispatches first.
        #[arg(long, default_value_t = 5)]
        priority: u8,

        /// Seconds before the sandbox kills the job.
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },

    /// Create a user account.
    AddUser {
        #[arg(long, default_value = "campus_compute.db")]
        db: PathBuf,

        #[arg(long)]
        username: String,

        #[arg(long)]
        password: String,

        #[arg(long)]
        email: Option<String>,

        /// coordinator | worker | user
        #[arg(long, default_value = "user")]
        role: String,
    },

    /// Print queue statistics, workers, and recent jobs.
    Status {
        #[arg(long, default_value = "campus_compute.db")]
        db: PathBuf,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Manager {
            host,
            port,
            db,
            data_dir,
            starting_credits,
            min_job_cost,
        } => run_manager(host, port, db, data_dir, starting_credits, min_job_cost).await,
        Commands::Worker {
            manager,
            port,
            name,
            user,
            no_container,
            image,
        } => run_worker(manager, port, name, user, no_container, image).await,
        Commands::Submit {
            db,
            user,
            title,
            file,
            requirements,
            cpu,
            ram,
            gpu,
            priority,
            timeout,
        } => run_submit(db, user, title, file, requirements, cpu, ram, gpu, priority, timeout),
        Commands::AddUser {
            db,
            username,
            password,
            email,
            role,
        } => run_add_user(db, username, password, email, role),
        Commands::Status { db } => run_status(db),
    }
}

// ============================================================================
// 3. RUNTIME: MANAGER
// ============================================================================

async fn run_manager(
    host: Option<String>,
    port: Option<u16>,
    db: PathBuf,
    data_dir: PathBuf,
    starting_credits: Option<i64>,
    min_job_cost: Option<i64>,
) -> Result<()> {
    let mut cfg = ManagerConfig::default();
    if let Some(h) = host {
        cfg.host = h;
    }
    if let Some(p) = port {
        cfg.port = p;
    }
    cfg.db_path = db;
    cfg.data_dir = data_dir;
    if let Some(c) = starting_credits {
        cfg.starting_credits = c;
    }
    if let Some(m) = min_job_cost {
        cfg.min_job_cost = m;
    }

    let store = GridStore::open(
        &cfg.db_path,
        StoreOptions {
            starting_credits: cfg.starting_credits,
            min_job_cost: cfg.min_job_cost,
        },
    )
    .context("Store init failed")?;

    let server = ManagerServer::new(cfg, store);

    tokio::select! {
        result = server.run() => result,
        _ = signal::ctrl_c() => {
            log::warn!("🛑 Interrupt received. Manager shutting down.");
            Ok(())
        }
    }
}

// ============================================================================
// 4. RUNTIME: WORKER
// ============================================================================

async fn run_worker(
    manager: Option<String>,
    port: Option<u16>,
    name: Option<String>,
    user: Option<String>,
    no_container: bool,
    image: Option<String>,
) -> Result<()> {
    let mut cfg = WorkerConfig::default();
    if let Some(m) = manager {
        cfg.manager_host = m;
    }
    if let Some(p) = port {
        cfg.manager_port = p;
    }
    if let Some(n) = name {
        cfg.name = n;
    }
    if let Some(u) = user {
        cfg.owner_token = u;
    }
    if no_container {
        cfg.sandbox.use_container = false;
    }
    if let Some(img) = image {
        cfg.sandbox.image = img;
    }

    log::info!(
        "Connecting to manager {}:{} as '{}'",
        cfg.manager_host,
        cfg.manager_port,
        cfg.name
    );

    WorkerClient::new(cfg).run().await
}

// ============================================================================
// 5. SUBMITTER TOOLING
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn run_submit(
    db: PathBuf,
    user: String,
    title: String,
    file: PathBuf,
    requirements: Option<PathBuf>,
    cpu: u32,
    ram: f64,
    gpu: bool,
    priority: u8,
    timeout: u64,
) -> Result<()> {
    let store = GridStore::open(&db, StoreOptions::default())?;

    let submitter = store
        .get_user_by_username(&user)?
        .ok_or_else(|| anyhow!("Unknown user '{}'. Create one with add-user first.", user))?;

    let code = std::fs::read_to_string(&file)
        .with_context(|| format!("Cannot read job script {:?}", file))?;
    let reqs = match requirements {
        Some(path) => Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("Cannot read requirements {:?}", path))?,
        ),
        None => None,
    };

    let mut request = JobRequest::new(title, code);
    request.requirements = reqs;
    request.cpu_required = cpu;
    request.ram_required_gb = ram;
    request.gpu_required = gpu;
    request.priority = priority;
    request.timeout_seconds = timeout;

    let job = store.submit_job(submitter.id, &request)?;
    let balance = store
        .get_user(submitter.id)?
        .map(|u| u.credits)
        .unwrap_or_default();

    println!("Job submitted: {}", job.id);
    println!("  title:    {}", job.title);
    println!("  cost:     {} credits", job.credit_cost);
    println!("  balance:  {} credits remaining", balance);
    Ok(())
}

fn run_add_user(
    db: PathBuf,
    username: String,
    password: String,
    email: Option<String>,
    role: String,
) -> Result<()> {
    let role = Role::parse(&role).ok_or_else(|| anyhow!("Invalid role '{}'", role))?;
    let store = GridStore::open(&db, StoreOptions::default())?;
    let user = store.create_user(&username, &password, email.as_deref(), role)?;

    println!("User created: {} ({})", user.username, user.id);
    println!("  starting balance: {} credits", user.credits);
    Ok(())
}

fn run_status(db: PathBuf) -> Result<()> {
    let store = GridStore::open(&db, StoreOptions::default())?;

    let stats = store.queue_stats()?;
    println!("Jobs:");
    println!(
        "  pending {} | running {} | completed {} | failed {} (queue depth {})",
        stats.pending, stats.running, stats.completed, stats.failed, stats.queue_depth
    );

    println!("\nWorkers:");
    let workers = store.list_workers()?;
    if workers.is_empty() {
        println!("  (none registered)");
    }
    for w in workers {
        println!(
            "  {:<20} {:<8} {} cores | {:>5.1} GB | GPU: {:<12} | {} jobs, {} credits",
            w.name,
            w.status.as_str(),
            w.specs.cpu_cores,
            w.specs.ram_gb,
            w.specs.gpu_name.as_deref().unwrap_or("none"),
            w.jobs_completed,
            w.credits_earned,
        );
    }

    println!("\nRecent jobs:");
    for job in store.list_jobs(None, 10)? {
        println!(
            "  {} {:<9} p{} '{}'",
            job.id,
            job.status.as_str(),
            job.priority,
            job.title
        );
    }
    Ok(())
}
