// tests/manager_sessions.rs
//
// The session state machine over real sockets: registration, dispatch,
// result ingest with artifact hygiene, protocol violations, and the
// heartbeat-timeout sweep.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use campusgrid::config::ManagerConfig;
use campusgrid::core::{JobRequest, OutputFile, Role, WorkerSpecs, WorkerStatus};
use campusgrid::manager::ManagerServer;
use campusgrid::protocol::{FramedStream, Message};
use campusgrid::store::{GridStore, StoreOptions};
use campusgrid::JobStatus;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

struct TestGrid {
    addr: SocketAddr,
    db: PathBuf,
    data_dir: PathBuf,
}

impl TestGrid {
    /// Boot a manager on an ephemeral port with a fast health sweep.
    async fn start(dir: &tempfile::TempDir, heartbeat_timeout: Duration) -> Self {
        let db = dir.path().join("grid.db");
        let data_dir = dir.path().to_path_buf();

        let mut cfg = ManagerConfig::default();
        cfg.db_path = db.clone();
        cfg.data_dir = data_dir.clone();
        cfg.heartbeat_timeout = heartbeat_timeout;
        cfg.health_check_interval = Duration::from_millis(100);

        let store = GridStore::open(&db, StoreOptions::default()).unwrap();
        let server = ManagerServer::new(cfg, store);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));

        Self { addr, db, data_dir }
    }

    /// A second handle onto the same database, as the dashboard would use.
    fn store(&self) -> GridStore {
        GridStore::open(&self.db, StoreOptions::default()).unwrap()
    }
}

fn worker_specs() -> WorkerSpecs {
    WorkerSpecs {
        cpu_cores: 4,
        cpu_model: "Test CPU".into(),
        ram_gb: 8.0,
        gpu_name: None,
        gpu_memory_gb: None,
        has_docker: false,
    }
}

async fn register(addr: SocketAddr, owner_token: &str) -> (FramedStream<TcpStream>, Uuid) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = FramedStream::new(stream);
    framed
        .send(&Message::Register {
            name: "test-worker".into(),
            owner_token: owner_token.into(),
            specs: worker_specs(),
        })
        .await
        .unwrap();

    match framed.recv().await.unwrap() {
        Some(Message::Registered { worker_id, .. }) => (framed, worker_id),
        other => panic!("expected registered, got {:?}", other),
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn registration_then_empty_queue_poll() {
    let dir = tempfile::tempdir().unwrap();
    let grid = TestGrid::start(&dir, Duration::from_secs(60)).await;

    let (mut framed, worker_id) = register(grid.addr, "").await;

    let workers = grid.store().list_workers().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].id, worker_id);
    assert_eq!(workers[0].status, WorkerStatus::Online);

    framed.send(&Message::RequestJob { worker_id }).await.unwrap();
    assert_eq!(framed.recv().await.unwrap(), Some(Message::NoJob));
}

#[tokio::test]
async fn full_job_round_trip_with_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let grid = TestGrid::start(&dir, Duration::from_secs(60)).await;
    let store = grid.store();

    let submitter = store.create_user("alice", "pw", None, Role::User).unwrap();
    store.create_user("bob", "pw", None, Role::Worker).unwrap();

    let job = store
        .submit_job(submitter.id, &JobRequest::new("hello", "print('hi')"))
        .unwrap();

    let (mut framed, worker_id) = register(grid.addr, "bob").await;

    framed.send(&Message::RequestJob { worker_id }).await.unwrap();
    let assignment = framed.recv().await.unwrap().expect("assignment expected");
    match &assignment {
        Message::Job { job_id, title, code, .. } => {
            assert_eq!(*job_id, job.id);
            assert_eq!(title, "hello");
            assert_eq!(code, "print('hi')");
        }
        other => panic!("expected a job, got {:?}", other),
    }
    assert_eq!(
        store.get_job(job.id).unwrap().unwrap().status,
        JobStatus::Running
    );

    framed
        .send(&Message::JobResult {
            job_id: job.id,
            worker_id,
            success: true,
            output: "hi\n".into(),
            error: None,
            files: vec![
                OutputFile {
                    filename: "report.txt".into(),
                    size: 11,
                    content: BASE64.encode(b"hello world"),
                },
                OutputFile {
                    filename: "../evil.txt".into(),
                    size: 4,
                    content: BASE64.encode(b"evil"),
                },
            ],
            execution_time: 0.5,
        })
        .await
        .unwrap();
    assert_eq!(
        framed.recv().await.unwrap(),
        Some(Message::JobReceived { job_id: job.id })
    );

    let done = store.get_job(job.id).unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result_output.as_deref(), Some("hi\n"));

    // The honest artifact landed; the traversal attempt did not.
    let out_dir = grid.data_dir.join("job_outputs").join(job.id.to_string());
    assert_eq!(
        std::fs::read(out_dir.join("report.txt")).unwrap(),
        b"hello world"
    );
    assert!(!grid.data_dir.join("job_outputs").join("evil.txt").exists());
    assert!(!out_dir.join("evil.txt").exists());

    // Owner got paid.
    let bob = store.get_user_by_username("bob").unwrap().unwrap();
    assert_eq!(bob.credits, 100 + job.credit_reward);
}

#[tokio::test]
async fn first_message_must_be_register() {
    let dir = tempfile::tempdir().unwrap();
    let grid = TestGrid::start(&dir, Duration::from_secs(60)).await;

    let stream = TcpStream::connect(grid.addr).await.unwrap();
    let mut framed = FramedStream::new(stream);
    framed
        .send(&Message::Heartbeat {
            worker_id: Uuid::new_v4(),
            status: "idle".into(),
        })
        .await
        .unwrap();

    // The manager hangs up without answering.
    assert!(framed.recv().await.unwrap().is_none());
    assert_eq!(grid.store().list_workers().unwrap().len(), 0);
}

#[tokio::test]
async fn explicit_disconnect_marks_worker_offline() {
    let dir = tempfile::tempdir().unwrap();
    let grid = TestGrid::start(&dir, Duration::from_secs(60)).await;
    let store = grid.store();

    let (mut framed, worker_id) = register(grid.addr, "").await;
    framed.send(&Message::Disconnect).await.unwrap();

    assert!(
        wait_for(
            || {
                store
                    .get_worker(worker_id)
                    .unwrap()
                    .map(|w| w.status == WorkerStatus::Offline)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        )
        .await,
        "worker should be durably offline after a goodbye"
    );
}

#[tokio::test]
async fn silent_worker_is_swept_and_its_job_requeued() {
    let dir = tempfile::tempdir().unwrap();
    // Aggressive timeout so the sweep fires within the test budget.
    let grid = TestGrid::start(&dir, Duration::from_millis(1500)).await;
    let store = grid.store();

    let submitter = store.create_user("alice", "pw", None, Role::User).unwrap();
    let job = store
        .submit_job(submitter.id, &JobRequest::new("doomed", "while True: pass"))
        .unwrap();

    let (mut framed, worker_id) = register(grid.addr, "").await;
    framed.send(&Message::RequestJob { worker_id }).await.unwrap();
    assert!(matches!(
        framed.recv().await.unwrap(),
        Some(Message::Job { .. })
    ));

    // Go silent: no heartbeats, no result. The monitor must kill the
    // session, mark us offline, and put the job back in the queue.
    assert!(
        wait_for(
            || {
                let worker_offline = store
                    .get_worker(worker_id)
                    .unwrap()
                    .map(|w| w.status == WorkerStatus::Offline)
                    .unwrap_or(false);
                let job_back = store
                    .get_job(job.id)
                    .unwrap()
                    .map(|j| j.status == JobStatus::Pending && j.requeue_count == 1)
                    .unwrap_or(false);
                worker_offline && job_back
            },
            Duration::from_secs(10),
        )
        .await,
        "silent worker should be swept and its job recovered"
    );

    // Our socket is dead too.
    assert!(matches!(framed.recv().await, Ok(None) | Err(_)));
}
