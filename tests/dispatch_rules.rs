// tests/dispatch_rules.rs
//
// The selection rule: priority beats age, FIFO within a priority, demands
// must fit the worker's specs, and a queue row is won by exactly one of
// any number of racing workers.

use campusgrid::core::{JobRequest, JobStatus, Role, WorkerSpecs};
use campusgrid::store::{GridStore, StoreError, StoreOptions};
use uuid::Uuid;

fn open_store(dir: &tempfile::TempDir) -> GridStore {
    GridStore::open(dir.path().join("grid.db"), StoreOptions::default())
        .expect("store should open")
}

fn specs(cpu: u32, ram: f64, gpu: Option<&str>) -> WorkerSpecs {
    WorkerSpecs {
        cpu_cores: cpu,
        cpu_model: "Test CPU".into(),
        ram_gb: ram,
        gpu_name: gpu.map(str::to_string),
        gpu_memory_gb: gpu.map(|_| 8.0),
        has_docker: false,
    }
}

fn submitter(store: &GridStore) -> Uuid {
    store
        .create_user("submitter", "pw", None, Role::User)
        .unwrap()
        .id
}

#[test]
fn higher_priority_dispatches_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let worker = store
        .register_worker("box", None, &specs(4, 8.0, None))
        .unwrap();

    let mut low = JobRequest::new("low", "pass");
    low.priority = 5;
    let mut high = JobRequest::new("high", "pass");
    high.priority = 9;

    // Submit the low-priority job first so age alone would favor it.
    store.submit_job(user, &low).unwrap();
    let high_job = store.submit_job(user, &high).unwrap();

    let picked = store.dispatch_job(worker).unwrap().unwrap();
    assert_eq!(picked.id, high_job.id);
}

#[test]
fn fifo_within_equal_priority() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let worker = store
        .register_worker("box", None, &specs(4, 8.0, None))
        .unwrap();

    let first = store
        .submit_job(user, &JobRequest::new("first", "pass"))
        .unwrap();
    let second = store
        .submit_job(user, &JobRequest::new("second", "pass"))
        .unwrap();

    assert_eq!(store.dispatch_job(worker).unwrap().unwrap().id, first.id);
    // Simulate completion so the worker can take the next one.
    store.complete_job(first.id, worker, true, "", None).unwrap();
    assert_eq!(store.dispatch_job(worker).unwrap().unwrap().id, second.id);
}

#[test]
fn gpu_jobs_never_reach_gpu_less_workers() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let no_gpu = store
        .register_worker("cpu-box", None, &specs(8, 16.0, None))
        .unwrap();

    let mut req = JobRequest::new("train", "pass");
    req.gpu_required = true;
    store.submit_job(user, &req).unwrap();

    assert!(store.dispatch_job(no_gpu).unwrap().is_none());
}

#[test]
fn capability_matching_scenario() {
    // W_A: 4 cores, 8 GB, no GPU. W_B: 2 cores, 4 GB, GPU.
    // J1 needs cpu=3; J2 needs gpu. Same priority; J1 queued first.
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let w_a = store
        .register_worker("W_A", None, &specs(4, 8.0, None))
        .unwrap();
    let w_b = store
        .register_worker("W_B", None, &specs(2, 4.0, Some("GTX 1080")))
        .unwrap();

    let mut j1 = JobRequest::new("J1", "pass");
    j1.cpu_required = 3;
    let mut j2 = JobRequest::new("J2", "pass");
    j2.gpu_required = true;
    let j1 = store.submit_job(user, &j1).unwrap();
    let j2 = store.submit_job(user, &j2).unwrap();

    // W_B asks first: J1 is older but needs 3 cores, so W_B gets J2.
    assert_eq!(store.dispatch_job(w_b).unwrap().unwrap().id, j2.id);
    // W_A takes J1.
    assert_eq!(store.dispatch_job(w_a).unwrap().unwrap().id, j1.id);
    // Queue is empty now.
    assert_eq!(store.queue_stats().unwrap().queue_depth, 0);
}

#[test]
fn oversized_demands_stay_queued() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let worker = store
        .register_worker("small", None, &specs(2, 2.0, None))
        .unwrap();

    let mut hungry = JobRequest::new("hungry", "pass");
    hungry.ram_required_gb = 16.0;
    store.submit_job(user, &hungry).unwrap();

    assert!(store.dispatch_job(worker).unwrap().is_none());
    assert_eq!(store.queue_stats().unwrap().queue_depth, 1);
}

#[test]
fn paused_workers_are_invisible_to_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let worker = store
        .register_worker("box", None, &specs(4, 8.0, None))
        .unwrap();
    store.submit_job(user, &JobRequest::new("j", "pass")).unwrap();

    store.pause_worker(worker).unwrap();
    assert!(store.dispatch_job(worker).unwrap().is_none());

    store.resume_worker(worker).unwrap();
    assert!(store.dispatch_job(worker).unwrap().is_some());
}

#[test]
fn unknown_worker_cannot_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    assert!(matches!(
        store.dispatch_job(Uuid::new_v4()),
        Err(StoreError::UnknownWorker(_))
    ));
}

#[test]
fn concurrent_dispatch_has_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let w_a = store
        .register_worker("W_A", None, &specs(4, 8.0, None))
        .unwrap();
    let w_b = store
        .register_worker("W_B", None, &specs(4, 8.0, None))
        .unwrap();

    store.submit_job(user, &JobRequest::new("only", "pass")).unwrap();

    let (a, b) = std::thread::scope(|s| {
        let ha = s.spawn(|| store.dispatch_job(w_a).unwrap().is_some());
        let hb = s.spawn(|| store.dispatch_job(w_b).unwrap().is_some());
        (ha.join().unwrap(), hb.join().unwrap())
    });

    assert!(a ^ b, "exactly one worker must win the queue row");
    assert_eq!(store.queue_stats().unwrap().queue_depth, 0);
    assert_eq!(store.queue_stats().unwrap().running, 1);
}

#[test]
fn terminal_jobs_never_reappear_in_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let worker = store
        .register_worker("box", None, &specs(4, 8.0, None))
        .unwrap();

    let job = store.submit_job(user, &JobRequest::new("j", "pass")).unwrap();
    store.dispatch_job(worker).unwrap().unwrap();
    store.complete_job(job.id, worker, true, "", None).unwrap();

    let stats = store.queue_stats().unwrap();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.completed, 1);
    // A second dispatch finds nothing.
    assert!(store.dispatch_job(worker).unwrap().is_none());
}

#[test]
fn orphaned_jobs_requeue_then_fail() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let worker = store
        .register_worker("flaky", None, &specs(4, 8.0, None))
        .unwrap();

    let job = store.submit_job(user, &JobRequest::new("unlucky", "pass")).unwrap();

    // Two disconnects put it back in the queue with its priority intact.
    for round in 1..=2 {
        store.dispatch_job(worker).unwrap().expect("dispatchable");
        let outcomes = store.requeue_worker_jobs(worker).unwrap();
        assert_eq!(outcomes, vec![(job.id, JobStatus::Pending)]);

        let j = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.requeue_count, round);
        assert!(j.worker_id.is_none());
        assert_eq!(store.queue_stats().unwrap().queue_depth, 1);
    }

    // The third strike exhausts the budget.
    store.dispatch_job(worker).unwrap().expect("dispatchable");
    let outcomes = store.requeue_worker_jobs(worker).unwrap();
    assert_eq!(outcomes, vec![(job.id, JobStatus::Failed)]);

    let j = store.get_job(job.id).unwrap().unwrap();
    assert_eq!(j.status, JobStatus::Failed);
    assert!(j.error_log.unwrap().contains("disconnected"));
    assert_eq!(store.queue_stats().unwrap().queue_depth, 0);
}

#[test]
fn stale_results_are_ignored_after_requeue() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let worker = store
        .register_worker("flaky", None, &specs(4, 8.0, None))
        .unwrap();

    let job = store.submit_job(user, &JobRequest::new("j", "pass")).unwrap();
    store.dispatch_job(worker).unwrap().unwrap();
    store.requeue_worker_jobs(worker).unwrap();

    // The old assignment's result arrives late: void, no state change.
    let applied = store
        .complete_job(job.id, worker, true, "late output", None)
        .unwrap();
    assert!(!applied);

    let j = store.get_job(job.id).unwrap().unwrap();
    assert_eq!(j.status, JobStatus::Pending);
    assert!(j.result_output.is_none());
}

#[test]
fn busy_workers_cannot_be_removed() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let user = submitter(&store);
    let worker = store
        .register_worker("box", None, &specs(4, 8.0, None))
        .unwrap();

    let job = store.submit_job(user, &JobRequest::new("j", "pass")).unwrap();
    store.dispatch_job(worker).unwrap().unwrap();

    assert!(matches!(
        store.remove_worker(worker),
        Err(StoreError::WorkerBusy(_))
    ));

    store.complete_job(job.id, worker, true, "", None).unwrap();
    store.remove_worker(worker).unwrap();
    assert!(store.get_worker(worker).unwrap().is_none());
}
