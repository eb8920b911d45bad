
use std::collections::HashSet;
use std::time::Duration;

use fleet_worker::job::JobRecord;
use fleet_worker::queue::InMemoryBroker;
use fleet_worker::status::JobStatus;
use fleet_worker::worker::{WorkerState, ABORTED_MESSAGE};
use tempfile::TempDir;
use test_harness::*;

#[tokio::test]
async fn test_successful_job_is_acked_with_one_success_report() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    let job = hello_world_job("1234567890");
    broker.publish_job(&shared_queue(), &job).unwrap();

    let supervisor = ScriptedSupervisor::always(Behavior::succeed_after(Duration::from_millis(200)));
    let summary = run_jobs(
        &broker,
        test_settings("vm123456", scratch.path()),
        supervisor.clone(),
        1,
    )
    .await;

    assert_eq!(summary.jobs_run, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);

    let reports = reports_for(&broker, "1234567890");
    assert_eq!(count_status(&reports, JobStatus::Success), 1);
    assert_eq!(count_status(&reports, JobStatus::Failed), 0);
    assert!(count_status(&reports, JobStatus::Running) >= 1);
    // Terminal report is last.
    assert_eq!(reports.last().unwrap().status, JobStatus::Success);
    assert_eq!(
        reports.last().unwrap().instance_id.as_deref(),
        Some("vm123456")
    );

    let acked = broker.acked();
    assert_eq!(acked.len(), 1);
    assert_eq!(acked[0].queue, shared_queue());
    assert!(broker.rejected().is_empty());
    assert_eq!(broker.in_flight(), 0);

    let calls = supervisor.invocations();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].workflow_path.to_str().unwrap(),
        "/workflows/Workflow_Bundle_HelloWorld_1.0-SNAPSHOT_SeqWare_1.1.0"
    );
}

#[tokio::test]
async fn test_failed_job_reports_exit_code_and_is_acked() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    broker
        .publish_job(&shared_queue(), &hello_world_job("job-42"))
        .unwrap();

    let summary = run_jobs(
        &broker,
        test_settings("vm1", scratch.path()),
        ScriptedSupervisor::always(Behavior::exit(42)),
        1,
    )
    .await;

    assert_eq!(summary.failed, 1);
    let reports = reports_for(&broker, "job-42");
    assert_eq!(count_status(&reports, JobStatus::Failed), 1);
    assert_eq!(count_status(&reports, JobStatus::Success), 0);
    let failed = reports.last().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.exit_code, Some(42));
    assert!(failed
        .message
        .as_deref()
        .unwrap()
        .contains("engine failed with 42"));
    assert_eq!(broker.acked().len(), 1);
    assert!(broker.rejected().is_empty());
}

#[tokio::test]
async fn test_poison_message_is_rejected_without_report() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    broker.publish(&shared_queue(), b"{ this is not a job".to_vec());
    broker.publish(&shared_queue(), br#"{"job_uuid":""}"#.to_vec());
    broker
        .publish_job(&shared_queue(), &hello_world_job("good"))
        .unwrap();

    let summary = run_jobs(
        &broker,
        test_settings("vm1", scratch.path()),
        ScriptedSupervisor::always(Behavior::succeed()),
        1,
    )
    .await;

    assert_eq!(summary.poison, 2);
    assert_eq!(summary.jobs_run, 1);

    let rejected = broker.rejected();
    assert_eq!(rejected.len(), 2);
    assert!(rejected.iter().all(|r| r.rejected == Some(false)));
    assert_eq!(broker.queue_len(&shared_queue()), 0);

    // Only the decodable job produced reports.
    let reports = broker.status_reports(&results_queue());
    assert!(reports.iter().all(|r| r.job_uuid == "good"));
}

#[tokio::test]
async fn test_launch_error_is_reported_failed_and_acked() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    broker
        .publish_job(&shared_queue(), &hello_world_job("no-engine"))
        .unwrap();

    let summary = run_jobs(
        &broker,
        test_settings("vm1", scratch.path()),
        ScriptedSupervisor::always(Behavior::LaunchFail),
        1,
    )
    .await;

    assert_eq!(summary.failed, 1);
    let reports = reports_for(&broker, "no-engine");
    let failed = reports.last().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.exit_code, None);
    assert!(failed.message.as_deref().unwrap().contains("fake-engine"));
    assert_eq!(broker.acked().len(), 1);
}

#[tokio::test]
async fn test_job_without_workflow_path_fails_without_launch() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    let job = JobRecord::with_uuid("empty").unwrap();
    broker.publish_job(&shared_queue(), &job).unwrap();

    let supervisor = ScriptedSupervisor::always(Behavior::succeed());
    run_jobs(
        &broker,
        test_settings("vm1", scratch.path()),
        supervisor.clone(),
        1,
    )
    .await;

    assert!(supervisor.invocations().is_empty());
    let reports = reports_for(&broker, "empty");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, JobStatus::Failed);
    assert_eq!(broker.acked().len(), 1);
}

#[tokio::test]
async fn test_parameter_file_contents_and_cleanup() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    broker
        .publish_job(&shared_queue(), &hello_world_job("params"))
        .unwrap();

    let supervisor = ScriptedSupervisor::always(Behavior::succeed());
    run_jobs(
        &broker,
        test_settings("vm1", scratch.path()),
        supervisor.clone(),
        1,
    )
    .await;

    let calls = supervisor.invocations();
    assert_eq!(calls.len(), 1);
    let mut lines: Vec<&str> = calls[0].parameters.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["param1=value1", "param2=value2"]);
    assert!(calls[0].parameter_file.starts_with(scratch.path()));

    assert!(!calls[0].parameter_file.exists());
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_parameter_file_removed_after_failure() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    broker
        .publish_job(&shared_queue(), &hello_world_job("fails"))
        .unwrap();

    let supervisor = ScriptedSupervisor::always(Behavior::exit(3));
    run_jobs(
        &broker,
        test_settings("vm1", scratch.path()),
        supervisor.clone(),
        1,
    )
    .await;

    assert!(!supervisor.invocations()[0].parameter_file.exists());
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_unwritable_scratch_dir_requeues_message() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let broker = InMemoryBroker::new();
    broker
        .publish_job(&shared_queue(), &hello_world_job("requeue-me"))
        .unwrap();

    let supervisor = ScriptedSupervisor::always(Behavior::succeed());
    let summary = run_jobs(
        &broker,
        test_settings("vm1", &blocker.join("scratch")),
        supervisor.clone(),
        1,
    )
    .await;

    assert_eq!(summary.requeued, 1);
    assert!(supervisor.invocations().is_empty());
    assert!(broker.status_reports(&results_queue()).is_empty());
    let rejected = broker.rejected();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].rejected, Some(true));
    // Back on the queue for another worker.
    assert_eq!(broker.queue_len(&shared_queue()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_cadence_during_long_job() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    broker
        .publish_job(&shared_queue(), &hello_world_job("long"))
        .unwrap();

    let mut settings = test_settings("vm1", scratch.path());
    settings.heartbeat_interval = Duration::from_millis(2500);
    let summary = run_jobs(
        &broker,
        settings,
        ScriptedSupervisor::always(Behavior::succeed_after(Duration::from_secs(6))),
        1,
    )
    .await;
    assert_eq!(summary.succeeded, 1);

    let reports = reports_for(&broker, "long");
    let terminal = reports
        .iter()
        .position(|r| r.status.is_terminal())
        .unwrap();
    assert_eq!(terminal, reports.len() - 1);
    let running_before_terminal = count_status(&reports[..terminal], JobStatus::Running);
    assert!(
        running_before_terminal >= 2,
        "expected at least 2 heartbeats, got {}",
        running_before_terminal
    );
}

#[tokio::test]
async fn test_status_publish_failures_do_not_fail_the_job() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    broker
        .publish_job(&shared_queue(), &hello_world_job("quiet"))
        .unwrap();
    broker.set_fail_publishes(true);

    let summary = run_jobs(
        &broker,
        test_settings("vm1", scratch.path()),
        ScriptedSupervisor::always(Behavior::succeed_after(Duration::from_millis(150))),
        1,
    )
    .await;

    assert_eq!(summary.succeeded, 1);
    assert_eq!(broker.acked().len(), 1);
    assert!(broker.status_reports(&results_queue()).is_empty());
}

#[tokio::test]
async fn test_stop_during_run_reports_aborted() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    broker
        .publish_job(&shared_queue(), &hello_world_job("abort-me"))
        .unwrap();
    broker
        .publish_job(&shared_queue(), &hello_world_job("never-started"))
        .unwrap();

    let supervisor = ScriptedSupervisor::always(Behavior::Hang);
    let worker = TestWorker::spawn(
        &broker,
        test_settings("vm1", scratch.path()),
        supervisor.clone(),
    );

    let mut state = worker.worker.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Running),
    )
    .await
    .expect("worker never started running")
    .unwrap();

    let summary = worker.stop(Duration::from_secs(5)).await;
    assert!(summary.aborted);
    assert_eq!(summary.failed, 1);

    let reports = reports_for(&broker, "abort-me");
    let last = reports.last().unwrap();
    assert_eq!(last.status, JobStatus::Failed);
    assert_eq!(last.message.as_deref(), Some(ABORTED_MESSAGE));
    assert_eq!(count_status(&reports, JobStatus::Failed), 1);

    // The aborted job is acked; the second one was never touched.
    assert_eq!(broker.acked().len(), 1);
    assert_eq!(broker.queue_len(&shared_queue()), 1);
    assert!(reports_for(&broker, "never-started").is_empty());
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_stop_while_idle_exits_cleanly() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    let worker = TestWorker::spawn(
        &broker,
        test_settings("vm1", scratch.path()),
        ScriptedSupervisor::always(Behavior::succeed()),
    );

    let mut state = worker.worker.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == WorkerState::Fetching),
    )
    .await
    .unwrap()
    .unwrap();

    let summary = worker.stop(Duration::from_secs(5)).await;
    assert_eq!(summary.jobs_run, 0);
    assert!(!summary.aborted);
    assert!(broker.settled().is_empty());
}

#[tokio::test]
async fn test_long_preworker_sleep_is_interrupted_by_stop() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    let mut settings = test_settings("vm1", scratch.path());
    settings.preworker_sleep = Duration::from_secs(3600);
    let worker = TestWorker::spawn(
        &broker,
        settings,
        ScriptedSupervisor::always(Behavior::succeed()),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = worker.stop(Duration::from_secs(5)).await;
    assert_eq!(summary.jobs_run, 0);
}

#[tokio::test]
async fn test_closed_broker_ends_the_loop() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    let worker = TestWorker::spawn(
        &broker,
        test_settings("vm1", scratch.path()),
        ScriptedSupervisor::always(Behavior::succeed()),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.close();
    let summary = worker.join(Duration::from_secs(5)).await;
    assert_eq!(summary.jobs_run, 0);
}

#[tokio::test]
async fn test_max_runs_stops_after_limit() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    for i in 0..5 {
        broker
            .publish_job(&shared_queue(), &hello_world_job(&format!("job-{}", i)))
            .unwrap();
    }

    let summary = run_jobs(
        &broker,
        test_settings("vm1", scratch.path()),
        ScriptedSupervisor::always(Behavior::succeed()),
        3,
    )
    .await;

    assert_eq!(summary.jobs_run, 3);
    assert_eq!(broker.acked().len(), 3);
    assert_eq!(broker.queue_len(&shared_queue()), 2);
    // FIFO order is preserved for a single consumer.
    let acked: Vec<String> = broker
        .acked()
        .iter()
        .map(|s| JobRecord::from_json_bytes(&s.payload).unwrap().uuid().to_string())
        .collect();
    assert_eq!(acked, vec!["job-0", "job-1", "job-2"]);
}

#[tokio::test]
async fn test_mixed_outcomes_keep_the_worker_alive() {
    let scratch = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    let paths = ["/wf/ok", "/wf/exit7", "/wf/missing", "/wf/ok2"];
    for (i, path) in paths.iter().enumerate() {
        let job = hello_world_job(&format!("mixed-{}", i)).with_workflow_path(*path);
        broker.publish_job(&shared_queue(), &job).unwrap();
    }
    broker.publish(&shared_queue(), b"garbage".to_vec());

    let supervisor = ScriptedSupervisor::new(|path| match path.to_str().unwrap() {
        "/wf/exit7" => Behavior::exit(7),
        "/wf/missing" => Behavior::LaunchFail,
        _ => Behavior::succeed(),
    });
    let worker = TestWorker::spawn(
        &broker,
        test_settings("vm1", scratch.path()),
        supervisor.clone(),
    );
    assert!(wait_until(Duration::from_secs(10), || broker.settled().len() == 5).await);
    let summary = worker.stop(Duration::from_secs(5)).await;

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.poison, 1);
    assert_eq!(supervisor.max_concurrent(), 1);
    assert_eq!(
        reports_for(&broker, "mixed-1").last().unwrap().exit_code,
        Some(7)
    );
}

#[tokio::test]
async fn test_instance_queue_targets_one_worker() {
    let scratch_a = TempDir::new().unwrap();
    let scratch_b = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    broker
        .publish_job(&instance_queue("vm-b"), &hello_world_job("directed"))
        .unwrap();

    let worker_a = TestWorker::spawn(
        &broker,
        test_settings("vm-a", scratch_a.path()),
        ScriptedSupervisor::always(Behavior::succeed()),
    );
    let worker_b = TestWorker::spawn(
        &broker,
        test_settings("vm-b", scratch_b.path()),
        ScriptedSupervisor::always(Behavior::succeed()),
    );

    assert!(wait_until(Duration::from_secs(5), || broker.acked().len() == 1).await);
    let summary_a = worker_a.stop(Duration::from_secs(5)).await;
    let summary_b = worker_b.stop(Duration::from_secs(5)).await;

    assert_eq!(summary_a.jobs_run, 0);
    assert_eq!(summary_b.jobs_run, 1);
    let reports = reports_for(&broker, "directed");
    assert!(reports
        .iter()
        .all(|r| r.instance_id.as_deref() == Some("vm-b")));
}

#[tokio::test]
async fn test_concurrent_workers_never_share_a_message() {
    let broker = InMemoryBroker::new();
    let total = 20;
    for i in 0..total {
        broker
            .publish_job(&shared_queue(), &hello_world_job(&format!("fleet-{}", i)))
            .unwrap();
    }

    let scratches: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let workers: Vec<TestWorker> = scratches
        .iter()
        .enumerate()
        .map(|(i, scratch)| {
            TestWorker::spawn(
                &broker,
                test_settings(&format!("vm-{}", i), scratch.path()),
                ScriptedSupervisor::always(Behavior::succeed_after(Duration::from_millis(10))),
            )
        })
        .collect();

    assert!(wait_until(Duration::from_secs(20), || broker.acked().len() == total).await);
    let mut jobs_run = 0;
    for worker in workers {
        jobs_run += worker.stop(Duration::from_secs(5)).await.jobs_run;
    }
    assert_eq!(jobs_run, total as u64);

    let acked = broker.acked();
    let tags: HashSet<u64> = acked.iter().map(|s| s.tag).collect();
    assert_eq!(tags.len(), total);
    let uuids: HashSet<String> = acked
        .iter()
        .map(|s| JobRecord::from_json_bytes(&s.payload).unwrap().uuid().to_string())
        .collect();
    assert_eq!(uuids.len(), total);

    for i in 0..total {
        let reports = reports_for(&broker, &format!("fleet-{}", i));
        assert_eq!(count_status(&reports, JobStatus::Success), 1);
    }
}
