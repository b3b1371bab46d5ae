use std::time::{Duration, Instant};

use mlpool_core::{Config, PoolError, PoolKey, PoolRegistry, RespawnPolicy, WorkerEvent, WorkerState};
use serde_json::json;

mod common;

use common::{kill_process, model, test_config, wait_for_event};

/// Announces readiness and exits straight away, every time it is started.
const CRASHING_WORKER: &str =
    r#"printf '%s\n' '{"id":0,"payload":{"type":"Ready","pid":0,"environment":null}}'; exit 1"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn killed_worker_is_replaced_and_requests_keep_succeeding() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workers = 2;
    let registry = PoolRegistry::start(test_config(temp.path(), workers))
        .await
        .expect("registry");
    let mut events = registry.subscribe();
    let adder = registry.load_model(model("adder", "sum")).await.expect("load");
    let pool = registry.find_pool(&adder).expect("pool");

    let before: Vec<u32> = pool.workers().keys().copied().collect();
    assert_eq!(before.len(), workers);
    let victim = before[0];
    kill_process(victim);

    let exited = wait_for_event(&mut events, Duration::from_secs(10), |event| {
        matches!(event, WorkerEvent::Exited { pid, expected: false, .. } if *pid == victim)
    })
    .await
    .expect("exit event for the killed worker");
    assert_eq!(exited.pool(), &PoolKey::Default);

    let respawned = wait_for_event(&mut events, Duration::from_secs(20), |event| {
        matches!(event, WorkerEvent::Respawned { old_pid, .. } if *old_pid == victim)
    })
    .await
    .expect("replacement worker");
    let replacement = respawned.pid().expect("pid");

    assert!(pool.wait_until_full(Duration::from_secs(10)).await);
    let after = pool.workers();
    assert_eq!(after.len(), workers);
    assert!(!after.contains_key(&victim));
    assert!(after.contains_key(&replacement));

    for round in 0..workers + 2 {
        let outputs = registry
            .predict(&adder, json!({ "inputs": [round, 1] }))
            .await
            .expect("predict after recovery");
        let expected = (round + 1) as f64;
        assert_eq!(outputs["total"], json!(expected));
    }
    registry.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_kill_during_a_request_is_retried_on_another_worker() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = PoolRegistry::start(test_config(temp.path(), 2))
        .await
        .expect("registry");
    let sleeper = registry.load_model(model("sleeper", "sleep")).await.expect("load");
    let pool = registry.find_pool(&sleeper).expect("pool");
    let pids: Vec<u32> = pool.workers().keys().copied().collect();

    let request = {
        let pool = pool.clone();
        let settings = sleeper.settings().clone();
        tokio::spawn(async move { pool.predict(&settings, json!({ "ms": 800 })).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    // Only one request is in flight, so exactly one worker is busy; killing
    // both guarantees the busy one dies and the retry lands on a replacement.
    for pid in pids {
        kill_process(pid);
    }

    let outputs = request
        .await
        .expect("join")
        .expect("request survives the crash");
    assert_eq!(outputs["ms"], 800);
    registry.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_run_in_parallel_across_workers() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = PoolRegistry::start(test_config(temp.path(), 2))
        .await
        .expect("registry");
    let sleeper = registry.load_model(model("sleeper", "sleep")).await.expect("load");
    let pool = registry.find_pool(&sleeper).expect("pool");

    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..2 {
        let pool = pool.clone();
        let settings = sleeper.settings().clone();
        handles.push(tokio::spawn(async move {
            pool.predict(&settings, json!({ "ms": 600 })).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("predict");
    }
    assert!(
        started.elapsed() < Duration::from_millis(1100),
        "two workers should serve two requests concurrently, took {:?}",
        started.elapsed()
    );
    registry.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hung_worker_times_out_and_is_replaced() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), 1).with_dispatch_timeout(Duration::from_millis(500));
    let registry = PoolRegistry::start(config).await.expect("registry");
    let mut events = registry.subscribe();
    let sleeper = registry.load_model(model("sleeper", "sleep")).await.expect("load");
    let pool = registry.find_pool(&sleeper).expect("pool");
    let hung = *pool.workers().keys().next().expect("worker");

    let err = registry
        .predict(&sleeper, json!({ "ms": 10_000 }))
        .await
        .expect_err("every attempt times out");
    assert!(matches!(err, PoolError::WorkerUnavailable { .. }), "{err}");

    wait_for_event(&mut events, Duration::from_secs(10), |event| {
        matches!(event, WorkerEvent::Exited { pid, expected: false, .. } if *pid == hung)
    })
    .await
    .expect("hung worker was killed");
    assert!(pool.wait_until_full(Duration::from_secs(20)).await);

    let outputs = registry
        .predict(&sleeper, json!({ "ms": 10 }))
        .await
        .expect("replacement serves");
    assert_eq!(outputs["ms"], 10);
    registry.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_beyond_the_queue_bound_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path(), 1).with_queue_depth(0);
    let registry = PoolRegistry::start(config).await.expect("registry");
    let sleeper = registry.load_model(model("sleeper", "sleep")).await.expect("load");
    let pool = registry.find_pool(&sleeper).expect("pool");

    let busy = {
        let pool = pool.clone();
        let settings = sleeper.settings().clone();
        tokio::spawn(async move { pool.predict(&settings, json!({ "ms": 700 })).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    let err = registry
        .predict(&sleeper, json!({ "ms": 1 }))
        .await
        .expect_err("queue is full");
    assert!(matches!(err, PoolError::QueueFull { depth: 0, .. }), "{err}");

    busy.await.expect("join").expect("first request completes");
    registry
        .predict(&sleeper, json!({ "ms": 1 }))
        .await
        .expect("capacity is back");
    registry.close().await.expect("close");
}

#[tokio::test]
async fn stopped_pools_reject_work_and_stop_twice() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = PoolRegistry::start(test_config(temp.path(), 1))
        .await
        .expect("registry");
    let mut events = registry.subscribe();
    let adder = registry.load_model(model("adder", "sum")).await.expect("load");
    let pool = registry.find_pool(&adder).expect("pool");

    pool.stop().await.expect("stop");
    pool.stop().await.expect("second stop is a no-op");
    assert!(pool.workers().is_empty());
    assert!(matches!(
        registry.predict(&adder, json!({ "inputs": [1] })).await,
        Err(PoolError::PoolStopped { .. })
    ));

    let exit = wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, WorkerEvent::Exited { .. })
    })
    .await
    .expect("exit event");
    assert!(matches!(exit, WorkerEvent::Exited { expected: true, .. }));
    registry.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_looping_slot_is_given_up() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = Config::new(temp.path().join("envs"), "sh")
        .with_worker_args(vec!["-c".to_string(), CRASHING_WORKER.to_string()])
        .with_parallel_workers(1)
        .with_startup_timeout(Duration::from_secs(5))
        .with_dispatch_timeout(Duration::from_secs(5))
        .with_respawn(RespawnPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_consecutive_failures: 2,
            stable_after: Duration::from_secs(60),
        });
    let registry = PoolRegistry::start(config).await.expect("registry");
    let mut events = registry.subscribe();

    let failed = wait_for_event(&mut events, Duration::from_secs(10), |event| {
        matches!(event, WorkerEvent::SlotFailed { .. })
    })
    .await
    .expect("slot reported failed");
    match failed {
        WorkerEvent::SlotFailed {
            pool,
            slot,
            failures,
            ..
        } => {
            assert_eq!(pool, PoolKey::Default);
            assert_eq!(slot, 0);
            assert_eq!(failures, 3);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let pool = registry.default_pool();
    assert!(pool.workers().is_empty());
    let adder = model("adder", "sum");
    assert!(matches!(
        pool.predict(&adder, json!({ "inputs": [1] })).await,
        Err(PoolError::WorkerUnavailable { .. })
    ));
    assert!(matches!(
        registry.load_model(adder).await,
        Err(PoolError::WorkerUnavailable { .. })
    ));
    assert_eq!(pool.refcount(), 0, "a model no worker accepted stays unbound");
    registry.close().await.expect("close");
}

#[tokio::test]
async fn worker_state_follows_requests() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = PoolRegistry::start(test_config(temp.path(), 1))
        .await
        .expect("registry");
    let worker = registry
        .default_pool()
        .workers()
        .into_values()
        .next()
        .expect("worker");
    assert_eq!(worker.state(), WorkerState::Ready);

    let adder = registry.load_model(model("adder", "sum")).await.expect("load");
    registry
        .predict(&adder, json!({ "inputs": [1, 2] }))
        .await
        .expect("predict");
    assert_eq!(worker.state(), WorkerState::Idle);

    registry.close().await.expect("close");
    assert_eq!(worker.state(), WorkerState::Dead);
    assert!(!worker.is_alive());
}
