//! # Runtime Integration Tests
//!
//! End-to-end scenarios over the assembled core with the mock invoker:
//! dependency chains, version preservation, two-phase end-of-app,
//! blocked constraints, cancellation, timeouts and open/close/delete
//! file lifecycles.

use std::sync::Arc;
use std::time::Duration;

use vela::config::{ProjectConfig, ResourcesConfig};
use vela::invoker::MockBehavior;
use vela::{
    AppState, Constraints, DataId, DataLocation, Direction, Implementation, MockInvoker,
    OnFailure, Parameter, Runtime, RuntimeConfig, TaskDescriptor, TaskFlags,
};

// ============================================================================
// TEST HELPERS
// ============================================================================

fn fleet_config(home: &std::path::Path, workers: usize, cores: u32) -> RuntimeConfig {
    let mut project = String::from("workers:\n");
    let mut resources = String::from("hosts:\n");
    for i in 1..=workers {
        project.push_str(&format!(
            "  - name: w{i}\n    host: h{i}\n    working_dir: {}/w{i}\n",
            home.display()
        ));
        resources.push_str(&format!(
            "  - host: h{i}\n    processors:\n      - name: main\n        architecture: x86_64\n        cores: {cores}\n    memory_gb: 32\n",
        ));
    }
    RuntimeConfig::new(
        home,
        ProjectConfig::from_yaml(&project).unwrap(),
        ResourcesConfig::from_yaml(&resources).unwrap(),
    )
}

fn write_task(data: &str) -> TaskDescriptor {
    TaskDescriptor::new(format!("gen.write({})", data))
        .with_implementation(Implementation::method("Gen", "write"))
        .with_parameter(Parameter::new(DataId::new(data).unwrap(), Direction::Out))
}

fn read_task(data: &str) -> TaskDescriptor {
    TaskDescriptor::new(format!("gen.read({})", data))
        .with_implementation(Implementation::method("Gen", "read"))
        .with_parameter(Parameter::new(DataId::new(data).unwrap(), Direction::In))
}

fn update_task(data: &str) -> TaskDescriptor {
    TaskDescriptor::new(format!("gen.update({})", data))
        .with_implementation(Implementation::method("Gen", "update"))
        .with_parameter(Parameter::new(DataId::new(data).unwrap(), Direction::InOut))
}

// ============================================================================
// DEPENDENCY SCENARIOS
// ============================================================================

#[tokio::test]
async fn linear_chain_runs_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = Arc::new(MockInvoker::new());
    invoker.behave(
        "gen.write(d)",
        MockBehavior {
            latency: Duration::from_millis(100),
            ..MockBehavior::default()
        },
    );
    let runtime =
        Runtime::start_with(fleet_config(dir.path(), 1, 4), invoker.clone(), None).unwrap();
    let app = runtime.register_app();

    // The reader can only succeed if the writer's replica exists first
    runtime.submit(app, write_task("d")).await.unwrap();
    runtime.submit(app, read_task("d")).await.unwrap();
    runtime.barrier(app).await.unwrap();

    assert_eq!(invoker.execution_count(), 2);
    // Version 1 of d was materialized in the worker sandbox
    let instance = vela::DataInstanceId::new(DataId::new("d").unwrap(), vela::Version::FIRST);
    assert!(!runtime.store().locations(&instance).is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn read_write_preserves_the_read_version_for_other_readers() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::start(fleet_config(dir.path(), 1, 4)).unwrap();
    let app = runtime.register_app();

    runtime.submit(app, write_task("d")).await.unwrap();
    runtime.submit(app, read_task("d")).await.unwrap();
    runtime.submit(app, read_task("d")).await.unwrap();
    runtime.submit(app, update_task("d")).await.unwrap();
    runtime.barrier(app).await.unwrap();

    // Version 2 exists after the in-out task
    let v2 = vela::DataInstanceId::new(DataId::new("d").unwrap(), vela::Version::new(2));
    assert!(!runtime.store().locations(&v2).is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn group_barrier_waits_only_for_its_group() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = Arc::new(MockInvoker::new());
    invoker.behave(
        "gen.write(slow)",
        MockBehavior {
            latency: Duration::from_secs(5),
            ..MockBehavior::default()
        },
    );
    let runtime =
        Runtime::start_with(fleet_config(dir.path(), 1, 4), invoker.clone(), None).unwrap();
    let app = runtime.register_app();
    let group = vela::GroupName::new("fast").unwrap();

    // The slow ungrouped task must not hold the group barrier
    runtime.submit(app, write_task("slow")).await.unwrap();
    runtime
        .submit(app, write_task("fast-d").with_group(group.clone()))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), runtime.barrier_group(app, group))
        .await
        .expect("group barrier must not wait for the slow task")
        .unwrap();
    runtime.cancel_app(app).await.unwrap();
    runtime.shutdown().await;
}

// ============================================================================
// END OF APP
// ============================================================================

#[tokio::test]
async fn end_of_app_stalls_until_all_hundred_tasks_finish() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = Arc::new(MockInvoker::new());
    for i in 0..100 {
        invoker.behave(
            format!("gen.write(d{})", i),
            MockBehavior {
                latency: Duration::from_millis(30),
                ..MockBehavior::default()
            },
        );
    }
    let runtime = Arc::new(
        Runtime::start_with(fleet_config(dir.path(), 2, 4), invoker.clone(), None).unwrap(),
    );
    let app = runtime.register_app();

    for i in 0..100 {
        runtime.submit(app, write_task(&format!("d{}", i))).await.unwrap();
    }

    let end = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.end_of_app(app).await })
    };

    // While draining, the app reports Stalled and submissions bounce
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = runtime.inspect(app).await.unwrap();
    assert_eq!(snapshot.state, Some(AppState::Stalled));
    assert!(snapshot.outstanding > 0);
    assert!(runtime.submit(app, write_task("late")).await.is_err());

    end.await.unwrap().unwrap();
    let snapshot = runtime.inspect(app).await.unwrap();
    assert_eq!(snapshot.state, Some(AppState::Terminated));
    assert_eq!(snapshot.outstanding, 0);
    assert_eq!(invoker.execution_count(), 100);
    runtime.shutdown().await;
}

#[tokio::test]
async fn end_of_app_on_idle_app_returns_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::start(fleet_config(dir.path(), 1, 4)).unwrap();
    let app = runtime.register_app();
    runtime.end_of_app(app).await.unwrap();
    assert!(runtime.submit(app, write_task("d")).await.is_err());
    runtime.shutdown().await;
}

// ============================================================================
// CONSTRAINTS AND BLOCKING
// ============================================================================

#[tokio::test]
async fn impossible_constraints_block_only_their_app() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = Arc::new(MockInvoker::new());
    let runtime =
        Runtime::start_with(fleet_config(dir.path(), 1, 4), invoker.clone(), None).unwrap();

    let stuck = runtime.register_app();
    let descriptor = TaskDescriptor::new("huge.run")
        .with_implementation(
            Implementation::method("Huge", "run")
                .with_constraints(Constraints::one_core().with_cores(999)),
        )
        .with_parameter(Parameter::new(DataId::new("big").unwrap(), Direction::Out));
    runtime.submit(stuck, descriptor).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = runtime.inspect(stuck).await.unwrap();
    assert!(snapshot.blocked, "999 cores can never dispatch on 4");
    assert_eq!(snapshot.outstanding, 1);

    // A healthy app on the same fleet is unaffected
    let healthy = runtime.register_app();
    runtime.submit(healthy, write_task("ok")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), runtime.barrier(healthy))
        .await
        .expect("healthy app must drain")
        .unwrap();

    assert!(invoker.executed_on(vela::TaskId::new(1)).is_none());
    runtime.shutdown().await;
}

// ============================================================================
// FAILURE POLICIES
// ============================================================================

#[tokio::test]
async fn retry_policy_reruns_flaky_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = Arc::new(MockInvoker::new());
    invoker.behave(
        "gen.write(d)",
        MockBehavior {
            fail_first: 2,
            ..MockBehavior::default()
        },
    );
    let runtime =
        Runtime::start_with(fleet_config(dir.path(), 1, 4), invoker.clone(), None).unwrap();
    let app = runtime.register_app();

    runtime.submit(app, write_task("d")).await.unwrap();
    runtime.barrier(app).await.unwrap();

    assert_eq!(invoker.attempts("gen.write(d)"), 3, "two failures, one success");
    runtime.shutdown().await;
}

#[tokio::test]
async fn timeout_converts_to_terminal_failure() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = Arc::new(MockInvoker::new());
    invoker.behave(
        "gen.write(d)",
        MockBehavior {
            latency: Duration::from_secs(60),
            ..MockBehavior::default()
        },
    );
    let runtime =
        Runtime::start_with(fleet_config(dir.path(), 1, 4), invoker.clone(), None).unwrap();
    let app = runtime.register_app();

    let flags = TaskFlags {
        timeout: Some(Duration::from_millis(50)),
        on_failure: OnFailure::Fail,
        max_retries: 0,
        ..TaskFlags::default()
    };
    runtime
        .submit(app, write_task("d").with_flags(flags))
        .await
        .unwrap();

    // The barrier releases once the timeout fires, not after a minute,
    // and carries the Fail-policy failure
    let result = tokio::time::timeout(Duration::from_secs(5), runtime.barrier(app))
        .await
        .expect("timeout must make the task terminal");
    assert!(result.is_err(), "Fail policy surfaces on the barrier");
    runtime.shutdown().await;
}

#[tokio::test]
async fn fail_policy_raises_an_app_level_failure() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = Arc::new(MockInvoker::new());
    invoker.behave(
        "gen.write(d)",
        MockBehavior {
            fail_first: u32::MAX,
            ..MockBehavior::default()
        },
    );
    let runtime =
        Runtime::start_with(fleet_config(dir.path(), 1, 4), invoker.clone(), None).unwrap();
    let app = runtime.register_app();

    let flags = TaskFlags {
        on_failure: OnFailure::Fail,
        max_retries: 0,
        ..TaskFlags::default()
    };
    runtime
        .submit(app, write_task("d").with_flags(flags))
        .await
        .unwrap();

    let err = runtime.barrier(app).await.unwrap_err();
    assert!(matches!(
        err,
        vela::RuntimeError::App(vela::AppError::Failed(_))
    ));

    // The failure sticks: later barriers fail immediately
    assert!(runtime.barrier(app).await.is_err());

    // An unrelated application on the same fleet is untouched
    let healthy = runtime.register_app();
    runtime.submit(healthy, write_task("ok")).await.unwrap();
    runtime.barrier(healthy).await.unwrap();
    runtime.shutdown().await;
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn cancel_fails_barriers_and_rejects_new_work() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = Arc::new(MockInvoker::new());
    invoker.behave(
        "gen.write(d)",
        MockBehavior {
            latency: Duration::from_secs(60),
            ..MockBehavior::default()
        },
    );
    let runtime = Arc::new(
        Runtime::start_with(fleet_config(dir.path(), 1, 4), invoker.clone(), None).unwrap(),
    );
    let app = runtime.register_app();
    runtime.submit(app, write_task("d")).await.unwrap();

    let barrier = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.barrier(app).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    runtime.cancel_app(app).await.unwrap();
    let result = barrier.await.unwrap();
    assert!(result.is_err(), "pending barrier fails with AppCancelled");

    assert!(runtime.submit(app, write_task("late")).await.is_err());
    runtime.shutdown().await;
}

// ============================================================================
// FILE LIFECYCLE
// ============================================================================

#[tokio::test]
async fn open_registered_file_returns_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::start(fleet_config(dir.path(), 1, 4)).unwrap();

    let path = dir.path().join("input.dat");
    std::fs::write(&path, b"payload").unwrap();
    let data = DataId::new("input.dat").unwrap();
    runtime
        .register_data(
            data.clone(),
            Some(DataLocation::private(vela::MASTER_HOST, &path)),
        )
        .await
        .unwrap();

    let opened = runtime.open_file(data.clone(), Direction::In).await.unwrap();
    assert_eq!(opened, path, "resident replica opens in place");
    runtime.close_file(data).await.unwrap();
    runtime.shutdown().await;
}

#[tokio::test]
async fn delete_defers_until_the_reader_closes() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::start(fleet_config(dir.path(), 1, 4)).unwrap();

    let path = dir.path().join("victim.dat");
    std::fs::write(&path, b"payload").unwrap();
    let data = DataId::new("victim.dat").unwrap();
    runtime
        .register_data(
            data.clone(),
            Some(DataLocation::private(vela::MASTER_HOST, &path)),
        )
        .await
        .unwrap();

    runtime.open_file(data.clone(), Direction::In).await.unwrap();
    runtime.delete(data.clone()).await.unwrap();
    // The reader still holds the file
    assert!(path.exists());

    runtime.close_file(data).await.unwrap();
    // Physical cleanup runs through the LOW queue; poll briefly
    for _ in 0..50 {
        if !path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!path.exists(), "deferred delete fires on last close");
    runtime.shutdown().await;
}

#[tokio::test]
async fn reading_unknown_data_is_a_typed_error() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::start(fleet_config(dir.path(), 1, 4)).unwrap();
    let err = runtime
        .open_file(DataId::new("ghost").unwrap(), Direction::In)
        .await
        .unwrap_err();
    assert!(matches!(err, vela::RuntimeError::Data(_)));
    runtime.shutdown().await;
}

// ============================================================================
// REDUCE
// ============================================================================

#[tokio::test]
async fn reduce_task_materializes_as_a_tree_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let invoker = Arc::new(MockInvoker::new());
    let runtime =
        Runtime::start_with(fleet_config(dir.path(), 2, 8), invoker.clone(), None).unwrap();
    let app = runtime.register_app();

    // Eight leaves first, so the reduce has instances to chew on
    for i in 0..8 {
        runtime
            .submit(app, write_task(&format!("part{}", i)))
            .await
            .unwrap();
    }

    let mut reduce = TaskDescriptor::new("sum.reduce")
        .with_implementation(Implementation::method("Sum", "reduce"));
    reduce.flags.is_reduce = true;
    reduce.flags.reduce_chunk_size = 2;
    for i in 0..8 {
        reduce = reduce.with_parameter(Parameter::new(
            DataId::new(format!("part{}", i)).unwrap(),
            Direction::In,
        ));
    }
    reduce = reduce.with_parameter(Parameter::new(DataId::new("total").unwrap(), Direction::Out));
    runtime.submit(app, reduce).await.unwrap();
    runtime.barrier(app).await.unwrap();

    // 8 leaf writers + 7 reduction nodes
    assert_eq!(invoker.execution_count(), 15);
    let total = vela::DataInstanceId::new(DataId::new("total").unwrap(), vela::Version::FIRST);
    assert!(!runtime.store().locations(&total).is_empty());
    runtime.shutdown().await;
}
