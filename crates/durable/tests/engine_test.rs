//! End-to-end engine tests on the in-memory databases
//!
//! These exercise the durable-execution contract: once-and-only-once
//! replay, deterministic child ids, FIFO messaging, step retry policies,
//! and transaction serialization-failure retry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;

use oxbow_durable::prelude::*;
use oxbow_durable::{AppDbError, MemoryAppTransaction, WorkflowStatusRecord};

struct Harness {
    engine: WorkflowEngine,
    system_db: Arc<MemorySystemDatabase>,
    app_db: Arc<MemoryAppDatabase>,
}

fn launch(registry: Registry) -> Harness {
    let system_db = Arc::new(MemorySystemDatabase::new());
    let app_db = Arc::new(MemoryAppDatabase::new());
    let engine = WorkflowEngine::launch(
        registry,
        system_db.clone(),
        app_db.clone(),
        EngineConfig::default().with_executor_id("test-executor"),
    );
    Harness {
        engine,
        system_db,
        app_db,
    }
}

fn pending_status(workflow_id: &str, name: &str) -> WorkflowStatusRecord {
    WorkflowStatusRecord {
        workflow_id: workflow_id.to_string(),
        status: WorkflowStatus::Pending,
        name: name.to_string(),
        class_name: None,
        config_name: None,
        output: None,
        error: None,
        app_id: None,
        app_version: None,
        executor_id: "crashed-executor".to_string(),
        request: None,
        recovery_attempts: 0,
        authenticated_user: None,
        authenticated_roles: vec![],
        assumed_role: None,
    }
}

/// Registry for the two-step workflow used by the basic and replay tests:
/// step one returns 10, step two returns 20, the workflow returns the sum.
fn two_step_registry(
    step_one_calls: Arc<AtomicU32>,
    step_two_calls: Arc<AtomicU32>,
) -> Registry {
    let mut registry = Registry::new();
    registry.step("step_one", StepRetryPolicy::default(), move |_ctx, _args| {
        let calls = step_one_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(10))
        }
    });
    registry.step("step_two", StepRetryPolicy::default(), move |_ctx, _args| {
        let calls = step_two_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(20))
        }
    });
    registry.workflow("combine", |ctx, args| async move {
        let first = ctx.run_step("step_one", args.clone()).await?;
        let second = ctx.run_step("step_two", args).await?;
        Ok(json!(first.as_i64().unwrap() + second.as_i64().unwrap()))
    });
    registry
}

#[test_log::test(tokio::test)]
async fn test_basic_durable_workflow() {
    let step_one_calls = Arc::new(AtomicU32::new(0));
    let step_two_calls = Arc::new(AtomicU32::new(0));
    let harness = launch(two_step_registry(step_one_calls.clone(), step_two_calls));

    let handle = harness
        .engine
        .start_workflow(
            "combine",
            json!({ "x": 5 }),
            StartOptions::default().with_workflow_id("wf-basic"),
        )
        .await
        .unwrap();
    assert_eq!(handle.workflow_id(), "wf-basic");

    let output = handle.result().await.unwrap();
    assert_eq!(output, json!(30));

    harness.engine.flush().await;
    let status = harness.engine.get_workflow_status("wf-basic").await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Success);
    assert_eq!(status.output, Some(json!(30)));

    let operations = harness.system_db.operation_results("wf-basic");
    assert_eq!(operations.len(), 2);
    assert_eq!(operations[0].function_id, 1);
    assert_eq!(operations[0].output, Some(json!(10)));
    assert_eq!(operations[1].function_id, 2);
    assert_eq!(operations[1].output, Some(json!(20)));
}

#[tokio::test]
async fn test_replay_skips_completed_steps() {
    let step_one_calls = Arc::new(AtomicU32::new(0));
    let step_two_calls = Arc::new(AtomicU32::new(0));
    let harness = launch(two_step_registry(
        step_one_calls.clone(),
        step_two_calls.clone(),
    ));

    // A previous execution crashed after recording step one: PENDING
    // status, inputs, and the first operation result are on disk.
    harness
        .system_db
        .insert_workflow_status(&pending_status("wf-crashed", "combine"), false)
        .await
        .unwrap();
    harness
        .system_db
        .update_workflow_inputs("wf-crashed", &json!({ "x": 5 }))
        .await
        .unwrap();
    harness
        .system_db
        .record_operation_result(&oxbow_durable::OperationResultRecord {
            workflow_id: "wf-crashed".to_string(),
            function_id: 1,
            output: Some(json!(10)),
            error: None,
        })
        .await
        .unwrap();

    let handle = harness.engine.recover_workflow("wf-crashed").await.unwrap();
    let output = handle.result().await.unwrap();
    assert_eq!(output, json!(30));

    // Step one replayed from its record; step two actually ran.
    assert_eq!(step_one_calls.load(Ordering::SeqCst), 0);
    assert_eq!(step_two_calls.load(Ordering::SeqCst), 1);

    harness.engine.flush().await;
    let status = harness
        .engine
        .get_workflow_status("wf-crashed")
        .await
        .unwrap();
    assert_eq!(status.status, WorkflowStatus::Success);
    assert_eq!(status.recovery_attempts, 1);
}

#[tokio::test]
async fn test_workflow_replay_returns_recorded_outcome_without_rerun() {
    let body_calls = Arc::new(AtomicU32::new(0));
    let mut registry = Registry::new();
    {
        let body_calls = body_calls.clone();
        registry.workflow("echo", move |_ctx, args| {
            let calls = body_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(args)
            }
        });
    }
    let harness = launch(registry);

    let options = StartOptions::default().with_workflow_id("wf-echo");
    let first = harness
        .engine
        .run_workflow("echo", json!("hello"), options.clone())
        .await
        .unwrap();
    assert_eq!(first, json!("hello"));
    harness.engine.flush().await;

    // Starting the same id again resolves from the terminal record.
    let second = harness
        .engine
        .run_workflow("echo", json!("hello"), options)
        .await
        .unwrap();
    assert_eq!(second, json!("hello"));
    assert_eq!(body_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_child_workflow_id_is_deterministic() {
    let mut registry = Registry::new();
    registry.workflow("child", |_ctx, args| async move { Ok(args) });
    registry.workflow("parent", |ctx, args| async move {
        ctx.run_workflow("child", args).await
    });
    let harness = launch(registry);

    let output = harness
        .engine
        .run_workflow(
            "parent",
            json!(7),
            StartOptions::default().with_workflow_id("p1"),
        )
        .await
        .unwrap();
    assert_eq!(output, json!(7));

    harness.engine.flush().await;
    let child_status = harness.engine.get_workflow_status("p1-1").await.unwrap();
    assert_eq!(child_status.status, WorkflowStatus::Success);
    assert_eq!(child_status.name, "child");
}

#[tokio::test]
async fn test_replayed_parent_does_not_rerun_completed_child() {
    let child_calls = Arc::new(AtomicU32::new(0));
    let mut registry = Registry::new();
    {
        let child_calls = child_calls.clone();
        registry.workflow("child", move |_ctx, args| {
            let calls = child_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(args)
            }
        });
    }
    registry.workflow("parent", |ctx, args| async move {
        ctx.run_workflow("child", args).await
    });
    let harness = launch(registry);

    // The child (deterministic id "p2-1") completed before the parent
    // crashed mid-flight.
    harness
        .engine
        .run_workflow(
            "child",
            json!(7),
            StartOptions::default().with_workflow_id("p2-1"),
        )
        .await
        .unwrap();
    harness.engine.flush().await;
    assert_eq!(child_calls.load(Ordering::SeqCst), 1);

    harness
        .system_db
        .insert_workflow_status(&pending_status("p2", "parent"), false)
        .await
        .unwrap();
    harness
        .system_db
        .update_workflow_inputs("p2", &json!(7))
        .await
        .unwrap();

    let handle = harness.engine.recover_workflow("p2").await.unwrap();
    assert_eq!(handle.result().await.unwrap(), json!(7));

    // The child call hit the existing completed row.
    assert_eq!(child_calls.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn test_send_recv_fifo_order() {
    let mut registry = Registry::new();
    registry.workflow("producer", |ctx, args| async move {
        let destination = args["destination"].as_str().unwrap().to_string();
        ctx.send(&destination, json!("a"), Some("t")).await?;
        ctx.send(&destination, json!("b"), Some("t")).await?;
        Ok(json!(null))
    });
    registry.workflow("consumer", |ctx, _args| async move {
        let first = ctx.recv(Some("t"), Duration::from_secs(5)).await?;
        let second = ctx.recv(Some("t"), Duration::from_secs(5)).await?;
        Ok(json!([first, second]))
    });
    let harness = launch(registry);

    let consumer = harness
        .engine
        .start_workflow(
            "consumer",
            json!({}),
            StartOptions::default().with_workflow_id("wf-consumer"),
        )
        .await
        .unwrap();

    harness
        .engine
        .run_workflow(
            "producer",
            json!({ "destination": "wf-consumer" }),
            StartOptions::default(),
        )
        .await
        .unwrap();

    let received = consumer.result().await.unwrap();
    assert_eq!(received, json!(["a", "b"]));
}

#[tokio::test(start_paused = true)]
async fn test_recv_timeout_returns_null_and_replays_instantly() {
    let mut registry = Registry::new();
    registry.workflow("waiter", |ctx, _args| async move {
        let message = ctx.recv(None, Duration::from_millis(200)).await?;
        Ok(json!(message))
    });
    let harness = launch(registry);

    let options = StartOptions::default().with_workflow_id("wf-waiter");
    let output = harness
        .engine
        .run_workflow("waiter", json!({}), options)
        .await
        .unwrap();
    assert_eq!(output, json!(null));

    // Recovery replays the recorded timeout without waiting again.
    let started = tokio::time::Instant::now();
    let handle = harness.engine.recover_workflow("wf-waiter").await.unwrap();
    assert_eq!(handle.result().await.unwrap(), json!(null));
    assert!(started.elapsed() < Duration::from_millis(150));
}

#[tokio::test(start_paused = true)]
async fn test_step_retries_exhausted() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = Registry::new();
    {
        let attempts = attempts.clone();
        registry.step(
            "always_fails",
            StepRetryPolicy::retrying()
                .with_max_attempts(3)
                .with_backoff_rate(2.0),
            move |_ctx, _args| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("downstream unavailable"))
                }
            },
        );
    }
    registry.workflow("fragile", |ctx, args| async move {
        ctx.run_step("always_fails", args).await
    });
    let harness = launch(registry);

    let started = tokio::time::Instant::now();
    let result = harness
        .engine
        .run_workflow(
            "fragile",
            json!({}),
            StartOptions::default().with_workflow_id("wf-fragile"),
        )
        .await;
    let elapsed = started.elapsed();

    // Three attempts, spaced 1s then 2s.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "elapsed {elapsed:?}");

    match result {
        Err(DurableError::MaxStepRetriesExceeded { step, attempts }) => {
            assert_eq!(step, "always_fails");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // The recorded error is the distinguished kind, not the last attempt's.
    let operations = harness.system_db.operation_results("wf-fragile");
    assert_eq!(operations.len(), 1);
    let recorded = SerializedError::from_value(operations[0].error.as_ref().unwrap());
    assert_eq!(recorded.kind, "max_step_retries_exceeded");

    // Replay re-raises the recorded error without running the step again.
    let replay = harness
        .engine
        .run_workflow(
            "fragile",
            json!({}),
            StartOptions::default().with_workflow_id("wf-fragile"),
        )
        .await;
    assert!(matches!(
        replay,
        Err(DurableError::MaxStepRetriesExceeded { .. })
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transaction_serialization_conflict_retries() {
    let body_runs = Arc::new(AtomicU32::new(0));
    let mut registry = Registry::new();
    {
        let body_runs = body_runs.clone();
        registry.transaction(
            "flaky_txn",
            IsolationLevel::Serializable,
            move |session, _args| {
                let runs = body_runs.clone();
                async move {
                    let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
                    if run <= 2 {
                        return Err(TxnError::Database(AppDbError::serialization_conflict()));
                    }
                    let txn = session
                        .downcast_mut::<MemoryAppTransaction>()
                        .expect("memory transaction");
                    txn.put("result", json!(7));
                    Ok(json!(7))
                }
                .boxed()
            },
        );
    }
    registry.workflow("reserve", |ctx, args| async move {
        ctx.run_transaction("flaky_txn", args).await
    });
    let harness = launch(registry);

    let started = tokio::time::Instant::now();
    let output = harness
        .engine
        .run_workflow(
            "reserve",
            json!({}),
            StartOptions::default().with_workflow_id("wf-reserve"),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(output, json!(7));
    assert_eq!(body_runs.load(Ordering::SeqCst), 3);

    // Two retries waited 1ms then 1.5ms.
    assert!(elapsed >= Duration::from_micros(2500), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(50), "elapsed {elapsed:?}");

    // The user writes and the result record committed exactly once.
    assert_eq!(harness.app_db.get("result"), Some(json!(7)));
    let results = harness.app_db.transaction_results("wf-reserve");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].output, Some(json!(7)));
}

#[tokio::test]
async fn test_transaction_replay_returns_recorded_output() {
    let body_runs = Arc::new(AtomicU32::new(0));
    let mut registry = Registry::new();
    {
        let body_runs = body_runs.clone();
        registry.transaction(
            "record_once",
            IsolationLevel::Serializable,
            move |session, _args| {
                let runs = body_runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    session
                        .downcast_mut::<MemoryAppTransaction>()
                        .unwrap()
                        .put("seen", json!(true));
                    Ok(json!("done"))
                }
                .boxed()
            },
        );
    }
    registry.workflow("txn_wf", |ctx, args| async move {
        ctx.run_transaction("record_once", args).await
    });
    let harness = launch(registry);

    harness
        .engine
        .run_workflow(
            "txn_wf",
            json!({}),
            StartOptions::default().with_workflow_id("wf-txn"),
        )
        .await
        .unwrap();

    // Simulate a crash before the terminal status flushed: recover by id.
    let handle = harness.engine.recover_workflow("wf-txn").await.unwrap();
    assert_eq!(handle.result().await.unwrap(), json!("done"));

    // The transaction body did not run a second time.
    assert_eq!(body_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bare_step_runs_under_temp_workflow() {
    let mut registry = Registry::new();
    registry.step("add_ten", StepRetryPolicy::default(), |_ctx, args| async move {
        Ok(json!(args.as_i64().unwrap() + 10))
    });
    let harness = launch(registry);

    let output = harness.engine.run_step("add_ten", json!(5)).await.unwrap();
    assert_eq!(output, json!(15));

    harness.engine.flush().await;
    // The call was recorded under its synthetic workflow umbrella.
    assert_eq!(harness.system_db.workflow_count(), 1);
}

#[tokio::test]
async fn test_bare_transaction_buffers_status_until_flush() {
    let mut registry = Registry::new();
    registry.transaction(
        "bump",
        IsolationLevel::Serializable,
        |session, _args| {
            async move {
                session
                    .downcast_mut::<MemoryAppTransaction>()
                    .unwrap()
                    .put("bumped", json!(1));
                Ok(json!(1))
            }
            .boxed()
        },
    );
    let harness = launch(registry);

    let output = harness.engine.run_transaction("bump", json!({})).await.unwrap();
    assert_eq!(output, json!(1));
    assert_eq!(harness.app_db.get("bumped"), Some(json!(1)));

    harness.engine.flush().await;
    // After the flush the single-transaction workflow has a terminal row.
    assert_eq!(harness.system_db.workflow_count(), 1);
}

#[tokio::test]
async fn test_nested_step_is_not_recorded() {
    let inner_calls = Arc::new(AtomicU32::new(0));
    let mut registry = Registry::new();
    {
        let inner_calls = inner_calls.clone();
        registry.step("inner", StepRetryPolicy::default(), move |_ctx, _args| {
            let calls = inner_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("inner"))
            }
        });
    }
    registry.step("outer", StepRetryPolicy::default(), |ctx, _args| async move {
        let inner = ctx.call_step("inner", json!({})).await?;
        Ok(json!({ "wrapped": inner }))
    });
    registry.workflow("nested", |ctx, args| async move {
        ctx.run_step("outer", args).await
    });
    let harness = launch(registry);

    let output = harness
        .engine
        .run_workflow(
            "nested",
            json!({}),
            StartOptions::default().with_workflow_id("wf-nested"),
        )
        .await
        .unwrap();
    assert_eq!(output, json!({ "wrapped": "inner" }));
    assert_eq!(inner_calls.load(Ordering::SeqCst), 1);

    // Only the outer step produced an operation record.
    let operations = harness.system_db.operation_results("wf-nested");
    assert_eq!(operations.len(), 1);
}

#[tokio::test]
async fn test_conflicting_starts_converge_to_one_result() {
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let executions = Arc::new(AtomicU32::new(0));
    let mut registry = Registry::new();
    {
        let barrier = barrier.clone();
        let executions = executions.clone();
        registry.step("race", StepRetryPolicy::default(), move |_ctx, _args| {
            let barrier = barrier.clone();
            let executions = executions.clone();
            async move {
                // Hold both executions inside the body so both try to
                // record the same (workflow_id, function_id).
                barrier.wait().await;
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(json!("winner"))
            }
        });
    }
    registry.workflow("racy", |ctx, args| async move {
        ctx.run_step("race", args).await
    });
    let harness = launch(registry);

    let options = StartOptions::default().with_workflow_id("wf-race");
    let first = harness
        .engine
        .start_workflow("racy", json!({}), options.clone())
        .await
        .unwrap();
    let second = harness
        .engine
        .start_workflow("racy", json!({}), options)
        .await
        .unwrap();

    let (a, b) = tokio::join!(first.result(), second.result());
    assert_eq!(a.unwrap(), json!("winner"));
    assert_eq!(b.unwrap(), json!("winner"));

    // Both bodies ran, but exactly one record exists.
    assert_eq!(executions.load(Ordering::SeqCst), 2);
    assert_eq!(harness.system_db.operation_results("wf-race").len(), 1);
}

#[tokio::test]
async fn test_events_inside_and_outside_workflows() {
    let mut registry = Registry::new();
    registry.workflow("publisher", |ctx, _args| async move {
        ctx.set_event("status", json!("ready")).await?;
        Ok(json!(null))
    });
    registry.workflow("watcher", |ctx, args| async move {
        let target = args["target"].as_str().unwrap().to_string();
        let value = ctx
            .get_event(&target, "status", Duration::from_secs(5))
            .await?;
        Ok(json!(value))
    });
    let harness = launch(registry);

    harness
        .engine
        .run_workflow(
            "publisher",
            json!({}),
            StartOptions::default().with_workflow_id("wf-pub"),
        )
        .await
        .unwrap();

    // Correlated read from inside a workflow.
    let watched = harness
        .engine
        .run_workflow(
            "watcher",
            json!({ "target": "wf-pub" }),
            StartOptions::default().with_workflow_id("wf-watch"),
        )
        .await
        .unwrap();
    assert_eq!(watched, json!("ready"));
    // The read and its timeout sleep each reserved a function id.
    let operations = harness.system_db.operation_results("wf-watch");
    assert_eq!(operations.len(), 2);

    // Uncorrelated read from outside any workflow.
    let outside = harness
        .engine
        .get_event("wf-pub", "status", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(outside, Some(json!("ready")));
}

#[tokio::test]
async fn test_bare_send_routes_through_temp_workflow() {
    let mut registry = Registry::new();
    registry.workflow("inbox", |ctx, _args| async move {
        let message = ctx.recv(None, Duration::from_secs(5)).await?;
        Ok(json!(message))
    });
    let harness = launch(registry);

    let inbox = harness
        .engine
        .start_workflow(
            "inbox",
            json!({}),
            StartOptions::default().with_workflow_id("wf-inbox"),
        )
        .await
        .unwrap();

    harness
        .engine
        .send("wf-inbox", json!("knock knock"), None)
        .await
        .unwrap();

    assert_eq!(inbox.result().await.unwrap(), json!("knock knock"));
}

#[tokio::test]
async fn test_workflow_error_is_recorded_and_replayed() {
    let body_calls = Arc::new(AtomicU32::new(0));
    let mut registry = Registry::new();
    {
        let body_calls = body_calls.clone();
        registry.workflow("doomed", move |_ctx, _args| {
            let calls = body_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DurableError::Application(SerializedError::application(
                    "invalid order",
                )))
            }
        });
    }
    let harness = launch(registry);

    let options = StartOptions::default().with_workflow_id("wf-doomed");
    let first = harness
        .engine
        .run_workflow("doomed", json!({}), options.clone())
        .await;
    assert!(matches!(first, Err(DurableError::Application(_))));

    // Errors are written synchronously, no flush needed.
    let status = harness.engine.get_workflow_status("wf-doomed").await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Error);
    assert!(status.output.is_none());
    assert!(status.error.is_some());

    // Replay re-raises the recorded error without running the body.
    let second = harness
        .engine
        .run_workflow("doomed", json!({}), options)
        .await;
    assert!(matches!(second, Err(DurableError::Application(_))));
    assert_eq!(body_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_method_workflow_rebinds_instance_on_recovery() {
    let mut registry = Registry::new();
    registry.method_workflow("counter_bump", "Counter", |_ctx, instance, _args| {
        async move {
            let counter = instance
                .downcast_ref::<AtomicU32>()
                .ok_or_else(|| DurableError::Internal("wrong instance type".to_string()))?;
            Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1))
        }
    });
    let shared = Arc::new(AtomicU32::new(0));
    registry.register_instance("Counter", "main", shared.clone());
    let harness = launch(registry);

    let output = harness
        .engine
        .run_workflow(
            "counter_bump",
            json!({}),
            StartOptions::default()
                .with_workflow_id("wf-counter")
                .with_config_name("main"),
        )
        .await
        .unwrap();
    assert_eq!(output, json!(1));
    assert_eq!(shared.load(Ordering::SeqCst), 1);

    harness.engine.flush().await;
    let status = harness
        .engine
        .get_workflow_status("wf-counter")
        .await
        .unwrap();
    assert_eq!(status.class_name.as_deref(), Some("Counter"));
    assert_eq!(status.config_name.as_deref(), Some("main"));

    // An interrupted sibling recovers against the registered instance.
    let mut crashed = pending_status("wf-counter-2", "counter_bump");
    crashed.class_name = Some("Counter".to_string());
    crashed.config_name = Some("main".to_string());
    harness
        .system_db
        .insert_workflow_status(&crashed, false)
        .await
        .unwrap();
    harness
        .system_db
        .update_workflow_inputs("wf-counter-2", &json!({}))
        .await
        .unwrap();

    let handle = harness
        .engine
        .recover_workflow("wf-counter-2")
        .await
        .unwrap();
    assert_eq!(handle.result().await.unwrap(), json!(2));
    assert_eq!(shared.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_recovery_failure_modes() {
    let mut registry = Registry::new();
    registry.workflow("known", |_ctx, args| async move { Ok(args) });
    let harness = launch(registry);

    // No status row at all.
    let missing = harness.engine.recover_workflow("wf-ghost").await;
    assert!(matches!(missing, Err(DurableError::Recovery { .. })));

    // Status without inputs.
    harness
        .system_db
        .insert_workflow_status(&pending_status("wf-inputless", "known"), false)
        .await
        .unwrap();
    let inputless = harness.engine.recover_workflow("wf-inputless").await;
    assert!(matches!(inputless, Err(DurableError::Recovery { .. })));

    // Status naming an unregistered function.
    harness
        .system_db
        .insert_workflow_status(&pending_status("wf-unknown", "not_registered"), false)
        .await
        .unwrap();
    harness
        .system_db
        .update_workflow_inputs("wf-unknown", &json!({}))
        .await
        .unwrap();
    let unknown = harness.engine.recover_workflow("wf-unknown").await;
    assert!(matches!(
        unknown,
        Err(DurableError::FunctionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_recovery_attempts_are_capped() {
    let mut registry = Registry::new();
    registry.workflow("looping", |_ctx, _args| async move {
        Err(DurableError::Application(SerializedError::application(
            "still failing",
        )))
    });
    let system_db = Arc::new(MemorySystemDatabase::new());
    let app_db = Arc::new(MemoryAppDatabase::new());
    let engine = WorkflowEngine::launch(
        registry,
        system_db.clone(),
        app_db,
        EngineConfig::default().with_max_recovery_attempts(2),
    );

    let mut status = pending_status("wf-looping", "looping");
    status.recovery_attempts = 2;
    system_db.insert_workflow_status(&status, false).await.unwrap();
    system_db
        .update_workflow_inputs("wf-looping", &json!({}))
        .await
        .unwrap();

    let result = engine.recover_workflow("wf-looping").await;
    assert!(matches!(
        result,
        Err(DurableError::WorkflowRetriesExceeded { attempts: 2, .. })
    ));

    // The workflow is terminally failed with the distinguished error kind.
    let row = engine.get_workflow_status("wf-looping").await.unwrap();
    assert_eq!(row.status, WorkflowStatus::Error);
    let recorded = SerializedError::from_value(row.error.as_ref().unwrap());
    assert_eq!(recorded.kind, "workflow_retries_exceeded");
}

#[tokio::test]
async fn test_required_roles_are_enforced() {
    let mut registry = Registry::new();
    registry.workflow_with_roles(
        "admin_only",
        vec!["admin".to_string()],
        |_ctx, args| async move { Ok(args) },
    );
    let harness = launch(registry);

    let denied = harness
        .engine
        .run_workflow("admin_only", json!({}), StartOptions::default())
        .await;
    assert!(matches!(denied, Err(DurableError::Unauthorized { .. })));

    let allowed = harness
        .engine
        .run_workflow(
            "admin_only",
            json!({}),
            StartOptions::default()
                .with_workflow_id("wf-admin")
                .with_auth(AuthContext::new("alice", vec!["admin".to_string()])),
        )
        .await
        .unwrap();
    assert_eq!(allowed, json!({}));

    harness.engine.flush().await;
    let status = harness.engine.get_workflow_status("wf-admin").await.unwrap();
    assert_eq!(status.authenticated_user.as_deref(), Some("alice"));
    assert_eq!(status.assumed_role.as_deref(), Some("admin"));
}

#[tokio::test]
async fn test_handle_status_for_missing_workflow() {
    let harness = launch(Registry::new());

    let missing = harness.engine.retrieve_workflow("wf-missing").await;
    assert!(matches!(
        missing,
        Err(DurableError::NonExistentWorkflow(id)) if id == "wf-missing"
    ));
}
