//! End-to-end tests of the engine over the in-memory persister
//!
//! Run with: cargo test -p stepworks-durable --test engine_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use stepworks_durable::persistence::MemoryTransaction;
use stepworks_durable::prelude::*;
use stepworks_durable::step::truncate_to_seconds;

fn engine(registry: StepHandlerRegistry) -> WorkflowEngine<InMemoryStepPersister> {
    WorkflowEngine::new(
        Arc::new(InMemoryStepPersister::new()),
        Arc::new(JsonStateFormatter),
        registry,
    )
}

/// Drain everything due, then return
fn drain(workers: usize) -> EngineConfig {
    EngineConfig::new().with_worker_count(workers).with_worker(
        WorkerConfig::new()
            .with_poll_interval(Duration::from_millis(10))
            .stop_when_no_immediate_work(true),
    )
}

async fn counts(engine: &WorkflowEngine<InMemoryStepPersister>) -> StepCounts {
    engine
        .data()
        .count_steps(&SearchModel::new(), None)
        .await
        .unwrap()
}

async fn single(
    engine: &WorkflowEngine<InMemoryStepPersister>,
    id: StepId,
    status: StepStatus,
) -> Step {
    let mut found = engine
        .data()
        .search_steps(&SearchModel::by_id(id), status, None)
        .await
        .unwrap();
    assert_eq!(found.len(), 1, "step {id} not in {status}");
    found.remove(0)
}

#[test_log::test(tokio::test)]
async fn test_one_step() {
    let seen = Arc::new(Mutex::new(None));
    let mut registry = StepHandlerRegistry::new();
    let observed = Arc::clone(&seen);
    registry.register_fn("OneStep", move |ctx| {
        let observed = Arc::clone(&observed);
        async move {
            let value: i32 = ctx.state()?;
            *observed.lock() = Some(value);
            Ok(ctx.step().done())
        }
    });
    let engine = engine(registry);

    let id = engine
        .data()
        .add_step(Step::new("OneStep").with_state(1234), None)
        .await
        .unwrap();
    engine.run(&drain(1)).await.unwrap();

    assert_eq!(*seen.lock(), Some(1234));
    assert_eq!(counts(&engine).await, StepCounts::new(0, 1, 0));

    let done = single(&engine, id, StepStatus::Done).await;
    assert_eq!(done.execution_count, 1);
    assert_eq!(done.executed_by.as_deref(), Some("worker-1"));
    assert!(done.execution_start_time.is_some());
    assert!(done.execution_duration_millis.is_some());
}

#[tokio::test]
async fn test_two_steps_in_one_transaction() {
    let mut registry = StepHandlerRegistry::new();
    registry.register_fn("a", |ctx| async move { Ok(ctx.step().done()) });
    registry.register_fn("b", |ctx| async move { Ok(ctx.step().done()) });
    let engine = engine(registry);
    let data = engine.data();

    let mut tx = data.begin().await.unwrap();
    data.add_step(Step::new("a"), Some(&mut tx)).await.unwrap();
    data.add_step(Step::new("b"), Some(&mut tx)).await.unwrap();

    assert_eq!(counts(&engine).await, StepCounts::new(0, 0, 0));
    data.commit(tx).await.unwrap();
    assert_eq!(counts(&engine).await, StepCounts::new(2, 0, 0));

    engine.run(&drain(1)).await.unwrap();
    assert_eq!(counts(&engine).await, StepCounts::new(0, 2, 0));
}

#[tokio::test]
async fn test_rerun_with_new_state() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let mut registry = StepHandlerRegistry::new();
    let log = Arc::clone(&observed);
    registry.register_fn("count", move |ctx| {
        let log = Arc::clone(&log);
        async move {
            let counter: i32 = ctx.state()?;
            log.lock().push(counter);

            if counter < 3 {
                let schedule = ctx.step().schedule_time.unwrap_or_else(Utc::now);
                return Ok(ctx.step().rerun().with_state(counter + 1).at(schedule));
            }
            Ok(ctx.step().done())
        }
    });
    let engine = engine(registry);

    let id = engine
        .data()
        .add_step(Step::new("count").with_state(1), None)
        .await
        .unwrap();
    engine.run(&drain(1)).await.unwrap();

    assert_eq!(*observed.lock(), vec![1, 2, 3]);
    assert_eq!(counts(&engine).await, StepCounts::new(0, 1, 0));

    let done = single(&engine, id, StepStatus::Done).await;
    assert_eq!(done.execution_count, 3);
    assert_eq!(done.state.as_deref(), Some("3"));
}

#[tokio::test]
async fn test_fail_signal_moves_step_to_failed() {
    let mut registry = StepHandlerRegistry::new();
    registry.register_fn("charge", |ctx| async move {
        Err(ctx.step().fail_as_error("card declined"))
    });
    let engine = engine(registry);

    let id = engine
        .data()
        .add_step(Step::new("charge").with_state("card"), None)
        .await
        .unwrap();
    engine.run(&drain(1)).await.unwrap();

    assert_eq!(counts(&engine).await, StepCounts::new(0, 0, 1));
    let failed = single(&engine, id, StepStatus::Failed).await;
    assert_eq!(failed.description.as_deref(), Some("card declined"));
    assert_eq!(failed.execution_count, 1);
}

#[tokio::test]
async fn test_fail_result_inserts_spawned_steps() {
    let mut registry = StepHandlerRegistry::new();
    registry.register_fn("charge", |ctx| async move {
        Ok(ctx.step().fail("insufficient funds").with(Step::new("notify")))
    });
    registry.register_fn("notify", |ctx| async move { Ok(ctx.step().done()) });
    let engine = engine(registry);

    let id = engine
        .data()
        .add_step(Step::new("charge"), None)
        .await
        .unwrap();
    engine.run(&drain(1)).await.unwrap();

    assert_eq!(counts(&engine).await, StepCounts::new(0, 1, 1));
    let failed = single(&engine, id, StepStatus::Failed).await;
    assert_eq!(failed.description.as_deref(), Some("insufficient funds"));

    let notify = engine
        .data()
        .search_steps(&SearchModel::new().with_created_by(id), StepStatus::Done, None)
        .await
        .unwrap();
    assert_eq!(notify.len(), 1);
    assert_eq!(notify[0].flow_id, failed.flow_id);
}

#[test_log::test(tokio::test)]
async fn test_fault_reruns_with_unchanged_state() {
    let mut registry = StepHandlerRegistry::new();
    registry.register_fn("flaky", |ctx| async move {
        if ctx.step().execution_count < 3 {
            return Err(StepError::fault("connection reset"));
        }
        Ok(ctx.step().done())
    });
    let engine = engine(registry);
    let worker = engine.worker("test-worker", WorkerConfig::default());

    let id = engine
        .data()
        .add_step(Step::new("flaky").with_state(serde_json::json!({"order": 7})), None)
        .await
        .unwrap();
    let before = single(&engine, id, StepStatus::Ready).await;

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, PollOutcome::Executed(StepStatus::Ready));

    let after = single(&engine, id, StepStatus::Ready).await;
    assert_eq!(after.state, before.state);
    assert_eq!(after.schedule_time, before.schedule_time);
    assert_eq!(after.execution_count, 1);
    assert_eq!(after.description.as_deref(), Some("connection reset"));

    tokio_test::assert_ok!(worker.run_once().await);
    let again = single(&engine, id, StepStatus::Ready).await;
    assert_eq!(again.state, before.state);
    assert_eq!(again.execution_count, 2);

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, PollOutcome::Executed(StepStatus::Done));
    assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Idle);
}

#[tokio::test]
async fn test_anyhow_error_is_a_fault() {
    let mut registry = StepHandlerRegistry::new();
    registry.register_fn("parse", |ctx| async move {
        let n: i32 = "x".parse().map_err(anyhow::Error::from)?;
        Ok(ctx.step().done().with(Step::new("never").with_state(n)))
    });
    let engine = engine(registry);
    let worker = engine.worker("w", WorkerConfig::default());

    let id = engine
        .data()
        .add_step(Step::new("parse"), None)
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    let step = single(&engine, id, StepStatus::Ready).await;
    assert!(step.description.is_some());
    assert_eq!(counts(&engine).await, StepCounts::new(1, 0, 0));
}

#[tokio::test]
async fn test_panic_is_a_fault() {
    let mut registry = StepHandlerRegistry::new();
    registry.register_fn("fragile", |ctx| async move {
        if ctx.step().execution_count == 1 {
            panic!("index out of bounds");
        }
        Ok(ctx.step().done())
    });
    let engine = engine(registry);
    let worker = engine.worker("w", WorkerConfig::default());

    let id = engine
        .data()
        .add_step(Step::new("fragile"), None)
        .await
        .unwrap();

    assert_eq!(
        worker.run_once().await.unwrap(),
        PollOutcome::Executed(StepStatus::Ready)
    );
    let step = single(&engine, id, StepStatus::Ready).await;
    assert!(step
        .description
        .as_deref()
        .unwrap_or_default()
        .contains("index out of bounds"));

    assert_eq!(
        worker.run_once().await.unwrap(),
        PollOutcome::Executed(StepStatus::Done)
    );
}

#[tokio::test]
async fn test_missing_handler_fails_step() {
    let engine = engine(StepHandlerRegistry::new());

    let id = engine
        .data()
        .add_step(Step::new("nobody"), None)
        .await
        .unwrap();
    engine.run(&drain(1)).await.unwrap();

    let failed = single(&engine, id, StepStatus::Failed).await;
    assert_eq!(
        failed.description.as_deref(),
        Some("missing step-implementation for step 'nobody'")
    );
}

#[tokio::test]
async fn test_spawned_steps_inherit_flow_and_correlation() {
    let mut registry = StepHandlerRegistry::new();
    registry.register_fn("parent", |ctx| async move {
        Ok(ctx.step().done_with([
            Step::new("child"),
            Step::new("child").with_correlation_id("other"),
        ]))
    });
    registry.register_fn("child", |ctx| async move { Ok(ctx.step().done()) });
    let engine = engine(registry);

    let parent_id = engine
        .data()
        .add_step(
            Step::new("parent")
                .with_flow_id("flow-42")
                .with_correlation_id("corr"),
            None,
        )
        .await
        .unwrap();
    engine.run(&drain(1)).await.unwrap();

    let done = engine
        .data()
        .search_steps(&SearchModel::by_flow_id("flow-42"), StepStatus::Done, None)
        .await
        .unwrap();
    assert_eq!(done.len(), 3);

    let mut correlations: Vec<_> = done
        .iter()
        .filter(|s| s.name == "child")
        .map(|s| {
            assert_eq!(s.created_by_step_id, parent_id);
            s.correlation_id.clone().unwrap_or_default()
        })
        .collect();
    correlations.sort();
    assert_eq!(correlations, vec!["corr", "other"]);
}

#[tokio::test]
async fn test_future_step_waits_for_activation() {
    let args_seen = Arc::new(Mutex::new(None));
    let mut registry = StepHandlerRegistry::new();
    let seen = Arc::clone(&args_seen);
    registry.register_fn("approve", move |ctx| {
        let seen = Arc::clone(&seen);
        async move {
            let args: String = ctx.activation_args()?;
            *seen.lock() = Some(args);
            Ok(ctx.step().done())
        }
    });
    let engine = engine(registry);

    let id = engine
        .data()
        .add_step(
            Step::new("approve").scheduled_at(Utc::now() + chrono::Duration::days(365)),
            None,
        )
        .await
        .unwrap();

    engine.run(&drain(1)).await.unwrap();
    assert_eq!(counts(&engine).await, StepCounts::new(1, 0, 0));

    let rows = engine.data().activate_step(id, "1234", None).await.unwrap();
    assert_eq!(rows, 1);
    engine.run(&drain(1)).await.unwrap();

    assert_eq!(counts(&engine).await, StepCounts::new(0, 1, 0));
    assert_eq!(args_seen.lock().as_deref(), Some("1234"));

    // Already done, nothing to activate
    assert_eq!(engine.data().activate_step(id, "1234", None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_singleton_add_is_rejected() {
    let engine = engine(StepHandlerRegistry::new());
    let data = engine.data();

    data.add_step(Step::new("nightly").singleton(), None)
        .await
        .unwrap();
    let err = data
        .add_step(Step::new("nightly").singleton(), None)
        .await
        .unwrap_err();

    assert!(err.is_singleton_violation());
    assert_eq!(counts(&engine).await, StepCounts::new(1, 0, 0));
}

#[tokio::test]
async fn test_singleton_violation_in_transition_reruns_step() {
    let mut registry = StepHandlerRegistry::new();
    registry.register_fn("spawner", |ctx| async move {
        Ok(ctx.step().done().with(Step::new("tick").singleton()))
    });
    let engine = engine(registry);
    let worker = engine.worker("w", WorkerConfig::default());

    engine
        .data()
        .add_step(
            Step::new("tick")
                .singleton()
                .scheduled_at(Utc::now() + chrono::Duration::days(1)),
            None,
        )
        .await
        .unwrap();
    let id = engine
        .data()
        .add_step(Step::new("spawner").with_state(5), None)
        .await
        .unwrap();

    assert_eq!(
        worker.run_once().await.unwrap(),
        PollOutcome::Executed(StepStatus::Ready)
    );

    let step = single(&engine, id, StepStatus::Ready).await;
    assert_eq!(step.execution_count, 1);
    assert_eq!(step.state.as_deref(), Some("5"));
    assert!(step.description.as_deref().unwrap_or_default().contains("tick"));
    assert_eq!(counts(&engine).await, StepCounts::new(2, 0, 0));
}

#[tokio::test]
async fn test_invalid_spawned_step_fails_current_step() {
    let mut registry = StepHandlerRegistry::new();
    registry.register_fn("buggy", |ctx| async move {
        Ok(ctx.step().done().with(Step::new("")))
    });
    let engine = engine(registry);

    let id = engine
        .data()
        .add_step(Step::new("buggy"), None)
        .await
        .unwrap();
    engine.run(&drain(1)).await.unwrap();

    assert_eq!(counts(&engine).await, StepCounts::new(0, 0, 1));
    let failed = single(&engine, id, StepStatus::Failed).await;
    assert!(failed
        .description
        .as_deref()
        .unwrap_or_default()
        .starts_with("invalid step output"));
}

#[tokio::test]
async fn test_re_execute_done_step() {
    let runs = Arc::new(Mutex::new(0));
    let mut registry = StepHandlerRegistry::new();
    let counter = Arc::clone(&runs);
    registry.register_fn("report", move |ctx| {
        let counter = Arc::clone(&counter);
        async move {
            let _: String = ctx.state()?;
            *counter.lock() += 1;
            Ok(ctx.step().done())
        }
    });
    let engine = engine(registry);

    let id = engine
        .data()
        .add_step(
            Step::new("report").with_state("q3").with_flow_id("reports"),
            None,
        )
        .await
        .unwrap();
    engine.run(&drain(1)).await.unwrap();

    let ids = engine
        .data()
        .re_execute_steps(&SearchModel::by_flow_id("reports"), None)
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);
    engine.run(&drain(1)).await.unwrap();

    assert_eq!(*runs.lock(), 2);
    assert_eq!(counts(&engine).await, StepCounts::new(0, 2, 0));

    let clone = single(&engine, ids[0], StepStatus::Done).await;
    assert_eq!(clone.created_by_step_id, id);
    assert_eq!(clone.state.as_deref(), Some("\"q3\""));
}

#[tokio::test]
async fn test_failed_step_is_not_executed() {
    let runs = Arc::new(Mutex::new(0));
    let mut registry = StepHandlerRegistry::new();
    let counter = Arc::clone(&runs);
    registry.register_fn("job", move |ctx| {
        let counter = Arc::clone(&counter);
        async move {
            *counter.lock() += 1;
            Ok(ctx.step().done())
        }
    });
    let engine = engine(registry);

    let id = engine.data().add_step(Step::new("job"), None).await.unwrap();
    assert!(engine.data().fail_step(id, None).await.unwrap());
    engine.run(&drain(1)).await.unwrap();

    assert_eq!(*runs.lock(), 0);
    assert_eq!(counts(&engine).await, StepCounts::new(0, 0, 1));
}

#[tokio::test]
async fn test_each_step_executes_once_across_workers() {
    let executions: Arc<Mutex<HashMap<StepId, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut registry = StepHandlerRegistry::new();
    let log = Arc::clone(&executions);
    registry.register_fn("work", move |ctx| {
        let log = Arc::clone(&log);
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            *log.lock().entry(ctx.step().id).or_default() += 1;
            Ok(ctx.step().done())
        }
    });
    let engine = engine(registry);

    let ids = engine
        .data()
        .add_steps((0..20).map(|i| Step::new("work").with_state(i)), None)
        .await
        .unwrap();
    engine.run(&drain(4)).await.unwrap();

    assert_eq!(counts(&engine).await, StepCounts::new(0, 20, 0));
    let executions = executions.lock();
    assert_eq!(executions.len(), 20);
    for id in ids {
        assert_eq!(executions.get(&id), Some(&1));
    }
}

/// Purchases recorded by the shopping steps, keyed by purchase id
type SalesLedger = Arc<Mutex<HashMap<Uuid, Vec<i32>>>>;

/// Join state: purchase, number of picks to wait for, give-up time
type Checkout = (Uuid, usize, chrono::DateTime<Utc>);

fn register_shop(
    registry: &mut StepHandlerRegistry,
    sales: &SalesLedger,
    total: &Arc<Mutex<Option<i32>>>,
    expected_picks: usize,
    max_wait: chrono::Duration,
) {
    registry.register_fn("drive-to-shop", move |ctx| async move {
        let purchase: Uuid = ctx.state()?;
        let checkout: Checkout = (purchase, expected_picks, Utc::now() + max_wait);
        Ok(ctx.step().done_with([
            Step::new("pick-milk").try_with_state(&(purchase, 1))?,
            Step::new("pick-cookies").try_with_state(&(purchase, 2))?,
            Step::new("pay-for-all").try_with_state(&checkout)?,
        ]))
    });

    for (name, price) in [("pick-milk", 1), ("pick-cookies", 30)] {
        let sales = Arc::clone(sales);
        registry.register_fn(name, move |ctx| {
            let sales = Arc::clone(&sales);
            async move {
                let (purchase, count): (Uuid, i32) = ctx.state()?;
                sales.lock().entry(purchase).or_default().push(price * count);
                Ok(ctx.step().done())
            }
        });
    }

    let sales = Arc::clone(sales);
    let total = Arc::clone(total);
    registry.register_fn("pay-for-all", move |ctx| {
        let sales = Arc::clone(&sales);
        let total = Arc::clone(&total);
        async move {
            let (purchase, expected, deadline): Checkout = ctx.state()?;
            let recorded = sales.lock().get(&purchase).cloned().unwrap_or_default();

            if recorded.len() < expected && Utc::now() <= deadline {
                // Same schedule time as the picks, which sort first by id
                return Ok(ctx.step().rerun());
            }

            *total.lock() = Some(recorded.iter().sum());
            Ok(ctx.step().done())
        }
    });
}

async fn shop(
    expected_picks: usize,
    max_wait: chrono::Duration,
) -> (WorkflowEngine<InMemoryStepPersister>, String, Option<i32>) {
    let sales: SalesLedger = Arc::new(Mutex::new(HashMap::new()));
    let total = Arc::new(Mutex::new(None));
    let mut registry = StepHandlerRegistry::new();
    register_shop(&mut registry, &sales, &total, expected_picks, max_wait);
    let engine = engine(registry);

    let purchase = Uuid::now_v7();
    let id = engine
        .data()
        .add_step(
            Step::new("drive-to-shop").try_with_state(&purchase).unwrap(),
            None,
        )
        .await
        .unwrap();
    let flow = single(&engine, id, StepStatus::Ready).await.flow_id.unwrap();

    // Stop-on-idle must not strand the join while it polls its siblings
    tokio::time::timeout(Duration::from_secs(20), engine.run(&drain(4)))
        .await
        .expect("fork/join did not finish in time")
        .unwrap();

    let total = *total.lock();
    (engine, flow, total)
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_fork_join() {
    let (engine, flow, total) = shop(2, chrono::Duration::seconds(8)).await;

    let counts = engine
        .data()
        .count_steps(&SearchModel::by_flow_id(flow.as_str()), None)
        .await
        .unwrap();
    assert_eq!(counts, StepCounts::new(0, 4, 0));
    assert_eq!(total, Some(61));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_proceeds_after_deadline() {
    // Waits for a third pick that never comes
    let started = std::time::Instant::now();
    let (engine, flow, total) = shop(3, chrono::Duration::milliseconds(1500)).await;

    assert!(started.elapsed() >= Duration::from_millis(1500));
    let counts = engine
        .data()
        .count_steps(&SearchModel::by_flow_id(flow.as_str()), None)
        .await
        .unwrap();
    assert_eq!(counts, StepCounts::new(0, 4, 0));
    assert_eq!(total, Some(61));
}

#[tokio::test]
async fn test_sub_second_rerun_is_due_when_draining() {
    let runs = Arc::new(Mutex::new(0));
    let mut registry = StepHandlerRegistry::new();
    let log = Arc::clone(&runs);
    registry.register_fn("poll-once-more", move |ctx| {
        let log = Arc::clone(&log);
        async move {
            *log.lock() += 1;
            if ctx.step().execution_count == 1 {
                // Inside the current second, so it floors to at most now
                let soon = truncate_to_seconds(Utc::now()) + chrono::Duration::milliseconds(999);
                return Ok(ctx.step().rerun().at(soon));
            }
            Ok(ctx.step().done())
        }
    });
    let engine = engine(registry);

    let id = engine
        .data()
        .add_step(Step::new("poll-once-more"), None)
        .await
        .unwrap();
    engine.run(&drain(1)).await.unwrap();

    assert_eq!(*runs.lock(), 2);
    assert_eq!(counts(&engine).await, StepCounts::new(0, 1, 0));
    assert_eq!(single(&engine, id, StepStatus::Done).await.execution_count, 2);
}

#[tokio::test]
async fn test_rerun_schedule_is_stored_in_whole_seconds() {
    let mut registry = StepHandlerRegistry::new();
    registry.register_fn("later", |ctx| async move {
        let at = Utc::now() + chrono::Duration::milliseconds(200);
        Ok(ctx.step().rerun().at(at))
    });
    let engine = engine(registry);
    let worker = engine.worker("test-worker", WorkerConfig::default());

    let id = engine
        .data()
        .add_step(Step::new("later"), None)
        .await
        .unwrap();
    let before = Utc::now();
    worker.run_once().await.unwrap();

    let stored = single(&engine, id, StepStatus::Ready)
        .await
        .schedule_time
        .unwrap();
    assert_eq!(stored.timestamp_subsec_nanos(), 0);
    assert!(stored >= truncate_to_seconds(before));
    assert!(stored <= Utc::now() + chrono::Duration::milliseconds(200));
}

#[tokio::test]
async fn test_fail_step_holds_the_step_against_workers() {
    let runs = Arc::new(Mutex::new(0));
    let mut registry = StepHandlerRegistry::new();
    let log = Arc::clone(&runs);
    registry.register_fn("ship", move |ctx| {
        let log = Arc::clone(&log);
        async move {
            *log.lock() += 1;
            Ok(ctx.step().done())
        }
    });
    let engine = engine(registry);
    let data = engine.data();
    let id = data.add_step(Step::new("ship"), None).await.unwrap();

    let mut admin = data.begin().await.unwrap();
    assert!(data.fail_step(id, Some(&mut admin)).await.unwrap());

    // Not committed yet, but the row is held: a worker must not claim it
    let worker = engine.worker("test-worker", WorkerConfig::default());
    assert_eq!(worker.run_once().await.unwrap(), PollOutcome::Idle);

    data.commit(admin).await.unwrap();

    assert_eq!(*runs.lock(), 0);
    assert_eq!(
        data.count_steps(&SearchModel::by_id(id), None).await.unwrap(),
        StepCounts::new(0, 0, 1)
    );
}

#[tokio::test]
async fn test_fail_step_waits_for_executing_worker() {
    let started = Arc::new(tokio::sync::Notify::new());
    let proceed = Arc::new(tokio::sync::Notify::new());
    let mut registry = StepHandlerRegistry::new();
    {
        let started = Arc::clone(&started);
        let proceed = Arc::clone(&proceed);
        registry.register_fn("ship", move |ctx| {
            let started = Arc::clone(&started);
            let proceed = Arc::clone(&proceed);
            async move {
                started.notify_one();
                proceed.notified().await;
                Ok(ctx.step().done())
            }
        });
    }
    let engine = engine(registry);
    let id = engine
        .data()
        .add_step(Step::new("ship"), None)
        .await
        .unwrap();

    let worker = engine.worker("test-worker", WorkerConfig::default());
    let executing = tokio::spawn(async move { worker.run_once().await });
    started.notified().await;

    let data = engine.data().clone();
    let admin = tokio::spawn(async move { data.fail_step(id, None).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!admin.is_finished());

    proceed.notify_one();
    assert_eq!(
        executing.await.unwrap().unwrap(),
        PollOutcome::Executed(StepStatus::Done)
    );

    // The worker moved it first; failing it now finds nothing
    assert!(!admin.await.unwrap().unwrap());
    assert_eq!(
        engine
            .data()
            .count_steps(&SearchModel::by_id(id), None)
            .await
            .unwrap(),
        StepCounts::new(0, 1, 0)
    );
}

#[tokio::test]
async fn test_activation_waits_for_executing_worker() {
    let started = Arc::new(tokio::sync::Notify::new());
    let proceed = Arc::new(tokio::sync::Notify::new());
    let mut registry = StepHandlerRegistry::new();
    {
        let started = Arc::clone(&started);
        let proceed = Arc::clone(&proceed);
        registry.register_fn("wait", move |ctx| {
            let started = Arc::clone(&started);
            let proceed = Arc::clone(&proceed);
            async move {
                started.notify_one();
                proceed.notified().await;
                Ok(ctx
                    .step()
                    .rerun()
                    .with_state(2)
                    .at(Utc::now() + chrono::Duration::days(1)))
            }
        });
    }
    let engine = engine(registry);
    let id = engine
        .data()
        .add_step(Step::new("wait").with_state(1), None)
        .await
        .unwrap();

    let worker = engine.worker("test-worker", WorkerConfig::default());
    let executing = tokio::spawn(async move { worker.run_once().await });
    started.notified().await;

    let data = engine.data().clone();
    let admin = tokio::spawn(async move { data.activate_step(id, "go", None).await });

    proceed.notify_one();
    executing.await.unwrap().unwrap();
    assert_eq!(admin.await.unwrap().unwrap(), 1);

    // Activation applied on top of the worker's rerun, not over it
    let step = single(&engine, id, StepStatus::Ready).await;
    assert_eq!(step.state.as_deref(), Some("2"));
    assert_eq!(step.activation_args.as_deref(), Some(r#""go""#));
    assert!(step.is_due(Utc::now()));
}

/// Fails `begin` on one chosen call, otherwise delegates to memory
struct FlakyPersister {
    inner: InMemoryStepPersister,
    calls: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl StepPersister for FlakyPersister {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            return Err(StoreError::Database("connection refused".to_string()));
        }
        self.inner.begin().await
    }

    async fn commit(&self, tx: MemoryTransaction) -> Result<(), StoreError> {
        self.inner.commit(tx).await
    }

    async fn insert(
        &self,
        tx: &mut MemoryTransaction,
        status: StepStatus,
        steps: &[Step],
    ) -> Result<Vec<StepId>, StoreError> {
        self.inner.insert(tx, status, steps).await
    }

    async fn update(
        &self,
        tx: &mut MemoryTransaction,
        status: StepStatus,
        step: &Step,
    ) -> Result<u64, StoreError> {
        self.inner.update(tx, status, step).await
    }

    async fn delete(
        &self,
        tx: &mut MemoryTransaction,
        status: StepStatus,
        id: StepId,
    ) -> Result<u64, StoreError> {
        self.inner.delete(tx, status, id).await
    }

    async fn lock_step(
        &self,
        tx: &mut MemoryTransaction,
        status: StepStatus,
        id: StepId,
    ) -> Result<Option<Step>, StoreError> {
        self.inner.lock_step(tx, status, id).await
    }

    async fn search_steps(
        &self,
        tx: &mut MemoryTransaction,
        criteria: &SearchModel,
        status: StepStatus,
    ) -> Result<Vec<Step>, StoreError> {
        self.inner.search_steps(tx, criteria, status).await
    }

    async fn claim_ready(
        &self,
        tx: &mut MemoryTransaction,
        worker_id: &str,
        now: chrono::DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Step>, StoreError> {
        self.inner.claim_ready(tx, worker_id, now, limit).await
    }
}

#[test_log::test(tokio::test)]
async fn test_storage_error_stops_the_engine() {
    let persister = Arc::new(FlakyPersister {
        inner: InMemoryStepPersister::new(),
        calls: AtomicUsize::new(0),
        fail_on: 5,
    });
    let engine = WorkflowEngine::new(
        Arc::clone(&persister),
        Arc::new(JsonStateFormatter),
        StepHandlerRegistry::new(),
    );

    // Never idle-stops: only the storage error can end the run
    let config = EngineConfig::new().with_worker_count(3).with_worker(
        WorkerConfig::new().with_poll_interval(Duration::from_millis(10)),
    );
    let result = tokio::time::timeout(Duration::from_secs(5), engine.run(&config))
        .await
        .expect("remaining workers were not stopped");

    assert!(matches!(
        result,
        Err(EngineError::Worker(WorkerError::Store(StoreError::Database(ref msg))))
            if msg == "connection refused"
    ));

    // Every worker stopped polling once the error surfaced
    let calls = persister.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(persister.calls.load(Ordering::SeqCst), calls);
}
