//! End-to-end tests driving plans through the engine with mock steps.

use super::*;
use crate::core::{FailureType, ResponseData, Status};
use crate::correlation::{JitterStrategy, MockTaskExecutor, RetryConfig};
use crate::errors::DispatchError;
use crate::events::CollectingEventSink;
use crate::execution::ChainState;
use crate::failure::{ActionConfig, FailureStrategyConfig};
use crate::testing::{
    eventually, fork, single_node_plan, stage, staged_plan, step, types, within,
    CollectingEndObserver, CollectingStatusObserver, RecordingTaskExecutor, TestSteps,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

struct Harness {
    engine: OrchestrationEngine,
    steps: TestSteps,
    executor: Arc<RecordingTaskExecutor>,
    statuses: Arc<CollectingStatusObserver>,
    ends: Arc<CollectingEndObserver>,
    sink: Arc<CollectingEventSink>,
}

fn harness() -> Harness {
    harness_with(RecordingTaskExecutor::new(), EngineConfig::default())
}

fn harness_with(executor: RecordingTaskExecutor, config: EngineConfig) -> Harness {
    let steps = TestSteps::new();
    let executor = Arc::new(executor);
    let statuses = Arc::new(CollectingStatusObserver::new());
    let ends = Arc::new(CollectingEndObserver::new());
    let sink = Arc::new(CollectingEventSink::new());
    let observers = Arc::new(ObserverRegistry::new());
    observers.add_status_observer(statuses.clone());
    observers.add_end_observer(ends.clone());
    let engine = OrchestrationEngine::builder(steps.registry())
        .with_config(config)
        .with_task_executor(executor.clone())
        .with_observers(observers)
        .with_event_sink(sink.clone())
        .build();
    Harness {
        engine,
        steps,
        executor,
        statuses,
        ends,
        sink,
    }
}

fn nodes_named(engine: &OrchestrationEngine, plan_execution_id: &str, identifier: &str) -> Vec<NodeExecution> {
    let mut nodes: Vec<NodeExecution> = engine
        .nodes(plan_execution_id)
        .into_iter()
        .filter(|n| n.identifier == identifier)
        .collect();
    nodes.sort_by_key(NodeExecution::retry_index);
    nodes
}

fn on_all_errors(action: ActionConfig) -> FailureStrategyConfig {
    FailureStrategyConfig::new([FailureType::AllErrors], action)
}

#[tokio::test]
async fn test_task_chain_runs_every_link_then_finalizes_once() {
    let h = harness();
    let pe = h
        .engine
        .start_plan(single_node_plan(step("deploy", types::TASK_CHAIN)), BTreeMap::new())
        .unwrap();
    let root = h.engine.root_runtime_id(&pe).unwrap();

    for link in 1..=3 {
        assert!(eventually(|| h.executor.dispatched().len() >= link).await);
        let task = h.executor.dispatched()[link - 1].clone();
        assert_eq!(task.request.parameters, json!({ "link": link }));
        if link == 1 {
            assert!(eventually(|| {
                h.engine
                    .node(&root)
                    .is_some_and(|n| n.chain_state == Some(ChainState::Chaining))
            })
            .await);
        }
        let delivery = h
            .engine
            .deliver_response(&task.wait_id, ResponseData::task(json!({ "done": link })))
            .unwrap();
        assert!(matches!(delivery, Delivery::Ready { .. }));
    }

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Succeeded);
    assert_eq!(
        h.steps.chain.callbacks_of(&root),
        vec![
            "start_chain_link",
            "execute_next_link",
            "execute_next_link",
            "finalize_execution"
        ]
    );
    let node = h.engine.node(&root).unwrap();
    assert_eq!(node.outcomes.get("links"), Some(&json!(3)));
    assert_eq!(node.chain_state, Some(ChainState::Done));
    assert_eq!(node.task_ids.len(), 3);

    h.engine.shutdown().await;
    assert_eq!(h.statuses.statuses_of(&root), vec![Status::Running, Status::Succeeded]);
    assert_eq!(h.ends.results(), vec![result]);
}

#[tokio::test]
async fn test_fork_children_run_concurrently_with_isolated_state() {
    let h = harness();
    let plan = Plan::new(
        "forked",
        "fan_out",
        [
            fork("fan_out", &["left", "right"]),
            step("left", types::TASK_CHAIN).with_parameters(json!({ "links": 2 })),
            step("right", types::TASK_CHAIN).with_parameters(json!({ "links": 2 })),
        ],
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();

    // Both first links are in flight before any result is delivered.
    assert!(eventually(|| h.executor.dispatched().len() == 2).await);
    for task in h.executor.dispatched() {
        h.engine
            .deliver_response(&task.wait_id, ResponseData::task(json!("first")))
            .unwrap();
    }
    assert!(eventually(|| h.executor.dispatched().len() == 4).await);
    for task in &h.executor.dispatched()[2..] {
        h.engine
            .deliver_response(&task.wait_id, ResponseData::task(json!("second")))
            .unwrap();
    }

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Succeeded);
    assert!(!h.steps.chain.saw_foreign_state());
    assert_eq!(h.steps.fork.resumed(), 1);

    let left = &nodes_named(&h.engine, &pe, "left")[0];
    let right = &nodes_named(&h.engine, &pe, "right")[0];
    assert_ne!(left.pass_through, right.pass_through);
    for node in [left, right] {
        assert_eq!(
            h.steps.chain.callbacks_of(&node.runtime_id),
            vec!["start_chain_link", "execute_next_link", "finalize_execution"]
        );
        assert_eq!(h.executor.dispatched_by(&node.runtime_id).len(), 2);
    }
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_async_barrier_resumes_only_after_all_wait_ids() {
    let h = harness();
    let plan = single_node_plan(
        step("approval", types::BARRIER).with_parameters(json!({ "waitIds": ["w1", "w2"] })),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();
    let root = h.engine.root_runtime_id(&pe).unwrap();
    assert!(eventually(|| h.engine.pending_wait_ids(&root).len() == 2).await);

    let first = h
        .engine
        .deliver_response("w1", ResponseData::task(json!("yes")))
        .unwrap();
    assert_eq!(
        first,
        Delivery::Pending {
            node_runtime_id: root.clone(),
            remaining: 1
        }
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.steps.barrier.handled().is_empty());
    assert_eq!(h.engine.node(&root).unwrap().status, Status::Running);

    let second = h
        .engine
        .deliver_response("w2", ResponseData::task(json!("also yes")))
        .unwrap();
    assert!(matches!(second, Delivery::Ready { .. }));

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Succeeded);
    assert_eq!(h.steps.barrier.handled(), vec![(root.clone(), 2)]);

    // Redelivery is reported and never reaches the step again.
    let again = h
        .engine
        .deliver_response("w1", ResponseData::task(json!("yes")))
        .unwrap();
    assert_eq!(again, Delivery::Duplicate);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.steps.barrier.handled().len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_orphaned_response_is_purged_after_max_age() {
    let h = harness_with(
        RecordingTaskExecutor::new(),
        EngineConfig::new().with_orphan_purge(20, 5),
    );
    let first = h
        .engine
        .deliver_response("stray", ResponseData::task(json!(1)))
        .unwrap();
    assert_eq!(first, Delivery::Unknown);
    assert_eq!(
        h.engine
            .deliver_response("stray", ResponseData::task(json!(2)))
            .unwrap(),
        Delivery::Duplicate
    );

    // Once purged the wait-id is unknown again and buffers afresh.
    assert!(
        eventually(|| {
            matches!(
                h.engine
                    .deliver_response("stray", ResponseData::task(json!(3))),
                Ok(Delivery::Unknown)
            )
        })
        .await
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_orphans_survive_with_default_max_age() {
    let h = harness();
    h.engine
        .deliver_response("stray", ResponseData::task(json!(1)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        h.engine
            .deliver_response("stray", ResponseData::task(json!(2)))
            .unwrap(),
        Delivery::Duplicate
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_abort_after_first_link_stops_the_chain() {
    let h = harness();
    let pe = h
        .engine
        .start_plan(single_node_plan(step("deploy", types::TASK_CHAIN)), BTreeMap::new())
        .unwrap();
    let root = h.engine.root_runtime_id(&pe).unwrap();
    assert!(eventually(|| h.executor.dispatched().len() == 1).await);

    h.engine.abort_node(&root).unwrap();
    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Aborted);

    let task = h.executor.dispatched()[0].clone();
    let late = h
        .engine
        .deliver_response(&task.wait_id, ResponseData::task(json!("too late")))
        .unwrap();
    assert_eq!(late, Delivery::Duplicate);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.steps.chain.callbacks_of(&root), vec!["start_chain_link"]);
    assert!(eventually(|| h.executor.cancelled() == vec![task.task_id.clone()]).await);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_response_before_registration_is_buffered() {
    let h = harness();
    assert_eq!(
        h.engine
            .deliver_response("early", ResponseData::task(json!(1)))
            .unwrap(),
        Delivery::Unknown
    );
    let plan = single_node_plan(
        step("approval", types::BARRIER).with_parameters(json!({ "waitIds": ["early"] })),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();
    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Succeeded);
    assert_eq!(h.steps.barrier.handled().len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_deadline_expires_node_and_runs_abort_hook() {
    let h = harness();
    let plan = single_node_plan(
        step("approval", types::BARRIER)
            .with_parameters(json!({ "waitIds": ["never"] }))
            .with_timeout_ms(30),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();
    let root = h.engine.root_runtime_id(&pe).unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Expired);
    assert_eq!(result.failures.len(), 1);
    assert!(result.failures[0]
        .failure_types
        .contains(&FailureType::TimeoutError));
    assert_eq!(h.steps.barrier.aborted(), vec![root]);
    assert_eq!(
        h.engine
            .deliver_response("never", ResponseData::task(json!(null)))
            .unwrap(),
        Delivery::Duplicate
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_retry_creates_new_attempts_until_success() {
    let h = harness();
    let plan = staged_plan(
        stage("deploy_stage", &["flaky"]).with_failure_strategy(on_all_errors(
            ActionConfig::retry(2, vec![1], ActionConfig::MarkAsFailure),
        )),
        vec![step("flaky", types::FAIL).with_parameters(json!({ "failTimes": 2 }))],
        Vec::new(),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Succeeded);
    assert!(result.failures.is_empty());
    assert_eq!(h.steps.fail.attempts("flaky"), 3);

    let attempts = nodes_named(&h.engine, &pe, "flaky");
    let summary: Vec<(u32, Status, bool)> = attempts
        .iter()
        .map(|n| (n.retry_index(), n.status, n.old_retry))
        .collect();
    assert_eq!(
        summary,
        vec![
            (0, Status::Failed, true),
            (1, Status::Failed, true),
            (2, Status::Succeeded, false)
        ]
    );
    assert_eq!(
        attempts[2].retry_ids,
        vec![attempts[0].runtime_id.clone(), attempts[1].runtime_id.clone()]
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retry_applies_nested_action() {
    let h = harness();
    let plan = staged_plan(
        stage("deploy_stage", &["broken"]),
        vec![step("broken", types::FAIL)
            .with_failure_strategy(on_all_errors(ActionConfig::retry(1, Vec::new(), ActionConfig::Ignore)))],
        Vec::new(),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::IgnoreFailed);
    assert!(result.is_success());
    assert_eq!(h.steps.fail.attempts("broken"), 2);
    let last = nodes_named(&h.engine, &pe, "broken").pop().unwrap();
    assert_eq!(last.status, Status::IgnoreFailed);
    assert_eq!(last.failure_info.len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_step_strategy_wins_over_stage_strategy() {
    let h = harness();
    let plan = staged_plan(
        stage("deploy_stage", &["broken"]).with_failure_strategy(FailureStrategyConfig::new(
            [FailureType::ApplicationError],
            ActionConfig::Abort,
        )),
        vec![step("broken", types::FAIL).with_failure_strategy(FailureStrategyConfig::new(
            [FailureType::ApplicationError],
            ActionConfig::MarkAsSuccess,
        ))],
        Vec::new(),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Succeeded);
    let broken = &nodes_named(&h.engine, &pe, "broken")[0];
    assert_eq!(broken.status, Status::Succeeded);
    assert_eq!(broken.failure_info.len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_stage_rollback_runs_section_and_reports_failure() {
    let h = harness();
    let plan = staged_plan(
        stage("deploy_stage", &["deploy"]).with_rollback("undo"),
        vec![step("deploy", types::FAIL).with_failure_strategy(on_all_errors(ActionConfig::StageRollback))],
        vec![step("undo", types::SUCCEED).in_rollback_section()],
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Failed);
    assert_eq!(h.steps.succeed.executed(), vec!["undo".to_string()]);

    let deploy = &nodes_named(&h.engine, &pe, "deploy")[0];
    let undo = &nodes_named(&h.engine, &pe, "undo")[0];
    assert_eq!(deploy.status, Status::Failed);
    assert_eq!(undo.status, Status::Succeeded);
    assert_eq!(undo.rollback_of.as_deref(), Some(deploy.runtime_id.as_str()));
    assert_eq!(undo.parent_id, deploy.parent_id);
    assert!(result
        .failures
        .iter()
        .any(|f| f.message.contains("deploy failed")));
    assert_eq!(h.sink.events_of_type("rollback.started").len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_rollback_without_section_fails_the_node() {
    let h = harness();
    let plan = staged_plan(
        stage("deploy_stage", &["deploy"]),
        vec![step("deploy", types::FAIL).with_failure_strategy(on_all_errors(ActionConfig::StageRollback))],
        Vec::new(),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Failed);
    assert!(h.engine.nodes(&pe).iter().all(|n| n.rollback_of.is_none()));
    assert!(h.sink.events_of_type("rollback.started").is_empty());
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_skipped_node_never_runs() {
    let h = harness();
    let plan = staged_plan(
        stage("deploy_stage", &["skipped", "runs"]),
        vec![
            step("skipped", types::SUCCEED).skipped(),
            step("runs", types::SUCCEED),
        ],
        Vec::new(),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Succeeded);
    assert_eq!(h.steps.succeed.executed(), vec!["runs".to_string()]);
    let skipped = &nodes_named(&h.engine, &pe, "skipped")[0];
    assert_eq!(skipped.status, Status::Skipped);
    assert_eq!(skipped.start_ts, None);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_next_node_runs_after_positive_sibling() {
    let h = harness();
    let plan = staged_plan(
        stage("deploy_stage", &["first"]),
        vec![
            step("first", types::SUCCEED).with_next("second"),
            step("second", types::SUCCEED),
        ],
        Vec::new(),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Succeeded);
    assert_eq!(
        h.steps.succeed.executed(),
        vec!["first".to_string(), "second".to_string()]
    );
    let first = &nodes_named(&h.engine, &pe, "first")[0];
    let second = &nodes_named(&h.engine, &pe, "second")[0];
    assert_eq!(first.parent_id, second.parent_id);
    assert_eq!(first.notify_id, second.notify_id);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_abort_plan_marks_leaves_and_aborts_everything() {
    let h = harness();
    let plan = Plan::new(
        "forked",
        "fan_out",
        [
            fork("fan_out", &["left", "right"]),
            step("left", types::BARRIER).with_parameters(json!({ "waitIds": ["a"] })),
            step("right", types::BARRIER).with_parameters(json!({ "waitIds": ["b"] })),
        ],
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();
    assert!(eventually(|| {
        h.engine
            .nodes(&pe)
            .iter()
            .filter(|n| n.status == Status::Running && !n.wait_ids.is_empty())
            .count()
            == 3
    })
    .await);

    assert_eq!(h.engine.abort_plan(&pe).unwrap(), 2);
    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Aborted);
    assert!(h.engine.nodes(&pe).iter().all(|n| n.status == Status::Aborted));
    assert_eq!(h.steps.barrier.aborted().len(), 2);
    assert_eq!(h.steps.fork.resumed(), 0);

    h.engine.shutdown().await;
    for leaf in ["left", "right"] {
        let node = &nodes_named(&h.engine, &pe, leaf)[0];
        assert_eq!(
            h.statuses.statuses_of(&node.runtime_id),
            vec![Status::Running, Status::Discontinuing, Status::Aborted]
        );
    }
    let root = h.engine.root_runtime_id(&pe).unwrap();
    assert!(!h.statuses.statuses_of(&root).contains(&Status::Discontinuing));
}

#[tokio::test]
async fn test_manual_intervention_applies_chosen_action() {
    let h = harness();
    let plan = staged_plan(
        stage("deploy_stage", &["broken"]),
        vec![step("broken", types::FAIL).with_failure_strategy(on_all_errors(
            ActionConfig::manual_intervention(60_000, ActionConfig::MarkAsFailure),
        ))],
        Vec::new(),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();
    assert!(eventually(|| {
        nodes_named(&h.engine, &pe, "broken")
            .first()
            .is_some_and(|n| n.status == Status::Paused)
    })
    .await);
    let broken = nodes_named(&h.engine, &pe, "broken").remove(0);
    assert_eq!(
        broken.intervention_timeout_action,
        Some(ActionConfig::MarkAsFailure)
    );

    assert!(matches!(
        h.engine.intervene(
            &broken.runtime_id,
            ActionConfig::manual_intervention(1, ActionConfig::Abort)
        ),
        Err(NodeflowError::InvalidRequest(_))
    ));
    h.engine
        .intervene(&broken.runtime_id, ActionConfig::MarkAsSuccess)
        .unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Succeeded);
    let broken = h.engine.node(&broken.runtime_id).unwrap();
    assert_eq!(broken.status, Status::Succeeded);
    assert_eq!(broken.intervention_timeout_action, None);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_manual_intervention_timeout_applies_fallback() {
    let h = harness();
    let plan = staged_plan(
        stage("deploy_stage", &["broken"]),
        vec![step("broken", types::FAIL).with_failure_strategy(on_all_errors(
            ActionConfig::manual_intervention(20, ActionConfig::Ignore),
        ))],
        Vec::new(),
    );
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::IgnoreFailed);
    let broken = &nodes_named(&h.engine, &pe, "broken")[0];
    assert_eq!(broken.status, Status::IgnoreFailed);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_task_step_dispatches_through_executor() {
    let mut executor = MockTaskExecutor::new();
    executor
        .expect_queue_task()
        .times(1)
        .returning(|_, _, request| {
            assert_eq!(request.task_type, "echo");
            assert_eq!(request.parameters, json!({ "command": "ls" }));
            Ok("task-42".to_string())
        });
    executor.expect_cancel_task().never();

    let steps = TestSteps::new();
    let engine = OrchestrationEngine::builder(steps.registry())
        .with_task_executor(Arc::new(executor))
        .build();
    let plan = single_node_plan(step("list", types::TASK).with_parameters(json!({ "command": "ls" })));
    let pe = engine.start_plan(plan, BTreeMap::new()).unwrap();
    let root = engine.root_runtime_id(&pe).unwrap();

    assert!(eventually(|| {
        engine
            .node(&root)
            .is_some_and(|n| n.task_ids == vec!["task-42".to_string()])
    })
    .await);
    let wait_id = engine.node(&root).unwrap().wait_ids[0].clone();
    engine
        .deliver_response(&wait_id, ResponseData::task(json!({ "files": 3 })))
        .unwrap();

    let result = within(engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Succeeded);
    assert_eq!(
        engine.node(&root).unwrap().outcomes.get("result"),
        Some(&json!({ "files": 3 }))
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_exhaustion_fails_with_delegate_provisioning() {
    let config = EngineConfig::default().with_dispatch_retry(
        RetryConfig::new()
            .with_max_attempts(2)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None),
    );
    let h = harness_with(
        RecordingTaskExecutor::failing(DispatchError::retryable("echo", "no delegate")),
        config,
    );
    let plan = single_node_plan(step("list", types::TASK));
    let pe = h.engine.start_plan(plan, BTreeMap::new()).unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Failed);
    assert_eq!(h.executor.attempts(), 2);
    assert!(result.failures[0]
        .failure_types
        .contains(&FailureType::DelegateProvisioning));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_panicking_step_fails_node() {
    let h = harness();
    let pe = h
        .engine
        .start_plan(single_node_plan(step("boom", types::PANIC)), BTreeMap::new())
        .unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Failed);
    assert!(result.failures[0].message.contains("step exploded"));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_step_type_fails_node() {
    let h = harness();
    let pe = h
        .engine
        .start_plan(single_node_plan(step("ghost", "GHOST")), BTreeMap::new())
        .unwrap();

    let result = within(h.engine.await_plan(&pe)).await.unwrap();
    assert_eq!(result.status, Status::Failed);
    assert!(result.failures[0].message.contains("No step registered"));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_setup_abstractions_reach_node_ambiance() {
    let h = harness();
    let plan = single_node_plan(step("hello", types::SUCCEED)).with_setup_abstraction("accountId", "acc1");
    let pe = h
        .engine
        .start_plan(
            plan,
            BTreeMap::from([("orgId".to_string(), "org1".to_string())]),
        )
        .unwrap();
    within(h.engine.await_plan(&pe)).await.unwrap();

    let root = h.engine.node(&h.engine.root_runtime_id(&pe).unwrap()).unwrap();
    assert_eq!(root.ambiance.setup_abstraction("accountId"), Some("acc1"));
    assert_eq!(root.ambiance.setup_abstraction("orgId"), Some("org1"));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_invalid_plan_and_stopped_engine_are_rejected() {
    let h = harness();
    let invalid = Plan::new("broken", "missing", [step("present", types::SUCCEED)]);
    assert!(matches!(
        h.engine.start_plan(invalid, BTreeMap::new()),
        Err(NodeflowError::PlanValidation(_))
    ));

    h.engine.shutdown().await;
    assert!(matches!(
        h.engine
            .start_plan(single_node_plan(step("late", types::SUCCEED)), BTreeMap::new()),
        Err(NodeflowError::ShutDown)
    ));
    assert!(matches!(
        h.engine.deliver_response("w", ResponseData::task(json!(1))),
        Err(NodeflowError::ShutDown)
    ));
}
