//! End-to-end tests for building and executing pipelines.

#[cfg(test)]
mod tests {
    use crate::core::ValueType::{Array, Integer, Number, Object, String as Str};
    use crate::core::{RunStatus, StageOutput, StageState};
    use crate::errors::PipelineError;
    use crate::events::CollectingEventSink;
    use crate::pipeline::{
        Executor, ExecutorConfig, PipelineGraph, RetryPolicy, StageRegistry, StageSpec,
    };
    use crate::stages::{AsyncFnStage, FnStage};
    use crate::testing::{
        assert_run_status, assert_stage_state, CountingStage, FailingStage, FlakyStage,
        ProducerStage, SlowStage,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(max_retries)
            .with_base_delay_ms(1)
            .with_max_delay_ms(5)
    }

    fn executor(workers: usize) -> Executor {
        Executor::new(ExecutorConfig::new().with_max_workers(workers))
    }

    fn no_params() -> HashMap<String, Value> {
        HashMap::new()
    }

    /// load -> transform -> train, driven by a `source_uri` parameter.
    fn ml_pipeline() -> PipelineGraph {
        let load = FnStage::new("load", |ctx| {
            let uri = ctx.input("source_uri").and_then(Value::as_str).unwrap_or_default();
            let rows = if uri.is_empty() { json!([]) } else { json!([3, -1, 4, -1, 5]) };
            StageOutput::ok_value("raw", rows)
        });
        let transform = FnStage::new("transform", |ctx| {
            StageOutput::from_result(ctx.input_as::<Vec<i64>>("raw").map(|rows| {
                let clean: Vec<i64> = rows.into_iter().filter(|v| *v >= 0).collect();
                HashMap::from([("clean".to_string(), json!(clean))])
            }))
        });
        let train = FnStage::new("train", |ctx| {
            StageOutput::from_result(ctx.input_as::<Vec<i64>>("clean").map(|rows| {
                #[allow(clippy::cast_precision_loss)]
                let mean = rows.iter().sum::<i64>() as f64 / rows.len().max(1) as f64;
                HashMap::from([("model".to_string(), json!({"kind": "mean", "weight": mean}))])
            }))
        });

        let mut registry = StageRegistry::new("ml");
        registry.declare_param("source_uri", Str);
        registry
            .register(
                StageSpec::from_stage(load)
                    .with_input("source_uri", Str)
                    .with_output("raw", Array),
            )
            .unwrap();
        registry
            .register(
                StageSpec::from_stage(transform)
                    .with_input("raw", Array)
                    .with_output("clean", Array),
            )
            .unwrap();
        registry
            .register(
                StageSpec::from_stage(train)
                    .with_input("clean", Array)
                    .with_output("model", Object),
            )
            .unwrap();
        registry.build().unwrap()
    }

    /// A wide graph: one root, four independent middles, one join.
    fn fan_out_graph() -> PipelineGraph {
        let mut registry = StageRegistry::new("fan");
        registry
            .register(StageSpec::from_stage(ProducerStage::new("root", [("seed", json!(1))])).with_output("seed", Integer))
            .unwrap();
        for i in 0..4 {
            let key = format!("part{i}");
            registry
                .register(
                    StageSpec::from_stage(ProducerStage::new(format!("mid{i}"), [(key.as_str(), json!(i))]))
                        .with_input("seed", Integer)
                        .with_output(key.clone(), Integer),
                )
                .unwrap();
        }
        let mut join = StageSpec::from_stage(CountingStage::new("join"));
        for i in 0..4 {
            join = join.with_input(format!("part{i}"), Number);
        }
        registry.register(join).unwrap();
        registry.build().unwrap()
    }

    #[test]
    fn test_topological_order_respects_every_edge() {
        let graph = fan_out_graph();
        let order = graph.execution_order();
        assert_eq!(order.len(), graph.len());

        let position = |name: &str| order.iter().position(|s| *s == name).unwrap();
        for stage in order.iter().copied() {
            for producer in graph.dependencies(stage).unwrap() {
                assert!(position(producer) < position(stage), "{producer} must precede {stage}");
            }
        }
        assert_eq!(order, vec!["root", "mid0", "mid1", "mid2", "mid3", "join"]);
    }

    #[test]
    fn test_cycle_fails_build() {
        let err = StageRegistry::new("loop")
            .with_stage(
                StageSpec::from_stage(CountingStage::new("a"))
                    .with_input("y", Integer)
                    .with_output("x", Integer),
            )
            .unwrap()
            .with_stage(
                StageSpec::from_stage(CountingStage::new("b"))
                    .with_input("x", Integer)
                    .with_output("y", Integer),
            )
            .unwrap()
            .build()
            .unwrap_err();

        match err {
            PipelineError::CycleDetected(cycle) => assert_eq!(cycle.cycle_path, vec!["a", "b", "a"]),
            other => panic!("expected a cycle, got {other}"),
        }
    }

    #[test]
    fn test_unresolved_input_fails_build() {
        let err = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(CountingStage::new("train")).with_input("features", Array))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UnresolvedInput { ref stage, ref key, .. } if stage == "train" && key == "features"
        ));
        assert!(err.is_definition_error());
    }

    #[tokio::test]
    async fn test_load_transform_train() {
        let graph = ml_pipeline();
        let record = executor(4)
            .execute(
                &graph,
                HashMap::from([("source_uri".to_string(), json!("s3://bucket/data.csv"))]),
            )
            .await
            .unwrap();

        assert_run_status(&record, RunStatus::Succeeded);
        assert_eq!(record.completion_order(), ["load", "transform", "train"]);
        assert_eq!(record.get("raw"), Some(&json!([3, -1, 4, -1, 5])));
        assert_eq!(record.get("clean"), Some(&json!([3, 4, 5])));
        assert_eq!(record.get("model"), Some(&json!({"kind": "mean", "weight": 4.0})));
        for stage in &record.stages {
            assert_eq!(stage.state, StageState::Done);
            assert_eq!(stage.attempts, 1);
        }

        let context = record.into_result().unwrap();
        assert_eq!(context.keys(), vec!["clean", "model", "raw", "source_uri"]);
    }

    #[tokio::test]
    async fn test_repeated_runs_complete_in_same_order() {
        let graph = fan_out_graph();
        let executor = executor(1);

        let mut orders = Vec::new();
        for _ in 0..5 {
            let record = executor.execute(&graph, no_params()).await.unwrap();
            assert!(record.is_success());
            orders.push(record.completion_order().to_vec());
        }
        let expected: Vec<String> = graph.execution_order().iter().map(ToString::to_string).collect();
        assert!(orders.iter().all(|order| *order == expected));
    }

    #[tokio::test]
    async fn test_stage_sees_only_declared_inputs() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let probe = {
            let seen = seen.clone();
            FnStage::new("probe", move |ctx| {
                let mut keys: Vec<String> = ctx.inputs().keys().cloned().collect();
                keys.sort();
                *seen.lock() = keys;
                StageOutput::ok_empty()
            })
        };
        let mut registry = StageRegistry::new("p");
        registry.declare_param("lr", Number);
        registry.declare_param("epochs", Integer);
        registry
            .register(StageSpec::from_stage(ProducerStage::new("load", [("raw", json!([]))])).with_output("raw", Array))
            .unwrap();
        registry
            .register(StageSpec::from_stage(probe).with_input("raw", Array).with_input("lr", Number))
            .unwrap();
        let graph = registry.build().unwrap();

        let params = HashMap::from([
            ("lr".to_string(), json!(0.1)),
            ("epochs".to_string(), json!(3)),
        ]);
        let record = executor(2).execute(&graph, params).await.unwrap();
        assert!(record.is_success());
        assert_eq!(*seen.lock(), vec!["lr".to_string(), "raw".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_bound_gives_exactly_n_plus_one_invocations() {
        let failing = FailingStage::new("train");
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(failing.clone()).with_retry(fast_retry(3)))
            .unwrap()
            .build()
            .unwrap();

        let record = executor(1).execute(&graph, no_params()).await.unwrap();
        assert_run_status(&record, RunStatus::Failed);
        assert_eq!(failing.calls(), 4);
        assert_eq!(record.stage("train").unwrap().attempts, 4);
        assert!(matches!(
            record.error(),
            Some(PipelineError::StageExecution { stage, attempts: 4, .. }) if stage == "train"
        ));
    }

    #[tokio::test]
    async fn test_fatal_failure_skips_remaining_retries() {
        let failing = FailingStage::new("train").fatal();
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(failing.clone()).with_retry(fast_retry(5)))
            .unwrap()
            .build()
            .unwrap();

        let record = executor(1).execute(&graph, no_params()).await.unwrap();
        assert_run_status(&record, RunStatus::Failed);
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test]
    async fn test_flaky_stage_succeeds_within_retry_bound() {
        let flaky = FlakyStage::new("load", 2).with_value("raw", json!([1]));
        let sink = Arc::new(CollectingEventSink::new());
        let graph = StageRegistry::new("p")
            .with_stage(
                StageSpec::from_stage(flaky.clone())
                    .with_output("raw", Array)
                    .with_retry(fast_retry(2)),
            )
            .unwrap()
            .build()
            .unwrap();

        let record = executor(1)
            .with_event_sink(sink.clone())
            .execute(&graph, no_params())
            .await
            .unwrap();
        assert!(record.is_success());
        assert_eq!(flaky.calls(), 3);
        assert_eq!(record.stage("load").unwrap().attempts, 3);
        assert_eq!(sink.events_of_type("stage.retrying").len(), 2);
    }

    #[tokio::test]
    async fn test_failure_skips_downstream_and_keeps_partial_record() {
        let train = CountingStage::new("train");
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(ProducerStage::new("load", [("raw", json!([1]))])).with_output("raw", Array))
            .unwrap()
            .with_stage(
                StageSpec::from_stage(FailingStage::new("transform"))
                    .with_input("raw", Array)
                    .with_output("clean", Array),
            )
            .unwrap()
            .with_stage(StageSpec::from_stage(train.clone()).with_input("clean", Array))
            .unwrap()
            .build()
            .unwrap();

        let record = executor(2).execute(&graph, no_params()).await.unwrap();
        assert_run_status(&record, RunStatus::Failed);
        assert_stage_state(&record, "load", StageState::Done);
        assert_stage_state(&record, "transform", StageState::Failed);
        assert_stage_state(&record, "train", StageState::Skipped);
        assert_eq!(train.calls(), 0);
        assert_eq!(record.get("raw"), Some(&json!([1])));
        assert!(record.get("clean").is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_first_stage() {
        let executor = executor(1);
        let token = executor.cancellation_token();
        let second = CountingStage::new("b");
        let first = FnStage::new("a", move |_| {
            token.cancel("operator request");
            StageOutput::ok_value("x", json!(1))
        });
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(first).with_output("x", Integer))
            .unwrap()
            .with_stage(StageSpec::from_stage(second.clone()).with_input("x", Integer))
            .unwrap()
            .build()
            .unwrap();

        let record = executor.execute(&graph, no_params()).await.unwrap();
        assert_run_status(&record, RunStatus::Cancelled);
        assert_stage_state(&record, "a", StageState::Done);
        assert_stage_state(&record, "b", StageState::Cancelled);
        assert_eq!(second.calls(), 0);
        assert_eq!(record.get("x"), Some(&json!(1)));
        assert!(matches!(
            record.error(),
            Some(PipelineError::Cancelled { reason }) if reason == "operator request"
        ));
    }

    #[tokio::test]
    async fn test_cooperative_stage_stops_on_cancel() {
        let executor = Executor::new(
            ExecutorConfig::new()
                .with_max_workers(2)
                .with_grace_period(Duration::from_secs(10)),
        );
        let token = executor.cancellation_token();
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(SlowStage::new("train", Duration::from_secs(30)).cooperative()))
            .unwrap()
            .build()
            .unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel("shutdown");
        });
        let started = Instant::now();
        let record = executor.execute(&graph, no_params()).await.unwrap();
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_run_status(&record, RunStatus::Cancelled);
        assert_stage_state(&record, "train", StageState::Cancelled);
    }

    #[tokio::test]
    async fn test_uncooperative_stage_aborted_after_grace_period() {
        let executor = Executor::new(
            ExecutorConfig::new()
                .with_max_workers(2)
                .with_grace_period(Duration::from_millis(50)),
        );
        let token = executor.cancellation_token();
        let stuck = SlowStage::new("train", Duration::from_secs(30));
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(stuck.clone()))
            .unwrap()
            .with_stage(StageSpec::from_stage(CountingStage::new("report")))
            .unwrap()
            .build()
            .unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel("deadline");
        });
        let started = Instant::now();
        let record = executor.execute(&graph, no_params()).await.unwrap();
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stuck.calls(), 1);
        assert_run_status(&record, RunStatus::Cancelled);
        assert_stage_state(&record, "train", StageState::Cancelled);
        assert_stage_state(&record, "report", StageState::Done);
    }

    #[tokio::test]
    async fn test_dropping_run_aborts_in_flight_stages() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let slow = AsyncFnStage::new("train", move |_ctx| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                StageOutput::ok_empty()
            }
        });
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(slow))
            .unwrap()
            .build()
            .unwrap();

        let executor = executor(1);
        let timed_out = tokio::time::timeout(Duration::from_millis(20), executor.execute(&graph, no_params())).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stage_cancel_output_cancels_run() {
        let graph = StageRegistry::new("p")
            .with_stage(StageSpec::from_stage(FnStage::new("gate", |_| StageOutput::cancel("quota exhausted"))))
            .unwrap()
            .with_stage(StageSpec::from_stage(CountingStage::new("train")))
            .unwrap()
            .build()
            .unwrap();

        let record = executor(1).execute(&graph, no_params()).await.unwrap();
        assert_run_status(&record, RunStatus::Cancelled);
        assert_stage_state(&record, "gate", StageState::Cancelled);
        assert_stage_state(&record, "train", StageState::Cancelled);
    }

    #[tokio::test]
    async fn test_max_workers_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = StageRegistry::new("wide");
        for i in 0..8 {
            let active = active.clone();
            let peak = peak.clone();
            let stage = AsyncFnStage::new(format!("s{i}"), move |_ctx| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    StageOutput::ok_empty()
                }
            });
            registry.register(StageSpec::from_stage(stage)).unwrap();
        }
        let graph = registry.build().unwrap();

        let record = executor(3).execute(&graph, no_params()).await.unwrap();
        assert!(record.is_success());
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded the worker limit");
        assert!(peak >= 2, "independent stages should overlap");
    }

    #[tokio::test]
    async fn test_one_executor_runs_graphs_concurrently() {
        let graph = ml_pipeline();
        let executor = executor(4);
        let params = |uri: &str| HashMap::from([("source_uri".to_string(), json!(uri))]);

        let (first, second) = tokio::join!(
            executor.execute(&graph, params("a.csv")),
            executor.execute(&graph, params("")),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.is_success());
        assert!(second.is_success());
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(second.get("clean"), Some(&json!([])));
    }
}
