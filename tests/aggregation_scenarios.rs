//! End-to-end aggregation scenarios driven through the public engine API

mod common;

use accrete_aggregate::{
    from_kind, AggregationEngine, AggregationRepository, AggregationStrategy, ChannelSink,
    FnStrategy, GroupBodiesStrategy, MemoryRecoverableRepository, MemoryRepository,
    RecoverableRepository, RecoverySettings, UseLatestStrategy,
};
use accrete_core::error::{CorrelationError, LockingError};
use accrete_core::{
    AccreteError, AggregatorConfig, AppConfig, CompletionReason, Exchange, Expression,
    OptimisticLockRetryPolicy, Predicate, StrategyError,
};
use common::{drain, fixtures_dir, init_tracing, keyed, keyed_config, recv, ContendedRepository};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_size_three_keeps_latest() {
    init_tracing();
    let config = AggregatorConfig {
        completion_size: Some(3),
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config)
        .strategy(UseLatestStrategy)
        .sink(sink)
        .build()
        .unwrap();
    engine.start().await.unwrap();

    for body in ["a1", "a2", "a3"] {
        engine.submit(keyed(body, "A")).await.unwrap();
    }

    let out = recv(&rx).await;
    assert_eq!(out.body, json!("a3"));
    assert_eq!(out.properties.aggregated_size, Some(3));
    assert_eq!(out.properties.completed_by, Some(CompletionReason::Size));
    assert!(engine.repository().get("A").is_none());

    let stats = engine.statistics().snapshot();
    assert_eq!(stats.total_in, 3);
    assert_eq!(stats.completed_by_size, 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_predicate_completes_on_end_marker() {
    init_tracing();
    let config = AggregatorConfig {
        completion_predicate: Some(Predicate::BodyContains("END".to_string())),
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config)
        .strategy(GroupBodiesStrategy)
        .sink(sink)
        .build()
        .unwrap();
    engine.start().await.unwrap();

    engine.submit(keyed("b1", "B")).await.unwrap();
    engine.submit(keyed("b2", "B")).await.unwrap();
    assert!(drain(&rx).is_empty());
    engine.submit(keyed("END", "B")).await.unwrap();

    let out = recv(&rx).await;
    assert_eq!(out.body, json!(["b1", "b2", "END"]));
    assert_eq!(out.properties.completed_by, Some(CompletionReason::Predicate));
    assert_eq!(out.properties.correlation_key.as_deref(), Some("B"));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_discard_on_aggregation_failure() {
    init_tracing();
    let config = AggregatorConfig {
        completion_size: Some(10),
        discard_on_aggregation_failure: true,
        ..keyed_config()
    };
    let strategy = FnStrategy::new(|old, new| {
        if new.body == json!("bad") {
            return Err(StrategyError::new("unparseable"));
        }
        GroupBodiesStrategy.aggregate(old, new)
    });
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config)
        .strategy(strategy)
        .sink(sink)
        .build()
        .unwrap();
    engine.start().await.unwrap();

    engine.submit(keyed("c1", "C")).await.unwrap();
    engine.submit(keyed("c2", "C")).await.unwrap();
    // the failing message is swallowed and the group dropped
    engine.submit(keyed("bad", "C")).await.unwrap();

    assert!(engine.repository().get("C").is_none());
    assert_eq!(engine.statistics().snapshot().discarded, 1);

    // a failing first message has nothing to discard
    engine.submit(keyed("bad", "F")).await.unwrap();
    assert!(engine.repository().get("F").is_none());
    assert_eq!(engine.statistics().snapshot().discarded, 1);

    engine.stop().await.unwrap();
    assert!(drain(&rx).is_empty());
}

#[tokio::test]
async fn test_force_completion_of_all_groups() {
    init_tracing();
    let config = AggregatorConfig {
        completion_size: Some(10),
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config).sink(sink).build().unwrap();
    engine.start().await.unwrap();

    engine.submit(keyed("d1", "D")).await.unwrap();
    engine.submit(keyed("d2", "D")).await.unwrap();
    engine.submit(keyed("e1", "E")).await.unwrap();
    assert_eq!(engine.force_completion_of_all_groups(), 2);
    assert!(engine.repository().keys().is_empty());
    assert_eq!(engine.force_completion_of_all_groups(), 0);
    assert_eq!(engine.force_completion_of_group("D"), 0);

    let mut keys: Vec<String> = vec![recv(&rx).await, recv(&rx).await]
        .into_iter()
        .filter_map(|ex| {
            assert_eq!(ex.properties.completed_by, Some(CompletionReason::Force));
            ex.properties.correlation_key
        })
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["D".to_string(), "E".to_string()]);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_closed_key_rejects_late_messages() {
    init_tracing();
    let config = AggregatorConfig {
        completion_size: Some(2),
        close_correlation_key_on_completion: Some(0),
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config).sink(sink).build().unwrap();
    engine.start().await.unwrap();

    engine.submit(keyed("1", "K")).await.unwrap();
    engine.submit(keyed("2", "K")).await.unwrap();
    recv(&rx).await;

    let err = engine.submit(keyed("3", "K")).await.unwrap_err();
    assert!(matches!(
        err,
        AccreteError::Correlation(CorrelationError::ClosedKey { .. })
    ));
    assert_eq!(engine.closed_correlation_keys_len(), 1);

    engine.clear_closed_correlation_keys();
    engine.submit(keyed("3", "K")).await.unwrap();
    assert_eq!(
        engine.repository().get("K").unwrap().exchange.properties.aggregated_size,
        Some(1)
    );
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_bounded_closed_keys_reopen_oldest() {
    init_tracing();
    let config = AggregatorConfig {
        completion_size: Some(1),
        close_correlation_key_on_completion: Some(1),
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config).sink(sink).build().unwrap();
    engine.start().await.unwrap();

    engine.submit(keyed("1", "A")).await.unwrap();
    engine.submit(keyed("1", "B")).await.unwrap();
    assert_eq!(engine.closed_correlation_keys_len(), 1);

    // A was evicted when B closed
    engine.submit(keyed("2", "A")).await.unwrap();
    assert!(engine.submit(keyed("3", "A")).await.is_err());

    let mut delivered = Vec::new();
    for _ in 0..3 {
        delivered.extend(recv(&rx).await.properties.correlation_key);
    }
    assert_eq!(delivered, vec!["A", "B", "A"]);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_optimistic_locking_retries_conflicts() {
    init_tracing();
    let repository = Arc::new(ContendedRepository::new(2));
    let failures = Arc::new(AtomicUsize::new(0));

    struct CountingStrategy(Arc<AtomicUsize>);

    impl AggregationStrategy for CountingStrategy {
        fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, StrategyError> {
            GroupBodiesStrategy.aggregate(old, new)
        }

        fn on_optimistic_lock_failure(&self, _old: Option<&Exchange>, _new: &Exchange) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let config = AggregatorConfig {
        completion_size: Some(2),
        optimistic_locking: true,
        optimistic_lock_retry: OptimisticLockRetryPolicy {
            maximum_retries: 5,
            retry_delay_ms: 1,
            ..Default::default()
        },
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config)
        .strategy(CountingStrategy(Arc::clone(&failures)))
        .repository(repository.clone())
        .sink(sink)
        .build()
        .unwrap();
    engine.start().await.unwrap();

    engine.submit(keyed("o1", "O")).await.unwrap();
    engine.submit(keyed("o2", "O")).await.unwrap();

    let out = recv(&rx).await;
    assert_eq!(out.body, json!(["o1", "o2"]));
    assert_eq!(repository.rejected(), 2);
    assert_eq!(failures.load(Ordering::SeqCst), 2);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_optimistic_locking_exhausts_retries() {
    init_tracing();
    let repository = Arc::new(ContendedRepository::new(usize::MAX));
    let config = AggregatorConfig {
        completion_size: Some(2),
        optimistic_locking: true,
        optimistic_lock_retry: OptimisticLockRetryPolicy {
            maximum_retries: 3,
            retry_delay_ms: 1,
            ..Default::default()
        },
        ..keyed_config()
    };
    let (sink, _rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config)
        .repository(repository.clone())
        .sink(sink)
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let err = engine.submit(keyed("x", "X")).await.unwrap_err();
    assert!(matches!(
        err,
        AccreteError::Locking(LockingError::Exhausted { attempts: 3 })
    ));
    assert_eq!(repository.rejected(), 3);
    assert!(repository.keys().is_empty());
    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submits_complete_once() {
    init_tracing();
    for optimistic_locking in [false, true] {
        let config = AggregatorConfig {
            completion_size: Some(100),
            optimistic_locking,
            optimistic_lock_retry: OptimisticLockRetryPolicy {
                retry_delay_ms: 0,
                ..Default::default()
            },
            ..keyed_config()
        };
        let (sink, rx) = ChannelSink::unbounded();
        let engine = AggregationEngine::builder(config)
            .strategy(GroupBodiesStrategy)
            .sink(sink)
            .build()
            .unwrap();
        engine.start().await.unwrap();

        let mut handles = Vec::new();
        for worker in 0..4 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let body = format!("{}-{}", worker, i);
                    engine.submit(keyed(&body, "hot")).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let out = recv(&rx).await;
        assert_eq!(out.properties.aggregated_size, Some(100));
        assert_eq!(out.body.as_array().map(Vec::len), Some(100));
        engine.stop().await.unwrap();
        assert!(drain(&rx).is_empty(), "optimistic={}", optimistic_locking);
    }
}

#[tokio::test]
async fn test_timeout_fires_exactly_once() {
    init_tracing();
    let config = AggregatorConfig {
        completion_timeout_ms: Some(100),
        completion_timeout_checker_interval_ms: 10,
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config)
        .strategy(GroupBodiesStrategy)
        .sink(sink)
        .build()
        .unwrap();
    engine.start().await.unwrap();

    engine.submit(keyed("t1", "T")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    // each message restarts the inactivity window
    engine.submit(keyed("t2", "T")).await.unwrap();

    let out = recv(&rx).await;
    assert_eq!(out.body, json!(["t1", "t2"]));
    assert_eq!(out.properties.completed_by, Some(CompletionReason::Timeout));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(drain(&rx).is_empty());
    assert_eq!(engine.statistics().snapshot().completed_by_timeout, 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_dynamic_size_and_timeout_expressions() {
    init_tracing();
    let config = AggregatorConfig {
        completion_size: Some(100),
        completion_size_expression: Some(Expression::Header("expected".to_string())),
        completion_timeout_expression: Some(Expression::Header("ttl".to_string())),
        completion_timeout_checker_interval_ms: 10,
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config).sink(sink).build().unwrap();
    engine.start().await.unwrap();

    // numeric strings are accepted for the expected size
    for body in ["s1", "s2"] {
        engine
            .submit(keyed(body, "S").with_header("expected", "2"))
            .await
            .unwrap();
    }
    let out = recv(&rx).await;
    assert_eq!(out.properties.completed_by, Some(CompletionReason::Size));
    assert_eq!(out.properties.aggregated_size, Some(2));

    engine
        .submit(keyed("t", "T").with_header("ttl", 50))
        .await
        .unwrap();
    assert_eq!(
        engine.repository().get("T").unwrap().exchange.properties.timeout_millis,
        Some(50)
    );
    let out = recv(&rx).await;
    assert_eq!(out.properties.completed_by, Some(CompletionReason::Timeout));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_open_group_keeps_its_size() {
    init_tracing();
    let config = AggregatorConfig {
        completion_size: Some(10),
        ..keyed_config()
    };
    let (sink, _rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config).sink(sink).build().unwrap();
    engine.start().await.unwrap();

    for body in ["1", "2", "3", "4"] {
        engine.submit(keyed(body, "N")).await.unwrap();
    }
    let stored = engine.repository().get("N").unwrap();
    assert_eq!(stored.exchange.properties.aggregated_size, Some(4));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_completed_key_restarts_at_size_one() {
    init_tracing();
    let config = AggregatorConfig {
        completion_size: Some(2),
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config).sink(sink).build().unwrap();
    engine.start().await.unwrap();

    engine.submit(keyed("1", "R")).await.unwrap();
    engine.submit(keyed("2", "R")).await.unwrap();
    recv(&rx).await;

    engine.submit(keyed("3", "R")).await.unwrap();
    let stored = engine.repository().get("R").unwrap();
    assert_eq!(stored.exchange.properties.aggregated_size, Some(1));
    assert_eq!(stored.exchange.body, json!("3"));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_caller_exchange_is_not_mutated() {
    init_tracing();
    let config = AggregatorConfig {
        completion_size: Some(1),
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config).sink(sink).build().unwrap();
    engine.start().await.unwrap();

    let input = keyed("only", "M");
    engine.submit(input.clone()).await.unwrap();

    let out = recv(&rx).await;
    assert_ne!(out.id(), input.id());
    assert_eq!(out.correlation_id(), Some(input.id()));
    assert_eq!(input.properties.aggregated_size, None);
    engine.stop().await.unwrap();
}

#[test]
fn test_confirm_is_idempotent() {
    let repository = MemoryRecoverableRepository::new(RecoverySettings::default());
    let done = Exchange::new("done");
    repository.add("A", done.clone());
    repository.remove("A", &done);
    assert_eq!(repository.scan(), vec![done.id()]);

    repository.confirm(&done.id());
    repository.confirm(&done.id());
    assert!(repository.scan().is_empty());
    assert!(!repository.confirm_with_result(&done.id()));

    // plain repositories accept confirmations for unknown ids
    MemoryRepository::new().confirm(&done.id());
}

#[tokio::test]
async fn test_fixture_config_drives_engine() {
    init_tracing();
    let config = AppConfig::from_file(fixtures_dir().join("aggregator.yaml")).unwrap();
    assert_eq!(config.logging.level, "debug");

    let strategy = from_kind(&config.aggregator.strategy);
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config.aggregator)
        .shared_strategy(strategy)
        .sink(sink)
        .build()
        .unwrap();
    engine.start().await.unwrap();

    engine.submit(Exchange::new(json!({"symbol": "ACME"}))).await.unwrap();
    engine
        .submit(Exchange::new(json!({"symbol": "INIT"})).with_header("type", "close"))
        .await
        .unwrap();
    let closed = recv(&rx).await;
    assert_eq!(closed.properties.correlation_key.as_deref(), Some("INIT"));
    assert_eq!(closed.properties.completed_by, Some(CompletionReason::Predicate));

    engine.submit(Exchange::new(json!({"symbol": "ACME"}))).await.unwrap();
    let pair = recv(&rx).await;
    assert_eq!(pair.properties.correlation_key.as_deref(), Some("ACME"));
    assert_eq!(pair.body_text(), r#"{"symbol":"ACME"}|{"symbol":"ACME"}"#);

    assert!(engine
        .submit(Exchange::new(json!({"symbol": "ACME"})))
        .await
        .is_err());
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_parallel_processing_delivers_everything() {
    init_tracing();
    let config = AggregatorConfig {
        completion_size: Some(1),
        parallel_processing: true,
        ..keyed_config()
    };
    let (sink, rx) = ChannelSink::unbounded();
    let engine = AggregationEngine::builder(config).sink(sink).build().unwrap();
    engine.start().await.unwrap();

    for i in 0..20 {
        engine.submit(keyed("p", &format!("P{}", i))).await.unwrap();
    }
    for _ in 0..20 {
        recv(&rx).await;
    }
    assert_eq!(engine.statistics().snapshot().total_completed, 20);
    engine.stop().await.unwrap();
}
