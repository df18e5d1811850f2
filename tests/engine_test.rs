//! # Engine Test Suite
//!
//! End-to-end behaviour of `ConjectureRunner`: finding and minimizing failures, exit reasons,
//! flakiness detection, database reuse, health checks and configuration.

use std::cell::Cell;
use std::time::Duration;

use conjecture_core::{
    ConjectureData, ConjectureRunner, DatabaseKey, DrawStrategy, EngineError, ExampleDatabase,
    ExitReason, HealthCheck, InMemoryDatabase, Phase, RunnerConfig, Status, TestError, TestResult,
};

/// Test helper to create a minimal test configuration
fn minimal_config() -> RunnerConfig {
    RunnerConfig {
        buffer_size: 1024,
        max_examples: 50,
        seed: 42,
        ..RunnerConfig::default()
    }
}

fn fails_above_200(data: &mut ConjectureData<'_>) -> TestResult {
    if data.draw_u8()? > 200 {
        return Err(data.mark_interesting("big").into());
    }
    Ok(())
}

#[test]
fn test_finds_and_minimizes_single_byte_failure() {
    let mut runner = ConjectureRunner::new(fails_above_200, minimal_config());
    let result = runner.run().unwrap();

    assert!(!result.passed());
    assert_eq!(result.interesting_examples.len(), 1);
    let example = result.interesting_examples.values().next().unwrap();
    assert_eq!(example.buffer, vec![201]);
    assert_eq!(example.status, Status::Interesting);
    assert_eq!(example.interesting_origin.as_ref().unwrap().as_str(), "big");
}

#[test]
fn test_two_byte_threshold_shrinks_to_boundary() {
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            let bytes = data.draw_bytes(2)?;
            if u16::from_be_bytes([bytes[0], bytes[1]]) >= 1000 {
                return Err(data.mark_interesting("large").into());
            }
            Ok(())
        },
        minimal_config(),
    );
    let result = runner.run().unwrap();
    assert_eq!(
        result.interesting_examples.values().next().unwrap().buffer,
        vec![3, 232]
    );
}

#[test]
fn test_same_origin_collapses_to_one_example() {
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            if data.draw_u8()? > 100 {
                return Err(data.mark_interesting("bad").into());
            }
            Ok(())
        },
        minimal_config(),
    );
    let result = runner.run().unwrap();
    assert_eq!(result.interesting_examples.len(), 1);
    assert!(result.stats.interesting_calls >= 2);
    assert_eq!(
        result.interesting_examples.values().next().unwrap().buffer,
        vec![101]
    );
}

#[test]
fn test_distinct_origins_are_kept_apart() {
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            let first = data.draw_u8()?;
            let second = data.draw_u8()?;
            if first > 100 && second > 100 {
                return Err(data.mark_interesting("both").into());
            }
            if first > 100 {
                return Err(data.mark_interesting("first").into());
            }
            Ok(())
        },
        minimal_config(),
    );
    runner
        .test_function(DrawStrategy::Replay(vec![150, 150]))
        .unwrap();
    runner
        .test_function(DrawStrategy::Replay(vec![150, 0]))
        .unwrap();
    assert_eq!(runner.interesting_examples().len(), 2);
}

#[test]
fn test_flaky_failure_is_reported() {
    let failed = Cell::new(false);
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            let byte = data.draw_u8()?;
            if byte > 0 && !failed.get() {
                failed.set(true);
                return Err(data.mark_interesting("once").into());
            }
            Ok(())
        },
        minimal_config(),
    );
    let result = runner.run().unwrap();
    assert_eq!(result.exit_reason, ExitReason::Flaky);
    assert!(result.is_flaky());
    assert!(!result.passed());
}

#[test]
fn test_zero_bound_zeroes_oversized_draws() {
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            data.draw_bytes(8)?;
            data.draw_bytes(40)?;
            Ok(())
        },
        RunnerConfig {
            buffer_size: 64,
            ..minimal_config()
        },
    );
    for _ in 0..5 {
        let result = runner.test_function(DrawStrategy::Random).unwrap();
        assert!(result.hit_zero_bound);
        assert_eq!(result.buffer.len(), 48);
        assert!(result.buffer[8..].iter().all(|&b| b == 0));
    }
}

#[test]
fn test_passing_test_stops_at_max_examples() {
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            data.draw_u64()?;
            Ok(())
        },
        minimal_config(),
    );
    let result = runner.run().unwrap();
    assert!(result.passed());
    assert_eq!(result.exit_reason, ExitReason::MaxExamples);
    assert_eq!(result.stats.valid_examples, 50);
}

#[test]
fn test_small_search_space_finishes() {
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            data.draw_capped_byte(2)?;
            Ok(())
        },
        minimal_config(),
    );
    let result = runner.run().unwrap();
    assert_eq!(result.exit_reason, ExitReason::Finished);
    assert_eq!(result.stats.call_count, 3);
    assert!(runner.tree().is_exhausted());
}

#[test]
fn test_zero_timeout_stops_immediately() {
    let mut runner = ConjectureRunner::new(
        fails_above_200,
        RunnerConfig {
            timeout: Some(Duration::ZERO),
            ..minimal_config()
        },
    );
    let result = runner.run().unwrap();
    assert_eq!(result.exit_reason, ExitReason::Timeout);
    assert_eq!(result.stats.call_count, 1);
}

#[test]
fn test_shrink_budget_stops_run() {
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            let bytes = data.draw_bytes(2)?;
            if u16::from_be_bytes([bytes[0], bytes[1]]) >= 1000 {
                return Err(data.mark_interesting("large").into());
            }
            Ok(())
        },
        RunnerConfig {
            max_shrinks: 1,
            ..minimal_config()
        },
    );
    let result = runner.run().unwrap();
    assert_eq!(result.exit_reason, ExitReason::MaxShrinks);
    assert_eq!(result.stats.shrinks, 1);
}

#[test]
fn test_panic_becomes_interesting_origin() {
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            let byte = data.draw_u8()?;
            assert!(byte <= 200, "byte {} too large", byte);
            Ok(())
        },
        minimal_config(),
    );
    let result = runner.run().unwrap();
    let (origin, example) = result.interesting_examples.iter().next().unwrap();
    assert!(origin.as_str().starts_with("panicked at "), "{}", origin);
    assert!(origin.as_str().contains("engine_test.rs"));
    assert_eq!(example.buffer, vec![201]);
}

#[test]
fn test_fault_aborts_run_and_saves_buffer() {
    let db = InMemoryDatabase::new();
    let key = DatabaseKey::from_function("test_fault_aborts_run_and_saves_buffer");
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            data.draw_u8()?;
            Err(TestError::fault("connection refused"))
        },
        minimal_config(),
    )
    .with_database(db.clone(), key.clone());

    match runner.run() {
        Err(EngineError::TestFault(fault)) => assert_eq!(fault.to_string(), "connection refused"),
        other => panic!("unexpected outcome {:?}", other.map(|r| r.exit_reason)),
    }
    assert_eq!(db.fetch(&key).unwrap(), vec![vec![0]]);
}

#[test]
fn test_filtering_everything_fails_health_check() {
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            data.draw_u8()?;
            Err(data.mark_invalid().into())
        },
        minimal_config(),
    );
    match runner.run() {
        Err(EngineError::HealthCheck { check, .. }) => {
            assert_eq!(check, HealthCheck::FilterTooMuch)
        }
        other => panic!("unexpected outcome {:?}", other.map(|r| r.exit_reason)),
    }
}

#[test]
fn test_disabled_health_check_runs_to_iteration_limit() {
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            data.draw_bytes(2)?;
            Err(data.mark_invalid().into())
        },
        RunnerConfig {
            perform_health_check: false,
            max_iterations: 120,
            ..minimal_config()
        },
    );
    let result = runner.run().unwrap();
    assert_eq!(result.exit_reason, ExitReason::MaxIterations);
    assert_eq!(result.stats.invalid_examples, 120);
}

#[test]
fn test_database_reuse_replays_saved_failure() {
    let db = InMemoryDatabase::new();
    let key = DatabaseKey::from_function("test_database_reuse_replays_saved_failure");

    let mut first = ConjectureRunner::new(fails_above_200, minimal_config())
        .with_database(db.clone(), key.clone());
    first.run().unwrap();
    assert_eq!(db.fetch(&key).unwrap(), vec![vec![201]]);

    let mut second = ConjectureRunner::new(
        fails_above_200,
        RunnerConfig {
            phases: vec![Phase::Reuse],
            ..minimal_config()
        },
    )
    .with_database(db.clone(), key.clone());
    let result = second.run().unwrap();
    assert_eq!(
        result.interesting_examples.values().next().unwrap().buffer,
        vec![201]
    );
}

#[test]
fn test_fixed_failures_are_evicted_from_database() {
    let db = InMemoryDatabase::new();
    let key = DatabaseKey::from_function("test_fixed_failures_are_evicted_from_database");
    let mut handle = db.clone();
    handle.save(&key, &[201]).unwrap();

    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            data.draw_u8()?;
            Ok(())
        },
        RunnerConfig {
            phases: vec![Phase::Reuse],
            ..minimal_config()
        },
    )
    .with_database(db.clone(), key.clone());
    let result = runner.run().unwrap();
    assert!(result.passed());
    assert!(db.fetch(&key).unwrap().is_empty());
}

#[test]
fn test_shrink_during_reuse_keeps_new_best_in_database() {
    let db = InMemoryDatabase::new();
    let key = DatabaseKey::from_function("test_shrink_during_reuse_keeps_new_best_in_database");
    let mut handle = db.clone();
    handle.save(&key, &[250]).unwrap();
    handle.save(&key.with_sub_key("secondary"), &[210]).unwrap();

    let mut runner = ConjectureRunner::new(
        fails_above_200,
        RunnerConfig {
            phases: vec![Phase::Reuse],
            max_shrinks: 1,
            ..minimal_config()
        },
    )
    .with_database(db.clone(), key.clone());
    let result = runner.run().unwrap();

    assert_eq!(result.exit_reason, ExitReason::MaxShrinks);
    assert_eq!(
        result.interesting_examples.values().next().unwrap().buffer,
        vec![210]
    );
    assert_eq!(db.fetch(&key).unwrap(), vec![vec![210]]);
    assert_eq!(
        db.fetch(&key.with_sub_key("secondary")).unwrap(),
        vec![vec![250]]
    );
}

#[test]
fn test_all_zero_buffer_is_tried_after_reused_failure() {
    let db = InMemoryDatabase::new();
    let key = DatabaseKey::from_function("test_all_zero_buffer_is_tried_after_reused_failure");
    let mut handle = db.clone();
    handle.save(&key, &[9]).unwrap();

    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            data.draw_u8()?;
            Err(data.mark_interesting("always").into())
        },
        RunnerConfig {
            phases: vec![Phase::Reuse, Phase::Generate],
            ..minimal_config()
        },
    )
    .with_database(db.clone(), key.clone());
    let result = runner.run().unwrap();

    assert_eq!(result.stats.call_count, 2);
    assert_eq!(
        result.interesting_examples.values().next().unwrap().buffer,
        vec![0]
    );
}

#[test]
fn test_covering_examples_are_saved() {
    let db = InMemoryDatabase::new();
    let key = DatabaseKey::from_function("test_covering_examples_are_saved");
    let mut runner = ConjectureRunner::new(
        |data: &mut ConjectureData<'_>| {
            if data.draw_u8()? % 2 == 0 {
                data.add_tag("even");
            }
            Ok(())
        },
        minimal_config(),
    )
    .with_database(db.clone(), key.clone());
    runner.run().unwrap();
    assert!(runner.covering_examples().contains_key("even"));
    assert_eq!(
        db.fetch(&key.with_sub_key("coverage")).unwrap(),
        vec![vec![0]]
    );
}

#[test]
fn test_runs_are_deterministic_for_a_seed() {
    let buffers = |seed: u64| {
        let seen = std::cell::RefCell::new(Vec::new());
        let mut runner = ConjectureRunner::new(
            |data: &mut ConjectureData<'_>| {
                data.draw_bytes(3)?;
                seen.borrow_mut().push(data.buffer().to_vec());
                Ok(())
            },
            RunnerConfig {
                seed,
                max_examples: 20,
                ..minimal_config()
            },
        );
        runner.run().unwrap();
        drop(runner);
        seen.into_inner()
    };
    assert_eq!(buffers(7), buffers(7));
}

#[test]
fn test_config_from_json() {
    let config = RunnerConfig::from_json(
        r#"{
            "max_examples": 10,
            "timeout": {"secs": 2, "nanos": 0},
            "suppress_health_check": ["too_slow", "large_base_example"],
            "health_check_thresholds": {"max_invalid_draws": 5}
        }"#,
    )
    .unwrap();
    assert_eq!(config.max_examples, 10);
    assert_eq!(config.timeout, Some(Duration::from_secs(2)));
    assert_eq!(
        config.suppress_health_check,
        vec![HealthCheck::TooSlow, HealthCheck::LargeBaseExample]
    );
    assert_eq!(config.health_check_thresholds.max_invalid_draws, 5);
    assert_eq!(config.health_check_thresholds.max_valid_draws, 10);
    assert_eq!(config.buffer_size, 8192);

    assert!(RunnerConfig::from_json("{\"max_examples\": \"many\"}").is_err());
}
