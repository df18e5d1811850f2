//! Shrinker tests: improvements are monotonic, shrinking is a fixed point, and discarded data is
//! removed.

use conjecture_core::{
    sort_key, ConjectureData, ConjectureResult, ConjectureRunner, DrawStrategy, Phase,
    RunnerConfig, Shrinker, Status, TestResult,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn shrink_config() -> RunnerConfig {
    RunnerConfig {
        buffer_size: 256,
        phases: vec![Phase::Shrink],
        perform_health_check: false,
        seed: 3,
        ..RunnerConfig::default()
    }
}

fn interesting(result: &ConjectureResult) -> bool {
    result.status == Status::Interesting
}

/// Zero-terminated list of pairs; fails when any element is at least 100.
fn large_element(data: &mut ConjectureData<'_>) -> TestResult {
    let mut found = false;
    loop {
        data.start_example();
        if data.draw_u8()? == 0 {
            data.stop_example(false);
            break;
        }
        found |= data.draw_u8()? >= 100;
        data.stop_example(false);
    }
    if found {
        return Err(data.mark_interesting("large element").into());
    }
    Ok(())
}

/// Shrink `initial` under `test` and return the final buffer.
fn shrink<F>(test: F, initial: Vec<u8>) -> Vec<u8>
where
    F: FnMut(&mut ConjectureData<'_>) -> TestResult,
{
    let mut runner = ConjectureRunner::new(test, shrink_config());
    let start = runner.test_function(DrawStrategy::Replay(initial)).unwrap();
    assert_eq!(start.status, Status::Interesting);
    let mut shrinker = Shrinker::new(&mut runner, start, Box::new(interesting));
    shrinker.shrink().unwrap();
    shrinker.shrink_target().buffer.clone()
}

#[test]
fn test_shrinking_never_makes_things_worse() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    for _ in 0..10 {
        let mut initial: Vec<u8> = Vec::new();
        for _ in 0..rng.gen_range(1..5) {
            initial.push(rng.gen_range(1..=255));
            initial.push(rng.gen());
        }
        initial.push(1);
        initial.push(rng.gen_range(100..=255));
        initial.push(0);

        let shrunk = shrink(large_element, initial.clone());
        assert!(sort_key(&shrunk) <= sort_key(&initial));

        let mut replay = ConjectureData::for_buffer(shrunk.clone());
        assert!(large_element(&mut replay).is_err());
        assert_eq!(replay.status(), Status::Interesting);
    }
}

#[test]
fn test_list_shrinks_to_single_element() {
    assert_eq!(
        shrink(large_element, vec![1, 5, 1, 150, 1, 7, 0]),
        vec![1, 100, 0]
    );
}

#[test]
fn test_shrinking_is_a_fixed_point() {
    let once = shrink(large_element, vec![3, 250, 9, 9, 0]);
    let twice = shrink(large_element, once.clone());
    assert_eq!(once, twice);
    assert_eq!(once, vec![1, 100, 0]);
}

/// Zero-prefixed attempts are filtered out and discarded; the byte after them must exceed 200.
fn filtered_attempts(data: &mut ConjectureData<'_>) -> TestResult {
    loop {
        data.start_example();
        if data.draw_u8()? == 0 {
            data.draw_u8()?;
            data.stop_example(true);
            continue;
        }
        data.stop_example(false);
        break;
    }
    if data.draw_u8()? > 200 {
        return Err(data.mark_interesting("big").into());
    }
    Ok(())
}

#[test]
fn test_discarded_attempts_are_removed() {
    let mut data = ConjectureData::for_buffer(vec![0, 50, 0, 60, 1, 250]);
    assert!(filtered_attempts(&mut data).is_err());
    assert_eq!(data.as_result().discarded, vec![(0, 2), (2, 4)]);

    let shrunk = shrink(filtered_attempts, vec![0, 50, 0, 60, 1, 250]);
    assert_eq!(shrunk, vec![1, 201]);
}

#[test]
fn test_shrink_calls_go_through_runner() {
    let mut runner = ConjectureRunner::new(large_element, shrink_config());
    let start = runner
        .test_function(DrawStrategy::Replay(vec![1, 120, 1, 130, 0]))
        .unwrap();
    let before = runner.stats().call_count;
    let mut shrinker = Shrinker::new(&mut runner, start, Box::new(interesting));
    shrinker.shrink().unwrap();
    let calls = shrinker.calls();
    drop(shrinker);

    assert!(calls > 0);
    assert!(runner.stats().call_count > before);
    // The runner keeps the best example it saw while the shrinker worked.
    let best = runner.interesting_examples().values().next().unwrap();
    assert_eq!(best.buffer, vec![1, 100, 0]);
}
