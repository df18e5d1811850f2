//! DataTree tests: deadness, prescreening, lookups and novelty rewriting against recorded
//! executions.

use std::sync::Arc;

use conjecture_core::{
    ConjectureData, ConjectureResult, DataTree, NoveltyCursor, Status, StopTest,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Draws one byte, then a block whose length is that byte modulo 3, and rejects even totals.
fn parity_test(data: &mut ConjectureData<'_>) -> Result<(), StopTest> {
    let n = data.draw_u8()? % 3;
    let rest = data.draw_bytes(n as usize)?;
    let total = rest.iter().map(|&b| u32::from(b)).sum::<u32>() + u32::from(n);
    if total % 2 == 0 {
        return Err(data.mark_invalid());
    }
    Ok(())
}

fn execute(buffer: &[u8]) -> Arc<ConjectureResult> {
    let mut data = ConjectureData::for_buffer(buffer.to_vec());
    let _ = parity_test(&mut data);
    data.freeze();
    Arc::new(data.as_result())
}

fn capped(value: u8, cap: u8) -> Arc<ConjectureResult> {
    let mut data = ConjectureData::for_buffer(vec![value]);
    data.draw_capped_byte(cap).unwrap();
    data.freeze();
    Arc::new(data.as_result())
}

#[test]
fn test_dead_set_only_grows() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut tree = DataTree::new();
    let mut dead_before: Vec<usize> = Vec::new();
    let mut node_count = tree.node_count();

    for _ in 0..200 {
        let len = rng.gen_range(0..4);
        let buffer: Vec<u8> = (0..len).map(|_| rng.gen_range(0..6)).collect();
        tree.record(&execute(&buffer));

        assert!(dead_before.iter().all(|&node| tree.is_dead(node)));
        assert!(tree.node_count() >= node_count);
        node_count = tree.node_count();
        dead_before = (0..node_count).filter(|&node| tree.is_dead(node)).collect();
    }
    assert!(tree.dead_count() > 0);
}

#[test]
fn test_recorded_buffers_fail_prescreen() {
    let mut tree = DataTree::new();
    let buffers: Vec<Vec<u8>> = vec![vec![0], vec![1, 9], vec![2, 3, 4], vec![4, 1]];
    for buffer in &buffers {
        let result = execute(buffer);
        assert_ne!(result.status, Status::Overrun);
        tree.record(&result);
    }
    for buffer in &buffers {
        assert!(!tree.prescreen(buffer), "{:?} passed prescreen", buffer);
    }
    assert!(tree.prescreen(&[3, 0]));
}

#[test]
fn test_prescreen_rejects_known_overruns() {
    let mut tree = DataTree::new();
    tree.record(&execute(&[2, 7, 7]));
    // The second block is known to be two bytes long, so one byte cannot be enough.
    assert!(!tree.prescreen(&[2, 7]));
}

#[test]
fn test_lookup_returns_recorded_result() {
    let mut tree = DataTree::new();
    let result = execute(&[1, 5]);
    tree.record(&result);

    let found = tree.lookup(&[1, 5]).unwrap();
    assert_eq!(found.buffer, vec![1, 5]);
    assert_eq!(found.status, result.status);
    // Trailing bytes are never read, so the same leaf is reached.
    assert_eq!(tree.lookup(&[1, 5, 200]).unwrap().buffer, vec![1, 5]);
    assert!(tree.lookup(&[1]).is_none());
    assert!(tree.lookup(&[2, 5]).is_none());
}

#[test]
fn test_overruns_do_not_create_leaves() {
    let mut tree = DataTree::new();
    tree.record(&execute(&[2, 1]));
    assert_eq!(tree.dead_count(), 0);
    assert!(tree.lookup(&[2, 1]).is_none());
}

#[test]
fn test_capped_values_exhaust_the_tree() {
    let mut tree = DataTree::new();
    for value in 0..=3 {
        assert!(!tree.is_exhausted());
        tree.record(&capped(value, 3));
    }
    assert!(tree.is_exhausted());
    // Values above the cap behave like the cap itself.
    assert_eq!(tree.lookup(&[200]).unwrap().buffer, vec![3]);
}

#[test]
fn test_forced_bytes_have_a_single_child() {
    let mut tree = DataTree::new();
    let mut data = ConjectureData::for_buffer(vec![0]);
    data.write(&[42]).unwrap();
    data.freeze();
    tree.record(&Arc::new(data.as_result()));
    assert!(tree.is_exhausted());
}

#[test]
fn test_rewrite_steers_away_from_dead_values() {
    let mut tree = DataTree::new();
    tree.record(&capped(0, 255));
    tree.record(&capped(1, 255));

    let mut cursor = NoveltyCursor::new();
    let rewritten = tree.rewrite_for_novelty(&mut cursor, &[], vec![0]);
    assert_eq!(rewritten, vec![2]);
    assert!(cursor.hit_novelty());

    let mut cursor = NoveltyCursor::new();
    assert_eq!(tree.rewrite_for_novelty(&mut cursor, &[], vec![77]), vec![77]);
}
