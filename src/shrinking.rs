//! Shrinker - reduce an interesting example to a local minimum
//!
//! The shrinker holds one interesting example (the shrink target) and a predicate saying whether a
//! candidate still reproduces the same failure. It tries a fixed battery of byte-level edits
//! (interval deletion, block zeroing, block minimization, block reordering) and adopts a
//! candidate only when it satisfies the predicate and is strictly smaller under `sort_key`.
//!
//! Every candidate is executed through the runner's `test_function`, so the runner's tree,
//! interesting-example map and exit budgets see shrink attempts exactly like generated ones.

use std::cmp::{min, Reverse};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use log::debug;
use rand::Rng;

use crate::data::{sort_key, ConjectureResult};
use crate::engine::{ConjectureRunner, DrawStrategy, RunHalt};
use crate::minimizer::minimize;

/// Consecutive failed perturbations before `escape_local_minimum` gives up
const MAX_ESCAPE_ATTEMPTS: usize = 10;

/// Longest block the lowering pass treats as an integer
const MAX_LOWERED_BLOCK: usize = 16;

/// Whether a candidate still counts as the failure being shrunk
pub type ShrinkPredicate<'r> = Box<dyn Fn(&ConjectureResult) -> bool + 'r>;

pub struct Shrinker<'r, 'f> {
    runner: &'r mut ConjectureRunner<'f>,
    shrink_target: Arc<ConjectureResult>,
    predicate: ShrinkPredicate<'r>,
    /// Set when removing discarded ranges failed, cleared by any later improvement
    discarding_failed: bool,
    removing_discarded: bool,
    /// Indices of blocks the minimization passes managed to lower
    shrinking_blocks: BTreeSet<usize>,
    calls: usize,
    shrinks: usize,
}

impl<'r, 'f> Shrinker<'r, 'f> {
    pub fn new(
        runner: &'r mut ConjectureRunner<'f>,
        initial: Arc<ConjectureResult>,
        predicate: ShrinkPredicate<'r>,
    ) -> Self {
        Shrinker {
            runner,
            shrink_target: initial,
            predicate,
            discarding_failed: false,
            removing_discarded: false,
            shrinking_blocks: BTreeSet::new(),
            calls: 0,
            shrinks: 0,
        }
    }

    pub fn shrink_target(&self) -> &Arc<ConjectureResult> {
        &self.shrink_target
    }

    /// Test function executions made by this shrinker
    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Times the shrink target was replaced
    pub fn shrinks(&self) -> usize {
        self.shrinks
    }

    /// Run the full shrink: opening move, greedy passes, then escape attempts.
    pub fn shrink(&mut self) -> Result<(), RunHalt> {
        if self.shrink_target.buffer.iter().all(|&b| b == 0) {
            return Ok(());
        }
        let zeros = vec![0; self.shrink_target.index()];
        if self.incorporate_new_buffer(&zeros)? {
            return Ok(());
        }
        self.greedy_shrink()?;
        self.escape_local_minimum()?;
        Ok(())
    }

    /// Try `buffer` as a replacement for the shrink target. Returns true if it was adopted.
    pub fn incorporate_new_buffer(&mut self, buffer: &[u8]) -> Result<bool, RunHalt> {
        let buffer = &buffer[..min(buffer.len(), self.shrink_target.index())];
        if sort_key(buffer) >= self.shrink_target.sort_key() {
            return Ok(false);
        }
        if !self.runner.tree().prescreen(buffer) {
            return Ok(false);
        }
        self.calls += 1;
        let result = self
            .runner
            .test_function(DrawStrategy::Replay(buffer.to_vec()))?;
        self.consider(result)
    }

    fn consider(&mut self, result: Arc<ConjectureResult>) -> Result<bool, RunHalt> {
        if !(self.predicate)(&*result) || result.sort_key() >= self.shrink_target.sort_key() {
            return Ok(false);
        }
        if !self.removing_discarded {
            self.discarding_failed = false;
        }
        self.shrink_target = result;
        self.shrinks += 1;
        self.remove_discarded()?;
        Ok(true)
    }

    /// Apply the pass battery until a whole sweep leaves the target unchanged.
    pub fn greedy_shrink(&mut self) -> Result<(), RunHalt> {
        self.delta_interval_deletion()?;
        self.coarse_block_replacement()?;
        loop {
            let before = Arc::clone(&self.shrink_target);
            self.remove_discarded()?;
            self.minimize_duplicated_blocks()?;
            self.minimize_individual_blocks()?;
            self.reorder_blocks()?;
            self.greedy_interval_deletion()?;
            self.interval_deletion_with_block_lowering()?;
            if Arc::ptr_eq(&before, &self.shrink_target) {
                break;
            }
            debug!(
                "Shrink sweep reduced target from {} to {} bytes",
                before.index(),
                self.shrink_target.index()
            );
        }
        Ok(())
    }

    /// Delete every discarded range in one edit, repeating while discards remain.
    fn remove_discarded(&mut self) -> Result<bool, RunHalt> {
        if self.removing_discarded || self.discarding_failed {
            return Ok(false);
        }
        self.removing_discarded = true;
        let outcome = self.remove_discarded_ranges();
        self.removing_discarded = false;
        outcome
    }

    fn remove_discarded_ranges(&mut self) -> Result<bool, RunHalt> {
        let mut removed = false;
        while !self.shrink_target.discarded.is_empty() {
            let attempt = without_ranges(
                &self.shrink_target.buffer,
                self.shrink_target.discarded.iter().copied(),
            );
            if !self.incorporate_new_buffer(&attempt)? {
                self.discarding_failed = true;
                break;
            }
            removed = true;
        }
        Ok(removed)
    }

    /// Delta debugging over structural intervals: delete runs of `k` adjacent intervals, halving
    /// `k` after each sweep.
    fn delta_interval_deletion(&mut self) -> Result<(), RunHalt> {
        let count = self.shrink_target.intervals.len();
        if count == 0 {
            return Ok(());
        }
        let mut k = (count / 2).max(1);
        loop {
            let mut i = 0;
            while i + k <= self.shrink_target.intervals.len() {
                let attempt = without_ranges(
                    &self.shrink_target.buffer,
                    self.shrink_target.intervals[i..i + k].iter().copied(),
                );
                if !self.incorporate_new_buffer(&attempt)? {
                    i += k;
                }
            }
            if k == 1 {
                return Ok(());
            }
            k /= 2;
        }
    }

    fn coarse_block_replacement(&mut self) -> Result<(), RunHalt> {
        let mut i = 0;
        while i < self.shrink_target.blocks.len() {
            let (u, v) = self.shrink_target.blocks[i];
            if self.shrink_target.buffer[u..v].iter().any(|&b| b != 0) {
                let mut attempt = self.shrink_target.buffer.clone();
                attempt[u..v].iter_mut().for_each(|b| *b = 0);
                self.incorporate_new_buffer(&attempt)?;
            }
            i += 1;
        }
        Ok(())
    }

    /// Write `value` into every block in `indices` at once.
    fn try_shrinking_blocks(&mut self, indices: &[usize], value: &[u8]) -> Result<bool, RunHalt> {
        let mut attempt = self.shrink_target.buffer.clone();
        for &i in indices {
            match self.shrink_target.blocks.get(i) {
                Some(&(u, v)) if v - u == value.len() => attempt[u..v].copy_from_slice(value),
                _ => return Ok(false),
            }
        }
        let improved = self.incorporate_new_buffer(&attempt)?;
        if improved {
            self.shrinking_blocks.extend(indices.iter().copied());
        }
        Ok(improved)
    }

    fn minimize_blocks(&mut self, indices: &[usize], initial: &[u8]) -> Result<(), RunHalt> {
        minimize(
            initial,
            |candidate: &[u8]| self.try_shrinking_blocks(indices, candidate),
            false,
        )?;
        Ok(())
    }

    fn minimize_duplicated_blocks(&mut self) -> Result<(), RunHalt> {
        for block in duplicated_blocks(&self.shrink_target) {
            let target = &self.shrink_target;
            let indices: Vec<usize> = target
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, &(u, v))| target.buffer[u..v] == block[..])
                .map(|(i, _)| i)
                .collect();
            if indices.len() > 1 {
                self.minimize_blocks(&indices, &block)?;
            }
        }
        Ok(())
    }

    fn minimize_individual_blocks(&mut self) -> Result<(), RunHalt> {
        let mut i = 0;
        while i < self.shrink_target.blocks.len() {
            let (u, v) = self.shrink_target.blocks[i];
            let block = self.shrink_target.buffer[u..v].to_vec();
            self.minimize_blocks(&[i], &block)?;
            i += 1;
        }
        Ok(())
    }

    /// Insertion sort of equal-length blocks by content.
    fn reorder_blocks(&mut self) -> Result<(), RunHalt> {
        for n in block_lengths(&self.shrink_target) {
            let mut i = 1;
            while i < self.shrink_target.block_starts(n).len() {
                let mut j = i;
                while j > 0 {
                    let starts = self.shrink_target.block_starts(n);
                    if j >= starts.len() {
                        break;
                    }
                    let (a, b) = (starts[j - 1], starts[j]);
                    let buffer = &self.shrink_target.buffer;
                    if buffer[a..a + n] <= buffer[b..b + n] {
                        break;
                    }
                    let mut attempt = buffer.clone();
                    attempt[a..a + n].copy_from_slice(&buffer[b..b + n]);
                    attempt[b..b + n].copy_from_slice(&buffer[a..a + n]);
                    if !self.incorporate_new_buffer(&attempt)? {
                        break;
                    }
                    j -= 1;
                }
                i += 1;
            }
        }
        Ok(())
    }

    fn greedy_interval_deletion(&mut self) -> Result<(), RunHalt> {
        let mut i = 0;
        while i < self.shrink_target.intervals.len() {
            let interval = self.shrink_target.intervals[i];
            let attempt = without_ranges(&self.shrink_target.buffer, std::iter::once(interval));
            if !self.incorporate_new_buffer(&attempt)? {
                i += 1;
            }
        }
        Ok(())
    }

    /// Delete an interval while lowering an earlier shrinking block by one or two, for
    /// structures whose length is encoded in a preceding block.
    fn interval_deletion_with_block_lowering(&mut self) -> Result<(), RunHalt> {
        let mut i = 0;
        while i < self.shrink_target.intervals.len() {
            let (u, v) = self.shrink_target.intervals[i];
            let candidates: Vec<usize> = self
                .shrinking_blocks
                .iter()
                .copied()
                .filter(|&b| {
                    self.shrink_target
                        .blocks
                        .get(b)
                        .map_or(false, |&(_, end)| end <= u)
                })
                .collect();

            'blocks: for b in candidates {
                let (bu, bv) = self.shrink_target.blocks[b];
                let size = bv - bu;
                if size > MAX_LOWERED_BLOCK {
                    continue;
                }
                let n = BigEndian::read_uint128(&self.shrink_target.buffer[bu..bv], size);
                for d in 1..=n.min(2) {
                    let mut attempt = self.shrink_target.buffer.clone();
                    BigEndian::write_uint128(&mut attempt[bu..bv], n - d, size);
                    attempt.drain(u..v);
                    if self.incorporate_new_buffer(&attempt)? {
                        let target = &self.shrink_target;
                        self.shrinking_blocks.retain(|&block| {
                            target.blocks.get(block).map_or(false, |&(_, end)| end <= u)
                        });
                        break 'blocks;
                    }
                }
            }
            i += 1;
        }
        Ok(())
    }

    /// Randomise the blocks the passes never managed to lower and shrink again from there,
    /// keeping the result only if it beats the current target.
    fn escape_local_minimum(&mut self) -> Result<(), RunHalt> {
        let mut failures = 0;
        while failures < MAX_ESCAPE_ATTEMPTS {
            let before = Arc::clone(&self.shrink_target);
            let mut attempt = before.buffer.clone();
            let rng = self.runner.random();
            for (i, &(u, v)) in before.blocks.iter().enumerate() {
                if !self.shrinking_blocks.contains(&i) {
                    rng.fill(&mut attempt[u..v]);
                }
            }
            if attempt == before.buffer {
                failures += 1;
                continue;
            }

            self.calls += 1;
            let result = self.runner.cached_test_function(&attempt)?;
            if !(self.predicate)(&*result) {
                failures += 1;
                continue;
            }

            self.shrink_target = result;
            self.greedy_shrink()?;
            if self.shrink_target.sort_key() < before.sort_key() {
                debug!(
                    "Escaped local minimum: {} -> {} bytes",
                    before.index(),
                    self.shrink_target.index()
                );
                failures = 0;
            } else {
                self.shrink_target = before;
                failures += 1;
            }
        }
        Ok(())
    }
}

/// Non-zero block contents occurring more than once, largest total footprint first, ties by
/// descending content.
fn duplicated_blocks(target: &ConjectureResult) -> Vec<Vec<u8>> {
    let mut occurrences: BTreeMap<Vec<u8>, usize> = BTreeMap::new();
    for &(u, v) in &target.blocks {
        *occurrences.entry(target.buffer[u..v].to_vec()).or_insert(0) += 1;
    }
    let mut duplicated: Vec<(Vec<u8>, usize)> = occurrences
        .into_iter()
        .rev()
        .filter(|(block, count)| *count > 1 && block.iter().any(|&b| b != 0))
        .collect();
    duplicated.sort_by_key(|(block, count)| Reverse(block.len() * count));
    duplicated.into_iter().map(|(block, _)| block).collect()
}

/// Distinct block lengths, longest first
fn block_lengths(target: &ConjectureResult) -> Vec<usize> {
    let lengths: BTreeSet<usize> = target.blocks.iter().map(|&(u, v)| v - u).collect();
    lengths.into_iter().rev().collect()
}

/// `buffer` with every byte covered by one of `ranges` removed. Ranges may overlap or nest.
fn without_ranges(buffer: &[u8], ranges: impl Iterator<Item = (usize, usize)>) -> Vec<u8> {
    let mut keep = vec![true; buffer.len()];
    for (u, v) in ranges {
        let end = min(v, buffer.len());
        if u < end {
            keep[u..end].iter_mut().for_each(|k| *k = false);
        }
    }
    buffer
        .iter()
        .zip(keep)
        .filter(|&(_, kept)| kept)
        .map(|(&b, _)| b)
        .collect()
}
