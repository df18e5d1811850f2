//! Seed-guided mutation of byte blocks.
//!
//! A [`Mutator`] commits to three strategies drawn from a fixed menu. Every draw made during an
//! execution driven by that mutator picks one of those three and applies it to the seed example,
//! so a single execution makes correlated edits (all bit flips, all boundary values, ...) instead
//! of unrelated noise.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::data::{ConjectureResult, DrawState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationStrategy {
    /// Fresh uniform bytes
    DrawNew,
    /// Keep the seed's bytes up to its last block, then draw fresh ones
    RedrawLast,
    /// Copy a block of the same length from this execution or the seed
    ReuseExisting,
    /// The seed's bytes at the same offset
    DrawExisting,
    /// A value no larger than the seed's
    DrawSmaller,
    /// A value no smaller than the seed's
    DrawLarger,
    /// The seed's bytes with one bit flipped
    FlipBit,
    DrawZero,
    DrawMax,
    /// One random byte repeated across the block
    DrawConstant,
}

impl MutationStrategy {
    /// Strategies a mutator picks from; repeated entries are weighted higher.
    pub const MENU: [MutationStrategy; 14] = [
        MutationStrategy::DrawNew,
        MutationStrategy::RedrawLast,
        MutationStrategy::RedrawLast,
        MutationStrategy::ReuseExisting,
        MutationStrategy::ReuseExisting,
        MutationStrategy::DrawExisting,
        MutationStrategy::DrawSmaller,
        MutationStrategy::DrawLarger,
        MutationStrategy::FlipBit,
        MutationStrategy::DrawZero,
        MutationStrategy::DrawZero,
        MutationStrategy::DrawMax,
        MutationStrategy::DrawMax,
        MutationStrategy::DrawConstant,
    ];
}

pub fn uniform<R: Rng + ?Sized>(rng: &mut R, n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rng.fill(bytes.as_mut_slice());
    bytes
}

/// Random byte string of the same length that is `<=` `existing`, usually strictly.
fn draw_predecessor<R: Rng + ?Sized>(rng: &mut R, existing: &[u8]) -> Vec<u8> {
    let mut strict = false;
    existing
        .iter()
        .map(|&x| {
            if strict {
                rng.gen()
            } else {
                let c = rng.gen_range(0..=x);
                strict = c < x;
                c
            }
        })
        .collect()
}

/// Random byte string of the same length that is `>=` `existing`, usually strictly.
fn draw_successor<R: Rng + ?Sized>(rng: &mut R, existing: &[u8]) -> Vec<u8> {
    let mut strict = false;
    existing
        .iter()
        .map(|&x| {
            if strict {
                rng.gen()
            } else {
                let c = rng.gen_range(x..=255);
                strict = c > x;
                c
            }
        })
        .collect()
}

/// Three strategies fixed for the lifetime of the mutator, applied to whichever seed the runner
/// hands it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutator {
    strategies: [MutationStrategy; 3],
}

impl Mutator {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut pick = || {
            *MutationStrategy::MENU
                .choose(rng)
                .unwrap_or(&MutationStrategy::DrawNew)
        };
        let strategies = [pick(), pick(), pick()];
        Mutator { strategies }
    }

    pub fn with_strategies(strategies: [MutationStrategy; 3]) -> Self {
        Mutator { strategies }
    }

    pub fn strategies(&self) -> &[MutationStrategy; 3] {
        &self.strategies
    }

    /// Produce the next `n` bytes of an execution derived from `seed` whose committed state is
    /// `state`.
    pub fn draw<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        seed: &ConjectureResult,
        state: &DrawState,
        n: usize,
    ) -> Vec<u8> {
        let index = state.index();
        if index + n > seed.buffer.len() {
            return uniform(rng, n);
        }
        let strategy = self.strategies[rng.gen_range(0..self.strategies.len())];
        apply(strategy, rng, seed, state, n)
    }
}

fn apply<R: Rng + ?Sized>(
    strategy: MutationStrategy,
    rng: &mut R,
    seed: &ConjectureResult,
    state: &DrawState,
    n: usize,
) -> Vec<u8> {
    let index = state.index();
    let existing = &seed.buffer[index..index + n];
    match strategy {
        MutationStrategy::DrawNew => uniform(rng, n),
        MutationStrategy::RedrawLast => {
            let last_start = seed.blocks.last().map_or(0, |&(u, _)| u);
            if index + n <= last_start {
                existing.to_vec()
            } else {
                uniform(rng, n)
            }
        }
        MutationStrategy::ReuseExisting => {
            let mut choices: Vec<(bool, usize)> =
                state.block_starts(n).into_iter().map(|i| (true, i)).collect();
            choices.extend(seed.block_starts(n).into_iter().map(|i| (false, i)));
            match choices.choose(rng) {
                Some(&(true, i)) => state.buffer[i..i + n].to_vec(),
                Some(&(false, i)) => seed.buffer[i..i + n].to_vec(),
                None => uniform(rng, n),
            }
        }
        MutationStrategy::DrawExisting => existing.to_vec(),
        MutationStrategy::DrawSmaller => {
            let candidate = uniform(rng, n);
            if candidate.as_slice() <= existing {
                candidate
            } else {
                draw_predecessor(rng, existing)
            }
        }
        MutationStrategy::DrawLarger => {
            let candidate = uniform(rng, n);
            if candidate.as_slice() >= existing {
                candidate
            } else {
                draw_successor(rng, existing)
            }
        }
        MutationStrategy::FlipBit => {
            let mut bytes = existing.to_vec();
            if n > 0 {
                let i = rng.gen_range(0..n);
                let k = rng.gen_range(0..8);
                bytes[i] ^= 1 << k;
            }
            bytes
        }
        MutationStrategy::DrawZero => vec![0; n],
        MutationStrategy::DrawMax => vec![255; n],
        MutationStrategy::DrawConstant => vec![rng.gen(); n],
    }
}
