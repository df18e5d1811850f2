//! Target Selection & Coverage-Guided Mutation
//!
//! The generation phase does not mutate examples at random. It rations its attention across the
//! coverage tags it has observed so that rare behaviours get mutated as often as common ones.
//!
//! # Architecture
//!
//! - **Targets**: every tag `t` seen on some example, its negation "does not exhibit `t`", and a
//!   synthetic `Universal` target that every example belongs to.
//! - **Best status gating**: only examples with the best status seen so far are indexed. When a
//!   strictly better status shows up, all bookkeeping is reset.
//! - **Universal tags**: tags that every example so far has carried are tracked as one set and only
//!   materialised into their own target once some example lacks them.
//! - **Bucketed heap**: targets are grouped into buckets keyed by `(usage_count, population)`.
//!   A min-heap over bucket keys gives the least-used, least-populated bucket; empty buckets are
//!   dropped lazily when they reach the top.
//!
//! Selecting an example charges one usage to *every* target that example belongs to, so a common
//! tag cannot hog selection by riding along with a rare one.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use rand::Rng;

use crate::data::{ConjectureResult, Status, Tag};

/// A coverage target examples can be indexed under
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    Universal,
    Tag(Tag),
    Negated(Tag),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Universal => f.write_str("<universal>"),
            Target::Tag(tag) => write!(f, "{}", tag),
            Target::Negated(tag) => write!(f, "not({})", tag),
        }
    }
}

/// Set supporting O(1) insert, remove and uniform random choice.
#[derive(Debug, Clone)]
pub struct SampleSet<T> {
    values: Vec<T>,
    index: HashMap<T, usize>,
}

impl<T: Hash + Eq + Clone> Default for SampleSet<T> {
    fn default() -> Self {
        SampleSet {
            values: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Hash + Eq + Clone> SampleSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.index.contains_key(value)
    }

    pub fn add(&mut self, value: T) {
        if self.index.contains_key(&value) {
            return;
        }
        self.index.insert(value.clone(), self.values.len());
        self.values.push(value);
    }

    pub fn remove(&mut self, value: &T) -> bool {
        let position = match self.index.remove(value) {
            Some(position) => position,
            None => return false,
        };
        self.values.swap_remove(position);
        if let Some(moved) = self.values.get(position) {
            self.index.insert(moved.clone(), position);
        }
        true
    }

    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&T> {
        if self.values.is_empty() {
            None
        } else {
            Some(&self.values[rng.gen_range(0..self.values.len())])
        }
    }
}

type Score = (usize, usize);

#[derive(Debug, Clone)]
pub struct TargetSelector {
    best_status: Status,
    examples_by_target: HashMap<Target, Vec<Arc<ConjectureResult>>>,
    usage_counts: HashMap<Target, usize>,
    targets_by_score: HashMap<Score, SampleSet<Target>>,
    scores_by_target: HashMap<Target, Score>,
    scores: BinaryHeap<Reverse<Score>>,
    /// Scores currently in `scores`, so each bucket is queued at most once
    queued: HashSet<Score>,
    universal_tags: Option<BTreeSet<Tag>>,
    non_universal_tags: BTreeSet<Tag>,
    example_count: usize,
}

impl Default for TargetSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetSelector {
    pub fn new() -> Self {
        TargetSelector {
            best_status: Status::Overrun,
            examples_by_target: HashMap::new(),
            usage_counts: HashMap::new(),
            targets_by_score: HashMap::new(),
            scores_by_target: HashMap::new(),
            scores: BinaryHeap::new(),
            queued: HashSet::new(),
            universal_tags: None,
            non_universal_tags: BTreeSet::new(),
            example_count: 0,
        }
    }

    fn reset(&mut self) {
        let best_status = self.best_status;
        *self = TargetSelector::new();
        self.best_status = best_status;
    }

    pub fn best_status(&self) -> Status {
        self.best_status
    }

    /// Number of examples indexed since the last reset
    pub fn example_count(&self) -> usize {
        self.example_count
    }

    pub fn usage(&self, target: &Target) -> usize {
        self.usage_counts.get(target).copied().unwrap_or(0)
    }

    pub fn examples(&self, target: &Target) -> &[Arc<ConjectureResult>] {
        self.examples_by_target
            .get(target)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every target that currently has at least one example
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.examples_by_target
            .iter()
            .filter(|(_, examples)| !examples.is_empty())
            .map(|(target, _)| target)
    }

    pub fn add(&mut self, example: &Arc<ConjectureResult>) {
        if example.status == Status::Interesting || example.status < self.best_status {
            return;
        }
        if example.status > self.best_status {
            self.best_status = example.status;
            self.reset();
        }

        let universal = match self.universal_tags.take() {
            None => (*example.tags).clone(),
            Some(mut universal) => {
                let previous = self.examples(&Target::Universal).to_vec();
                let demoted: Vec<Tag> = universal.difference(&example.tags).cloned().collect();
                for tag in demoted {
                    universal.remove(&tag);
                    self.non_universal_tags.insert(tag.clone());
                    self.examples_by_target
                        .insert(Target::Tag(tag.clone()), previous.clone());
                    self.rescore(Target::Tag(tag));
                }

                let fresh: Vec<Tag> = example
                    .tags
                    .iter()
                    .filter(|tag| {
                        !self.non_universal_tags.contains(*tag) && !universal.contains(*tag)
                    })
                    .cloned()
                    .collect();
                for tag in fresh {
                    self.non_universal_tags.insert(tag.clone());
                    self.examples_by_target
                        .insert(Target::Negated(tag.clone()), previous.clone());
                    self.rescore(Target::Negated(tag));
                }
                universal
            }
        };
        self.universal_tags = Some(universal);

        self.example_count += 1;
        for target in self.targets_for(example) {
            self.examples_by_target
                .entry(target.clone())
                .or_default()
                .push(Arc::clone(example));
            self.rescore(target);
        }
    }

    /// Every target `example` is indexed under
    pub fn targets_for(&self, example: &ConjectureResult) -> Vec<Target> {
        let mut targets = vec![Target::Universal];
        targets.extend(example.tags.iter().cloned().map(Target::Tag));
        targets.extend(
            self.non_universal_tags
                .iter()
                .filter(|tag| !example.tags.contains(*tag))
                .cloned()
                .map(Target::Negated),
        );
        targets
    }

    pub fn has_tag(&self, target: &Target, example: &ConjectureResult) -> bool {
        match target {
            Target::Universal => true,
            Target::Tag(tag) => example.tags.contains(tag),
            Target::Negated(tag) => !example.tags.contains(tag),
        }
    }

    fn rescore(&mut self, target: Target) {
        let score = (self.usage(&target), self.examples(&target).len());
        if let Some(old) = self.scores_by_target.get(&target) {
            if let Some(bucket) = self.targets_by_score.get_mut(old) {
                bucket.remove(&target);
            }
        }
        self.scores_by_target.insert(target.clone(), score);
        if self.queued.insert(score) {
            self.scores.push(Reverse(score));
        }
        self.targets_by_score.entry(score).or_default().add(target);
    }

    fn select_target<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Target> {
        while let Some(&Reverse(score)) = self.scores.peek() {
            match self.targets_by_score.get(&score).and_then(|b| b.choose(rng)) {
                Some(target) => return Some(target.clone()),
                None => {
                    self.scores.pop();
                    self.queued.remove(&score);
                }
            }
        }
        None
    }

    /// Pick a target and one of its examples to mutate next. `None` until an example is added.
    pub fn select<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> Option<(Target, Arc<ConjectureResult>)> {
        let target = self.select_target(rng)?;
        let examples = self.examples(&target);
        if examples.is_empty() {
            return None;
        }
        let example = Arc::clone(&examples[rng.gen_range(0..examples.len())]);
        for charged in self.targets_for(&example) {
            *self.usage_counts.entry(charged.clone()).or_insert(0) += 1;
            self.rescore(charged);
        }
        Some((target, example))
    }
}
