//! ConjectureRunner - the test execution engine
//!
//! The runner owns everything that outlives a single execution: the novelty tree, the target
//! selector, the best interesting example per origin, the covering example per tag and the run's
//! random generator. It drives three phases in order:
//!
//! 1. **Reuse**: replay buffers saved by earlier runs.
//! 2. **Generate**: probe the all-zero buffer, run purely random executions, then mutate examples
//!    picked by the target selector until something interesting turns up.
//! 3. **Shrink**: check every interesting example still reproduces, then minimise each origin.
//!
//! Every execution, whichever phase asked for it, goes through [`ConjectureRunner::test_function`]
//! so that bookkeeping (tree recording, covering and interesting maps, database writes, exit
//! checks) is applied uniformly. Reaching a budget is signalled by `RunHalt::Complete`, which
//! unwinds to [`ConjectureRunner::run`] through `?`; fatal conditions travel the same way as
//! `RunHalt::Failed`.

use std::cmp::max;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::data::{
    catch_test_panic, ByteSource, ConjectureData, ConjectureResult, DrawState, InterestingOrigin,
    Replay, Status, Tag, TestError, TestResult,
};
use crate::datatree::{DataTree, NoveltyCursor};
use crate::health::{HealthCheck, HealthCheckState, HealthCheckThresholds, HealthVerdict};
use crate::mutator::{uniform, Mutator};
use crate::persistence::{DatabaseKey, ExampleDatabase};
use crate::shrinking::Shrinker;
use crate::targeting::TargetSelector;

/// Mutations tried from one mutator before it is replaced
const MUTATIONS_PER_MUTATOR: usize = 10;

/// Purely random executions before switching to mutation
const MIN_RANDOM_EXAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Reuse,
    Generate,
    Shrink,
}

/// Configuration for the ConjectureRunner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum bytes a single execution may consume
    pub buffer_size: usize,

    /// Valid examples after which generation stops
    pub max_examples: usize,

    /// Executions after which generation stops, whatever their status
    pub max_iterations: usize,

    /// Improvements to interesting examples after which the run stops
    pub max_shrinks: usize,

    /// Overall wall-clock budget
    pub timeout: Option<Duration>,

    /// Runs lasting longer than this fail the hung test health check
    pub hung_test_time_limit: Duration,

    pub phases: Vec<Phase>,

    pub perform_health_check: bool,

    pub suppress_health_check: Vec<HealthCheck>,

    pub health_check_thresholds: HealthCheckThresholds,

    /// Example nesting depth at which draws are forced to zero
    pub max_depth: usize,

    /// Seed for the run's random generator
    pub seed: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            max_examples: 100,
            max_iterations: 1000,
            max_shrinks: 500,
            timeout: None,
            hung_test_time_limit: Duration::from_secs(5 * 60),
            phases: vec![Phase::Reuse, Phase::Generate, Phase::Shrink],
            perform_health_check: true,
            suppress_health_check: Vec::new(),
            health_check_thresholds: HealthCheckThresholds::default(),
            max_depth: 100,
            seed: 0,
        }
    }
}

impl RunnerConfig {
    /// Parse a possibly partial JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn has_phase(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }
}

/// Reasons a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    MaxExamples,
    MaxIterations,
    MaxShrinks,
    Timeout,
    /// No more work to do
    Finished,
    /// An interesting example stopped reproducing
    Flaky,
}

impl ExitReason {
    /// Human-readable description of the exit reason
    pub fn description(&self, config: &RunnerConfig) -> String {
        match self {
            ExitReason::MaxExamples => format!("max_examples={}", config.max_examples),
            ExitReason::MaxIterations => format!(
                "max_iterations={}, but too few examples satisfied assumptions",
                max(config.max_iterations, config.max_examples)
            ),
            ExitReason::MaxShrinks => format!("shrunk example {} times", config.max_shrinks),
            ExitReason::Timeout => format!("timed out after {:?}", config.timeout.unwrap_or_default()),
            ExitReason::Finished => "nothing left to do".to_string(),
            ExitReason::Flaky => "test was flaky".to_string(),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitReason::MaxExamples => "max_examples",
            ExitReason::MaxIterations => "max_iterations",
            ExitReason::MaxShrinks => "max_shrinks",
            ExitReason::Timeout => "timeout",
            ExitReason::Finished => "finished",
            ExitReason::Flaky => "flaky",
        };
        f.write_str(name)
    }
}

/// Failures that abort a run
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Health check {check} failed: {message}")]
    HealthCheck { check: HealthCheck, message: String },

    #[error("Stop signal from execution {found} escaped into execution {expected}")]
    StaleStopTest { expected: u64, found: u64 },

    #[error("Test function raised a fault: {0}")]
    TestFault(Box<dyn std::error::Error + Send + Sync>),
}

/// Why a run stopped before finishing its current phase
#[derive(Debug)]
pub enum RunHalt {
    /// A budget was reached or there is nothing left to do
    Complete(ExitReason),
    Failed(EngineError),
}

impl From<EngineError> for RunHalt {
    fn from(error: EngineError) -> Self {
        RunHalt::Failed(error)
    }
}

/// Statistics about test execution
#[derive(Debug, Clone, Default)]
pub struct RunnerStats {
    /// Executions of the test function
    pub call_count: usize,
    pub valid_examples: usize,
    pub invalid_examples: usize,
    pub overrun_examples: usize,
    pub interesting_calls: usize,
    /// Times an interesting example was replaced by a smaller one
    pub shrinks: usize,
    pub total_runtime: Duration,
    pub total_draw_time: Duration,
    pub runtime_by_status: BTreeMap<Status, Duration>,
    /// Number of executions that noted each event
    pub event_counts: BTreeMap<String, usize>,
}

/// What the caller gets back from a completed run
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_reason: ExitReason,
    /// Smallest known example per origin
    pub interesting_examples: BTreeMap<InterestingOrigin, Arc<ConjectureResult>>,
    pub stats: RunnerStats,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.interesting_examples.is_empty() && self.exit_reason != ExitReason::Flaky
    }

    pub fn is_flaky(&self) -> bool {
        self.exit_reason == ExitReason::Flaky
    }
}

/// Where the bytes of one execution come from
#[derive(Debug, Clone)]
pub enum DrawStrategy {
    /// Exactly this buffer; reading past its end overruns
    Replay(Vec<u8>),
    /// Uniform random bytes
    Random,
    /// Mutations of a seed example
    Mutate {
        mutator: Mutator,
        seed: Arc<ConjectureResult>,
    },
    /// This buffer as a prefix, zero-padded, with the usual novelty steering
    Redistribute(Vec<u8>),
}

/// Byte source for every non-replay execution: proposes bytes per the strategy, then applies the
/// zero bound and novelty rewriting.
struct Generator<'g> {
    tree: &'g DataTree,
    rng: &'g mut ChaCha8Rng,
    strategy: &'g DrawStrategy,
    cursor: NoveltyCursor,
    cap: usize,
    max_depth: usize,
}

impl ByteSource for Generator<'_> {
    fn draw_bytes(&mut self, state: &mut DrawState, n: usize) -> Vec<u8> {
        if state.depth >= self.max_depth || state.index() + n > self.cap {
            state.hit_zero_bound = true;
            return vec![0; n];
        }
        let proposed = match self.strategy {
            DrawStrategy::Random => uniform(&mut *self.rng, n),
            DrawStrategy::Mutate { mutator, seed } => mutator.draw(&mut *self.rng, seed, state, n),
            DrawStrategy::Replay(prefix) | DrawStrategy::Redistribute(prefix) => {
                let start = state.index().min(prefix.len());
                let end = (state.index() + n).min(prefix.len());
                let mut bytes = prefix[start..end].to_vec();
                bytes.resize(n, 0);
                bytes
            }
        };
        self.tree
            .rewrite_for_novelty(&mut self.cursor, &state.buffer, proposed)
    }
}

#[derive(Debug, Clone, Copy)]
enum Corpus {
    Primary,
    Secondary,
    Coverage,
}

type TestFunction<'f> = Box<dyn FnMut(&mut ConjectureData<'_>) -> TestResult + 'f>;

/// Main test execution engine
pub struct ConjectureRunner<'f> {
    test: TestFunction<'f>,
    config: RunnerConfig,
    database: Option<Box<dyn ExampleDatabase + 'f>>,
    database_key: Option<DatabaseKey>,
    rng: ChaCha8Rng,
    tree: DataTree,
    target_selector: TargetSelector,
    interesting_examples: BTreeMap<InterestingOrigin, Arc<ConjectureResult>>,
    covering_examples: BTreeMap<Tag, Arc<ConjectureResult>>,
    shrunk_examples: BTreeSet<InterestingOrigin>,
    interned_tags: HashSet<Arc<BTreeSet<Tag>>>,
    health_check_state: Option<HealthCheckState>,
    stats: RunnerStats,
    exit_reason: Option<ExitReason>,
    last_data: Option<Arc<ConjectureResult>>,
    start_time: Instant,
}

impl fmt::Debug for ConjectureRunner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConjectureRunner")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .field("exit_reason", &self.exit_reason)
            .field("interesting_examples", &self.interesting_examples.len())
            .finish()
    }
}

impl<'f> ConjectureRunner<'f> {
    pub fn new<F>(test: F, config: RunnerConfig) -> Self
    where
        F: FnMut(&mut ConjectureData<'_>) -> TestResult + 'f,
    {
        Self {
            test: Box::new(test),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            database: None,
            database_key: None,
            tree: DataTree::new(),
            target_selector: TargetSelector::new(),
            interesting_examples: BTreeMap::new(),
            covering_examples: BTreeMap::new(),
            shrunk_examples: BTreeSet::new(),
            interned_tags: HashSet::new(),
            health_check_state: None,
            stats: RunnerStats::default(),
            exit_reason: None,
            last_data: None,
            start_time: Instant::now(),
        }
    }

    /// Persist and reuse examples under `key`
    pub fn with_database<D>(mut self, database: D, key: DatabaseKey) -> Self
    where
        D: ExampleDatabase + 'f,
    {
        self.database = Some(Box::new(database));
        self.database_key = Some(key);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    pub fn tree(&self) -> &DataTree {
        &self.tree
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason
    }

    pub fn interesting_examples(&self) -> &BTreeMap<InterestingOrigin, Arc<ConjectureResult>> {
        &self.interesting_examples
    }

    pub fn covering_examples(&self) -> &BTreeMap<Tag, Arc<ConjectureResult>> {
        &self.covering_examples
    }

    pub(crate) fn random(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Run every enabled phase and report what was found.
    pub fn run(&mut self) -> Result<RunResult, EngineError> {
        self.start_time = Instant::now();
        match self.run_phases() {
            Ok(()) | Err(RunHalt::Complete(_)) => {}
            Err(RunHalt::Failed(error)) => return Err(error),
        }
        let exit_reason = *self.exit_reason.get_or_insert(ExitReason::Finished);
        info!(
            "Run complete after {} examples ({} valid) and {} shrinks: {}",
            self.stats.call_count,
            self.stats.valid_examples,
            self.stats.shrinks,
            exit_reason.description(&self.config)
        );
        Ok(RunResult {
            exit_reason,
            interesting_examples: self.interesting_examples.clone(),
            stats: self.stats.clone(),
        })
    }

    fn run_phases(&mut self) -> Result<(), RunHalt> {
        if self.config.has_phase(Phase::Reuse) {
            self.reuse_existing_examples()?;
        }
        if self.config.has_phase(Phase::Generate) {
            self.generate_new_examples()?;
        }
        if self.config.has_phase(Phase::Shrink) {
            self.shrink_interesting_examples()?;
        }
        Ok(())
    }

    fn exit_with(&mut self, reason: ExitReason) -> RunHalt {
        if self.exit_reason.is_none() {
            info!("Stopping run: {}", reason.description(&self.config));
            self.exit_reason = Some(reason);
        }
        RunHalt::Complete(reason)
    }

    /// Execute one buffer against the test function and fold the outcome into the run's state.
    pub fn test_function(
        &mut self,
        strategy: DrawStrategy,
    ) -> Result<Arc<ConjectureResult>, RunHalt> {
        if self.start_time.elapsed() >= self.config.hung_test_time_limit {
            self.fail_health_check(
                HealthCheck::HungTest,
                format!(
                    "Your test has been running for at least {:?}. This is probably a sign \
                     that it is hung.",
                    self.config.hung_test_time_limit
                ),
            )?;
        }
        self.stats.call_count += 1;

        let (mut result, outcome) = {
            let mut data = match &strategy {
                DrawStrategy::Replay(buffer) => {
                    ConjectureData::new(Box::new(Replay::new(buffer.clone())), buffer.len())
                }
                _ => {
                    let generator = Generator {
                        tree: &self.tree,
                        rng: &mut self.rng,
                        strategy: &strategy,
                        cursor: NoveltyCursor::new(),
                        cap: self.config.buffer_size / 2,
                        max_depth: self.config.max_depth,
                    };
                    ConjectureData::new(Box::new(generator), self.config.buffer_size)
                }
            };
            let test = &mut self.test;
            let outcome = match catch_test_panic(|| test(&mut data)) {
                Ok(outcome) => outcome,
                Err(origin) => {
                    data.mark_interesting(origin);
                    Ok(())
                }
            };
            data.freeze();
            (data.as_result(), outcome)
        };

        let failure = match outcome {
            Ok(()) => None,
            Err(TestError::Stop(stop)) if stop.testcounter == result.testcounter => None,
            Err(TestError::Stop(stop)) => Some(EngineError::StaleStopTest {
                expected: result.testcounter,
                found: stop.testcounter,
            }),
            Err(TestError::Fault(fault)) => Some(EngineError::TestFault(fault)),
        };
        self.note_details(&result);
        if let Some(error) = failure {
            self.db_save(Corpus::Primary, &result.buffer);
            return Err(RunHalt::Failed(error));
        }
        debug_data(&result);

        result.tags = self.intern_tags(&result.tags);
        let result = Arc::new(result);
        self.target_selector.add(&result);

        match result.status {
            Status::Valid => {
                self.stats.valid_examples += 1;
                self.update_covering_examples(&result);
            }
            Status::Invalid => self.stats.invalid_examples += 1,
            Status::Overrun => self.stats.overrun_examples += 1,
            Status::Interesting => self.stats.interesting_calls += 1,
        }

        self.tree.record(&result);
        self.last_data = Some(Arc::clone(&result));

        if result.status == Status::Interesting {
            self.record_interesting(&result)?;
        }

        self.check_exits()?;
        self.record_for_health_check(&result)?;
        Ok(result)
    }

    /// Like `test_function` on a replayed buffer, but answered from the tree when the outcome is
    /// already known.
    pub fn cached_test_function(&mut self, buffer: &[u8]) -> Result<Arc<ConjectureResult>, RunHalt> {
        match self.tree.lookup(buffer) {
            Some(result) => Ok(result),
            None => self.test_function(DrawStrategy::Replay(buffer.to_vec())),
        }
    }

    fn intern_tags(&mut self, tags: &Arc<BTreeSet<Tag>>) -> Arc<BTreeSet<Tag>> {
        if let Some(existing) = self.interned_tags.get(&**tags) {
            return Arc::clone(existing);
        }
        self.interned_tags.insert(Arc::clone(tags));
        Arc::clone(tags)
    }

    fn note_details(&mut self, result: &ConjectureResult) {
        self.stats.total_runtime += result.runtime;
        self.stats.total_draw_time += result.draw_times.iter().sum::<Duration>();
        *self
            .stats
            .runtime_by_status
            .entry(result.status)
            .or_default() += result.runtime;
        for event in &result.events {
            *self.stats.event_counts.entry(event.clone()).or_default() += 1;
        }
    }

    fn update_covering_examples(&mut self, result: &Arc<ConjectureResult>) {
        for tag in result.tags.iter() {
            let improves = match self.covering_examples.get(tag) {
                None => true,
                Some(existing) => result.sort_key() < existing.sort_key(),
            };
            if !improves {
                continue;
            }
            if let Some(previous) = self.covering_examples.insert(tag.clone(), Arc::clone(result)) {
                self.db_delete(Corpus::Coverage, &previous.buffer);
            }
            self.db_save(Corpus::Coverage, &result.buffer);
        }
    }

    fn record_interesting(&mut self, result: &Arc<ConjectureResult>) -> Result<(), RunHalt> {
        let origin = match &result.interesting_origin {
            Some(origin) => origin.clone(),
            None => return Ok(()),
        };
        // A known failure makes further health signal meaningless.
        self.health_check_state = None;

        match self.interesting_examples.get(&origin).cloned() {
            None => {
                info!("Found interesting example for {} ({} bytes)", origin, result.index());
                self.db_save(Corpus::Primary, &result.buffer);
                self.interesting_examples.insert(origin, Arc::clone(result));
            }
            Some(existing) if result.sort_key() < existing.sort_key() => {
                self.stats.shrinks += 1;
                self.db_move(Corpus::Primary, Corpus::Secondary, &existing.buffer);
                self.db_save(Corpus::Primary, &result.buffer);
                self.shrunk_examples.remove(&origin);
                self.interesting_examples.insert(origin, Arc::clone(result));
                if self.stats.shrinks >= self.config.max_shrinks {
                    return Err(self.exit_with(ExitReason::MaxShrinks));
                }
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn check_exits(&mut self) -> Result<(), RunHalt> {
        if let Some(timeout) = self.config.timeout {
            if self.start_time.elapsed() >= timeout {
                return Err(self.exit_with(ExitReason::Timeout));
            }
        }
        if self.interesting_examples.is_empty() {
            if self.stats.valid_examples >= self.config.max_examples {
                return Err(self.exit_with(ExitReason::MaxExamples));
            }
            if self.stats.call_count >= max(self.config.max_iterations, self.config.max_examples) {
                return Err(self.exit_with(ExitReason::MaxIterations));
            }
        }
        if self.tree.is_exhausted() {
            return Err(self.exit_with(ExitReason::Finished));
        }
        Ok(())
    }

    fn record_for_health_check(&mut self, result: &ConjectureResult) -> Result<(), RunHalt> {
        let verdict = match self.health_check_state.as_mut() {
            Some(state) => state.record(result, &self.config.health_check_thresholds),
            None => return Ok(()),
        };
        match verdict {
            HealthVerdict::Pending => Ok(()),
            HealthVerdict::Healthy => {
                self.health_check_state = None;
                Ok(())
            }
            HealthVerdict::Failed(check, message) => {
                self.health_check_state = None;
                self.fail_health_check(check, message)
            }
        }
    }

    fn fail_health_check(&mut self, check: HealthCheck, message: String) -> Result<(), RunHalt> {
        if !self.config.perform_health_check || self.config.suppress_health_check.contains(&check) {
            warn!("Suppressed health check {}: {}", check, message);
            return Ok(());
        }
        Err(RunHalt::Failed(EngineError::HealthCheck { check, message }))
    }

    fn corpus_key(&self, corpus: Corpus) -> Option<DatabaseKey> {
        let key = self.database_key.as_ref()?;
        Some(match corpus {
            Corpus::Primary => key.clone(),
            Corpus::Secondary => key.with_sub_key("secondary"),
            Corpus::Coverage => key.with_sub_key("coverage"),
        })
    }

    fn db_save(&mut self, corpus: Corpus, value: &[u8]) {
        let key = match self.corpus_key(corpus) {
            Some(key) => key,
            None => return,
        };
        if let Some(database) = self.database.as_mut() {
            if let Err(e) = database.save(&key, value) {
                warn!("Failed to save example under {}: {}", key, e);
            }
        }
    }

    fn db_delete(&mut self, corpus: Corpus, value: &[u8]) {
        let key = match self.corpus_key(corpus) {
            Some(key) => key,
            None => return,
        };
        if let Some(database) = self.database.as_mut() {
            if let Err(e) = database.delete(&key, value) {
                warn!("Failed to delete example under {}: {}", key, e);
            }
        }
    }

    fn db_move(&mut self, from: Corpus, to: Corpus, value: &[u8]) {
        let (from_key, to_key) = match (self.corpus_key(from), self.corpus_key(to)) {
            (Some(from_key), Some(to_key)) => (from_key, to_key),
            _ => return,
        };
        if let Some(database) = self.database.as_mut() {
            if let Err(e) = database.move_value(&from_key, &to_key, value) {
                warn!("Failed to move example from {} to {}: {}", from_key, to_key, e);
            }
        }
    }

    fn db_fetch(&self, corpus: Corpus) -> Vec<Vec<u8>> {
        let (database, key) = match (self.database.as_ref(), self.corpus_key(corpus)) {
            (Some(database), Some(key)) => (database, key),
            _ => return Vec::new(),
        };
        match database.fetch(&key) {
            Ok(values) => values,
            Err(e) => {
                warn!("Failed to fetch examples under {}: {}", key, e);
                Vec::new()
            }
        }
    }

    fn reuse_existing_examples(&mut self) -> Result<(), RunHalt> {
        if self.database.is_none() || self.database_key.is_none() {
            return Ok(());
        }
        info!("Reusing examples from the database");

        let mut corpus = self.db_fetch(Corpus::Primary);
        corpus.sort_by(|a, b| sort_key_cmp(a, b));

        let desired_size = max(2, (self.config.max_examples + 9) / 10);
        if corpus.len() < desired_size {
            let shortfall = desired_size - corpus.len();
            let mut extra = self.db_fetch(Corpus::Secondary);
            extra.extend(self.db_fetch(Corpus::Coverage));
            extra.sort_by(|a, b| sort_key_cmp(a, b));
            extra.dedup();
            extra.retain(|buffer| !corpus.contains(buffer));
            if extra.len() > shortfall {
                let smallest = shortfall / 2;
                let mut sampled: Vec<Vec<u8>> = extra.drain(..smallest).collect();
                sampled.extend(
                    extra
                        .choose_multiple(&mut self.rng, shortfall - smallest)
                        .cloned(),
                );
                sampled.sort_by(|a, b| sort_key_cmp(a, b));
                extra = sampled;
            }
            corpus.extend(extra);
        }

        for existing in corpus {
            self.last_data = None;
            let outcome = self.test_function(DrawStrategy::Replay(existing.clone()));
            let reproduced = self
                .last_data
                .as_ref()
                .map_or(false, |data| data.status == Status::Interesting);
            if !reproduced && !matches!(outcome, Err(RunHalt::Failed(_))) {
                self.db_delete(Corpus::Primary, &existing);
                self.db_delete(Corpus::Secondary, &existing);
            }
            outcome?;
        }
        Ok(())
    }

    fn generate_new_examples(&mut self) -> Result<(), RunHalt> {
        info!("Generating new examples");

        let buffer_size = self.config.buffer_size;
        let zero_data = self.cached_test_function(&vec![0; buffer_size])?;
        if !self.interesting_examples.is_empty() {
            return Ok(());
        }
        if zero_data.status == Status::Overrun
            || (zero_data.status == Status::Valid && zero_data.index() * 2 > buffer_size)
        {
            self.fail_health_check(
                HealthCheck::LargeBaseExample,
                format!(
                    "The smallest natural example for your test is extremely large ({} bytes \
                     of a {} byte buffer)",
                    zero_data.index(),
                    buffer_size
                ),
            )?;
        }

        let cap = buffer_size / 2;
        if cap > 0
            && self.interesting_examples.is_empty()
            && zero_data.index() >= cap
            && (0..cap).all(|i| zero_data.forced_indices.contains(&i))
        {
            return Err(self.exit_with(ExitReason::Finished));
        }

        if self.config.perform_health_check {
            self.health_check_state = Some(HealthCheckState::new());
        }

        let mut zero_bound_queue: Vec<Arc<ConjectureResult>> = Vec::new();

        let mut count = 0;
        while self.interesting_examples.is_empty()
            && (count < MIN_RANDOM_EXAMPLES || self.health_check_state.is_some())
        {
            let covered = self.covering_examples.len();
            let result = self.test_function(DrawStrategy::Random)?;
            if result.hit_zero_bound {
                zero_bound_queue.push(result);
            }
            count += 1;
            if self.covering_examples.len() > covered {
                count = 0;
            }
        }

        let mut mutator = Mutator::new(&mut self.rng);
        let mut mutations = 0;
        while self.interesting_examples.is_empty() {
            if let Some(overdrawn) = zero_bound_queue.pop() {
                let mut buffer = overdrawn.buffer.clone();
                for &i in &overdrawn.forced_indices {
                    buffer[i] = 0;
                }
                buffer.shuffle(&mut self.rng);
                let result = self.test_function(DrawStrategy::Redistribute(buffer))?;
                if result.hit_zero_bound {
                    zero_bound_queue.push(result);
                }
                continue;
            }

            let (target, seed) = match self.target_selector.select(&mut self.rng) {
                Some(selection) => selection,
                None => {
                    let result = self.test_function(DrawStrategy::Random)?;
                    if result.hit_zero_bound {
                        zero_bound_queue.push(result);
                    }
                    continue;
                }
            };
            mutations += 1;
            let covered = self.covering_examples.len();
            let result = self.test_function(DrawStrategy::Mutate {
                mutator: mutator.clone(),
                seed: Arc::clone(&seed),
            })?;
            if result.hit_zero_bound {
                zero_bound_queue.push(Arc::clone(&result));
            }

            if result.status > seed.status || self.covering_examples.len() > covered {
                mutations = 0;
            } else if result.status < seed.status
                || !self.target_selector.has_tag(&target, &result)
                || mutations >= MUTATIONS_PER_MUTATOR
            {
                mutations = 0;
                mutator = Mutator::new(&mut self.rng);
            }
        }
        Ok(())
    }

    fn shrink_interesting_examples(&mut self) -> Result<(), RunHalt> {
        if self.interesting_examples.is_empty() {
            return Ok(());
        }
        info!(
            "Shrinking {} interesting example(s)",
            self.interesting_examples.len()
        );

        let mut known: Vec<Arc<ConjectureResult>> =
            self.interesting_examples.values().cloned().collect();
        known.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        for previous in known {
            let replayed = self.test_function(DrawStrategy::Replay(previous.buffer.clone()))?;
            if replayed.status != Status::Interesting {
                warn!(
                    "Interesting example of {} bytes did not reproduce on replay",
                    previous.index()
                );
                return Err(self.exit_with(ExitReason::Flaky));
            }
        }

        self.clear_secondary_key()?;

        loop {
            let next = self
                .interesting_examples
                .iter()
                .filter(|(origin, _)| !self.shrunk_examples.contains(*origin))
                .min_by(|(oa, a), (ob, b)| a.sort_key().cmp(&b.sort_key()).then_with(|| oa.cmp(ob)))
                .map(|(origin, example)| (origin.clone(), Arc::clone(example)));
            let (origin, example) = match next {
                Some(next) => next,
                None => break,
            };
            debug!("Shrinking example for {} ({} bytes)", origin, example.index());
            self.shrink(example, origin.clone())?;
            self.shrunk_examples.insert(origin);
        }
        Ok(())
    }

    /// Retry superseded failures that are no larger than the current ones, then drop them.
    fn clear_secondary_key(&mut self) -> Result<(), RunHalt> {
        let mut corpus = self.db_fetch(Corpus::Secondary);
        corpus.sort_by(|a, b| sort_key_cmp(a, b));
        for buffer in corpus {
            let largest = self
                .interesting_examples
                .values()
                .map(|example| example.buffer.clone())
                .max_by(|a, b| sort_key_cmp(a, b));
            match largest {
                Some(largest) if sort_key_cmp(&buffer, &largest).is_le() => {}
                _ => break,
            }
            self.cached_test_function(&buffer)?;
            self.db_delete(Corpus::Secondary, &buffer);
        }
        Ok(())
    }

    fn shrink(
        &mut self,
        example: Arc<ConjectureResult>,
        origin: InterestingOrigin,
    ) -> Result<(), RunHalt> {
        let predicate = move |result: &ConjectureResult| {
            result.status == Status::Interesting
                && result.interesting_origin.as_ref() == Some(&origin)
        };
        let mut shrinker = Shrinker::new(self, example, Box::new(predicate));
        shrinker.shrink()?;
        debug!(
            "Shrinker finished after {} calls and {} shrinks",
            shrinker.calls(),
            shrinker.shrinks()
        );
        Ok(())
    }
}

fn sort_key_cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    crate::data::sort_key(a).cmp(&crate::data::sort_key(b))
}

fn debug_data(result: &ConjectureResult) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let blocks = result
        .blocks
        .iter()
        .map(|&(u, v)| {
            result.buffer[u..v]
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect::<Vec<_>>()
        .join(" || ");
    let origin = result
        .interesting_origin
        .as_ref()
        .map(|origin| format!(" ({})", origin))
        .unwrap_or_default();
    debug!(
        "{} bytes [{}] -> {}{}",
        result.index(),
        blocks,
        result.status,
        origin
    );
}
