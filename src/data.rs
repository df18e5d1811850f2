//! # ConjectureData: the byte-level draw source
//!
//! A test function never sees randomness directly. Every value it builds is derived from an
//! ordered, append-only buffer of bytes that `ConjectureData` hands out block by block. Where those
//! bytes come from is pluggable through the [`ByteSource`] trait: the engine supplies sources that
//! generate random data, mutate an earlier example, or replay a fixed buffer.
//!
//! ## Lifecycle
//!
//! 1. A `ConjectureData` is created for exactly one execution of the test function.
//! 2. The test draws blocks (`draw_bytes`, `write`, `draw_capped_byte`, ...), opens and closes
//!    nested examples, attaches coverage tags and may conclude the execution early with
//!    `mark_interesting` / `mark_invalid`.
//! 3. The data is frozen and converted into an immutable [`ConjectureResult`], which is what the
//!    runner, the data tree and the shrinker keep around.
//!
//! Draws that run past `max_length` put the data into the `Overrun` state and return a
//! [`StopTest`] carrying this execution's counter. Counters let the runner tell a stop signal that
//! belongs to the current execution apart from one leaking out of an unrelated execution.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

/// Global test counter for unique test identification
static GLOBAL_TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque coverage tag attached to an execution.
pub type Tag = String;

/// Outcome of one execution. The ordering is significant:
/// `Overrun < Invalid < Valid < Interesting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The test asked for more bytes than the buffer allows
    Overrun = 0,
    /// The test rejected the data (failed assumption, filtered draw)
    Invalid = 1,
    /// The test ran to completion without finding anything
    Valid = 2,
    /// The test failed
    Interesting = 3,
}

impl Default for Status {
    fn default() -> Self {
        Status::Valid
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Overrun => "OVERRUN",
            Status::Invalid => "INVALID",
            Status::Valid => "VALID",
            Status::Interesting => "INTERESTING",
        };
        f.write_str(name)
    }
}

/// Identifies *why* an execution was interesting. Two interesting examples with different
/// origins are treated as different bugs and shrunk independently.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterestingOrigin(String);

impl InterestingOrigin {
    pub fn new(label: impl Into<String>) -> Self {
        InterestingOrigin(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Origin for a panic escaping the test function: the panic location when the hook saw one,
    /// otherwise the panic message.
    fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        if let Some(location) = LAST_PANIC_LOCATION.with(|slot| slot.borrow_mut().take()) {
            return InterestingOrigin(format!("panicked at {}", location));
        }
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());
        InterestingOrigin(format!("panicked: {}", message))
    }
}

impl From<&str> for InterestingOrigin {
    fn from(label: &str) -> Self {
        InterestingOrigin::new(label)
    }
}

impl From<String> for InterestingOrigin {
    fn from(label: String) -> Self {
        InterestingOrigin(label)
    }
}

impl fmt::Display for InterestingOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signal that the current execution is over. Returned by every draw once the data is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("test execution {testcounter} stopped")]
pub struct StopTest {
    pub testcounter: u64,
}

/// Everything a test function can return besides success.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// The execution was concluded early (overrun, invalid, interesting)
    #[error(transparent)]
    Stop(#[from] StopTest),

    /// A fault that is not a test failure. The runner saves the buffer and aborts the run.
    #[error("test function fault: {0}")]
    Fault(Box<dyn std::error::Error + Send + Sync>),
}

impl TestError {
    pub fn fault<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        TestError::Fault(error.into())
    }
}

/// Return type of test functions run by the engine
pub type TestResult = Result<(), TestError>;

/// Sort key used everywhere a "smaller" buffer is needed: shorter always wins, then bytewise.
pub fn sort_key(buffer: &[u8]) -> (usize, &[u8]) {
    (buffer.len(), buffer)
}

/// The part of an in-progress execution that byte sources are allowed to see.
#[derive(Debug, Default, Clone)]
pub struct DrawState {
    /// Bytes committed so far
    pub buffer: Vec<u8>,
    /// `[start, end)` of every block committed so far
    pub blocks: Vec<(usize, usize)>,
    /// Current example nesting depth
    pub depth: usize,
    /// Set by sources that zeroed a block to keep the data size under control
    pub hit_zero_bound: bool,
}

impl DrawState {
    pub fn index(&self) -> usize {
        self.buffer.len()
    }

    /// Start offsets of every committed block of exactly `n` bytes
    pub fn block_starts(&self, n: usize) -> Vec<usize> {
        block_starts(&self.blocks, n)
    }
}

fn block_starts(blocks: &[(usize, usize)], n: usize) -> Vec<usize> {
    blocks
        .iter()
        .filter(|(u, v)| v - u == n)
        .map(|(u, _)| *u)
        .collect()
}

/// Pluggable byte generation. Called once per free draw with the number of bytes wanted;
/// must return exactly `n` bytes.
pub trait ByteSource {
    fn draw_bytes(&mut self, state: &mut DrawState, n: usize) -> Vec<u8>;
}

/// Replays a fixed buffer. Paired with `max_length == buffer.len()` by
/// [`ConjectureData::for_buffer`], so reading past the end overruns instead of padding.
#[derive(Debug, Clone)]
pub struct Replay {
    buffer: Vec<u8>,
}

impl Replay {
    pub fn new(buffer: impl Into<Vec<u8>>) -> Self {
        Replay { buffer: buffer.into() }
    }
}

impl ByteSource for Replay {
    fn draw_bytes(&mut self, state: &mut DrawState, n: usize) -> Vec<u8> {
        let start = state.index().min(self.buffer.len());
        let end = (start + n).min(self.buffer.len());
        let mut result = self.buffer[start..end].to_vec();
        result.resize(n, 0);
        result
    }
}

/// Live state of one execution of the test function.
pub struct ConjectureData<'a> {
    source: Box<dyn ByteSource + 'a>,
    state: DrawState,
    max_length: usize,
    status: Status,
    frozen: bool,
    testcounter: u64,
    tags: BTreeSet<Tag>,
    events: BTreeSet<String>,
    interesting_origin: Option<InterestingOrigin>,
    forced_indices: BTreeSet<usize>,
    capped: BTreeMap<usize, u8>,
    discarded: Vec<(usize, usize)>,
    intervals: Vec<(usize, usize)>,
    example_stack: Vec<usize>,
    draw_times: Vec<Duration>,
    start_time: Instant,
    finish_time: Option<Instant>,
}

impl<'a> fmt::Debug for ConjectureData<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConjectureData")
            .field("testcounter", &self.testcounter)
            .field("status", &self.status)
            .field("frozen", &self.frozen)
            .field("buffer", &self.state.buffer)
            .field("max_length", &self.max_length)
            .finish()
    }
}

impl<'a> ConjectureData<'a> {
    /// Create a fresh execution drawing from `source`, allowed at most `max_length` bytes
    pub fn new(source: Box<dyn ByteSource + 'a>, max_length: usize) -> Self {
        ConjectureData {
            source,
            state: DrawState::default(),
            max_length,
            status: Status::Valid,
            frozen: false,
            testcounter: GLOBAL_TEST_COUNTER.fetch_add(1, Ordering::Relaxed),
            tags: BTreeSet::new(),
            events: BTreeSet::new(),
            interesting_origin: None,
            forced_indices: BTreeSet::new(),
            capped: BTreeMap::new(),
            discarded: Vec::new(),
            intervals: Vec::new(),
            example_stack: Vec::new(),
            draw_times: Vec::new(),
            start_time: Instant::now(),
            finish_time: None,
        }
    }

    pub fn testcounter(&self) -> u64 {
        self.testcounter
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of bytes consumed so far
    pub fn index(&self) -> usize {
        self.state.index()
    }

    pub fn depth(&self) -> usize {
        self.state.depth
    }

    pub fn buffer(&self) -> &[u8] {
        &self.state.buffer
    }

    fn stop(&self) -> StopTest {
        StopTest {
            testcounter: self.testcounter,
        }
    }

    /// Check whether `n` more bytes fit; if not the execution overruns.
    fn reserve(&mut self, n: usize) -> Result<(), StopTest> {
        if self.frozen {
            return Err(self.stop());
        }
        if self.index() + n > self.max_length {
            self.status = Status::Overrun;
            self.freeze();
            return Err(self.stop());
        }
        Ok(())
    }

    fn commit(&mut self, bytes: &[u8]) {
        let start = self.index();
        self.state.buffer.extend_from_slice(bytes);
        self.state.blocks.push((start, self.index()));
    }

    fn pull(&mut self, n: usize) -> Vec<u8> {
        let started = Instant::now();
        let bytes = self.source.draw_bytes(&mut self.state, n);
        self.draw_times.push(started.elapsed());
        assert_eq!(bytes.len(), n, "byte source returned a block of the wrong size");
        bytes
    }

    /// Draw one block of `n` freely chosen bytes.
    pub fn draw_bytes(&mut self, n: usize) -> Result<Vec<u8>, StopTest> {
        self.reserve(n)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.pull(n);
        self.commit(&bytes);
        Ok(bytes)
    }

    pub fn draw_u8(&mut self) -> Result<u8, StopTest> {
        Ok(self.draw_bytes(1)?[0])
    }

    /// Eight-byte block read as a big-endian integer, so smaller buffers give smaller values
    pub fn draw_u64(&mut self) -> Result<u64, StopTest> {
        let bytes = self.draw_bytes(8)?;
        Ok(BigEndian::read_u64(&bytes))
    }

    /// Draw a single byte no larger than `max`. Larger source values are clamped to `max`, so
    /// every value above the cap behaves exactly like the cap itself.
    pub fn draw_capped_byte(&mut self, max: u8) -> Result<u8, StopTest> {
        self.reserve(1)?;
        let index = self.index();
        let value = self.pull(1)[0].min(max);
        self.capped.insert(index, max);
        self.commit(&[value]);
        Ok(value)
    }

    /// Append bytes whose values are fixed by the test rather than drawn.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), StopTest> {
        self.reserve(bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        let start = self.index();
        self.forced_indices.extend(start..start + bytes.len());
        self.commit(bytes);
        Ok(())
    }

    pub fn start_example(&mut self) {
        if self.frozen {
            return;
        }
        self.example_stack.push(self.index());
        self.state.depth += 1;
    }

    /// Close the innermost example. A discarded example is one the test abandoned (a rejected
    /// filter attempt, a backtracked parse) and is a candidate for wholesale removal.
    pub fn stop_example(&mut self, discard: bool) {
        if self.frozen {
            return;
        }
        self.close_example(discard);
    }

    fn close_example(&mut self, discard: bool) {
        let start = match self.example_stack.pop() {
            Some(start) => start,
            None => return,
        };
        self.state.depth -= 1;
        let end = self.index();
        if start != end {
            self.intervals.push((start, end));
            if discard {
                self.discarded.push((start, end));
            }
        }
    }

    pub fn add_tag(&mut self, tag: impl Into<Tag>) {
        if !self.frozen {
            self.tags.insert(tag.into());
        }
    }

    pub fn note_event(&mut self, event: impl Into<String>) {
        if !self.frozen {
            self.events.insert(event.into());
        }
    }

    /// Conclude this execution as a failure with the given origin.
    pub fn mark_interesting(&mut self, origin: impl Into<InterestingOrigin>) -> StopTest {
        if !self.frozen {
            self.status = Status::Interesting;
            self.interesting_origin = Some(origin.into());
            self.freeze();
        }
        self.stop()
    }

    /// Conclude this execution as invalid.
    pub fn mark_invalid(&mut self) -> StopTest {
        if !self.frozen {
            self.status = Status::Invalid;
            self.freeze();
        }
        self.stop()
    }

    /// Mark the execution complete. Open examples are closed and the structural intervals
    /// (examples and blocks, longest first) are computed. Idempotent.
    pub fn freeze(&mut self) {
        if self.frozen {
            return;
        }
        self.finish_time = Some(Instant::now());
        while !self.example_stack.is_empty() {
            self.close_example(false);
        }

        let mut intervals: BTreeSet<(usize, usize)> = self.intervals.drain(..).collect();
        intervals.extend(self.state.blocks.iter().copied());
        let mut intervals: Vec<(usize, usize)> = intervals.into_iter().collect();
        intervals.sort_by_key(|&(u, v)| (std::cmp::Reverse(v - u), u));
        self.intervals = intervals;

        self.discarded.sort_unstable();
        self.frozen = true;
    }

    /// Snapshot the frozen execution into an immutable record
    pub fn as_result(&self) -> ConjectureResult {
        let runtime = self
            .finish_time
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.start_time);
        ConjectureResult {
            buffer: self.state.buffer.clone(),
            status: self.status,
            blocks: self.state.blocks.clone(),
            tags: Arc::new(self.tags.clone()),
            interesting_origin: self.interesting_origin.clone(),
            forced_indices: self.forced_indices.clone(),
            capped: self.capped.clone(),
            discarded: self.discarded.clone(),
            intervals: self.intervals.clone(),
            hit_zero_bound: self.state.hit_zero_bound,
            events: self.events.clone(),
            draw_times: self.draw_times.clone(),
            runtime,
            testcounter: self.testcounter,
        }
    }
}

impl ConjectureData<'static> {
    /// Execution that replays exactly `buffer` and overruns if the test wants more
    pub fn for_buffer(buffer: impl Into<Vec<u8>>) -> Self {
        let buffer = buffer.into();
        let max_length = buffer.len();
        ConjectureData::new(Box::new(Replay::new(buffer)), max_length)
    }
}

/// Immutable record of one finished execution.
#[derive(Debug, Clone)]
pub struct ConjectureResult {
    /// Bytes actually consumed
    pub buffer: Vec<u8>,
    pub status: Status,
    /// `[start, end)` per draw, in draw order
    pub blocks: Vec<(usize, usize)>,
    /// Interned tag set
    pub tags: Arc<BTreeSet<Tag>>,
    pub interesting_origin: Option<InterestingOrigin>,
    /// Offsets whose value was fixed by the test rather than drawn
    pub forced_indices: BTreeSet<usize>,
    /// Offset -> maximum legal byte value at that offset
    pub capped: BTreeMap<usize, u8>,
    /// Ranges the test marked as abandoned, sorted by start
    pub discarded: Vec<(usize, usize)>,
    /// Structural intervals, longest first then by start
    pub intervals: Vec<(usize, usize)>,
    pub hit_zero_bound: bool,
    pub events: BTreeSet<String>,
    pub draw_times: Vec<Duration>,
    pub runtime: Duration,
    pub testcounter: u64,
}

impl ConjectureResult {
    pub fn index(&self) -> usize {
        self.buffer.len()
    }

    pub fn block_starts(&self, n: usize) -> Vec<usize> {
        block_starts(&self.blocks, n)
    }

    pub fn sort_key(&self) -> (usize, &[u8]) {
        sort_key(&self.buffer)
    }
}

thread_local! {
    static RUNNING_TEST: Cell<bool> = Cell::new(false);
    static LAST_PANIC_LOCATION: RefCell<Option<String>> = RefCell::new(None);
}

static PANIC_HOOK: Once = Once::new();

/// Wrap the process panic hook once: panics raised while this thread runs a test function only
/// record their location, everything else goes to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if RUNNING_TEST.with(Cell::get) {
                let location = info
                    .location()
                    .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
                LAST_PANIC_LOCATION.with(|slot| *slot.borrow_mut() = location);
            } else {
                previous(info);
            }
        }));
    });
}

/// Run `f`, turning an escaping panic into the origin it should be reported under.
pub(crate) fn catch_test_panic<R>(f: impl FnOnce() -> R) -> Result<R, InterestingOrigin> {
    install_panic_hook();
    LAST_PANIC_LOCATION.with(|slot| slot.borrow_mut().take());
    let was_running = RUNNING_TEST.with(|flag| flag.replace(true));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    RUNNING_TEST.with(|flag| flag.set(was_running));
    outcome.map_err(InterestingOrigin::from_panic)
}
