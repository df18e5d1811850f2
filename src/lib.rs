//! # Conjecture Core
//!
//! The byte-level engine behind property-based testing: every value a test draws is derived from a
//! buffer of bytes, so finding a failure means searching byte strings and simplifying a failure
//! means making its buffer shorter and lexicographically smaller.
//!
//! A [`ConjectureRunner`] explores that space with random and mutated buffers, steered away from
//! already-explored prefixes by a [`DataTree`] and toward rarely-seen coverage by a
//! [`TargetSelector`]. Once the test fails, the [`Shrinker`] reduces the failing buffer to a local
//! minimum. Failing buffers can be persisted in an [`ExampleDatabase`] and replayed on later runs.
//!
//! ```rust
//! use conjecture_core::{ConjectureData, ConjectureRunner, RunnerConfig};
//!
//! let mut runner = ConjectureRunner::new(
//!     |data: &mut ConjectureData<'_>| {
//!         if data.draw_u8()? > 200 {
//!             return Err(data.mark_interesting("too big").into());
//!         }
//!         Ok(())
//!     },
//!     RunnerConfig::default(),
//! );
//! let result = runner.run().unwrap();
//! for example in result.interesting_examples.values() {
//!     assert_eq!(example.buffer, vec![201]);
//! }
//! ```

pub mod data;
pub mod datatree;
pub mod engine;
pub mod health;
pub mod minimizer;
pub mod mutator;
pub mod persistence;
pub mod shrinking;
pub mod targeting;

// Re-export core types for easy access
pub use data::{
    sort_key, ByteSource, ConjectureData, ConjectureResult, DrawState, InterestingOrigin, Replay,
    Status, StopTest, Tag, TestError, TestResult,
};
pub use datatree::{DataTree, NoveltyCursor};
pub use engine::{
    ConjectureRunner, DrawStrategy, EngineError, ExitReason, Phase, RunHalt, RunResult,
    RunnerConfig, RunnerStats,
};
pub use health::{HealthCheck, HealthCheckThresholds};
pub use minimizer::minimize;
pub use mutator::{MutationStrategy, Mutator};
pub use persistence::{
    DatabaseError, DatabaseKey, DirectoryDatabase, ExampleDatabase, InMemoryDatabase,
};
pub use shrinking::Shrinker;
pub use targeting::{Target, TargetSelector};
