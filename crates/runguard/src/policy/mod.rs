//! Governance policies registered on the [`Pipeline`](crate::pipeline::Pipeline).
//!
//! - [`tripwire`]: [`TripWire`] counts steps, tool calls, elapsed time and
//!   tokens against configured ceilings; aborts the run or skips a call.
//! - [`offload`]: [`ResultOffload`] moves oversized tool results to an
//!   external store and leaves a reference in their place.
//! - [`compaction`]: [`ContextCompaction`] summarizes once the running
//!   token estimate crosses a fraction of the context window.

pub mod compaction;
pub mod offload;
pub mod tripwire;

pub use compaction::{
    CompactionConfig, CompactionStats, ContextCompaction, FnSummarizer, Summarizer,
    SummaryMetadata,
};
pub use offload::{EvictedResultReference, FnStore, OffloadConfig, ResultOffload, ResultStore};
pub use tripwire::{TripViolation, TripWire, TripWireConfig, TripWireStats, Wire};

/// Characters per token used for every estimate in this crate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}
