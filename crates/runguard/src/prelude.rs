//! Convenience re-exports for common `runguard` types.
//!
//! ```ignore
//! use runguard::prelude::*;
//! ```
//!
//! Metadata key constants and the simulator are left out; import those from
//! their modules directly.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::config::GovernanceConfig;
pub use crate::error::{GovernError, GovernResult};

// ── Mutation queue ──────────────────────────────────────────────────
pub use crate::queue::{
    Drain, FlushFailure, FlushReport, FnDrain, MutationQueue, OverflowPolicy, QueueConfig,
    QueueEntry,
};

// ── Pipeline ────────────────────────────────────────────────────────
pub use crate::pipeline::{
    AfterAgent, AfterTool, AgentAction, BeforeAgent, BeforeTool, HookError, HookFuture, Phase,
    Pipeline, Policy, Priority, RunContext, ToolAction, ToolDecision, ToolInvocation,
};

// ── Policies ────────────────────────────────────────────────────────
pub use crate::policy::{
    CompactionConfig, ContextCompaction, EvictedResultReference, FnStore, FnSummarizer,
    OffloadConfig, ResultOffload, ResultStore, Summarizer, TripViolation, TripWire,
    TripWireConfig,
};

// ── Streaming and storage ───────────────────────────────────────────
pub use crate::delta::{DeltaConfig, DeltaEncoder};
pub use crate::store::DirectoryStore;
