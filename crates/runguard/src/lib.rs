//! Run governance for autonomous agents.
//!
//! `runguard` sits between an agent execution engine and the outside world
//! and keeps a run inside its budgets. It does not call models or execute
//! tools itself; the engine drives it through a fixed set of hook points.
//!
//! # Getting started
//!
//! ```ignore
//! use runguard::prelude::*;
//! use std::sync::Arc;
//!
//! let config = GovernanceConfig::load("governance.json")?;
//! let store = Arc::new(DirectoryStore::new("/var/lib/runguard"));
//!
//! let tripwire = Arc::new(TripWire::new(config.tripwire.clone()));
//! let mut pipeline = Pipeline::new();
//! pipeline.register(tripwire.clone());
//! pipeline.register(Arc::new(ResultOffload::new(config.offload.clone(), store.clone())));
//!
//! let mut ctx = RunContext::new("session-1");
//! if let AgentAction::Abort(reason) = pipeline.before_agent(&mut ctx, &turn).await? {
//!     return Err(reason.into());
//! }
//! let outcome = pipeline
//!     .invoke_tool(&mut ctx, "read_file", args, 0, |args| tools.call("read_file", args))
//!     .await?;
//! ```
//!
//! # Where to find things
//!
//! - **Buffer state writes before they hit storage:** [`MutationQueue`](queue::MutationQueue)
//!   with a [`Drain`](queue::Drain) for the backing store. Supports
//!   periodic auto-flush and bounded retries.
//!
//! - **Intercept a run:** implement [`Policy`](pipeline::Policy) and register
//!   it on a [`Pipeline`](pipeline::Pipeline). Hooks fire in
//!   [`Priority`](pipeline::Priority) order.
//!
//! - **Enforce budgets:** [`TripWire`](policy::TripWire) for steps, tool
//!   calls, wall-clock time and tokens.
//!
//! - **Keep huge tool results out of context:** [`ResultOffload`](policy::ResultOffload).
//!
//! - **Summarize a growing context:** [`ContextCompaction`](policy::ContextCompaction).
//!
//! - **Stream only what changed:** [`DeltaEncoder`](delta::DeltaEncoder).
//!
//! - **Persist to local disk:** [`DirectoryStore`](store::DirectoryStore)
//!   implements both the drain and the offload store contracts.
//!
//! - **Configure everything from one file:** [`GovernanceConfig`](config::GovernanceConfig).
//!
//! # Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`queue`] | Durable mutation queue, flush and auto-flush |
//! | [`pipeline`] | Run context, hook payloads, `Policy` trait, dispatcher |
//! | [`policy`] | Trip-wire, result offload and context compaction policies |
//! | [`delta`] | Per-type delta suppression for streamed events |
//! | [`store`] | Filesystem drain and result store |
//! | [`config`] | Serde-loadable configuration for every component |
//! | [`simulate`] | Scripted replay through the full stack |
//! | [`error`] | `GovernError` and `GovernResult` |
//! | [`ids`] | Entry and reference id generation |

pub mod config;
pub mod delta;
pub mod error;
pub mod ids;
pub mod pipeline;
pub mod policy;
pub mod prelude;
pub mod queue;
pub mod simulate;
pub mod store;

pub use config::GovernanceConfig;
pub use error::{GovernError, GovernResult};
