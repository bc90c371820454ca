//! Trip-wire budget enforcement: steps, tool calls, wall-clock time, tokens.
//!
//! Counters live inside the [`TripWire`] instance, start at zero on
//! construction or [`reset`](TripWire::reset), and never reset on their own.
//! Use one instance per run (or share one across runs to budget them
//! together).
//!
//! Checks happen after incrementing: with `max_steps = N`, agent turns
//! `1..=N` pass and turn `N + 1` trips. Step, time and token overruns abort
//! the run from `before_agent`; tool-call and token overruns skip the
//! current call from `before_tool`. Tokens are counted in `after_tool` but
//! only enforced at the next check.

use crate::ids::now_millis;
use crate::pipeline::{
    AfterTool, AgentAction, BeforeAgent, BeforeTool, HookFuture, Policy, Priority, RunContext,
    ToolAction,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Metadata key holding the most recent violation.
pub const VIOLATION_METADATA_KEY: &str = "tripwire.violation";

/// Ceilings for a [`TripWire`]. An unset ceiling never trips.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct TripWireConfig {
    pub max_steps: Option<u32>,
    pub max_tool_calls: Option<u32>,
    pub max_time_ms: Option<u64>,
    pub max_tokens: Option<u64>,
}

impl TripWireConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_steps(mut self, max: u32) -> Self {
        self.max_steps = Some(max);
        self
    }

    pub fn with_max_tool_calls(mut self, max: u32) -> Self {
        self.max_tool_calls = Some(max);
        self
    }

    pub fn with_max_time_ms(mut self, max: u64) -> Self {
        self.max_time_ms = Some(max);
        self
    }

    pub fn with_max_tokens(mut self, max: u64) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

/// Which budget tripped.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Wire {
    Steps,
    ToolCalls,
    Time,
    Tokens,
}

impl fmt::Display for Wire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Wire::Steps => "steps",
            Wire::ToolCalls => "toolCalls",
            Wire::Time => "time",
            Wire::Tokens => "tokens",
        };
        f.write_str(name)
    }
}

/// A tripped budget.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TripViolation {
    pub wire: Wire,
    pub limit: u64,
    pub observed: u64,
}

impl fmt::Display for TripViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "limit exceeded: {} at {} (limit {})",
            self.wire, self.observed, self.limit
        )
    }
}

/// Snapshot of a trip-wire's counters.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TripWireStats {
    pub step_count: u32,
    pub tool_call_count: u32,
    pub total_tokens: u64,
    pub start_timestamp_ms: Option<i64>,
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;
type TripCallback = Box<dyn Fn(&TripViolation) + Send + Sync>;

/// Budget-enforcing [`Policy`].
pub struct TripWire {
    config: TripWireConfig,
    stats: Mutex<TripWireStats>,
    clock: Clock,
    on_trip: Option<TripCallback>,
}

impl TripWire {
    pub fn new(config: TripWireConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(TripWireStats::default()),
            clock: Arc::new(now_millis),
            on_trip: None,
        }
    }

    /// Replace the millisecond clock (Unix epoch ms by default).
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Called with every violation before the abort/skip is returned.
    pub fn on_trip(mut self, callback: impl Fn(&TripViolation) + Send + Sync + 'static) -> Self {
        self.on_trip = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &TripWireConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TripWireStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> TripWireStats {
        self.lock().clone()
    }

    /// Zero all counters and forget the start timestamp.
    pub fn reset(&self) {
        *self.lock() = TripWireStats::default();
    }

    fn token_violation(&self, stats: &TripWireStats) -> Option<TripViolation> {
        let limit = self.config.max_tokens?;
        (stats.total_tokens > limit).then_some(TripViolation {
            wire: Wire::Tokens,
            limit,
            observed: stats.total_tokens,
        })
    }

    fn check_agent_turn(&self) -> Option<TripViolation> {
        let now = (self.clock)();
        let mut stats = self.lock();
        let start = *stats.start_timestamp_ms.get_or_insert(now);
        stats.step_count += 1;
        debug!(step = stats.step_count, "Trip-wire step counted");

        if let Some(limit) = self.config.max_steps
            && stats.step_count > limit
        {
            return Some(TripViolation {
                wire: Wire::Steps,
                limit: limit.into(),
                observed: stats.step_count.into(),
            });
        }

        let elapsed = now.saturating_sub(start).max(0) as u64;
        if let Some(limit) = self.config.max_time_ms
            && elapsed > limit
        {
            return Some(TripViolation {
                wire: Wire::Time,
                limit,
                observed: elapsed,
            });
        }

        self.token_violation(&stats)
    }

    fn check_tool_call(&self) -> Option<TripViolation> {
        let mut stats = self.lock();
        stats.tool_call_count += 1;

        if let Some(limit) = self.config.max_tool_calls
            && stats.tool_call_count > limit
        {
            return Some(TripViolation {
                wire: Wire::ToolCalls,
                limit: limit.into(),
                observed: stats.tool_call_count.into(),
            });
        }

        self.token_violation(&stats)
    }

    fn trip(&self, ctx: &mut RunContext, violation: &TripViolation) {
        warn!(
            session = %ctx.session_id,
            wire = %violation.wire,
            limit = violation.limit,
            observed = violation.observed,
            "Trip-wire tripped"
        );
        if let Ok(value) = serde_json::to_value(violation) {
            ctx.set(VIOLATION_METADATA_KEY, value);
        }
        if let Some(callback) = &self.on_trip {
            callback(violation);
        }
    }
}

/// Token count reported in a tool result's numeric `tokens` field.
fn reported_tokens(result: &Value) -> Option<u64> {
    let tokens = result.get("tokens")?;
    tokens
        .as_u64()
        .or_else(|| tokens.as_f64().filter(|t| *t >= 0.0).map(|t| t as u64))
}

impl Policy for TripWire {
    fn name(&self) -> &str {
        "tripwire"
    }

    fn priority(&self) -> Priority {
        Priority::EARLY
    }

    fn before_agent<'a>(
        &'a self,
        ctx: &'a mut RunContext,
        _turn: &'a BeforeAgent<'a>,
    ) -> HookFuture<'a, AgentAction> {
        let action = match self.check_agent_turn() {
            Some(violation) => {
                self.trip(ctx, &violation);
                AgentAction::Abort(violation.to_string())
            }
            None => AgentAction::Proceed,
        };
        Box::pin(async move { Ok(action) })
    }

    fn before_tool<'a>(
        &'a self,
        ctx: &'a mut RunContext,
        _call: &'a BeforeTool<'a>,
    ) -> HookFuture<'a, ToolAction> {
        let action = match self.check_tool_call() {
            Some(violation) => {
                self.trip(ctx, &violation);
                ToolAction::Skip {
                    reason: violation.to_string(),
                    result: None,
                }
            }
            None => ToolAction::Proceed,
        };
        Box::pin(async move { Ok(action) })
    }

    fn after_tool<'a>(
        &'a self,
        _ctx: &'a mut RunContext,
        call: &'a AfterTool<'a>,
    ) -> HookFuture<'a, Option<Value>> {
        if let Some(tokens) = reported_tokens(call.result) {
            let mut stats = self.lock();
            stats.total_tokens = stats.total_tokens.saturating_add(tokens);
            debug!(
                tool = call.tool_name,
                tokens,
                total = stats.total_tokens,
                "Trip-wire tokens counted"
            );
        }
        Box::pin(futures::future::ready(Ok(None)))
    }
}
