//! Scripted replay of an agent run through the full governance stack.
//!
//! A script is a JSON document describing what the model "said" and which
//! tools it "called" on each turn:
//!
//! ```json
//! {
//!   "sessionId": "demo",
//!   "turns": [
//!     {
//!       "prompt": "List the repo",
//!       "toolCalls": [
//!         { "name": "ls", "args": {"path": "."}, "result": {"tokens": 120, "files": ["a.rs"]} }
//!       ],
//!       "response": "The repo has one file."
//!     }
//!   ]
//! }
//! ```
//!
//! Each turn fires `before_agent`, then `before_tool`/`after_tool` per call,
//! then `after_agent`, exactly as an execution engine would. The governed
//! response is buffered as a mutation and flushed into the
//! [`DirectoryStore`]; every state change is streamed through the
//! [`DeltaEncoder`] and handed to the caller as one JSON line.

use crate::config::GovernanceConfig;
use crate::delta::DeltaEncoder;
use crate::error::GovernResult;
use crate::pipeline::{
    AfterAgent, AgentAction, BeforeAgent, Pipeline, RunContext, ToolInvocation,
};
use crate::policy::{
    CompactionStats, ContextCompaction, FnSummarizer, ResultOffload, TripWire, TripWireStats,
};
use crate::queue::{FlushReport, MutationQueue};
use crate::store::DirectoryStore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

/// Characters kept by the simulator's truncating summarizer.
pub const SUMMARY_CHARS: usize = 200;

// ── Script format ──────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    pub turns: Vec<ScriptTurn>,
}

fn default_session_id() -> String {
    "simulated".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTurn {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub tool_calls: Vec<ScriptToolCall>,
    pub response: String,
}

/// A scripted tool call. A numeric `tokens` field in `result` is counted
/// against the token budget.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    pub result: Value,
}

impl Script {
    pub fn from_json(json: &str) -> GovernResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ── Streamed events ────────────────────────────────────────────────

/// Run-state events streamed through the delta encoder. The `type` tag is
/// the delta key, so an unchanged `status` or `budget` is suppressed.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RunEvent {
    Status {
        state: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Budget {
        steps: u32,
        tool_calls: u32,
        tokens: u64,
    },
    Tool {
        turn: usize,
        name: String,
        outcome: &'static str,
        result: Value,
    },
    Response {
        turn: usize,
        text: String,
    },
    Flush {
        succeeded: usize,
        failed: usize,
        pending: usize,
    },
}

// ── Summary ────────────────────────────────────────────────────────

/// End-of-run totals.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub turns_completed: usize,
    pub aborted: Option<String>,
    pub tripwire: TripWireStats,
    pub compaction: CompactionStats,
    pub flushed: usize,
    pub flush_failures: usize,
    pub events_emitted: u64,
    pub events_suppressed: u64,
    pub metadata: serde_json::Map<String, Value>,
}

// ── Simulation ─────────────────────────────────────────────────────

/// The governance stack assembled from one [`GovernanceConfig`].
pub struct Simulation {
    pipeline: Pipeline,
    tripwire: Arc<TripWire>,
    compaction: Arc<ContextCompaction>,
    queue: MutationQueue,
    store: Arc<DirectoryStore>,
    delta: DeltaEncoder,
}

/// Deterministic stand-in for a model summary: the first
/// [`SUMMARY_CHARS`] characters.
fn truncate_summary(text: &str) -> String {
    let kept: String = text.chars().take(SUMMARY_CHARS).collect();
    format!("[Summary] {kept}")
}

impl Simulation {
    pub fn new(config: &GovernanceConfig, store: DirectoryStore) -> GovernResult<Self> {
        config.validate()?;
        let store = Arc::new(store);

        let tripwire = Arc::new(TripWire::new(config.tripwire.clone()));
        let compaction = Arc::new(ContextCompaction::new(
            config.compaction.clone(),
            Arc::new(FnSummarizer::new(|text: String| async move {
                Ok::<_, String>(truncate_summary(&text))
            })),
        ));
        let offload = ResultOffload::new(config.offload.clone(), store.clone());

        let mut pipeline = Pipeline::new();
        pipeline.register(tripwire.clone());
        pipeline.register(Arc::new(offload));
        pipeline.register(compaction.clone());

        Ok(Self {
            pipeline,
            tripwire,
            compaction,
            queue: MutationQueue::new(config.queue.clone()),
            store,
            delta: DeltaEncoder::new(config.delta.clone()),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Encode `event` and hand it to `emit` unless unchanged.
    fn stream(&mut self, event: &RunEvent, emit: &mut impl FnMut(String)) -> GovernResult<()> {
        if let Some(line) = self.delta.encode(event)? {
            emit(line);
        }
        Ok(())
    }

    fn budget_event(&self) -> RunEvent {
        let stats = self.tripwire.stats();
        RunEvent::Budget {
            steps: stats.step_count,
            tool_calls: stats.tool_call_count,
            tokens: stats.total_tokens,
        }
    }

    /// Replay `script`, calling `emit` with each streamed JSON line.
    pub async fn run(
        &mut self,
        script: &Script,
        mut emit: impl FnMut(String),
    ) -> GovernResult<SimulationSummary> {
        let mut ctx = RunContext::new(script.session_id.clone());
        if let Some(name) = &script.agent_name {
            ctx = ctx.with_agent_name(name.clone());
        }
        let mut summary = SimulationSummary::default();

        for (turn, step) in script.turns.iter().enumerate() {
            let tools: Vec<String> = step.tool_calls.iter().map(|c| c.name.clone()).collect();
            let request = BeforeAgent {
                prompt: &step.prompt,
                instructions: None,
                tools: &tools,
            };
            if let AgentAction::Abort(reason) = self.pipeline.before_agent(&mut ctx, &request).await? {
                warn!(turn, %reason, "Simulated run aborted");
                let event = RunEvent::Status {
                    state: "aborted",
                    reason: Some(reason.clone()),
                };
                self.stream(&event, &mut emit)?;
                summary.aborted = Some(reason);
                break;
            }
            let running = RunEvent::Status {
                state: "running",
                reason: None,
            };
            self.stream(&running, &mut emit)?;

            for call in &step.tool_calls {
                let scripted = call.result.clone();
                let invocation = self
                    .pipeline
                    .invoke_tool(&mut ctx, &call.name, call.args.clone(), turn as u32, |_args| {
                        async move { scripted }
                    })
                    .await?;
                let event = match invocation {
                    ToolInvocation::Completed { result } => RunEvent::Tool {
                        turn,
                        name: call.name.clone(),
                        outcome: "completed",
                        result,
                    },
                    ToolInvocation::Skipped { reason, result } => RunEvent::Tool {
                        turn,
                        name: call.name.clone(),
                        outcome: "skipped",
                        result: result.unwrap_or(Value::String(reason)),
                    },
                };
                self.stream(&event, &mut emit)?;
            }

            let text = self
                .pipeline
                .after_agent(&mut ctx, &AfterAgent {
                    text: &step.response,
                })
                .await?;
            self.stream(&RunEvent::Response { turn, text: text.clone() }, &mut emit)?;

            self.queue.enqueue(
                &ctx.session_id,
                format!("turn-{turn:03}"),
                json!({ "response": text, "toolCalls": tools }),
            )?;
            let report = self.queue.flush(self.store.as_ref()).await;
            self.record_flush(&report, &mut summary);
            let flush = RunEvent::Flush {
                succeeded: report.succeeded,
                failed: report.failed,
                pending: self.queue.size(),
            };
            self.stream(&flush, &mut emit)?;

            let budget = self.budget_event();
            self.stream(&budget, &mut emit)?;
            summary.turns_completed += 1;
        }

        if summary.aborted.is_none() {
            let finished = RunEvent::Status {
                state: "finished",
                reason: None,
            };
            self.stream(&finished, &mut emit)?;
        }

        summary.tripwire = self.tripwire.stats();
        summary.compaction = self.compaction.stats();
        summary.events_emitted = self.delta.emitted();
        summary.events_suppressed = self.delta.suppressed();
        summary.metadata = ctx.metadata;
        info!(
            turns = summary.turns_completed,
            aborted = summary.aborted.is_some(),
            flushed = summary.flushed,
            "Simulation finished"
        );
        Ok(summary)
    }

    fn record_flush(&self, report: &FlushReport, summary: &mut SimulationSummary) {
        summary.flushed += report.succeeded;
        summary.flush_failures += report.errors.len();
        for failure in &report.errors {
            warn!(id = failure.entry.id, error = %failure.error, "Mutation dropped");
        }
    }
}
