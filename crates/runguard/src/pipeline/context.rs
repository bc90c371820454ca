//! Per-run context and the payloads handed to each hook.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Mutable per-run record passed by reference to every hook of one run.
///
/// Policies communicate through `metadata` (string keys) without knowing
/// each other's types. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub session_id: String,
    pub agent_name: Option<String>,
    pub metadata: Map<String, Value>,
}

impl RunContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_name: None,
            metadata: Map::new(),
        }
    }

    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Append `value` to the array stored at `key`, creating it if needed.
    /// A non-array value at `key` is replaced.
    pub fn push(&mut self, key: &str, value: Value) {
        match self.metadata.get_mut(key) {
            Some(Value::Array(items)) => items.push(value),
            _ => {
                self.metadata
                    .insert(key.to_string(), Value::Array(vec![value]));
            }
        }
    }
}

// ── Hook payloads ──────────────────────────────────────────────────

/// Payload for `before_agent`: the turn about to be sent to the model.
#[derive(Debug, Clone, Default)]
pub struct BeforeAgent<'a> {
    pub prompt: &'a str,
    pub instructions: Option<&'a str>,
    /// Names of the tools offered this turn.
    pub tools: &'a [String],
}

/// Payload for `before_tool`.
#[derive(Debug, Clone)]
pub struct BeforeTool<'a> {
    pub tool_name: &'a str,
    pub args: &'a Value,
    pub step_index: u32,
}

/// Payload for `after_tool`.
#[derive(Debug, Clone)]
pub struct AfterTool<'a> {
    pub tool_name: &'a str,
    pub args: &'a Value,
    pub result: &'a Value,
    pub step_index: u32,
    pub duration_ms: u64,
}

/// Payload for `after_agent`: the model's visible response text.
#[derive(Debug, Clone)]
pub struct AfterAgent<'a> {
    pub text: &'a str,
}

/// The hook point at which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    BeforeAgent,
    BeforeTool,
    AfterTool,
    AfterAgent,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::BeforeAgent => "beforeAgent",
            Phase::BeforeTool => "beforeTool",
            Phase::AfterTool => "afterTool",
            Phase::AfterAgent => "afterAgent",
        };
        f.write_str(name)
    }
}

/// Payload for `on_error`.
#[derive(Debug, Clone)]
pub struct HookError<'a> {
    pub phase: Phase,
    /// Name of the policy whose hook failed.
    pub policy_name: &'a str,
    pub error: &'a crate::error::GovernError,
}

// ── Hook outcomes ──────────────────────────────────────────────────

/// Returned by `before_agent`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AgentAction {
    #[default]
    Proceed,
    /// Stop the whole run, with a reason for the caller.
    Abort(String),
}

/// Returned by a policy's `before_tool`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ToolAction {
    #[default]
    Proceed,
    /// Run the tool with these arguments instead.
    RewriteArgs(Value),
    /// Do not run the tool. `result`, if given, stands in for its output.
    Skip {
        reason: String,
        result: Option<Value>,
    },
}

/// The pipeline's aggregate verdict for a tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDecision {
    /// Execute the tool with these (possibly rewritten) arguments.
    Run { args: Value },
    /// Skip the call; the run itself continues.
    Skip {
        reason: String,
        result: Option<Value>,
    },
}

impl ToolDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, ToolDecision::Skip { .. })
    }
}
