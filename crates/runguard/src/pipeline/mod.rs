//! Interception pipeline: ordered policies fired at fixed points of a run.
//!
//! A full turn fires hooks in this order:
//!
//! 1. `before_agent`: may abort the whole run.
//! 2. `before_tool`: per tool call; may skip the call or rewrite its args.
//! 3. `after_tool`: may replace the tool result.
//! 4. `after_agent`: may replace the visible response text.
//! 5. `on_error`: fired on every policy when another policy's hook fails.
//!
//! Policies implement only the hooks they need (every [`Policy`] method has a
//! no-op default) and fire in [`Priority`] order, ties in registration order.
//! An abort or skip short-circuits the remaining policies for that hook only;
//! the policy stays registered. Replacements chain: each policy sees the
//! output of the ones before it.
//!
//! The execution engine driving the run must call each hook at the point
//! above, honour abort/skip, and pass rewritten args and results through.
//! [`Pipeline::invoke_tool`] does the tool half of that for you.

pub mod context;

pub use context::{
    AfterAgent, AfterTool, AgentAction, BeforeAgent, BeforeTool, HookError, Phase, RunContext,
    ToolAction, ToolDecision,
};

use crate::error::{GovernError, GovernResult};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Boxed future returned by the async [`Policy`] hooks.
pub type HookFuture<'a, T> = BoxFuture<'a, GovernResult<T>>;

/// Dispatch order of a policy. Lower fires first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    pub const EARLY: Priority = Priority(-100);
    pub const NORMAL: Priority = Priority(0);
    pub const LATE: Priority = Priority(100);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

// ── Policy trait ───────────────────────────────────────────────────

/// A governance policy hooked into an agent run.
///
/// Every hook defaults to a no-op. Policies keep their own state behind
/// interior mutability since hooks take `&self`.
///
/// # Example
///
/// ```ignore
/// struct NoShell;
///
/// impl Policy for NoShell {
///     fn name(&self) -> &str {
///         "no-shell"
///     }
///
///     fn before_tool<'a>(
///         &'a self,
///         _ctx: &'a mut RunContext,
///         call: &'a BeforeTool<'a>,
///     ) -> HookFuture<'a, ToolAction> {
///         let action = if call.tool_name == "shell" {
///             ToolAction::Skip { reason: "shell disabled".into(), result: None }
///         } else {
///             ToolAction::Proceed
///         };
///         Box::pin(async move { Ok(action) })
///     }
/// }
/// ```
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    /// Default priority used by [`Pipeline::register`].
    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    fn before_agent<'a>(
        &'a self,
        _ctx: &'a mut RunContext,
        _turn: &'a BeforeAgent<'a>,
    ) -> HookFuture<'a, AgentAction> {
        Box::pin(futures::future::ready(Ok(AgentAction::Proceed)))
    }

    fn before_tool<'a>(
        &'a self,
        _ctx: &'a mut RunContext,
        _call: &'a BeforeTool<'a>,
    ) -> HookFuture<'a, ToolAction> {
        Box::pin(futures::future::ready(Ok(ToolAction::Proceed)))
    }

    /// Return `Some(result)` to replace the tool result.
    fn after_tool<'a>(
        &'a self,
        _ctx: &'a mut RunContext,
        _call: &'a AfterTool<'a>,
    ) -> HookFuture<'a, Option<Value>> {
        Box::pin(futures::future::ready(Ok(None)))
    }

    /// Return `Some(text)` to replace the visible response text.
    fn after_agent<'a>(
        &'a self,
        _ctx: &'a mut RunContext,
        _response: &'a AfterAgent<'a>,
    ) -> HookFuture<'a, Option<String>> {
        Box::pin(futures::future::ready(Ok(None)))
    }

    fn on_error(&self, _ctx: &mut RunContext, _error: &HookError<'_>) {}
}

// ── Pipeline ───────────────────────────────────────────────────────

struct Registered {
    policy: Arc<dyn Policy>,
    priority: Priority,
}

/// Outcome of [`Pipeline::invoke_tool`].
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    /// The tool ran; `result` is after every `after_tool` replacement.
    Completed { result: Value },
    /// A policy skipped the call.
    Skipped {
        reason: String,
        result: Option<Value>,
    },
}

/// Ordered list of policies dispatched at each hook point.
#[derive(Default)]
pub struct Pipeline {
    policies: Vec<Registered>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a policy at its own priority (builder pattern).
    pub fn with(mut self, policy: impl Policy + 'static) -> Self {
        self.register(Arc::new(policy));
        self
    }

    /// Add a shared policy at its own priority.
    ///
    /// Keep a clone of the `Arc` to read the policy's state (e.g.
    /// trip-wire stats) after the run.
    pub fn register(&mut self, policy: Arc<dyn Policy>) {
        let priority = policy.priority();
        self.register_at(policy, priority);
    }

    /// Add a shared policy at an explicit priority.
    pub fn register_at(&mut self, policy: Arc<dyn Policy>, priority: Priority) {
        debug!(policy = policy.name(), priority = priority.0, "Policy registered");
        self.policies.push(Registered { policy, priority });
        // Stable: equal priorities keep registration order.
        self.policies.sort_by_key(|r| r.priority);
    }

    /// Policy names in dispatch order.
    pub fn policy_names(&self) -> Vec<&str> {
        self.policies.iter().map(|r| r.policy.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Notify every policy of a failed hook, then hand the error back.
    fn fail(
        &self,
        ctx: &mut RunContext,
        phase: Phase,
        policy_name: &str,
        error: GovernError,
    ) -> GovernError {
        warn!(%phase, policy = policy_name, %error, "Policy hook failed");
        let hook_error = HookError {
            phase,
            policy_name,
            error: &error,
        };
        for reg in &self.policies {
            reg.policy.on_error(ctx, &hook_error);
        }
        error
    }

    pub async fn before_agent(
        &self,
        ctx: &mut RunContext,
        turn: &BeforeAgent<'_>,
    ) -> GovernResult<AgentAction> {
        for reg in &self.policies {
            let action = match reg.policy.before_agent(ctx, turn).await {
                Ok(action) => action,
                Err(e) => return Err(self.fail(ctx, Phase::BeforeAgent, reg.policy.name(), e)),
            };
            if let AgentAction::Abort(reason) = action {
                info!(policy = reg.policy.name(), %reason, "Run aborted by policy");
                return Ok(AgentAction::Abort(reason));
            }
        }
        Ok(AgentAction::Proceed)
    }

    pub async fn before_tool(
        &self,
        ctx: &mut RunContext,
        call: &BeforeTool<'_>,
    ) -> GovernResult<ToolDecision> {
        let mut args = call.args.clone();
        for reg in &self.policies {
            let view = BeforeTool {
                tool_name: call.tool_name,
                args: &args,
                step_index: call.step_index,
            };
            let action = match reg.policy.before_tool(ctx, &view).await {
                Ok(action) => action,
                Err(e) => return Err(self.fail(ctx, Phase::BeforeTool, reg.policy.name(), e)),
            };
            match action {
                ToolAction::Proceed => {}
                ToolAction::RewriteArgs(rewritten) => {
                    debug!(policy = reg.policy.name(), tool = call.tool_name, "Tool args rewritten");
                    args = rewritten;
                }
                ToolAction::Skip { reason, result } => {
                    info!(
                        policy = reg.policy.name(),
                        tool = call.tool_name,
                        %reason,
                        "Tool call skipped by policy"
                    );
                    return Ok(ToolDecision::Skip { reason, result });
                }
            }
        }
        Ok(ToolDecision::Run { args })
    }

    /// Returns the final tool result after all replacements.
    pub async fn after_tool(&self, ctx: &mut RunContext, call: &AfterTool<'_>) -> GovernResult<Value> {
        let mut result = call.result.clone();
        for reg in &self.policies {
            let view = AfterTool {
                tool_name: call.tool_name,
                args: call.args,
                result: &result,
                step_index: call.step_index,
                duration_ms: call.duration_ms,
            };
            let replacement = match reg.policy.after_tool(ctx, &view).await {
                Ok(replacement) => replacement,
                Err(e) => return Err(self.fail(ctx, Phase::AfterTool, reg.policy.name(), e)),
            };
            if let Some(replaced) = replacement {
                result = replaced;
            }
        }
        Ok(result)
    }

    /// Returns the final visible text after all replacements.
    pub async fn after_agent(
        &self,
        ctx: &mut RunContext,
        response: &AfterAgent<'_>,
    ) -> GovernResult<String> {
        let mut text = response.text.to_string();
        for reg in &self.policies {
            let view = AfterAgent { text: &text };
            let replacement = match reg.policy.after_agent(ctx, &view).await {
                Ok(replacement) => replacement,
                Err(e) => return Err(self.fail(ctx, Phase::AfterAgent, reg.policy.name(), e)),
            };
            if let Some(replaced) = replacement {
                text = replaced;
            }
        }
        Ok(text)
    }

    /// Run one tool call through `before_tool`, `execute`, and `after_tool`.
    ///
    /// `execute` receives the possibly rewritten arguments and is not called
    /// when a policy skips the call.
    pub async fn invoke_tool<F, Fut>(
        &self,
        ctx: &mut RunContext,
        tool_name: &str,
        args: Value,
        step_index: u32,
        execute: F,
    ) -> GovernResult<ToolInvocation>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Value>,
    {
        let call = BeforeTool {
            tool_name,
            args: &args,
            step_index,
        };
        let args = match self.before_tool(ctx, &call).await? {
            ToolDecision::Run { args } => args,
            ToolDecision::Skip { reason, result } => {
                return Ok(ToolInvocation::Skipped { reason, result });
            }
        };

        let started = Instant::now();
        let raw = execute(args.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = self
            .after_tool(
                ctx,
                &AfterTool {
                    tool_name,
                    args: &args,
                    result: &raw,
                    step_index,
                    duration_ms,
                },
            )
            .await?;
        Ok(ToolInvocation::Completed { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every hook it sees into a shared log.
    struct Recorder {
        name: String,
        priority: Priority,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &str, priority: Priority, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.into(),
                priority,
                log: Arc::clone(log),
            }
        }

        fn record(&self, hook: &str) {
            self.log.lock().unwrap().push(format!("{}:{hook}", self.name));
        }
    }

    impl Policy for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> Priority {
            self.priority
        }

        fn before_agent<'a>(
            &'a self,
            _ctx: &'a mut RunContext,
            _turn: &'a BeforeAgent<'a>,
        ) -> HookFuture<'a, AgentAction> {
            self.record("before_agent");
            Box::pin(async { Ok(AgentAction::Proceed) })
        }

        fn on_error(&self, _ctx: &mut RunContext, error: &HookError<'_>) {
            self.record(&format!("on_error({}@{})", error.policy_name, error.phase));
        }
    }

    struct Aborter;

    impl Policy for Aborter {
        fn name(&self) -> &str {
            "aborter"
        }

        fn before_agent<'a>(
            &'a self,
            _ctx: &'a mut RunContext,
            _turn: &'a BeforeAgent<'a>,
        ) -> HookFuture<'a, AgentAction> {
            Box::pin(async { Ok(AgentAction::Abort("stop".into())) })
        }
    }

    /// Rewrites args, marks metadata, and wraps results.
    struct Rewriter;

    impl Policy for Rewriter {
        fn name(&self) -> &str {
            "rewriter"
        }

        fn before_tool<'a>(
            &'a self,
            ctx: &'a mut RunContext,
            call: &'a BeforeTool<'a>,
        ) -> HookFuture<'a, ToolAction> {
            ctx.set("rewriter.seen", json!(call.tool_name));
            let mut args = call.args.clone();
            args["limit"] = json!(10);
            Box::pin(async move { Ok(ToolAction::RewriteArgs(args)) })
        }

        fn after_tool<'a>(
            &'a self,
            _ctx: &'a mut RunContext,
            call: &'a AfterTool<'a>,
        ) -> HookFuture<'a, Option<Value>> {
            let wrapped = json!({ "wrapped": call.result });
            Box::pin(async move { Ok(Some(wrapped)) })
        }

        fn after_agent<'a>(
            &'a self,
            _ctx: &'a mut RunContext,
            response: &'a AfterAgent<'a>,
        ) -> HookFuture<'a, Option<String>> {
            let text = response.text.to_uppercase();
            Box::pin(async move { Ok(Some(text)) })
        }
    }

    struct Skipper;

    impl Policy for Skipper {
        fn name(&self) -> &str {
            "skipper"
        }

        fn before_tool<'a>(
            &'a self,
            ctx: &'a mut RunContext,
            call: &'a BeforeTool<'a>,
        ) -> HookFuture<'a, ToolAction> {
            // Reads what an earlier policy left behind.
            let seen = ctx.get("rewriter.seen").cloned();
            let action = if call.tool_name == "shell" {
                ToolAction::Skip {
                    reason: format!("blocked after {seen:?}"),
                    result: Some(json!("shell disabled")),
                }
            } else {
                ToolAction::Proceed
            };
            Box::pin(async move { Ok(action) })
        }
    }

    struct Failing;

    impl Policy for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn after_agent<'a>(
            &'a self,
            _ctx: &'a mut RunContext,
            _response: &'a AfterAgent<'a>,
        ) -> HookFuture<'a, Option<String>> {
            Box::pin(async { Err(GovernError::collaborator("summarize", "timeout")) })
        }
    }

    fn turn() -> BeforeAgent<'static> {
        BeforeAgent {
            prompt: "do the thing",
            instructions: None,
            tools: &[],
        }
    }

    #[tokio::test]
    async fn policies_fire_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .with(Recorder::new("late", Priority::LATE, &log))
            .with(Recorder::new("normal-a", Priority::NORMAL, &log))
            .with(Recorder::new("early", Priority::EARLY, &log))
            .with(Recorder::new("normal-b", Priority::NORMAL, &log));

        assert_eq!(
            pipeline.policy_names(),
            vec!["early", "normal-a", "normal-b", "late"]
        );

        let mut ctx = RunContext::new("s1");
        let action = pipeline.before_agent(&mut ctx, &turn()).await.unwrap();
        assert_eq!(action, AgentAction::Proceed);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "early:before_agent",
                "normal-a:before_agent",
                "normal-b:before_agent",
                "late:before_agent"
            ]
        );
    }

    #[tokio::test]
    async fn abort_short_circuits_only_that_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new().with(Recorder::new("after", Priority::LATE, &log));
        pipeline.register_at(Arc::new(Aborter), Priority::EARLY);

        let mut ctx = RunContext::new("s1");
        let action = pipeline.before_agent(&mut ctx, &turn()).await.unwrap();
        assert_eq!(action, AgentAction::Abort("stop".into()));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(pipeline.len(), 2);
    }

    #[tokio::test]
    async fn partial_policies_are_tolerated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new().with(Recorder::new("only-agent", Priority::NORMAL, &log));

        let mut ctx = RunContext::new("s1");
        let args = json!({"path": "."});
        let decision = pipeline
            .before_tool(
                &mut ctx,
                &BeforeTool {
                    tool_name: "ls",
                    args: &args,
                    step_index: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(decision, ToolDecision::Run { args: args.clone() });

        let text = pipeline
            .after_agent(&mut ctx, &AfterAgent { text: "done" })
            .await
            .unwrap();
        assert_eq!(text, "done");
    }

    #[tokio::test]
    async fn rewrites_chain_and_skip_sees_metadata() {
        let pipeline = Pipeline::new().with(Rewriter).with(Skipper);
        let mut ctx = RunContext::new("s1");

        let invocation = pipeline
            .invoke_tool(&mut ctx, "grep", json!({"q": "x"}), 1, |args| async move {
                assert_eq!(args["limit"], json!(10));
                json!("matches")
            })
            .await
            .unwrap();
        assert_eq!(
            invocation,
            ToolInvocation::Completed {
                result: json!({"wrapped": "matches"})
            }
        );

        let mut ran = false;
        let invocation = pipeline
            .invoke_tool(&mut ctx, "shell", json!({}), 2, |_| {
                ran = true;
                async { json!("should not run") }
            })
            .await
            .unwrap();
        assert!(!ran);
        match invocation {
            ToolInvocation::Skipped { reason, result } => {
                assert!(reason.contains("shell"));
                assert_eq!(result, Some(json!("shell disabled")));
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn after_agent_replacement_chains() {
        let pipeline = Pipeline::new().with(Rewriter);
        let mut ctx = RunContext::new("s1");
        let text = pipeline
            .after_agent(&mut ctx, &AfterAgent { text: "quiet" })
            .await
            .unwrap();
        assert_eq!(text, "QUIET");
    }

    #[tokio::test]
    async fn failing_hook_notifies_all_policies_then_propagates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .with(Recorder::new("observer", Priority::EARLY, &log))
            .with(Failing);

        let mut ctx = RunContext::new("s1");
        let err = pipeline
            .after_agent(&mut ctx, &AfterAgent { text: "x" })
            .await
            .unwrap_err();
        assert!(matches!(err, GovernError::Collaborator { .. }));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["observer:on_error(failing@afterAgent)"]
        );
    }
}
