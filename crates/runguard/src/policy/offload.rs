//! Result offload: move oversized tool results out of the agent's context.
//!
//! A single `read_file` or web fetch can swamp the context window. When a
//! tool result's estimated token count exceeds the threshold, the original
//! payload is handed to an external [`ResultStore`] and the in-context
//! result is replaced by a one-line [`EvictedResultReference`]. The original
//! is then recoverable only through that store.

use super::estimate_tokens;
use crate::error::GovernError;
use crate::ids::generate_reference_id;
use crate::pipeline::{AfterTool, HookFuture, Policy, Priority, RunContext};
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Metadata key listing every reference produced during the run.
pub const REFERENCES_METADATA_KEY: &str = "offload.references";

/// Configuration for [`ResultOffload`].
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OffloadConfig {
    /// Estimated tokens above which a result is offloaded. Default: 50 000.
    pub token_threshold: usize,
    /// Tools whose results are never offloaded. Default: `ls`, `glob`, `grep`.
    pub excluded_tools: BTreeSet<String>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            token_threshold: 50_000,
            excluded_tools: ["ls", "glob", "grep"].into_iter().map(String::from).collect(),
        }
    }
}

impl OffloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token_threshold(mut self, tokens: usize) -> Self {
        self.token_threshold = tokens;
        self
    }

    pub fn exclude_tool(mut self, name: impl Into<String>) -> Self {
        self.excluded_tools.insert(name.into());
        self
    }
}

/// Stand-in for an offloaded tool result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EvictedResultReference {
    pub id: String,
    pub tool_name: String,
    #[serde(rename = "estimatedTokenCount")]
    pub estimated_tokens: usize,
}

impl fmt::Display for EvictedResultReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Offloaded: {} result {} (~{} tokens). Full output is in the result store.]",
            self.tool_name, self.id, self.estimated_tokens
        )
    }
}

// ── Store contract ─────────────────────────────────────────────────

/// Boxed future returned by [`ResultStore::store`].
pub type StoreFuture<'a> = BoxFuture<'a, Result<(), String>>;

/// Out-of-band storage for offloaded payloads, supplied by an
/// object-storage collaborator.
pub trait ResultStore: Send + Sync {
    fn store<'a>(&'a self, id: &'a str, content: &'a str) -> StoreFuture<'a>;
}

/// A [`ResultStore`] backed by an async closure taking `(id, content)`.
pub struct FnStore<F>(F);

impl<F, Fut> FnStore<F>
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> ResultStore for FnStore<F>
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn store<'a>(&'a self, id: &'a str, content: &'a str) -> StoreFuture<'a> {
        Box::pin((self.0)(id.to_string(), content.to_string()))
    }
}

// ── Policy ─────────────────────────────────────────────────────────

/// Strings are measured as-is; everything else by its compact JSON form.
fn serialize_result(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// [`Policy`] that offloads oversized tool results on `after_tool`.
pub struct ResultOffload {
    config: OffloadConfig,
    store: Arc<dyn ResultStore>,
}

impl ResultOffload {
    pub fn new(config: OffloadConfig, store: Arc<dyn ResultStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }
}

impl Policy for ResultOffload {
    fn name(&self) -> &str {
        "result-offload"
    }

    fn priority(&self) -> Priority {
        Priority::LATE
    }

    fn after_tool<'a>(
        &'a self,
        ctx: &'a mut RunContext,
        call: &'a AfterTool<'a>,
    ) -> HookFuture<'a, Option<Value>> {
        Box::pin(async move {
            if self.config.excluded_tools.contains(call.tool_name) {
                return Ok(None);
            }

            let content = serialize_result(call.result);

            let estimated_tokens = estimate_tokens(&content);
            if estimated_tokens <= self.config.token_threshold {
                return Ok(None);
            }

            let reference = EvictedResultReference {
                id: generate_reference_id(),
                tool_name: call.tool_name.to_string(),
                estimated_tokens,
            };
            self.store
                .store(&reference.id, &content)
                .await
                .map_err(|e| GovernError::collaborator("store", e))?;

            info!(
                session = %ctx.session_id,
                tool = call.tool_name,
                id = %reference.id,
                estimated_tokens,
                "Tool result offloaded"
            );
            ctx.push(REFERENCES_METADATA_KEY, serde_json::to_value(&reference)?);
            Ok(Some(Value::String(reference.to_string())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, ToolInvocation};
    use serde_json::json;
    use std::sync::Mutex;

    type Stored = Arc<Mutex<Vec<(String, String)>>>;

    fn recording_store() -> (Arc<dyn ResultStore>, Stored) {
        let stored: Stored = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&stored);
        let store = FnStore::new(move |id: String, content: String| {
            s.lock().unwrap().push((id, content));
            futures::future::ready(Ok(()))
        });
        (Arc::new(store), stored)
    }

    async fn run(policy: &ResultOffload, ctx: &mut RunContext, tool: &str, result: Value) -> Option<Value> {
        let args = json!({});
        let call = AfterTool {
            tool_name: tool,
            args: &args,
            result: &result,
            step_index: 0,
            duration_ms: 3,
        };
        policy.after_tool(ctx, &call).await.unwrap()
    }

    #[tokio::test]
    async fn oversized_result_replaced_with_reference() {
        let (store, stored) = recording_store();
        let policy = ResultOffload::new(OffloadConfig::new().with_token_threshold(10), store);
        let mut ctx = RunContext::new("s1");
        let big = "x".repeat(41); // ceil(41 / 4) = 11 tokens

        let replaced = run(&policy, &mut ctx, "read_file", json!(big)).await.unwrap();
        let text = replaced.as_str().unwrap();
        assert!(text.contains("read_file"));
        assert!(text.contains("~11 tokens"));

        let stored = stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].1, big);
        assert!(text.contains(&stored[0].0));

        let refs = ctx.get(REFERENCES_METADATA_KEY).unwrap();
        assert_eq!(refs[0]["toolName"], "read_file");
        assert_eq!(refs[0]["estimatedTokenCount"], 11);
    }

    #[tokio::test]
    async fn result_at_threshold_is_kept() {
        let (store, stored) = recording_store();
        let policy = ResultOffload::new(OffloadConfig::new().with_token_threshold(10), store);
        let mut ctx = RunContext::new("s1");

        let kept = run(&policy, &mut ctx, "read_file", json!("y".repeat(40))).await;
        assert!(kept.is_none());
        assert!(stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn excluded_tools_never_offloaded() {
        let (store, stored) = recording_store();
        let policy = ResultOffload::new(OffloadConfig::new().with_token_threshold(1), store);
        let mut ctx = RunContext::new("s1");

        for tool in ["ls", "glob", "grep"] {
            assert!(run(&policy, &mut ctx, tool, json!("z".repeat(500))).await.is_none());
        }
        assert!(stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn structured_results_measured_by_json() {
        let (store, stored) = recording_store();
        let policy = ResultOffload::new(OffloadConfig::new().with_token_threshold(5), store);
        let mut ctx = RunContext::new("s1");
        let result = json!({"rows": ["aaaa", "bbbb", "cccc"]});

        assert!(run(&policy, &mut ctx, "query", result.clone()).await.is_some());
        assert_eq!(stored.lock().unwrap()[0].1, result.to_string());
    }

    #[test]
    fn serialize_result_keeps_strings_raw_and_compacts_the_rest() {
        assert_eq!(serialize_result(&json!("plain \"text\"")), "plain \"text\"");
        assert_eq!(serialize_result(&json!({"a": [1, null]})), r#"{"a":[1,null]}"#);
        assert_eq!(serialize_result(&json!(null)), "null");
    }

    #[test]
    fn reference_serializes_with_camel_case_fields() {
        let reference = EvictedResultReference {
            id: "ref-1".into(),
            tool_name: "grep".into(),
            estimated_tokens: 42,
        };
        let value = serde_json::to_value(&reference).unwrap();
        assert_eq!(
            value,
            json!({"id": "ref-1", "toolName": "grep", "estimatedTokenCount": 42})
        );
        let back: EvictedResultReference = serde_json::from_value(value).unwrap();
        assert_eq!(back, reference);
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let store: Arc<dyn ResultStore> = Arc::new(FnStore::new(|_id: String, _content: String| {
            futures::future::ready(Err("bucket missing".to_string()))
        }));
        let policy = ResultOffload::new(OffloadConfig::new().with_token_threshold(1), store);
        let mut ctx = RunContext::new("s1");
        let args = json!({});
        let result = json!("q".repeat(100));
        let call = AfterTool {
            tool_name: "fetch",
            args: &args,
            result: &result,
            step_index: 0,
            duration_ms: 0,
        };

        let err = policy.after_tool(&mut ctx, &call).await.unwrap_err();
        assert!(matches!(err, GovernError::Collaborator { ref name, .. } if name == "store"));
        assert!(ctx.get(REFERENCES_METADATA_KEY).is_none());
    }

    #[tokio::test]
    async fn offload_through_pipeline_invocation() {
        let (store, stored) = recording_store();
        let pipeline = Pipeline::new().with(ResultOffload::new(
            OffloadConfig::new().with_token_threshold(2),
            store,
        ));
        let mut ctx = RunContext::new("s1");

        let invocation = pipeline
            .invoke_tool(&mut ctx, "fetch", json!({"url": "x"}), 0, |_| async {
                json!("a long page body")
            })
            .await
            .unwrap();
        match invocation {
            ToolInvocation::Completed { result } => {
                assert!(result.as_str().unwrap().starts_with("[Offloaded: fetch"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(stored.lock().unwrap().len(), 1);
    }
}
