//! Context compaction: summarize once the running token estimate crosses a
//! fraction of the context window.
//!
//! Totals accumulate for the life of the [`ContextCompaction`] instance, not
//! per run. When a response pushes the estimate past
//! `threshold_fraction * max_tokens`, the response is passed to the external
//! [`Summarizer`], the optional persistence callback is invoked, the visible
//! text is replaced by the summary, and the totals restart from the
//! summary's own estimated size rather than from zero.

use super::estimate_tokens;
use crate::error::GovernError;
use crate::pipeline::{AfterAgent, HookFuture, Policy, Priority, RunContext};
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Metadata key counting compactions performed during the run.
pub const COUNT_METADATA_KEY: &str = "compaction.count";

/// Configuration for [`ContextCompaction`].
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CompactionConfig {
    /// Fraction of the window at which compaction triggers. Default: 0.7.
    pub threshold_fraction: f64,
    /// Context window size in tokens. Default: 128 000.
    pub max_tokens: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold_fraction: 0.7,
            max_tokens: 128_000,
        }
    }
}

impl CompactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold_fraction(mut self, fraction: f64) -> Self {
        self.threshold_fraction = fraction;
        self
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = tokens;
        self
    }

    /// Token estimate above which compaction triggers.
    pub fn threshold_tokens(&self) -> f64 {
        self.threshold_fraction * self.max_tokens as f64
    }
}

// ── Collaborator contracts ─────────────────────────────────────────

/// Boxed future returned by [`Summarizer::summarize`].
pub type SummaryFuture<'a> = BoxFuture<'a, Result<String, String>>;

/// Compresses text. Supplied by the memory/storage collaborator.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(&'a self, text: &'a str) -> SummaryFuture<'a>;
}

/// A [`Summarizer`] backed by an async closure.
pub struct FnSummarizer<F>(F);

impl<F, Fut> FnSummarizer<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> Summarizer for FnSummarizer<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    fn summarize<'a>(&'a self, text: &'a str) -> SummaryFuture<'a> {
        Box::pin((self.0)(text.to_string()))
    }
}

/// Context handed to the persistence callback with each summary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryMetadata {
    pub session_id: String,
    /// Responses accumulated since the previous compaction.
    pub message_count: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

type PersistCallback =
    Box<dyn Fn(&str, &SummaryMetadata) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Running totals of a [`ContextCompaction`].
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompactionStats {
    pub message_count: usize,
    pub total_estimated_tokens: usize,
    /// Compactions performed by this instance.
    pub compactions: usize,
}

// ── Policy ─────────────────────────────────────────────────────────

/// [`Policy`] that compacts the response on `after_agent` once the running
/// token estimate crosses the threshold.
pub struct ContextCompaction {
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
    on_summarize: Option<PersistCallback>,
    stats: Mutex<CompactionStats>,
}

impl ContextCompaction {
    pub fn new(config: CompactionConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            summarizer,
            on_summarize: None,
            stats: Mutex::new(CompactionStats::default()),
        }
    }

    /// Persist each summary, e.g. into long-term memory. Failures propagate
    /// out of `after_agent`.
    pub fn on_summarize<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(String, SummaryMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.on_summarize = Some(Box::new(
            move |summary: &str, metadata: &SummaryMetadata| -> BoxFuture<'static, Result<(), String>> {
                Box::pin(callback(summary.to_string(), metadata.clone()))
            },
        ));
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CompactionStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> CompactionStats {
        self.lock().clone()
    }

    pub fn reset(&self) {
        *self.lock() = CompactionStats::default();
    }

    /// Count a response; returns `(message_count, total)` when it crosses
    /// the threshold.
    fn accumulate(&self, text: &str) -> Option<(usize, usize)> {
        let mut stats = self.lock();
        stats.message_count += 1;
        stats.total_estimated_tokens += estimate_tokens(text);
        debug!(
            messages = stats.message_count,
            tokens = stats.total_estimated_tokens,
            "Compaction totals updated"
        );
        (stats.total_estimated_tokens as f64 > self.config.threshold_tokens())
            .then_some((stats.message_count, stats.total_estimated_tokens))
    }
}

impl Policy for ContextCompaction {
    fn name(&self) -> &str {
        "context-compaction"
    }

    fn priority(&self) -> Priority {
        Priority::LATE
    }

    fn after_agent<'a>(
        &'a self,
        ctx: &'a mut RunContext,
        response: &'a AfterAgent<'a>,
    ) -> HookFuture<'a, Option<String>> {
        Box::pin(async move {
            let Some((message_count, tokens_before)) = self.accumulate(response.text) else {
                return Ok(None);
            };

            let summary = self
                .summarizer
                .summarize(response.text)
                .await
                .map_err(|e| GovernError::collaborator("summarize", e))?;
            let tokens_after = estimate_tokens(&summary);

            if let Some(persist) = &self.on_summarize {
                let metadata = SummaryMetadata {
                    session_id: ctx.session_id.clone(),
                    message_count,
                    tokens_before,
                    tokens_after,
                };
                persist(&summary, &metadata)
                    .await
                    .map_err(|e| GovernError::collaborator("on_summarize", e))?;
            }

            {
                let mut stats = self.lock();
                stats.message_count = 1;
                stats.total_estimated_tokens = tokens_after;
                stats.compactions += 1;
            }

            let count = ctx
                .get(COUNT_METADATA_KEY)
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            ctx.set(COUNT_METADATA_KEY, serde_json::json!(count + 1));

            info!(
                session = %ctx.session_id,
                tokens_before,
                tokens_after,
                "Context compacted"
            );
            Ok(Some(summary))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_summarizer(summary: &'static str) -> (Arc<dyn Summarizer>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let summarizer = FnSummarizer::new(move |_text: String| {
            c.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(summary.to_string()))
        });
        (Arc::new(summarizer), calls)
    }

    /// Threshold = 0.5 * 100 = 50 tokens.
    fn small_window() -> CompactionConfig {
        CompactionConfig::new()
            .with_threshold_fraction(0.5)
            .with_max_tokens(100)
    }

    async fn respond(policy: &ContextCompaction, ctx: &mut RunContext, text: &str) -> Option<String> {
        policy
            .after_agent(ctx, &AfterAgent { text })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn below_threshold_only_accumulates() {
        let (summarizer, calls) = counting_summarizer("s");
        let policy = ContextCompaction::new(small_window(), summarizer);
        let mut ctx = RunContext::new("s1");

        assert!(respond(&policy, &mut ctx, &"a".repeat(80)).await.is_none());
        assert!(respond(&policy, &mut ctx, &"b".repeat(117)).await.is_none());
        let stats = policy.stats();
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.total_estimated_tokens, 20 + 30);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn crossing_threshold_summarizes_once_and_rebases() {
        let (summarizer, calls) = counting_summarizer("compact summary!");
        let policy = ContextCompaction::new(small_window(), summarizer);
        let mut ctx = RunContext::new("s1");

        respond(&policy, &mut ctx, &"a".repeat(160)).await; // 40 tokens
        let replaced = respond(&policy, &mut ctx, &"b".repeat(44)).await; // +11 = 51
        assert_eq!(replaced.as_deref(), Some("compact summary!"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = policy.stats();
        assert_eq!(stats.total_estimated_tokens, 4, "rebased on the summary size");
        assert_eq!(stats.message_count, 1);
        assert_eq!(stats.compactions, 1);
        assert_eq!(ctx.get(COUNT_METADATA_KEY), Some(&serde_json::json!(1)));

        assert!(respond(&policy, &mut ctx, "short").await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(policy.stats().total_estimated_tokens, 4 + 2);
    }

    #[tokio::test]
    async fn persistence_callback_receives_metadata() {
        let (summarizer, _calls) = counting_summarizer("sum");
        let persisted = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&persisted);
        let policy = ContextCompaction::new(small_window(), summarizer).on_summarize(
            move |summary: String, metadata: SummaryMetadata| {
                p.lock().unwrap().push((summary, metadata));
                futures::future::ready(Ok(()))
            },
        );
        let mut ctx = RunContext::new("session-7");

        respond(&policy, &mut ctx, &"x".repeat(204)).await;

        let persisted = persisted.lock().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].0, "sum");
        assert_eq!(
            persisted[0].1,
            SummaryMetadata {
                session_id: "session-7".into(),
                message_count: 1,
                tokens_before: 51,
                tokens_after: 1,
            }
        );
    }

    #[tokio::test]
    async fn summarizer_failure_propagates_without_rebasing() {
        let summarizer: Arc<dyn Summarizer> = Arc::new(FnSummarizer::new(|_text: String| {
            futures::future::ready(Err("model overloaded".to_string()))
        }));
        let policy = ContextCompaction::new(small_window(), summarizer);
        let mut ctx = RunContext::new("s1");

        let err = policy
            .after_agent(&mut ctx, &AfterAgent { text: &"y".repeat(400) })
            .await
            .unwrap_err();
        assert!(matches!(err, GovernError::Collaborator { ref name, .. } if name == "summarize"));
        assert_eq!(policy.stats().total_estimated_tokens, 100);
        assert_eq!(policy.stats().compactions, 0);
    }

    #[tokio::test]
    async fn totals_survive_across_runs_until_reset() {
        let (summarizer, _calls) = counting_summarizer("s");
        let policy = Arc::new(ContextCompaction::new(small_window(), summarizer));
        let mut pipeline = Pipeline::new();
        pipeline.register(policy.clone());

        let mut first = RunContext::new("run-1");
        pipeline
            .after_agent(&mut first, &AfterAgent { text: &"a".repeat(40) })
            .await
            .unwrap();
        let mut second = RunContext::new("run-2");
        pipeline
            .after_agent(&mut second, &AfterAgent { text: &"a".repeat(40) })
            .await
            .unwrap();
        assert_eq!(policy.stats().total_estimated_tokens, 20);

        policy.reset();
        assert_eq!(policy.stats(), CompactionStats::default());
    }
}
