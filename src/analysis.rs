//! Analysis Contract
//!
//! The analysis model reads the recent group transcript (and the transcripts
//! of any active threads) and decides whether the bot should speak up, and
//! where.

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Matches a fenced ```json block
static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex")
});

/// Structured decision returned by the analysis model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Decision {
    pub should_join: bool,
    pub create_new: Option<bool>,
    pub reply_in_thread_id: Option<String>,
    pub preference_key: Option<String>,
    pub topic: Option<String>,
    pub search_queries: Option<Vec<String>>,
    /// Explicit trigger message ids to copy into the thread
    pub message_ids: Option<Vec<i64>>,
    pub thread_should_end_id: Option<String>,
}

impl Decision {
    /// A decision to stay silent
    pub fn skip() -> Self {
        Self::default()
    }

    /// Join by starting a new thread under `preference_key`
    pub fn create(preference_key: &str) -> Self {
        Self {
            should_join: true,
            create_new: Some(true),
            preference_key: Some(preference_key.to_string()),
            ..Self::default()
        }
    }

    /// Join an existing thread
    pub fn reply_in(thread_id: &str) -> Self {
        Self {
            should_join: true,
            reply_in_thread_id: Some(thread_id.to_string()),
            ..Self::default()
        }
    }

    pub fn wants_new_thread(&self) -> bool {
        self.create_new.unwrap_or(false)
    }

    pub fn search_queries(&self) -> &[String] {
        self.search_queries.as_deref().unwrap_or(&[])
    }
}

/// Per-run context passed to the analysis model
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub group_id: i64,
    pub trigger_user_id: Option<i64>,
    /// Set when the trigger is group silence rather than a new message
    pub idle_mode: bool,
    /// Preference keys the decision may use
    pub allowed_preferences: Vec<String>,
}

/// Transcript of one active thread, as shown to the analysis model
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub thread_id: String,
    pub preference_key: String,
    pub is_current: bool,
    pub transcript: String,
}

/// Decides whether and where the bot should join a conversation
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Decide from the group transcript alone (no active threads)
    async fn analyze(
        &self,
        preference_text: &str,
        transcript: &str,
        options: &AnalyzeOptions,
    ) -> Result<Decision>;

    /// Decide with the transcripts of the group's active threads
    async fn analyze_with_threads(
        &self,
        preference_text: &str,
        transcript: &str,
        threads: &[ThreadContext],
        options: &AnalyzeOptions,
    ) -> Result<Decision>;
}

/// Parse a decision from raw model output.
///
/// Accepts bare JSON, a fenced ```json block, or JSON embedded in prose.
pub fn parse_decision(raw: &str) -> Result<Decision> {
    let trimmed = raw.trim();
    if let Ok(decision) = serde_json::from_str::<Decision>(trimmed) {
        return Ok(decision);
    }

    if let Some(caps) = FENCED_JSON.captures(trimmed) {
        if let Some(body) = caps.get(1) {
            return serde_json::from_str(body.as_str()).context("invalid JSON in fenced block");
        }
    }

    let start = trimmed
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("no JSON object in analysis output"))?;
    let end = trimmed
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| anyhow::anyhow!("unterminated JSON object in analysis output"))?;
    serde_json::from_str(&trimmed[start..=end]).context("invalid decision JSON")
}

/// Render thread contexts for an analysis prompt
pub fn format_thread_contexts(threads: &[ThreadContext]) -> String {
    threads
        .iter()
        .map(|t| {
            let marker = if t.is_current { " (current)" } else { "" };
            format!(
                "<thread id=\"{}\" preference=\"{}\"{}>\n{}\n</thread>",
                t.thread_id, t.preference_key, marker, t.transcript
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
