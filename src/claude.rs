//! Claude API Client
//!
//! Anthropic Messages API client backing every model call the scheduler
//! makes: the join analysis, reply generation, segment summaries and topic
//! pruning. Static instructions go into a cached system block.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::analysis::{format_thread_contexts, parse_decision, AnalysisClient, AnalyzeOptions, Decision, ThreadContext};
use crate::collaborators::{ReplyGenerator, Summarizer, TopicFilter};
use crate::context::InjectContext;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const ANALYSIS_INSTRUCTIONS: &str = "You watch a group chat on behalf of a bot. \
Decide whether the bot should join the conversation now. Answer with a single JSON object: \
{\"shouldJoin\": bool, \"createNew\": bool, \"replyInThreadId\": string|null, \
\"preferenceKey\": string|null, \"topic\": string|null, \"searchQueries\": [string], \
\"messageIds\": [number]|null, \"threadShouldEndId\": string|null}. \
Only join when the bot has something genuinely useful to add. \
Use only the preference keys listed as allowed.";

const REPLY_INSTRUCTIONS: &str = "You are a member of a group chat. \
Reply in character with one short, natural message. Do not narrate or explain.";

const SUMMARY_INSTRUCTIONS: &str = "Summarize the following chat excerpt in a few sentences. \
Keep names, decisions and open questions. Output only the summary.";

const TOPIC_INSTRUCTIONS: &str = "Each line of the conversation below starts with [index]. \
Return a JSON array with the indices of the lines that are still relevant to the persona's topic. \
Output only the array.";

/// Claude API client
#[derive(Clone)]
pub struct ClaudeClient {
    client: Client,
    api_key: Option<String>,
    /// Model hint for analysis, summaries and topic pruning
    utility_model: String,
}

/// System message block with optional cache control
#[derive(Debug, Serialize)]
struct SystemBlock {
    r#type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    r#type: String,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: usize,
    system: Vec<SystemBlock>,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
    #[serde(default)]
    cache_read_input_tokens: usize,
}

/// Completion result with usage stats
#[derive(Debug, Clone)]
pub struct CompleteResult {
    pub content: String,
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cache_read_tokens: usize,
}

impl ClaudeClient {
    pub fn new(api_key: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.map(|s| s.to_string()),
            utility_model: "haiku".to_string(),
        }
    }

    /// Create from config
    pub fn from_config(config: &crate::config::ProactiveConfig) -> Self {
        Self::new(config.anthropic_api_key.as_deref())
    }

    pub fn with_utility_model(mut self, model: &str) -> Self {
        self.utility_model = model.to_string();
        self
    }

    /// Check if API key is configured
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Get model ID from hint
    fn model_id(model: &str) -> &'static str {
        match model.to_lowercase().as_str() {
            "haiku" => "claude-3-5-haiku-20241022",
            "opus" => "claude-3-opus-20240229",
            _ => "claude-sonnet-4-20250514",
        }
    }

    /// Single-turn completion with a cached system block
    pub async fn complete(
        &self,
        prompt: &str,
        instructions: &str,
        max_tokens: usize,
        model: &str,
    ) -> Result<CompleteResult> {
        let model_id = Self::model_id(model);

        let request = MessageRequest {
            model: model_id.to_string(),
            max_tokens,
            system: vec![SystemBlock {
                r#type: "text".to_string(),
                text: instructions.to_string(),
                cache_control: Some(CacheControl {
                    r#type: "ephemeral".to_string(),
                }),
            }],
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        debug!("Calling Claude API: model={}, prompt_len={}", model_id, prompt.len());

        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            anyhow::bail!("Claude API error {}: {}", status, text);
        }

        let result: MessageResponse = response.json().await?;

        let content = result
            .content
            .into_iter()
            .filter_map(|b| if b.r#type == "text" { b.text } else { None })
            .collect::<Vec<_>>()
            .join("\n");

        info!(
            "Claude response: model={}, in={}, out={}, cache_read={}",
            model_id,
            result.usage.input_tokens,
            result.usage.output_tokens,
            result.usage.cache_read_input_tokens
        );

        Ok(CompleteResult {
            content,
            model: model_id.to_string(),
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
            cache_read_tokens: result.usage.cache_read_input_tokens,
        })
    }

    async fn decide(&self, prompt: String) -> Result<Decision> {
        let result = self
            .complete(&prompt, ANALYSIS_INSTRUCTIONS, 1024, &self.utility_model)
            .await?;
        parse_decision(&result.content)
    }
}

/// Prompt for the join analysis
pub fn analysis_prompt(
    preference_text: &str,
    transcript: &str,
    threads: &[ThreadContext],
    options: &AnalyzeOptions,
) -> String {
    let mut prompt = format!(
        "[Allowed preference keys]\n{}\n\n[Personas]\n{}\n\n[Recent group messages]\n{}",
        options.allowed_preferences.join(", "),
        preference_text,
        transcript
    );

    if !threads.is_empty() {
        prompt.push_str("\n\n[Active threads]\n");
        prompt.push_str(&format_thread_contexts(threads));
    }

    if let Some(user_id) = options.trigger_user_id {
        prompt.push_str(&format!("\n\nLatest trigger came from user {}.", user_id));
    }
    if options.idle_mode {
        prompt.push_str("\n\nThe group has gone quiet. Only join if a new topic is worth starting.");
    }
    prompt
}

/// Extract the index list from a topic-filter answer
pub fn parse_indices(raw: &str) -> Result<Vec<usize>> {
    let start = raw.find('[').context("no JSON array in topic filter output")?;
    let end = raw.rfind(']').context("unterminated JSON array")?;
    if end < start {
        anyhow::bail!("malformed JSON array");
    }
    serde_json::from_str(&raw[start..=end]).context("invalid index array")
}

#[async_trait]
impl AnalysisClient for ClaudeClient {
    async fn analyze(
        &self,
        preference_text: &str,
        transcript: &str,
        options: &AnalyzeOptions,
    ) -> Result<Decision> {
        self.decide(analysis_prompt(preference_text, transcript, &[], options))
            .await
    }

    async fn analyze_with_threads(
        &self,
        preference_text: &str,
        transcript: &str,
        threads: &[ThreadContext],
        options: &AnalyzeOptions,
    ) -> Result<Decision> {
        self.decide(analysis_prompt(preference_text, transcript, threads, options))
            .await
    }
}

#[async_trait]
impl ReplyGenerator for ClaudeClient {
    async fn generate(&self, context: &InjectContext, provider: &str) -> Result<String> {
        debug!("Generating reply (~{} context tokens)", context.estimated_tokens());
        let result = self
            .complete(&context.format_for_prompt(), REPLY_INSTRUCTIONS, 1024, provider)
            .await?;
        Ok(result.content)
    }
}

#[async_trait]
impl Summarizer for ClaudeClient {
    async fn summarize(&self, transcript: &str) -> Result<String> {
        let result = self
            .complete(transcript, SUMMARY_INSTRUCTIONS, 512, &self.utility_model)
            .await?;
        Ok(result.content.trim().to_string())
    }
}

#[async_trait]
impl TopicFilter for ClaudeClient {
    async fn select_relevant(&self, indexed_transcript: &str, persona: &str) -> Result<Vec<usize>> {
        let prompt = format!("[Persona]\n{}\n\n[Conversation]\n{}", persona, indexed_transcript);
        let result = self
            .complete(&prompt, TOPIC_INSTRUCTIONS, 256, &self.utility_model)
            .await?;
        parse_indices(&result.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id() {
        assert_eq!(ClaudeClient::model_id("HAIKU"), "claude-3-5-haiku-20241022");
        assert_eq!(ClaudeClient::model_id("whatever"), "claude-sonnet-4-20250514");
    }

    #[test]
    fn test_parse_indices() {
        assert_eq!(parse_indices("[0, 2, 5]").unwrap(), vec![0, 2, 5]);
        assert_eq!(parse_indices("Relevant lines: [1,3]\n").unwrap(), vec![1, 3]);
        assert!(parse_indices("none of them").is_err());
        assert!(parse_indices("[\"a\"]").is_err());
    }

    #[test]
    fn test_analysis_prompt_sections() {
        let options = AnalyzeOptions {
            group_id: 1,
            trigger_user_id: Some(42),
            idle_mode: true,
            allowed_preferences: vec!["cook".into(), "gamer".into()],
        };
        let threads = vec![ThreadContext {
            thread_id: "t1".into(),
            preference_key: "cook".into(),
            is_current: true,
            transcript: "[10:00:00] alice: pasta?".into(),
        }];

        let prompt = analysis_prompt("You are a cook.", "#1 alice: hi", &threads, &options);
        assert!(prompt.contains("cook, gamer"));
        assert!(prompt.contains("[Active threads]"));
        assert!(prompt.contains("user 42"));
        assert!(prompt.contains("gone quiet"));

        let plain = analysis_prompt("p", "t", &[], &AnalyzeOptions::default());
        assert!(!plain.contains("[Active threads]"));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let client = ClaudeClient::new(None);
        assert!(!client.is_available());
        let err = client.summarize("a: hi").await.unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }
}
