//! Reply Context Assembly
//!
//! Builds the payload handed to the reply generator from four independent
//! blocks:
//! - Persona (rendered from the group settings' templates; required)
//! - Thread transcript (from the thread store or a raw entry window)
//! - Retrieved knowledge (optional)
//! - Long-term memory (optional)
//!
//! Only a missing persona template fails assembly. Empty or failing
//! optional blocks render as empty strings.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::collaborators::{MemoryCollaborator, RetrievalCollaborator, RetrievalOptions};
use crate::config::GroupSettings;
use crate::error::{ProactiveError, Result};
use crate::history::{format_entries, GroupMessageEntry};
use crate::thread_store::ThreadStore;

/// Assembled reply context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InjectContext {
    pub persona: String,
    pub thread: String,
    pub knowledge: String,
    pub memory: String,
    pub topic: Option<String>,
}

impl InjectContext {
    /// Format context for prompt injection
    pub fn format_for_prompt(&self) -> String {
        let mut parts = Vec::new();

        if !self.persona.is_empty() {
            parts.push(format!("[Persona]\n{}", self.persona));
        }

        if let Some(ref topic) = self.topic {
            parts.push(format!("[Topic]\n{}", topic));
        }

        if !self.thread.is_empty() {
            parts.push(format!("[Conversation]\n{}", self.thread));
        }

        if !self.knowledge.is_empty() {
            parts.push(self.knowledge.clone());
        }

        if !self.memory.is_empty() {
            parts.push(self.memory.clone());
        }

        parts.join("\n\n")
    }

    /// Estimated token count (~4 characters per token)
    pub fn estimated_tokens(&self) -> usize {
        (self.persona.len() + self.thread.len() + self.knowledge.len() + self.memory.len()) / 4
    }
}

/// Inputs for one assembly
#[derive(Debug, Clone, Copy)]
pub struct AssembleRequest<'a> {
    pub group_id: i64,
    pub trigger_user_id: Option<i64>,
    pub preference_key: &'a str,
    /// Transcript block, already rendered
    pub transcript: &'a str,
    pub topic: Option<&'a str>,
    pub search_queries: &'a [String],
}

/// Stateless composer of reply context blocks
pub struct ReplyContextAssembler {
    settings: Arc<GroupSettings>,
    retrieval: Arc<dyn RetrievalCollaborator>,
    memory: Arc<dyn MemoryCollaborator>,
    knowledge_limit: usize,
}

impl ReplyContextAssembler {
    pub fn new(
        settings: Arc<GroupSettings>,
        retrieval: Arc<dyn RetrievalCollaborator>,
        memory: Arc<dyn MemoryCollaborator>,
        knowledge_limit: usize,
    ) -> Self {
        Self {
            settings,
            retrieval,
            memory,
            knowledge_limit,
        }
    }

    pub fn settings(&self) -> &GroupSettings {
        &self.settings
    }

    /// Persona text for one or more preference keys.
    /// Multiple keys are rendered as labelled sections.
    pub fn persona_block(&self, keys: &[String]) -> Result<String> {
        let mut sections = Vec::with_capacity(keys.len());
        for key in keys {
            let template = self
                .settings
                .template(key)
                .ok_or_else(|| ProactiveError::MissingTemplate(key.clone()))?;
            if keys.len() == 1 {
                sections.push(template.trim().to_string());
            } else {
                sections.push(format!("### {}\n{}", key, template.trim()));
            }
        }
        Ok(sections.join("\n\n"))
    }

    /// Transcript block for an existing thread
    pub fn thread_block(store: &ThreadStore, thread_id: &str) -> Option<String> {
        store.get_context_formatted(thread_id)
    }

    /// Transcript block for a thread that does not exist yet
    pub fn entries_block(entries: &[GroupMessageEntry]) -> String {
        format_entries(entries)
    }

    /// Knowledge section; empty when retrieval yields nothing or fails
    pub async fn knowledge_block(
        &self,
        preference_key: &str,
        topic: Option<&str>,
        search_queries: &[String],
    ) -> String {
        let query = topic
            .filter(|t| !t.trim().is_empty())
            .or_else(|| search_queries.first().map(String::as_str))
            .unwrap_or("");
        if query.is_empty() && search_queries.is_empty() {
            return String::new();
        }

        let options = RetrievalOptions {
            limit: self.knowledge_limit,
            search_queries: search_queries.to_vec(),
        };

        match self.retrieval.retrieve(preference_key, query, &options).await {
            Ok(snippets) => {
                let lines: Vec<String> = snippets
                    .into_iter()
                    .filter(|s| !s.trim().is_empty())
                    .take(self.knowledge_limit.max(1))
                    .map(|s| format!("- {}", s.trim()))
                    .collect();
                if lines.is_empty() {
                    String::new()
                } else {
                    debug!("Retrieved {} knowledge snippets for '{}'", lines.len(), preference_key);
                    format!("[Relevant Knowledge]\n{}", lines.join("\n"))
                }
            }
            Err(e) => {
                warn!("Knowledge retrieval failed for '{}': {}", preference_key, e);
                String::new()
            }
        }
    }

    /// Memory section; empty when nothing is remembered or lookup fails
    pub async fn memory_block(&self, group_id: i64, user_id: Option<i64>) -> String {
        match self.memory.get_memory_text(group_id, user_id).await {
            Ok(memory) => {
                let mut parts = Vec::new();
                if !memory.group_text.trim().is_empty() {
                    parts.push(format!("[Group Memory]\n{}", memory.group_text.trim()));
                }
                if !memory.user_text.trim().is_empty() {
                    parts.push(format!("[About the Member]\n{}", memory.user_text.trim()));
                }
                parts.join("\n\n")
            }
            Err(e) => {
                warn!("Memory lookup failed for group {}: {}", group_id, e);
                String::new()
            }
        }
    }

    /// Compose all four blocks
    pub async fn assemble(&self, request: AssembleRequest<'_>) -> Result<InjectContext> {
        let persona = self.persona_block(&[request.preference_key.to_string()])?;
        let knowledge = self
            .knowledge_block(request.preference_key, request.topic, request.search_queries)
            .await;
        let memory = self.memory_block(request.group_id, request.trigger_user_id).await;

        Ok(InjectContext {
            persona,
            thread: request.transcript.to_string(),
            knowledge,
            memory,
            topic: request.topic.map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryText, NoMemory, NoRetrieval};
    use async_trait::async_trait;

    struct FixedRetrieval(Vec<String>);

    #[async_trait]
    impl RetrievalCollaborator for FixedRetrieval {
        async fn retrieve(&self, _: &str, _: &str, _: &RetrievalOptions) -> anyhow::Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct FailingMemory;

    #[async_trait]
    impl MemoryCollaborator for FailingMemory {
        async fn get_memory_text(&self, _: i64, _: Option<i64>) -> anyhow::Result<MemoryText> {
            anyhow::bail!("memory offline")
        }
    }

    struct FixedMemory;

    #[async_trait]
    impl MemoryCollaborator for FixedMemory {
        async fn get_memory_text(&self, _: i64, user_id: Option<i64>) -> anyhow::Result<MemoryText> {
            Ok(MemoryText {
                group_text: "likes pasta".into(),
                user_text: user_id.map(|u| format!("user {} is vegan", u)).unwrap_or_default(),
            })
        }
    }

    fn settings() -> Arc<GroupSettings> {
        Arc::new(
            GroupSettings::default()
                .with_persona("cook", "You are a cook.")
                .with_persona("gamer", "You are a gamer.")
                .with_group(1, &["cook", "gamer"]),
        )
    }

    #[test]
    fn test_persona_block_multiple_keys() {
        let assembler = ReplyContextAssembler::new(settings(), Arc::new(NoRetrieval), Arc::new(NoMemory), 3);
        let text = assembler
            .persona_block(&["cook".to_string(), "gamer".to_string()])
            .unwrap();
        assert!(text.contains("### cook\nYou are a cook."));
        assert!(text.contains("### gamer\nYou are a gamer."));

        let single = assembler.persona_block(&["cook".to_string()]).unwrap();
        assert_eq!(single, "You are a cook.");
    }

    #[tokio::test]
    async fn test_missing_template_fails() {
        let assembler = ReplyContextAssembler::new(settings(), Arc::new(NoRetrieval), Arc::new(NoMemory), 3);
        let err = assembler
            .assemble(AssembleRequest {
                group_id: 1,
                trigger_user_id: None,
                preference_key: "unknown",
                transcript: "",
                topic: None,
                search_queries: &[],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProactiveError::MissingTemplate(_)));
    }

    #[tokio::test]
    async fn test_optional_blocks_degrade_to_empty() {
        let assembler = ReplyContextAssembler::new(settings(), Arc::new(NoRetrieval), Arc::new(FailingMemory), 3);
        let ctx = assembler
            .assemble(AssembleRequest {
                group_id: 1,
                trigger_user_id: Some(5),
                preference_key: "cook",
                transcript: "a: hi",
                topic: Some("dinner"),
                search_queries: &[],
            })
            .await
            .unwrap();
        assert_eq!(ctx.persona, "You are a cook.");
        assert!(ctx.knowledge.is_empty());
        assert!(ctx.memory.is_empty());

        let prompt = ctx.format_for_prompt();
        assert!(prompt.contains("[Topic]\ndinner"));
        assert!(prompt.contains("[Conversation]\na: hi"));
    }

    #[tokio::test]
    async fn test_knowledge_and_memory_blocks() {
        let retrieval = FixedRetrieval(vec!["fact one".into(), " ".into(), "fact two".into(), "fact three".into()]);
        let assembler = ReplyContextAssembler::new(settings(), Arc::new(retrieval), Arc::new(FixedMemory), 2);

        let knowledge = assembler
            .knowledge_block("cook", None, &["pasta".to_string()])
            .await;
        assert_eq!(knowledge, "[Relevant Knowledge]\n- fact one\n- fact two");

        // No topic and no queries: retrieval is not consulted.
        assert!(assembler.knowledge_block("cook", None, &[]).await.is_empty());

        let memory = assembler.memory_block(1, Some(7)).await;
        assert!(memory.contains("[Group Memory]\nlikes pasta"));
        assert!(memory.contains("user 7 is vegan"));
    }
}
