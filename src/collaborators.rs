//! Collaborator Traits
//!
//! Narrow async interfaces for everything the scheduler consumes but does
//! not own: retrieval, long-term memory, generation, delivery, archiving and
//! the two compression calls. Optional capabilities ship a no-op
//! implementation so callers never branch on "not configured".

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::context::InjectContext;
use crate::thread_store::Thread;

/// Options for a knowledge lookup
#[derive(Debug, Clone, Default)]
pub struct RetrievalOptions {
    pub limit: usize,
    pub search_queries: Vec<String>,
}

/// Knowledge base lookup keyed by preference
#[async_trait]
pub trait RetrievalCollaborator: Send + Sync {
    async fn retrieve(
        &self,
        preference_key: &str,
        query: &str,
        options: &RetrievalOptions,
    ) -> Result<Vec<String>>;
}

/// Long-term memory text for a group and (optionally) one member
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryText {
    pub group_text: String,
    pub user_text: String,
}

impl MemoryText {
    pub fn is_empty(&self) -> bool {
        self.group_text.trim().is_empty() && self.user_text.trim().is_empty()
    }
}

#[async_trait]
pub trait MemoryCollaborator: Send + Sync {
    async fn get_memory_text(&self, group_id: i64, user_id: Option<i64>) -> Result<MemoryText>;
}

/// Turns an assembled context into reply text
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, context: &InjectContext, provider: &str) -> Result<String>;
}

/// Delivers text to a group
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send(&self, group_id: i64, text: &str) -> Result<()>;
}

/// Receives threads as they end
#[async_trait]
pub trait ThreadArchive: Send + Sync {
    async fn save_ended_thread(&self, thread: &Thread) -> Result<()>;
}

/// Summarizes a segment of a thread transcript
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<String>;
}

/// Picks which indexed thread lines are still on-topic for a persona
#[async_trait]
pub trait TopicFilter: Send + Sync {
    async fn select_relevant(&self, indexed_transcript: &str, persona: &str) -> Result<Vec<usize>>;
}

/// Retrieval that always yields nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetrieval;

#[async_trait]
impl RetrievalCollaborator for NoRetrieval {
    async fn retrieve(&self, _: &str, _: &str, _: &RetrievalOptions) -> Result<Vec<String>> {
        Ok(vec![])
    }
}

/// Memory that always yields nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMemory;

#[async_trait]
impl MemoryCollaborator for NoMemory {
    async fn get_memory_text(&self, _: i64, _: Option<i64>) -> Result<MemoryText> {
        Ok(MemoryText::default())
    }
}

/// Topic filter that never prunes
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAllTopics;

#[async_trait]
impl TopicFilter for KeepAllTopics {
    async fn select_relevant(&self, _: &str, _: &str) -> Result<Vec<usize>> {
        Ok(vec![])
    }
}

/// Outbound sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl OutboundSink for LogSink {
    async fn send(&self, group_id: i64, text: &str) -> Result<()> {
        info!("[group {}] bot: {}", group_id, text);
        Ok(())
    }
}
