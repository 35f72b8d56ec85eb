//! GroupBot Proactive Scheduler
//!
//! Lets a chat bot join group conversations on its own initiative.
//!
//! # Features
//!
//! - **Debounced Analysis**: bursts of messages collapse into one decision
//! - **Per-Group Ordering**: analyses for a group run one at a time
//! - **Topical Threads**: the bot tracks sub-conversations it takes part in
//! - **Reply Locking**: at most one reply in flight per thread
//! - **Background Compression**: old thread segments summarized, off-topic lines pruned
//! - **Thread Archive**: ended threads persisted to SQLite
//!
//! # Architecture
//!
//! ```text
//! inbound msg ──► schedule() ──► debounce ──► group queue ──► run_analysis()
//!                                                                  │
//!                     ┌──────────────────┬─────────────────────────┤
//!                     ▼                  ▼                         ▼
//!               AnalysisClient     ThreadStore           ReplyContextAssembler
//!                 (Claude)      (create/join/end)      (persona/knowledge/memory)
//!                                        │                         │
//!                                        ▼                         ▼
//!                                CompressionWorker      ReplyGenerator ──► OutboundSink
//! ```

pub mod analysis;
pub mod archive;
pub mod claude;
pub mod collaborators;
pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod scheduler;
pub mod thread_store;

pub use analysis::{parse_decision, AnalysisClient, AnalyzeOptions, Decision, ThreadContext};
pub use archive::{ArchiveSummary, SqliteThreadArchive};
pub use claude::ClaudeClient;
pub use collaborators::{
    KeepAllTopics, LogSink, MemoryCollaborator, MemoryText, NoMemory, NoRetrieval, OutboundSink,
    ReplyGenerator, RetrievalCollaborator, RetrievalOptions, Summarizer, ThreadArchive, TopicFilter,
};
pub use compression::{CompressionConfig, CompressionStats, CompressionWorker};
pub use config::{GroupSettings, PersonaSettings, ProactiveConfig};
pub use context::{AssembleRequest, InjectContext, ReplyContextAssembler};
pub use error::ProactiveError;
pub use history::{GroupHistorySource, GroupMessageEntry, InMemoryHistory, MessageMark};
pub use scheduler::{AnalysisContext, AnalysisOutcome, Collaborators, ProactiveScheduler, SchedulerStats};
pub use thread_store::{Thread, ThreadMessage, ThreadStore, BOT_USER_ID};
