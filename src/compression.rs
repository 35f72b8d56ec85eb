//! Thread Compression
//!
//! Runs detached from the reply path to keep thread transcripts bounded:
//! - Topic cleaning: drop lines a classifier judges off-topic for the persona
//! - Segment summarization: collapse the oldest segment into one summary line
//!
//! A per-thread guard keeps compression of one thread from overlapping with
//! itself. Live appends from the scheduler may land while a model call is in
//! flight; both steps only touch messages that existed when the call began.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collaborators::{Summarizer, TopicFilter};
use crate::config::{GroupSettings, ProactiveConfig};
use crate::thread_store::ThreadStore;

/// Compression thresholds
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Summarize once a thread holds more than this many messages
    pub summary_ceiling: usize,
    /// Oldest messages collapsed per summarization
    pub summary_segment: usize,
    /// Minimum size before topic cleaning is attempted
    pub topic_clean_min_messages: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            summary_ceiling: 30,
            summary_segment: 10,
            topic_clean_min_messages: 8,
        }
    }
}

impl From<&ProactiveConfig> for CompressionConfig {
    fn from(config: &ProactiveConfig) -> Self {
        Self {
            summary_ceiling: config.summary_ceiling,
            summary_segment: config.summary_segment,
            topic_clean_min_messages: config.topic_clean_min_messages,
        }
    }
}

/// Compression counters
#[derive(Debug, Default)]
pub struct CompressionStats {
    pub runs: AtomicU64,
    pub threads_pruned: AtomicU64,
    pub messages_pruned: AtomicU64,
    pub summaries_written: AtomicU64,
    pub skipped_busy: AtomicU64,
}

/// Background compressor for thread transcripts
#[derive(Clone)]
pub struct CompressionWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    store: Arc<Mutex<ThreadStore>>,
    summarizer: Arc<dyn Summarizer>,
    topic_filter: Arc<dyn TopicFilter>,
    settings: Arc<GroupSettings>,
    config: CompressionConfig,
    compressing: Mutex<HashSet<String>>,
    stats: CompressionStats,
}

/// Removes a thread id from the compressing set on drop
struct CompressingGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    thread_id: String,
}

impl<'a> CompressingGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, thread_id: &str) -> Option<Self> {
        let mut active = set.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(thread_id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            thread_id: thread_id.to_string(),
        })
    }
}

impl Drop for CompressingGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.set.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.thread_id);
    }
}

impl CompressionWorker {
    pub fn new(
        store: Arc<Mutex<ThreadStore>>,
        summarizer: Arc<dyn Summarizer>,
        topic_filter: Arc<dyn TopicFilter>,
        settings: Arc<GroupSettings>,
        config: CompressionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store,
                summarizer,
                topic_filter,
                settings,
                config,
                compressing: Mutex::new(HashSet::new()),
                stats: CompressionStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> &CompressionStats {
        &self.inner.stats
    }

    /// Whether a thread is being compressed right now
    pub fn is_compressing(&self, thread_id: &str) -> bool {
        self.inner
            .compressing
            .lock()
            .map(|s| s.contains(thread_id))
            .unwrap_or(false)
    }

    /// Compress a group's threads in the background. Never blocks.
    pub fn schedule(&self, group_id: i64) -> Option<JoinHandle<()>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                warn!("No async runtime; skipping compression for group {}", group_id);
                return None;
            }
        };
        let worker = self.clone();
        Some(handle.spawn(async move {
            let touched = worker.compress_group(group_id).await;
            debug!("Compression for group {} touched {} threads", group_id, touched);
        }))
    }

    /// Compress every active thread of a group in sequence.
    /// Returns the number of threads that changed.
    pub async fn compress_group(&self, group_id: i64) -> usize {
        self.inner.stats.runs.fetch_add(1, Ordering::Relaxed);

        let thread_ids: Vec<String> = {
            let store = self.inner.store.lock().unwrap_or_else(|p| p.into_inner());
            store
                .get_active_threads(group_id)
                .into_iter()
                .map(|t| t.thread_id.clone())
                .collect()
        };

        let mut changed = 0;
        for thread_id in thread_ids {
            if self.compress_thread(&thread_id).await {
                changed += 1;
            }
        }
        changed
    }

    /// Run both compression steps on one thread. Returns true if it changed.
    pub async fn compress_thread(&self, thread_id: &str) -> bool {
        let Some(_guard) = CompressingGuard::acquire(&self.inner.compressing, thread_id) else {
            debug!("Thread {} already compressing, skipping", thread_id);
            self.inner.stats.skipped_busy.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let pruned = self.clean_topics(thread_id).await;
        let summarized = self.summarize_oldest(thread_id).await;
        pruned || summarized
    }

    async fn clean_topics(&self, thread_id: &str) -> bool {
        let (indexed, snapshot_len, persona) = {
            let store = self.inner.store.lock().unwrap_or_else(|p| p.into_inner());
            let Some(thread) = store.get_thread(thread_id) else {
                return false;
            };
            if thread.messages.len() < self.inner.config.topic_clean_min_messages {
                return false;
            }
            let persona = self
                .inner
                .settings
                .summary(&thread.preference_key)
                .unwrap_or(&thread.preference_key)
                .to_string();
            let indexed = store
                .get_context_formatted_with_indices(thread_id)
                .unwrap_or_default();
            (indexed, thread.messages.len(), persona)
        };

        let selected = match self.inner.topic_filter.select_relevant(&indexed, &persona).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Topic cleaning failed for thread {}: {}", thread_id, e);
                return false;
            }
        };

        let keep: HashSet<usize> = selected.into_iter().filter(|i| *i < snapshot_len).collect();
        if keep.is_empty() || keep.len() >= snapshot_len {
            debug!("Topic cleaning kept thread {} unchanged", thread_id);
            return false;
        }

        let mut store = self.inner.store.lock().unwrap_or_else(|p| p.into_inner());
        let current_len = match store.get_thread(thread_id) {
            Some(t) => t.messages.len(),
            None => return false,
        };
        // Messages appended since the snapshot are always kept.
        let mut indices: Vec<usize> = keep.into_iter().collect();
        indices.extend(snapshot_len..current_len);

        match store.keep_only_message_indices(thread_id, &indices) {
            Ok(kept) => {
                let removed = current_len.saturating_sub(kept);
                self.inner.stats.threads_pruned.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .stats
                    .messages_pruned
                    .fetch_add(removed as u64, Ordering::Relaxed);
                info!("Pruned {} off-topic messages from thread {}", removed, thread_id);
                true
            }
            Err(e) => {
                warn!("Failed to prune thread {}: {}", thread_id, e);
                false
            }
        }
    }

    async fn summarize_oldest(&self, thread_id: &str) -> bool {
        let segment = self.inner.config.summary_segment;
        if segment == 0 {
            return false;
        }

        let transcript = {
            let store = self.inner.store.lock().unwrap_or_else(|p| p.into_inner());
            let Some(thread) = store.get_thread(thread_id) else {
                return false;
            };
            if thread.messages.len() <= self.inner.config.summary_ceiling {
                return false;
            }
            thread.messages[..segment.min(thread.messages.len())]
                .iter()
                .map(|m| m.format_line())
                .collect::<Vec<_>>()
                .join("\n")
        };

        let summary = match self.inner.summarizer.summarize(&transcript).await {
            Ok(s) if !s.trim().is_empty() => s,
            Ok(_) => {
                warn!("Empty summary for thread {}, leaving it unchanged", thread_id);
                return false;
            }
            Err(e) => {
                warn!("Summarization failed for thread {}: {}", thread_id, e);
                return false;
            }
        };

        let mut store = self.inner.store.lock().unwrap_or_else(|p| p.into_inner());
        match store.replace_earliest_with_summary(thread_id, segment, &summary) {
            Ok(replaced) => {
                self.inner.stats.summaries_written.fetch_add(1, Ordering::Relaxed);
                info!("Summarized {} oldest messages of thread {}", replaced, thread_id);
                true
            }
            Err(e) => {
                warn!("Failed to store summary for thread {}: {}", thread_id, e);
                false
            }
        }
    }
}
