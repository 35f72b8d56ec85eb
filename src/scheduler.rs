//! Proactive Scheduler
//!
//! Decides, without any explicit command, when the bot should speak up in a
//! group conversation:
//! - Debounces bursts of inbound events into one decision point per group
//! - Runs analyses for a group strictly one at a time, in arrival order
//! - Applies the analysis decision to the thread store (create / join / end)
//! - Generates and sends replies with at most one in flight per thread
//! - Throttles background compression by inbound message volume
//!
//! Every failure ends as "no proactive reply this cycle"; nothing here
//! propagates to the caller of [`ProactiveScheduler::schedule`].

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::analysis::{AnalysisClient, AnalyzeOptions, Decision, ThreadContext};
use crate::collaborators::{
    KeepAllTopics, MemoryCollaborator, NoMemory, NoRetrieval, OutboundSink, ReplyGenerator,
    RetrievalCollaborator, Summarizer, ThreadArchive, TopicFilter,
};
use crate::compression::{CompressionConfig, CompressionWorker};
use crate::config::{GroupSettings, ProactiveConfig};
use crate::context::{AssembleRequest, ReplyContextAssembler};
use crate::error::ProactiveError;
use crate::history::{
    filter_readable, newest_user_mark, GroupHistorySource, GroupMessageEntry, MessageMark,
};
use crate::thread_store::{now_ms, Thread, ThreadMessage, ThreadStore};

/// Snapshot carried from a debounced trigger into its analysis run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisContext {
    pub group_id: i64,
    pub trigger_user_id: Option<i64>,
    pub idle_mode: bool,
}

/// What one analysis run ended up doing
#[derive(Debug)]
pub enum AnalysisOutcome {
    /// No readable messages in the group window
    NoHistory,
    /// The analysis model chose not to join
    Silent,
    /// The decision conflicted with group configuration
    Dropped(ProactiveError),
    /// A new thread was refused because no new user message arrived
    NewThreadBlocked,
    /// A collaborator failed or returned nothing; no reply was sent
    Degraded(&'static str),
    /// A reply was sent and recorded
    Replied { thread_id: String, new_thread: bool },
}

impl AnalysisOutcome {
    pub fn is_reply(&self) -> bool {
        matches!(self, AnalysisOutcome::Replied { .. })
    }
}

/// External collaborators the scheduler drives
#[derive(Clone)]
pub struct Collaborators {
    pub history: Arc<dyn GroupHistorySource>,
    pub analysis: Arc<dyn AnalysisClient>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub outbound: Arc<dyn OutboundSink>,
    pub archive: Arc<dyn ThreadArchive>,
    pub summarizer: Arc<dyn Summarizer>,
    pub retrieval: Arc<dyn RetrievalCollaborator>,
    pub memory: Arc<dyn MemoryCollaborator>,
    pub topic_filter: Arc<dyn TopicFilter>,
}

impl Collaborators {
    /// Required collaborators; optional ones default to no-ops
    pub fn new(
        history: Arc<dyn GroupHistorySource>,
        analysis: Arc<dyn AnalysisClient>,
        generator: Arc<dyn ReplyGenerator>,
        outbound: Arc<dyn OutboundSink>,
        archive: Arc<dyn ThreadArchive>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            history,
            analysis,
            generator,
            outbound,
            archive,
            summarizer,
            retrieval: Arc::new(NoRetrieval),
            memory: Arc::new(NoMemory),
            topic_filter: Arc::new(KeepAllTopics),
        }
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn RetrievalCollaborator>) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryCollaborator>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_topic_filter(mut self, topic_filter: Arc<dyn TopicFilter>) -> Self {
        self.topic_filter = topic_filter;
        self
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub analyses_run: u64,
    pub analyses_failed: u64,
    pub replies_sent: u64,
    pub threads_created: u64,
    pub threads_ended: u64,
    pub new_threads_blocked: u64,
    pub compressions_scheduled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    analyses_run: AtomicU64,
    analyses_failed: AtomicU64,
    replies_sent: AtomicU64,
    threads_created: AtomicU64,
    threads_ended: AtomicU64,
    new_threads_blocked: AtomicU64,
    compressions_scheduled: AtomicU64,
}

enum QueueItem {
    Analyze(AnalysisContext),
    Barrier(oneshot::Sender<()>),
}

struct DebounceTimer {
    id: u64,
    handle: JoinHandle<()>,
}

/// Mutable scheduling state, keyed by group or thread id
#[derive(Default)]
struct SchedulingState {
    timers: HashMap<i64, DebounceTimer>,
    next_timer_id: u64,
    pending: HashMap<i64, usize>,
    queues: HashMap<i64, mpsc::UnboundedSender<QueueItem>>,
    reply_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    new_thread_marks: HashMap<i64, MessageMark>,
}

/// Where a joining decision should land
enum Target {
    Existing { thread_id: String, preference_key: String },
    New,
}

struct SchedulerInner {
    config: ProactiveConfig,
    settings: Arc<GroupSettings>,
    history: Arc<dyn GroupHistorySource>,
    analysis: Arc<dyn AnalysisClient>,
    generator: Arc<dyn ReplyGenerator>,
    outbound: Arc<dyn OutboundSink>,
    archive: Arc<dyn ThreadArchive>,
    assembler: ReplyContextAssembler,
    compression: CompressionWorker,
    store: Arc<Mutex<ThreadStore>>,
    state: Mutex<SchedulingState>,
    counters: Counters,
}

/// The proactive conversation scheduler
#[derive(Clone)]
pub struct ProactiveScheduler {
    inner: Arc<SchedulerInner>,
}

impl ProactiveScheduler {
    pub fn new(
        config: ProactiveConfig,
        settings: Arc<GroupSettings>,
        collaborators: Collaborators,
    ) -> Self {
        let store = Arc::new(Mutex::new(ThreadStore::new()));
        let compression = CompressionWorker::new(
            store.clone(),
            collaborators.summarizer,
            collaborators.topic_filter,
            settings.clone(),
            CompressionConfig::from(&config),
        );
        let assembler = ReplyContextAssembler::new(
            settings.clone(),
            collaborators.retrieval,
            collaborators.memory,
            config.knowledge_limit,
        );

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                settings,
                history: collaborators.history,
                analysis: collaborators.analysis,
                generator: collaborators.generator,
                outbound: collaborators.outbound,
                archive: collaborators.archive,
                assembler,
                compression,
                store,
                state: Mutex::new(SchedulingState::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// Shared handle to the thread store
    pub fn thread_store(&self) -> Arc<Mutex<ThreadStore>> {
        self.inner.store.clone()
    }

    pub fn compression(&self) -> &CompressionWorker {
        &self.inner.compression
    }

    pub fn config(&self) -> &ProactiveConfig {
        &self.inner.config
    }

    /// Inbound events counted toward the next compression
    pub fn pending_count(&self, group_id: i64) -> usize {
        self.state().pending.get(&group_id).copied().unwrap_or(0)
    }

    /// Whether a debounce timer is armed for the group
    pub fn has_pending_timer(&self, group_id: i64) -> bool {
        self.state().timers.contains_key(&group_id)
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            scheduled: c.scheduled.load(Ordering::Relaxed),
            analyses_run: c.analyses_run.load(Ordering::Relaxed),
            analyses_failed: c.analyses_failed.load(Ordering::Relaxed),
            replies_sent: c.replies_sent.load(Ordering::Relaxed),
            threads_created: c.threads_created.load(Ordering::Relaxed),
            threads_ended: c.threads_ended.load(Ordering::Relaxed),
            new_threads_blocked: c.new_threads_blocked.load(Ordering::Relaxed),
            compressions_scheduled: c.compressions_scheduled.load(Ordering::Relaxed),
        }
    }

    /// Register an inbound group event. Re-arms the group's debounce timer;
    /// never blocks and never fails.
    pub fn schedule(&self, group_id: i64, trigger_user_id: Option<i64>, idle_mode: bool) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                warn!("No async runtime; dropping trigger for group {}", group_id);
                return;
            }
        };

        self.inner.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        let ctx = AnalysisContext {
            group_id,
            trigger_user_id,
            idle_mode,
        };

        let mut state = self.state();
        *state.pending.entry(group_id).or_insert(0) += 1;

        if let Some(previous) = state.timers.remove(&group_id) {
            previous.handle.abort();
        }

        state.next_timer_id += 1;
        let timer_id = state.next_timer_id;
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.debounce;

        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                ProactiveScheduler { inner }.fire_timer(ctx, timer_id);
            }
        });
        state.timers.insert(group_id, DebounceTimer { id: timer_id, handle });
        debug!("Debounce armed for group {} (pending: {})", group_id, state.pending[&group_id]);
    }

    /// Wait until every analysis already queued for the group has finished
    pub async fn flush(&self, group_id: i64) {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            self.enqueue_locked(&mut state, group_id, QueueItem::Barrier(tx));
        }
        let _ = rx.await;
    }

    /// Persist and end a thread. Returns false if it was not active.
    pub async fn end_thread(&self, thread_id: &str) -> bool {
        let snapshot = {
            let store = self.store();
            match store.get_thread(thread_id) {
                Some(t) => t.clone(),
                None => return false,
            }
        };

        if let Err(e) = self.inner.archive.save_ended_thread(&snapshot).await {
            warn!("Failed to archive thread {}: {}", thread_id, e);
        }

        let ended = self.store().end_thread(thread_id).is_some();
        if ended {
            self.state().reply_locks.remove(thread_id);
            self.inner.counters.threads_ended.fetch_add(1, Ordering::Relaxed);
            info!(
                "Ended thread {} in group {} ({} messages)",
                thread_id,
                snapshot.group_id,
                snapshot.messages.len()
            );
        }
        ended
    }

    /// Execute one decision cycle for a group. Compression accounting runs
    /// whatever the outcome.
    pub async fn run_analysis(&self, ctx: AnalysisContext) -> Result<AnalysisOutcome> {
        self.inner.counters.analyses_run.fetch_add(1, Ordering::Relaxed);
        let outcome = self.decide_and_reply(&ctx).await;
        self.account_compression(ctx.group_id);

        if let Ok(ref outcome) = outcome {
            debug!("Analysis for group {} finished: {:?}", ctx.group_id, outcome);
        }
        outcome
    }

    async fn decide_and_reply(&self, ctx: &AnalysisContext) -> Result<AnalysisOutcome> {
        let group_id = ctx.group_id;

        self.end_idle_threads(group_id).await;

        let keys = self.inner.settings.preference_keys(group_id).to_vec();
        if keys.is_empty() {
            return Ok(self.dropped(ProactiveError::UnknownGroup(group_id)));
        }
        let preference_text = match self.inner.assembler.persona_block(&keys) {
            Ok(text) => text,
            Err(e) => return Ok(self.dropped(e)),
        };

        let entries = match self
            .inner
            .history
            .get_recent(group_id, self.inner.config.history_limit)
            .await
        {
            Ok(entries) => filter_readable(entries),
            Err(e) => {
                warn!("History fetch failed for group {}: {}", group_id, e);
                return Ok(AnalysisOutcome::Degraded("history"));
            }
        };
        if entries.is_empty() {
            return Ok(AnalysisOutcome::NoHistory);
        }

        let decision = match self.analyze(ctx, &preference_text, &entries, keys).await {
            Ok(d) => d,
            Err(e) => {
                warn!("Analysis failed for group {}: {}", group_id, e);
                return Ok(AnalysisOutcome::Degraded("analysis"));
            }
        };
        debug!("Decision for group {}: {:?}", group_id, decision);

        if let Some(ref end_id) = decision.thread_should_end_id {
            self.end_requested_thread(group_id, end_id).await;
        }

        if !decision.should_join {
            return Ok(AnalysisOutcome::Silent);
        }

        match self.resolve_target(group_id, &decision) {
            Target::Existing {
                thread_id,
                preference_key,
            } => {
                if let Err(e) = self.inner.settings.check_allowed(group_id, &preference_key) {
                    return Ok(self.dropped(e));
                }
                self.reply_in_thread(ctx, &thread_id, &preference_key, &decision, &entries)
                    .await
            }
            Target::New => {
                let preference_key = match self.resolve_new_preference(group_id, &decision) {
                    Ok(k) => k,
                    Err(e) => return Ok(self.dropped(e)),
                };
                self.reply_in_new_thread(ctx, &preference_key, &decision, &entries)
                    .await
            }
        }
    }

    async fn analyze(
        &self,
        ctx: &AnalysisContext,
        preference_text: &str,
        entries: &[GroupMessageEntry],
        allowed_preferences: Vec<String>,
    ) -> Result<Decision> {
        let transcript = self.inner.history.format(entries);
        let options = AnalyzeOptions {
            group_id: ctx.group_id,
            trigger_user_id: ctx.trigger_user_id,
            idle_mode: ctx.idle_mode,
            allowed_preferences,
        };

        let threads: Vec<ThreadContext> = {
            let store = self.store();
            let current = store.get_current_thread_id(ctx.group_id);
            store
                .get_active_threads(ctx.group_id)
                .into_iter()
                .map(|t| ThreadContext {
                    thread_id: t.thread_id.clone(),
                    preference_key: t.preference_key.clone(),
                    is_current: current == Some(t.thread_id.as_str()),
                    transcript: ReplyContextAssembler::thread_block(&store, &t.thread_id)
                        .unwrap_or_default(),
                })
                .collect()
        };

        if threads.is_empty() {
            self.inner
                .analysis
                .analyze(preference_text, &transcript, &options)
                .await
        } else {
            self.inner
                .analysis
                .analyze_with_threads(preference_text, &transcript, &threads, &options)
                .await
        }
    }

    /// End threads idle past the timeout, sparing a current thread that is
    /// within the grace window or mid-reply
    async fn end_idle_threads(&self, group_id: i64) {
        let idle = {
            let store = self.store();
            store.idle_thread_ids(
                group_id,
                now_ms(),
                self.inner.config.idle_timeout.as_millis() as i64,
                self.inner.config.grace_window.as_millis() as i64,
            )
        };

        for thread_id in idle {
            if self.reply_in_flight(&thread_id) {
                debug!("Thread {} is idle but mid-reply, keeping it", thread_id);
                continue;
            }
            debug!("Thread {} idle in group {}", thread_id, group_id);
            self.end_thread(&thread_id).await;
        }
    }

    async fn end_requested_thread(&self, group_id: i64, thread_id: &str) {
        let protected = {
            let store = self.store();
            let Some(thread) = store.get_thread(thread_id) else {
                debug!("Thread {} to end is already gone", thread_id);
                return;
            };
            if thread.group_id != group_id {
                warn!(
                    "Ignoring end request for thread {} from group {} (owned by {})",
                    thread_id, group_id, thread.group_id
                );
                return;
            }
            let in_grace = now_ms() - thread.last_activity_at
                < self.inner.config.grace_window.as_millis() as i64;
            store.get_current_thread_id(group_id) == Some(thread_id) && in_grace
        };

        if protected || self.reply_in_flight(thread_id) {
            debug!("Thread {} had recent activity, not ending it this cycle", thread_id);
            return;
        }
        self.end_thread(thread_id).await;
    }

    fn resolve_target(&self, group_id: i64, decision: &Decision) -> Target {
        let store = self.store();

        if let Some(ref thread_id) = decision.reply_in_thread_id {
            match store.get_thread(thread_id) {
                Some(t) if t.group_id == group_id => {
                    return Target::Existing {
                        thread_id: t.thread_id.clone(),
                        preference_key: t.preference_key.clone(),
                    };
                }
                Some(t) => {
                    warn!(
                        "Decision for group {} named thread {} of group {}; creating new instead",
                        group_id, thread_id, t.group_id
                    );
                    return Target::New;
                }
                None => {
                    debug!("Decision named unknown thread {}; creating new instead", thread_id);
                    return Target::New;
                }
            }
        }

        if decision.wants_new_thread() {
            return Target::New;
        }

        // Neither target given: the current thread is the tie-break.
        store
            .get_current_thread_id(group_id)
            .and_then(|id| store.get_thread(id))
            .map(|t| Target::Existing {
                thread_id: t.thread_id.clone(),
                preference_key: t.preference_key.clone(),
            })
            .unwrap_or(Target::New)
    }

    fn resolve_new_preference(&self, group_id: i64, decision: &Decision) -> Result<String, ProactiveError> {
        let keys = self.inner.settings.preference_keys(group_id);
        let key = match decision.preference_key.as_deref() {
            Some(k) => k.to_string(),
            None if keys.len() == 1 => keys[0].clone(),
            None => return Err(ProactiveError::MissingPreference),
        };
        self.inner.settings.check_allowed(group_id, &key)?;
        Ok(key)
    }

    async fn reply_in_thread(
        &self,
        ctx: &AnalysisContext,
        thread_id: &str,
        preference_key: &str,
        decision: &Decision,
        entries: &[GroupMessageEntry],
    ) -> Result<AnalysisOutcome> {
        let lock = self.reply_lock(thread_id);
        let _guard = lock.lock_owned().await;

        let transcript = {
            let mut store = self.store();
            let Some(thread) = store.get_thread(thread_id) else {
                debug!("Thread {} ended before the reply could start", thread_id);
                return Ok(AnalysisOutcome::Degraded("thread ended"));
            };

            let (triggers, restrict) = match decision.message_ids {
                Some(ref ids) => (entries.to_vec(), Some(ids.as_slice())),
                None => (entries_after_thread(thread, entries), None),
            };
            let triggers: Vec<GroupMessageEntry> =
                triggers.into_iter().filter(|e| !e.is_bot_reply).collect();

            store.set_current_thread(ctx.group_id, thread_id)?;
            let appended = store.append_group_messages(thread_id, &triggers, restrict)?;
            debug!("Appended {} trigger messages to thread {}", appended, thread_id);

            ReplyContextAssembler::thread_block(&store, thread_id).unwrap_or_default()
        };

        let outcome = self
            .generate_and_send(ctx, thread_id, preference_key, &transcript, decision)
            .await?;
        if outcome.is_reply() {
            return Ok(AnalysisOutcome::Replied {
                thread_id: thread_id.to_string(),
                new_thread: false,
            });
        }
        Ok(outcome)
    }

    async fn reply_in_new_thread(
        &self,
        ctx: &AnalysisContext,
        preference_key: &str,
        decision: &Decision,
        entries: &[GroupMessageEntry],
    ) -> Result<AnalysisOutcome> {
        let group_id = ctx.group_id;
        let Some(newest) = newest_user_mark(entries) else {
            return Ok(self.blocked(group_id));
        };

        let allowed = {
            let mut state = self.state();
            let fresh = state
                .new_thread_marks
                .get(&group_id)
                .map_or(true, |boundary| newest > *boundary);
            if fresh {
                state.new_thread_marks.insert(group_id, newest);
            }
            fresh
        };
        if !allowed {
            return Ok(self.blocked(group_id));
        }

        let thread: Thread = {
            let mut store = self.store();
            let thread = store.create(group_id, preference_key, entries);
            store.set_current_thread(group_id, &thread.thread_id)?;
            thread
        };
        self.inner.counters.threads_created.fetch_add(1, Ordering::Relaxed);
        info!(
            "Created thread {} in group {} for '{}' ({} seed messages)",
            thread.thread_id,
            group_id,
            preference_key,
            thread.messages.len()
        );

        let lock = self.reply_lock(&thread.thread_id);
        let _guard = lock.lock_owned().await;

        let transcript = ReplyContextAssembler::entries_block(entries);
        let outcome = self
            .generate_and_send(ctx, &thread.thread_id, preference_key, &transcript, decision)
            .await?;
        if outcome.is_reply() {
            return Ok(AnalysisOutcome::Replied {
                thread_id: thread.thread_id,
                new_thread: true,
            });
        }
        Ok(outcome)
    }

    /// Assemble, generate, send, then record. Caller holds the reply lock.
    async fn generate_and_send(
        &self,
        ctx: &AnalysisContext,
        thread_id: &str,
        preference_key: &str,
        transcript: &str,
        decision: &Decision,
    ) -> Result<AnalysisOutcome> {
        let inject = match self
            .inner
            .assembler
            .assemble(AssembleRequest {
                group_id: ctx.group_id,
                trigger_user_id: ctx.trigger_user_id,
                preference_key,
                transcript,
                topic: decision.topic.as_deref(),
                search_queries: decision.search_queries(),
            })
            .await
        {
            Ok(inject) => inject,
            Err(e) => return Ok(self.dropped(e)),
        };

        let reply = match self
            .inner
            .generator
            .generate(&inject, &self.inner.config.provider)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!("Empty reply generated for thread {}", thread_id);
                return Ok(AnalysisOutcome::Degraded("generation"));
            }
            Err(e) => {
                warn!("Reply generation failed for thread {}: {}", thread_id, e);
                return Ok(AnalysisOutcome::Degraded("generation"));
            }
        };

        if let Err(e) = self.inner.outbound.send(ctx.group_id, &reply).await {
            warn!("Failed to send reply to group {}: {}", ctx.group_id, e);
            return Ok(AnalysisOutcome::Degraded("send"));
        }

        if let Err(e) = self
            .store()
            .append_message(thread_id, ThreadMessage::bot_reply(&reply))
        {
            warn!("Reply sent but thread {} is gone: {}", thread_id, e);
        }
        self.inner.counters.replies_sent.fetch_add(1, Ordering::Relaxed);
        info!("Replied in thread {} (group {})", thread_id, ctx.group_id);

        Ok(AnalysisOutcome::Replied {
            thread_id: thread_id.to_string(),
            new_thread: false,
        })
    }

    fn account_compression(&self, group_id: i64) {
        let due = {
            let mut state = self.state();
            let pending = state.pending.entry(group_id).or_insert(0);
            if *pending >= self.inner.config.compression_threshold {
                *pending = 0;
                true
            } else {
                false
            }
        };

        if due {
            self.inner
                .counters
                .compressions_scheduled
                .fetch_add(1, Ordering::Relaxed);
            debug!("Scheduling compression for group {}", group_id);
            self.inner.compression.schedule(group_id);
        }
    }

    fn fire_timer(&self, ctx: AnalysisContext, timer_id: u64) {
        let mut state = self.state();
        match state.timers.get(&ctx.group_id) {
            Some(timer) if timer.id == timer_id => {
                state.timers.remove(&ctx.group_id);
            }
            _ => return,
        }
        self.enqueue_locked(&mut state, ctx.group_id, QueueItem::Analyze(ctx));
    }

    fn enqueue_locked(&self, state: &mut SchedulingState, group_id: i64, item: QueueItem) {
        let tx = state.queues.entry(group_id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(drain_queue(Arc::downgrade(&self.inner), group_id, rx));
            tx
        });
        if tx.send(item).is_err() {
            error!("Analysis queue for group {} is closed", group_id);
        }
    }

    fn reply_lock(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.state()
            .reply_locks
            .entry(thread_id.to_string())
            .or_default()
            .clone()
    }

    fn reply_in_flight(&self, thread_id: &str) -> bool {
        self.state()
            .reply_locks
            .get(thread_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    fn dropped(&self, error: ProactiveError) -> AnalysisOutcome {
        warn!("Dropping decision: {}", error);
        AnalysisOutcome::Dropped(error)
    }

    fn blocked(&self, group_id: i64) -> AnalysisOutcome {
        self.inner
            .counters
            .new_threads_blocked
            .fetch_add(1, Ordering::Relaxed);
        debug!("New thread blocked in group {}: no new user message", group_id);
        AnalysisOutcome::NewThreadBlocked
    }

    fn state(&self) -> MutexGuard<'_, SchedulingState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn store(&self) -> MutexGuard<'_, ThreadStore> {
        self.inner.store.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Per-group worker: runs queued analyses one at a time, in order. Each run
/// is its own task so a panic is contained to that run.
async fn drain_queue(
    scheduler: Weak<SchedulerInner>,
    group_id: i64,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
) {
    while let Some(item) = rx.recv().await {
        let ctx = match item {
            QueueItem::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
            QueueItem::Analyze(ctx) => ctx,
        };

        let Some(inner) = scheduler.upgrade() else {
            break;
        };
        let run = ProactiveScheduler { inner };
        let failed = run.clone();

        let result = tokio::spawn(async move { run.run_analysis(ctx).await }).await;
        let failure = match result {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(e) => Some(format!("task aborted: {}", e)),
        };
        if let Some(reason) = failure {
            failed
                .inner
                .counters
                .analyses_failed
                .fetch_add(1, Ordering::Relaxed);
            error!("Analysis for group {} failed: {}", group_id, reason);
        }
    }
    debug!("Analysis queue for group {} closed", group_id);
}

/// Group entries newer than the last message the thread has taken in.
///
/// Anchors on the thread's high-water mark, which pruning never lowers, so
/// messages dropped by compression are not picked up again. Falls back to
/// timestamps for threads without one.
fn entries_after_thread(thread: &Thread, entries: &[GroupMessageEntry]) -> Vec<GroupMessageEntry> {
    if let Some(seen) = thread.last_seen {
        if let Some(pos) = entries.iter().position(|e| e.message_id == seen.message_id) {
            return entries[pos + 1..].to_vec();
        }
        return entries.iter().filter(|e| e.mark() > seen).cloned().collect();
    }

    let since = thread.last_user_message_at().unwrap_or(thread.created_at);
    entries
        .iter()
        .filter(|e| e.created_at > since)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, at: i64) -> GroupMessageEntry {
        GroupMessageEntry::user(id, 10 + id, &format!("m{}", id)).at(at)
    }

    #[test]
    fn test_entries_after_thread_by_anchor() {
        let mut store = ThreadStore::new();
        let thread = store.create(1, "p", &[entry(1, 100), entry(2, 200)]);
        let window = vec![entry(1, 100), entry(2, 200), entry(3, 150), entry(4, 400)];

        // Anchored on id 2, so id 3 counts even with an older timestamp.
        let newer = entries_after_thread(&thread, &window);
        let ids: Vec<i64> = newer.iter().map(|e| e.message_id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_entries_after_thread_falls_back_to_time() {
        let mut store = ThreadStore::new();
        let thread = store.create(1, "p", &[entry(1, 100), entry(2, 200)]);
        let window = vec![entry(5, 150), entry(6, 250), entry(7, 300)];

        let ids: Vec<i64> = entries_after_thread(&thread, &window)
            .iter()
            .map(|e| e.message_id)
            .collect();
        assert_eq!(ids, vec![6, 7]);
    }

    #[test]
    fn test_entries_after_thread_nothing_new() {
        let mut store = ThreadStore::new();
        let thread = store.create(1, "p", &[entry(1, 100), entry(2, 200)]);
        assert!(entries_after_thread(&thread, &[entry(1, 100), entry(2, 200)]).is_empty());
    }

    #[test]
    fn test_entries_after_thread_ignores_pruned_messages() {
        let mut store = ThreadStore::new();
        let seed: Vec<GroupMessageEntry> = (1..=10).map(|i| entry(i, 100 + i)).collect();
        let thread_id = store.create(1, "p", &seed).thread_id;
        store
            .append_message(&thread_id, ThreadMessage::bot_reply("noted"))
            .unwrap();
        store
            .keep_only_message_indices(&thread_id, &[0, 1, 2, 3, 4, 10])
            .unwrap();

        let window: Vec<GroupMessageEntry> = (1..=11).map(|i| entry(i, 100 + i)).collect();
        let thread = store.get_thread(&thread_id).unwrap();
        let ids: Vec<i64> = entries_after_thread(thread, &window)
            .iter()
            .map(|e| e.message_id)
            .collect();
        assert_eq!(ids, vec![11]);
    }

    #[test]
    fn test_entries_after_thread_without_anchor_in_window() {
        let mut store = ThreadStore::new();
        let thread = store.create(1, "p", &[entry(1, 100), entry(2, 200)]);
        // Window scrolled past id 2; same-timestamp entries order by id.
        let window = vec![entry(3, 200), entry(4, 210)];

        let ids: Vec<i64> = entries_after_thread(&thread, &window)
            .iter()
            .map(|e| e.message_id)
            .collect();
        assert_eq!(ids, vec![3, 4]);
    }
}
