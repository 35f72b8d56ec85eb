//! Thread Archive Integration Tests
//!
//! Ended threads flowing from the scheduler into the SQLite archive.

use async_trait::async_trait;
use groupbot_proactive::{
    AnalysisClient, AnalyzeOptions, Collaborators, Decision, GroupMessageEntry, GroupSettings,
    InMemoryHistory, InjectContext, LogSink, ProactiveConfig, ProactiveScheduler, ReplyGenerator,
    SqliteThreadArchive, Summarizer, ThreadContext,
};
use std::sync::Arc;
use tempfile::TempDir;

struct StartThread;

#[async_trait]
impl AnalysisClient for StartThread {
    async fn analyze(&self, _: &str, _: &str, _: &AnalyzeOptions) -> anyhow::Result<Decision> {
        Ok(Decision::create("host"))
    }

    async fn analyze_with_threads(
        &self,
        _: &str,
        _: &str,
        _: &[ThreadContext],
        _: &AnalyzeOptions,
    ) -> anyhow::Result<Decision> {
        Ok(Decision::skip())
    }
}

struct Echo;

#[async_trait]
impl ReplyGenerator for Echo {
    async fn generate(&self, context: &InjectContext, _: &str) -> anyhow::Result<String> {
        Ok(format!("echo ({} chars of context)", context.thread.len()))
    }
}

#[async_trait]
impl Summarizer for Echo {
    async fn summarize(&self, transcript: &str) -> anyhow::Result<String> {
        Ok(transcript.lines().count().to_string())
    }
}

fn create_scheduler(name: &str) -> (ProactiveScheduler, Arc<SqliteThreadArchive>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let archive = Arc::new(
        SqliteThreadArchive::open(&temp_dir.path().join(format!("{}.db", name)))
            .expect("Failed to open archive"),
    );

    let history = Arc::new(InMemoryHistory::new());
    history.push(5, GroupMessageEntry::user(1, 42, "board game night?").with_nickname("dana"));

    let settings = GroupSettings::default()
        .with_persona("host", "You organize events.")
        .with_group(5, &["host"]);
    let collaborators = Collaborators::new(
        history,
        Arc::new(StartThread),
        Arc::new(Echo),
        Arc::new(LogSink),
        archive.clone(),
        Arc::new(Echo),
    );

    let scheduler = ProactiveScheduler::new(ProactiveConfig::default(), Arc::new(settings), collaborators);
    (scheduler, archive, temp_dir)
}

#[tokio::test]
async fn test_ended_thread_is_archived() {
    let (scheduler, archive, _temp) = create_scheduler("ended");

    let ctx = groupbot_proactive::AnalysisContext {
        group_id: 5,
        trigger_user_id: Some(42),
        idle_mode: false,
    };
    let outcome = scheduler.run_analysis(ctx).await.unwrap();
    assert!(outcome.is_reply());

    let thread_id = {
        let store = scheduler.thread_store();
        let store = store.lock().unwrap();
        store.get_current_thread_id(5).unwrap().to_string()
    };

    assert!(scheduler.end_thread(&thread_id).await);
    assert!(!scheduler.end_thread(&thread_id).await);

    let archived = archive.get(&thread_id).unwrap().expect("thread archived");
    assert_eq!(archived.group_id, 5);
    assert_eq!(archived.preference_key, "host");
    assert_eq!(archived.messages.len(), 2);
    assert_eq!(archived.messages[0].nickname.as_deref(), Some("dana"));
    assert!(archived.messages[1].is_bot_reply);

    let summary = archive.summary(5).unwrap();
    assert_eq!(summary.thread_count, 1);
    assert_eq!(summary.message_count, 2);
}

#[tokio::test]
async fn test_archive_survives_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("reopen.db");

    let thread_id = {
        let (scheduler, _, _temp) = create_scheduler("scratch");
        scheduler
            .run_analysis(groupbot_proactive::AnalysisContext {
                group_id: 5,
                trigger_user_id: None,
                idle_mode: true,
            })
            .await
            .unwrap();

        let store = scheduler.thread_store();
        let thread = store.lock().unwrap().get_active_threads(5)[0].clone();

        let archive = SqliteThreadArchive::open(&path).unwrap();
        assert!(archive.insert(&thread).unwrap());
        thread.thread_id
    };

    let reopened = SqliteThreadArchive::open(&path).unwrap();
    assert_eq!(reopened.archived_thread_ids(5, 10).unwrap(), vec![thread_id]);
}
