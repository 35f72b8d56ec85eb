//! Thread Archive
//!
//! SQLite store for ended threads. Each thread is written once, with its
//! message list serialized as JSON; later saves of the same thread id are
//! ignored.

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::collaborators::ThreadArchive;
use crate::thread_store::{Thread, ThreadMessage};

/// Archive summary for one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub group_id: i64,
    pub thread_count: usize,
    pub message_count: usize,
}

/// Ended-thread archive with SQLite backend
pub struct SqliteThreadArchive {
    conn: Mutex<Connection>,
}

impl SqliteThreadArchive {
    /// Open or create archive database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let archive = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        archive.init_schema()?;

        info!("Thread archive opened: {}", path.display());
        Ok(archive)
    }

    pub fn open_in_memory() -> Result<Self> {
        let archive = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        archive.init_schema()?;
        Ok(archive)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS archived_threads (
                thread_id TEXT PRIMARY KEY,
                group_id INTEGER NOT NULL,
                preference_key TEXT NOT NULL,
                messages TEXT NOT NULL,
                message_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_activity_at INTEGER NOT NULL,
                ended_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_archived_threads_group
                ON archived_threads(group_id, ended_at DESC);
            "#,
        )?;
        Ok(())
    }

    /// Store an ended thread. Returns false if it was already archived.
    pub fn insert(&self, thread: &Thread) -> Result<bool> {
        let messages = serde_json::to_string(&thread.messages)?;
        let ended_at = chrono::Utc::now().timestamp_millis();

        let rows = self.conn().execute(
            "INSERT OR IGNORE INTO archived_threads
             (thread_id, group_id, preference_key, messages, message_count,
              created_at, last_activity_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                thread.thread_id,
                thread.group_id,
                thread.preference_key,
                messages,
                thread.messages.len() as i64,
                thread.created_at,
                thread.last_activity_at,
                ended_at
            ],
        )?;

        debug!("Archived thread {} ({} rows)", thread.thread_id, rows);
        Ok(rows > 0)
    }

    /// Look up one archived thread
    pub fn get(&self, thread_id: &str) -> Result<Option<Thread>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT thread_id, group_id, preference_key, messages, created_at, last_activity_at
                 FROM archived_threads WHERE thread_id = ?1",
                params![thread_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(thread_id, group_id, preference_key, messages, created_at, last_activity_at)| {
            let messages: Vec<ThreadMessage> = serde_json::from_str(&messages)?;
            Ok(Thread {
                thread_id,
                group_id,
                preference_key,
                messages,
                created_at,
                last_activity_at,
                last_seen: None,
            })
        })
        .transpose()
    }

    /// Most recently ended thread ids of a group
    pub fn archived_thread_ids(&self, group_id: i64, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT thread_id FROM archived_threads
             WHERE group_id = ?1
             ORDER BY ended_at DESC, rowid DESC
             LIMIT ?2",
        )?;

        let ids = stmt
            .query_map(params![group_id, limit as i64], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn summary(&self, group_id: i64) -> Result<ArchiveSummary> {
        let (threads, messages): (i64, i64) = self.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(message_count), 0)
             FROM archived_threads WHERE group_id = ?1",
            params![group_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(ArchiveSummary {
            group_id,
            thread_count: threads as usize,
            message_count: messages as usize,
        })
    }
}

#[async_trait]
impl ThreadArchive for SqliteThreadArchive {
    async fn save_ended_thread(&self, thread: &Thread) -> Result<()> {
        if !self.insert(thread)? {
            debug!("Thread {} was already archived", thread.thread_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::GroupMessageEntry;
    use crate::thread_store::ThreadStore;

    fn sample_thread(group_id: i64) -> Thread {
        let mut store = ThreadStore::new();
        let seed = vec![
            GroupMessageEntry::user(1, 10, "anyone cooking tonight?").with_nickname("alice"),
            GroupMessageEntry::user(2, 11, "pasta again"),
        ];
        let thread = store.create(group_id, "cook", &seed);
        store
            .append_message(&thread.thread_id, ThreadMessage::bot_reply("Try carbonara."))
            .unwrap();
        store.get_thread(&thread.thread_id).unwrap().clone()
    }

    #[test]
    fn test_insert_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let archive = SqliteThreadArchive::open(&dir.path().join("archive.db")).unwrap();
        let thread = sample_thread(7);

        assert!(archive.insert(&thread).unwrap());
        let loaded = archive.get(&thread.thread_id).unwrap().unwrap();
        assert_eq!(loaded.group_id, 7);
        assert_eq!(loaded.preference_key, "cook");
        assert_eq!(loaded.messages.len(), 3);
        assert!(loaded.messages[2].is_bot_reply);

        assert!(archive.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_is_idempotent() {
        let archive = SqliteThreadArchive::open_in_memory().unwrap();
        let thread = sample_thread(1);

        assert!(archive.insert(&thread).unwrap());
        assert!(!archive.insert(&thread).unwrap());
        assert_eq!(archive.summary(1).unwrap().thread_count, 1);
    }

    #[test]
    fn test_group_isolation() {
        let archive = SqliteThreadArchive::open_in_memory().unwrap();
        let a = sample_thread(1);
        let b = sample_thread(1);
        let c = sample_thread(2);
        for t in [&a, &b, &c] {
            archive.insert(t).unwrap();
        }

        let ids = archive.archived_thread_ids(1, 10).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&c.thread_id));

        let summary = archive.summary(2).unwrap();
        assert_eq!(summary.thread_count, 1);
        assert_eq!(summary.message_count, 3);
        assert_eq!(archive.summary(99).unwrap().thread_count, 0);
    }

    #[tokio::test]
    async fn test_save_ended_thread() {
        let archive = SqliteThreadArchive::open_in_memory().unwrap();
        let thread = sample_thread(3);

        archive.save_ended_thread(&thread).await.unwrap();
        archive.save_ended_thread(&thread).await.unwrap();
        assert_eq!(archive.archived_thread_ids(3, 5).unwrap(), vec![thread.thread_id]);
    }
}
