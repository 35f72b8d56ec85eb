//! Thread Store
//!
//! In-memory registry of the ephemeral topical threads the bot is tracking
//! in each group. Pure data and lifecycle operations; no I/O and no locking.
//! Callers (the scheduler and the compression worker) guarantee that a
//! single thread is never mutated by two logical callers at once.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::{ProactiveError, Result};
use crate::history::{format_time, GroupMessageEntry, MessageMark};

/// User id recorded for bot replies and synthetic messages
pub const BOT_USER_ID: i64 = 0;

/// Prefix marking a synthetic summary message
const SUMMARY_PREFIX: &str = "[Summary of earlier discussion] ";

/// A message inside a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    /// Sender; `BOT_USER_ID` for the bot
    pub user_id: i64,
    pub nickname: Option<String>,
    pub content: String,
    pub is_bot_reply: bool,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// Group message this was copied from, if any
    pub source_message_id: Option<i64>,
}

impl ThreadMessage {
    /// Bot reply stamped with the current time
    pub fn bot_reply(content: &str) -> Self {
        Self {
            user_id: BOT_USER_ID,
            nickname: None,
            content: content.to_string(),
            is_bot_reply: true,
            created_at: now_ms(),
            source_message_id: None,
        }
    }

    /// Whether this is a synthetic summary inserted by compression
    pub fn is_summary(&self) -> bool {
        self.user_id == BOT_USER_ID && !self.is_bot_reply && self.content.starts_with(SUMMARY_PREFIX)
    }

    fn label(&self) -> String {
        if self.is_bot_reply {
            "Bot".to_string()
        } else if self.is_summary() {
            "Summary".to_string()
        } else {
            match &self.nickname {
                Some(n) if !n.trim().is_empty() => n.clone(),
                _ => format!("user{}", self.user_id),
            }
        }
    }

    /// One transcript line: `[HH:MM:SS] name: content`
    pub fn format_line(&self) -> String {
        format!("[{}] {}: {}", format_time(self.created_at), self.label(), self.content)
    }
}

impl From<&GroupMessageEntry> for ThreadMessage {
    fn from(entry: &GroupMessageEntry) -> Self {
        Self {
            user_id: if entry.is_bot_reply { BOT_USER_ID } else { entry.user_id },
            nickname: entry.nickname.clone(),
            content: entry.content.clone(),
            is_bot_reply: entry.is_bot_reply,
            created_at: entry.created_at,
            source_message_id: Some(entry.message_id),
        }
    }
}

/// One topical sub-conversation in a group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub group_id: i64,
    pub preference_key: String,
    pub messages: Vec<ThreadMessage>,
    pub created_at: i64,
    pub last_activity_at: i64,
    /// Newest group message taken into the thread. Pruning never lowers it.
    #[serde(default)]
    pub last_seen: Option<MessageMark>,
}

impl Thread {
    /// Timestamp of the newest message, or creation time when empty
    pub fn latest_message_at(&self) -> i64 {
        self.messages
            .iter()
            .map(|m| m.created_at)
            .max()
            .unwrap_or(self.created_at)
    }

    /// Newest group message id that was copied into this thread
    pub fn last_source_message_id(&self) -> Option<i64> {
        self.messages.iter().rev().find_map(|m| m.source_message_id)
    }

    /// Timestamp of the newest non-bot message
    pub fn last_user_message_at(&self) -> Option<i64> {
        self.messages
            .iter()
            .filter(|m| !m.is_bot_reply && !m.is_summary())
            .map(|m| m.created_at)
            .max()
    }

    fn contains_source(&self, message_id: i64) -> bool {
        self.messages
            .iter()
            .any(|m| m.source_message_id == Some(message_id))
    }

    fn touch(&mut self, at: i64) {
        self.last_activity_at = self.last_activity_at.max(at);
    }

    fn see(&mut self, mark: MessageMark) {
        self.last_seen = Some(self.last_seen.map_or(mark, |seen| seen.max(mark)));
    }
}

/// Registry of active threads
#[derive(Debug, Default)]
pub struct ThreadStore {
    threads: HashMap<String, Thread>,
    current: HashMap<i64, String>,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a thread seeded with group history
    pub fn create(
        &mut self,
        group_id: i64,
        preference_key: &str,
        seed: &[GroupMessageEntry],
    ) -> Thread {
        self.create_at(group_id, preference_key, seed, now_ms())
    }

    /// Create a thread with an explicit creation time
    pub fn create_at(
        &mut self,
        group_id: i64,
        preference_key: &str,
        seed: &[GroupMessageEntry],
        now: i64,
    ) -> Thread {
        let thread = Thread {
            thread_id: uuid::Uuid::new_v4().to_string(),
            group_id,
            preference_key: preference_key.to_string(),
            messages: seed.iter().map(ThreadMessage::from).collect(),
            created_at: now,
            last_activity_at: now,
            last_seen: seed.iter().map(GroupMessageEntry::mark).max(),
        };
        debug!(
            "Created thread {} in group {} ({} seed messages)",
            thread.thread_id,
            group_id,
            thread.messages.len()
        );
        self.threads.insert(thread.thread_id.clone(), thread.clone());
        thread
    }

    pub fn get_thread(&self, thread_id: &str) -> Option<&Thread> {
        self.threads.get(thread_id)
    }

    /// Active threads of a group, oldest first
    pub fn get_active_threads(&self, group_id: i64) -> Vec<&Thread> {
        let mut threads: Vec<&Thread> = self
            .threads
            .values()
            .filter(|t| t.group_id == group_id)
            .collect();
        threads.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.thread_id.cmp(&b.thread_id))
        });
        threads
    }

    pub fn get_current_thread_id(&self, group_id: i64) -> Option<&str> {
        self.current.get(&group_id).map(String::as_str)
    }

    /// Mark a thread as its group's current one
    pub fn set_current_thread(&mut self, group_id: i64, thread_id: &str) -> Result<()> {
        let thread = self.thread_in_group(group_id, thread_id)?;
        thread.touch(now_ms());
        self.current.insert(group_id, thread_id.to_string());
        Ok(())
    }

    /// Remove a thread from the active set; persistence is the caller's job
    pub fn end_thread(&mut self, thread_id: &str) -> Option<Thread> {
        let thread = self.threads.remove(thread_id)?;
        if self.current.get(&thread.group_id).map(String::as_str) == Some(thread_id) {
            self.current.remove(&thread.group_id);
        }
        debug!("Ended thread {} in group {}", thread_id, thread.group_id);
        Some(thread)
    }

    pub fn append_message(&mut self, thread_id: &str, message: ThreadMessage) -> Result<()> {
        let thread = self.thread_mut(thread_id)?;
        let at = now_ms().max(message.created_at);
        thread.messages.push(message);
        thread.touch(at);
        Ok(())
    }

    /// Bulk import group entries, optionally restricted to `message_ids`.
    /// Entries already present in the thread are skipped. Returns the
    /// number appended.
    pub fn append_group_messages(
        &mut self,
        thread_id: &str,
        entries: &[GroupMessageEntry],
        message_ids: Option<&[i64]>,
    ) -> Result<usize> {
        let wanted: Option<HashSet<i64>> = message_ids.map(|ids| ids.iter().copied().collect());
        let thread = self.thread_mut(thread_id)?;

        let mut appended = 0;
        for entry in entries {
            if let Some(ref wanted) = wanted {
                if !wanted.contains(&entry.message_id) {
                    continue;
                }
            }
            if thread.contains_source(entry.message_id) {
                continue;
            }
            thread.messages.push(ThreadMessage::from(entry));
            thread.see(entry.mark());
            appended += 1;
        }

        if appended > 0 {
            thread.touch(now_ms());
        }
        Ok(appended)
    }

    /// Thread transcript, one line per message
    pub fn get_context_formatted(&self, thread_id: &str) -> Option<String> {
        let thread = self.threads.get(thread_id)?;
        Some(
            thread
                .messages
                .iter()
                .map(ThreadMessage::format_line)
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Thread transcript with a `[i]` index prefix on every line
    pub fn get_context_formatted_with_indices(&self, thread_id: &str) -> Option<String> {
        let thread = self.threads.get(thread_id)?;
        Some(
            thread
                .messages
                .iter()
                .enumerate()
                .map(|(i, m)| format!("[{}] {}", i, m.format_line()))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Collapse the earliest `n` messages into one summary message.
    /// Returns the number of messages replaced.
    pub fn replace_earliest_with_summary(
        &mut self,
        thread_id: &str,
        n: usize,
        summary: &str,
    ) -> Result<usize> {
        let thread = self.thread_mut(thread_id)?;
        let n = n.min(thread.messages.len());
        if n == 0 {
            return Ok(0);
        }

        let replaced: Vec<ThreadMessage> = thread.messages.drain(..n).collect();
        let created_at = replaced.last().map(|m| m.created_at).unwrap_or(thread.created_at);
        thread.messages.insert(
            0,
            ThreadMessage {
                user_id: BOT_USER_ID,
                nickname: None,
                content: format!("{}{}", SUMMARY_PREFIX, summary.trim()),
                is_bot_reply: false,
                created_at,
                source_message_id: None,
            },
        );
        thread.touch(now_ms());
        Ok(n)
    }

    /// Keep only messages at the given indices, preserving order.
    /// Out-of-range indices are ignored. Returns the number kept.
    pub fn keep_only_message_indices(&mut self, thread_id: &str, indices: &[usize]) -> Result<usize> {
        let keep: HashSet<usize> = indices.iter().copied().collect();
        let thread = self.thread_mut(thread_id)?;
        let messages = std::mem::take(&mut thread.messages);
        thread.messages = messages
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, m)| m)
            .collect();
        thread.touch(now_ms());
        Ok(thread.messages.len())
    }

    /// Threads of a group with no new message for `idle_timeout_ms`.
    /// Age counts from the newest message or from creation, whichever is
    /// later, so a thread seeded from an old window gets a full timeout.
    /// The group's current thread is spared while its last activity is
    /// within `grace_ms`.
    pub fn idle_thread_ids(
        &self,
        group_id: i64,
        now: i64,
        idle_timeout_ms: i64,
        grace_ms: i64,
    ) -> Vec<String> {
        let current = self.get_current_thread_id(group_id);
        self.get_active_threads(group_id)
            .into_iter()
            .filter(|t| now - t.latest_message_at().max(t.created_at) > idle_timeout_ms)
            .filter(|t| {
                let in_grace = now - t.last_activity_at < grace_ms;
                !(current == Some(t.thread_id.as_str()) && in_grace)
            })
            .map(|t| t.thread_id.clone())
            .collect()
    }

    /// Number of active threads across all groups
    pub fn active_count(&self) -> usize {
        self.threads.len()
    }

    fn thread_mut(&mut self, thread_id: &str) -> Result<&mut Thread> {
        self.threads
            .get_mut(thread_id)
            .ok_or_else(|| ProactiveError::ThreadNotFound(thread_id.to_string()))
    }

    fn thread_in_group(&mut self, group_id: i64, thread_id: &str) -> Result<&mut Thread> {
        let thread = self.thread_mut(thread_id)?;
        if thread.group_id != group_id {
            return Err(ProactiveError::ForeignThread {
                thread_id: thread_id.to_string(),
                expected: group_id,
                actual: thread.group_id,
            });
        }
        Ok(thread)
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(count: i64, start_at: i64) -> Vec<GroupMessageEntry> {
        (1..=count)
            .map(|i| GroupMessageEntry::user(i, 100 + i, &format!("message {}", i)).at(start_at + i))
            .collect()
    }

    #[test]
    fn test_create_and_lookup() {
        let mut store = ThreadStore::new();
        let thread = store.create(1, "p1", &entries(3, 0));

        assert_eq!(thread.messages.len(), 3);
        assert_eq!(thread.messages[0].source_message_id, Some(1));
        assert!(store.get_thread(&thread.thread_id).is_some());
        assert_eq!(store.get_active_threads(1).len(), 1);
        assert!(store.get_active_threads(2).is_empty());
    }

    #[test]
    fn test_current_thread_and_end() {
        let mut store = ThreadStore::new();
        let a = store.create(1, "p1", &[]);
        let b = store.create(1, "p1", &[]);

        store.set_current_thread(1, &b.thread_id).unwrap();
        assert_eq!(store.get_current_thread_id(1), Some(b.thread_id.as_str()));

        let ended = store.end_thread(&b.thread_id).unwrap();
        assert_eq!(ended.thread_id, b.thread_id);
        assert!(store.get_current_thread_id(1).is_none());
        assert!(store.get_thread(&b.thread_id).is_none());
        assert!(store.end_thread(&b.thread_id).is_none());
        assert_eq!(store.get_active_threads(1)[0].thread_id, a.thread_id);
    }

    #[test]
    fn test_set_current_rejects_foreign_thread() {
        let mut store = ThreadStore::new();
        let t = store.create(1, "p1", &[]);
        let err = store.set_current_thread(2, &t.thread_id).unwrap_err();
        assert!(matches!(err, ProactiveError::ForeignThread { .. }));
        assert!(store.get_current_thread_id(2).is_none());
    }

    #[test]
    fn test_append_group_messages_subset_and_dedup() {
        let mut store = ThreadStore::new();
        let seed = entries(2, 0);
        let t = store.create(1, "p1", &seed);

        let more = entries(5, 0);
        let added = store
            .append_group_messages(&t.thread_id, &more, Some(&[2, 4]))
            .unwrap();
        assert_eq!(added, 1); // 2 already present

        let added = store.append_group_messages(&t.thread_id, &more, None).unwrap();
        assert_eq!(added, 2); // 3 and 5

        let ids: Vec<Option<i64>> = store
            .get_thread(&t.thread_id)
            .unwrap()
            .messages
            .iter()
            .map(|m| m.source_message_id)
            .collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(4), Some(3), Some(5)]);
    }

    #[test]
    fn test_replace_earliest_with_summary() {
        let mut store = ThreadStore::new();
        let t = store.create(1, "p1", &entries(25, 0));

        let replaced = store
            .replace_earliest_with_summary(&t.thread_id, 10, "S")
            .unwrap();
        assert_eq!(replaced, 10);

        let thread = store.get_thread(&t.thread_id).unwrap();
        assert_eq!(thread.messages.len(), 25 - 10 + 1);
        assert!(thread.messages[0].is_summary());
        assert!(thread.messages[0].content.ends_with('S'));
        assert_eq!(thread.messages[1].source_message_id, Some(11));

        let formatted = store.get_context_formatted(&t.thread_id).unwrap();
        assert_eq!(formatted.lines().count(), 16);
        assert!(formatted.lines().next().unwrap().contains("Summary"));
    }

    #[test]
    fn test_keep_only_message_indices() {
        let mut store = ThreadStore::new();
        let t = store.create(1, "p1", &entries(5, 0));

        let kept = store
            .keep_only_message_indices(&t.thread_id, &[4, 0, 2, 99])
            .unwrap();
        assert_eq!(kept, 3);

        let indexed = store.get_context_formatted_with_indices(&t.thread_id).unwrap();
        let lines: Vec<&str> = indexed.lines().collect();
        assert!(lines[0].starts_with("[0]") && lines[0].ends_with("message 1"));
        assert!(lines[1].starts_with("[1]") && lines[1].ends_with("message 3"));
        assert!(lines[2].starts_with("[2]") && lines[2].ends_with("message 5"));
    }

    #[test]
    fn test_last_activity_is_monotonic() {
        let mut store = ThreadStore::new();
        let future = now_ms() + 60_000;
        let t = store.create_at(1, "p1", &[], future);

        let mut old = ThreadMessage::bot_reply("late");
        old.created_at = 5;
        store.append_message(&t.thread_id, old).unwrap();

        assert_eq!(store.get_thread(&t.thread_id).unwrap().last_activity_at, future);
    }

    #[test]
    fn test_idle_thread_ids_respects_grace() {
        let mut store = ThreadStore::new();
        let now = 10_000_000;
        let old_seed = entries(2, 0);

        let current = store.create_at(1, "p1", &old_seed, now - 100_000);
        store.thread_mut(&current.thread_id).unwrap().touch(now - 1_000);
        let stale = store.create_at(1, "p1", &old_seed, now - 500_000);
        store.current.insert(1, current.thread_id.clone());

        let idle = store.idle_thread_ids(1, now, 60_000, 5_000);
        assert_eq!(idle, vec![stale.thread_id.clone()]);

        // Once the grace window has passed, the current thread goes too.
        let idle = store.idle_thread_ids(1, now + 10_000, 60_000, 5_000);
        assert_eq!(idle.len(), 2);
    }

    #[test]
    fn test_idle_counts_from_creation_for_old_seed() {
        let mut store = ThreadStore::new();
        let now = 10_000_000;

        // Seeded from messages far older than the timeout, created just now
        let thread = store.create_at(1, "p1", &entries(3, 0), now);

        assert!(store.idle_thread_ids(1, now + 30_000, 60_000, 5_000).is_empty());
        assert_eq!(
            store.idle_thread_ids(1, now + 61_000, 60_000, 5_000),
            vec![thread.thread_id]
        );
    }

    #[test]
    fn test_last_seen_survives_pruning() {
        let mut store = ThreadStore::new();
        let thread = store.create(1, "p1", &entries(3, 0));
        assert_eq!(thread.last_seen.map(|m| m.message_id), Some(3));

        let newer = vec![GroupMessageEntry::user(4, 104, "message 4").at(10)];
        store.append_group_messages(&thread.thread_id, &newer, None).unwrap();
        store.keep_only_message_indices(&thread.thread_id, &[0]).unwrap();

        let t = store.get_thread(&thread.thread_id).unwrap();
        assert_eq!(t.messages.len(), 1);
        assert_eq!(t.last_source_message_id(), Some(1));
        assert_eq!(t.last_seen.map(|m| m.message_id), Some(4));
    }
}
