//! Group History
//!
//! Read-only view of recent group messages plus the transcript helpers
//! shared by analysis and thread formatting.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Maximum entries the in-memory source keeps per group
const DEFAULT_WINDOW: usize = 200;

/// Content markers for entries that carry no readable text
const PLACEHOLDERS: &[&str] = &[
    "[image]", "[photo]", "[sticker]", "[voice]", "[audio]", "[video]", "[file]", "[document]",
];

/// One message as recorded by the chat platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessageEntry {
    pub message_id: i64,
    pub user_id: i64,
    pub nickname: Option<String>,
    pub content: String,
    pub is_bot_reply: bool,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    #[serde(default)]
    pub was_at_bot: bool,
}

impl GroupMessageEntry {
    /// Create a user message stamped with the current time
    pub fn user(message_id: i64, user_id: i64, content: &str) -> Self {
        Self {
            message_id,
            user_id,
            nickname: None,
            content: content.to_string(),
            is_bot_reply: false,
            created_at: chrono::Utc::now().timestamp_millis(),
            was_at_bot: false,
        }
    }

    /// Set nickname
    pub fn with_nickname(mut self, nickname: &str) -> Self {
        self.nickname = Some(nickname.to_string());
        self
    }

    /// Override timestamp
    pub fn at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether the entry has text worth showing to a model
    pub fn is_readable(&self) -> bool {
        let trimmed = self.content.trim();
        !trimmed.is_empty() && !PLACEHOLDERS.iter().any(|p| trimmed.eq_ignore_ascii_case(p))
    }

    /// Display name for transcripts
    pub fn display_name(&self) -> String {
        if self.is_bot_reply {
            return "Bot".to_string();
        }
        match &self.nickname {
            Some(n) if !n.trim().is_empty() => n.clone(),
            _ => format!("user{}", self.user_id),
        }
    }

    /// Ordering key used for "newer than" comparisons
    pub fn mark(&self) -> MessageMark {
        MessageMark {
            created_at: self.created_at,
            message_id: self.message_id,
        }
    }
}

/// Position of a message in a group's timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageMark {
    pub created_at: i64,
    pub message_id: i64,
}

/// Source of recent group messages
#[async_trait]
pub trait GroupHistorySource: Send + Sync {
    /// Most recent `limit` entries for a group, oldest first
    async fn get_recent(&self, group_id: i64, limit: usize) -> Result<Vec<GroupMessageEntry>>;

    /// Human-readable transcript with stable per-line identifiers
    fn format(&self, entries: &[GroupMessageEntry]) -> String {
        format_entries(entries)
    }
}

/// Keep only entries with readable text
pub fn filter_readable(entries: Vec<GroupMessageEntry>) -> Vec<GroupMessageEntry> {
    entries.into_iter().filter(|e| e.is_readable()).collect()
}

/// Format a timestamp (ms) as HH:MM:SS UTC
pub fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

/// Default transcript format: `#<id> [HH:MM:SS] <name>: <content>`
pub fn format_entries(entries: &[GroupMessageEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            let at = if e.was_at_bot { " (@bot)" } else { "" };
            format!(
                "#{} [{}] {}{}: {}",
                e.message_id,
                format_time(e.created_at),
                e.display_name(),
                at,
                e.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Newest non-bot entry in a window
pub fn newest_user_mark(entries: &[GroupMessageEntry]) -> Option<MessageMark> {
    entries
        .iter()
        .filter(|e| !e.is_bot_reply)
        .map(|e| e.mark())
        .max()
}

/// In-memory rolling history per group
pub struct InMemoryHistory {
    groups: Mutex<HashMap<i64, VecDeque<GroupMessageEntry>>>,
    window: usize,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            window: window.max(1),
        }
    }

    /// Record a message, trimming the oldest beyond the window
    pub fn push(&self, group_id: i64, entry: GroupMessageEntry) {
        let mut groups = match self.groups.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let log = groups.entry(group_id).or_default();
        log.push_back(entry);
        while log.len() > self.window {
            log.pop_front();
        }
    }

    /// Next message id for a group (max + 1)
    pub fn next_message_id(&self, group_id: i64) -> i64 {
        let groups = match self.groups.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        groups
            .get(&group_id)
            .and_then(|log| log.iter().map(|e| e.message_id).max())
            .map(|id| id + 1)
            .unwrap_or(1)
    }

    /// Number of stored entries for a group
    pub fn len(&self, group_id: i64) -> usize {
        self.groups
            .lock()
            .map(|g| g.get(&group_id).map(|l| l.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupHistorySource for InMemoryHistory {
    async fn get_recent(&self, group_id: i64, limit: usize) -> Result<Vec<GroupMessageEntry>> {
        let groups = self
            .groups
            .lock()
            .map_err(|e| anyhow::anyhow!("history lock poisoned: {}", e))?;
        let Some(log) = groups.get(&group_id) else {
            return Ok(vec![]);
        };
        let skip = log.len().saturating_sub(limit);
        Ok(log.iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readable_filter() {
        let entries = vec![
            GroupMessageEntry::user(1, 10, "hello"),
            GroupMessageEntry::user(2, 10, "   "),
            GroupMessageEntry::user(3, 11, "[Sticker]"),
            GroupMessageEntry::user(4, 11, "[image] look at this"),
        ];
        let kept = filter_readable(entries);
        let ids: Vec<i64> = kept.iter().map(|e| e.message_id).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn test_format_entries() {
        let mut bot = GroupMessageEntry::user(2, 0, "hi all").at(0);
        bot.is_bot_reply = true;
        let entries = vec![
            GroupMessageEntry::user(1, 10, " hey ").with_nickname("Max").at(0),
            bot,
        ];
        let text = format_entries(&entries);
        assert_eq!(text, "#1 [00:00:00] Max: hey\n#2 [00:00:00] Bot: hi all");
    }

    #[test]
    fn test_newest_user_mark_skips_bot() {
        let mut bot = GroupMessageEntry::user(3, 0, "reply").at(300);
        bot.is_bot_reply = true;
        let entries = vec![
            GroupMessageEntry::user(1, 10, "a").at(100),
            GroupMessageEntry::user(2, 11, "b").at(200),
            bot,
        ];
        let mark = newest_user_mark(&entries).unwrap();
        assert_eq!(mark.message_id, 2);
    }

    #[tokio::test]
    async fn test_in_memory_window() {
        let history = InMemoryHistory::with_window(3);
        for i in 1..=5 {
            history.push(9, GroupMessageEntry::user(i, 1, &format!("m{}", i)));
        }
        assert_eq!(history.len(9), 3);
        assert_eq!(history.next_message_id(9), 6);

        let recent = history.get_recent(9, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message_id, 4);
        assert_eq!(recent[1].message_id, 5);

        assert!(history.get_recent(1, 10).await.unwrap().is_empty());
    }
}
