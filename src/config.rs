//! Configuration management
//!
//! Scheduler tuning comes from environment variables; per-group persona
//! settings come from a TOML file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ProactiveError;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct ProactiveConfig {
    /// Delay after the last inbound event before analysis runs
    pub debounce: Duration,

    /// Inbound events per group before compression is scheduled
    pub compression_threshold: usize,

    /// Threads with no messages for this long are ended
    pub idle_timeout: Duration,

    /// Recent-activity window that spares the current thread from idle ending
    pub grace_window: Duration,

    /// Size of the recent-message window fetched for analysis
    pub history_limit: usize,

    /// Thread size above which the oldest segment gets summarized
    pub summary_ceiling: usize,

    /// Number of oldest messages collapsed into one summary
    pub summary_segment: usize,

    /// Minimum thread size before topic cleaning is attempted
    pub topic_clean_min_messages: usize,

    /// Maximum knowledge snippets injected into a reply
    pub knowledge_limit: usize,

    /// Provider name handed to the reply generator
    pub provider: String,

    /// SQLite path for the ended-thread archive
    pub db_path: PathBuf,

    /// TOML file with group and persona settings
    pub groups_file: Option<PathBuf>,

    /// Anthropic API key (required by the binary)
    pub anthropic_api_key: Option<String>,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            compression_threshold: 10,
            idle_timeout: Duration::from_secs(30 * 60),
            grace_window: Duration::from_secs(60),
            history_limit: 30,
            summary_ceiling: 30,
            summary_segment: 10,
            topic_clean_min_messages: 8,
            knowledge_limit: 5,
            provider: "sonnet".to_string(),
            db_path: PathBuf::from("groupbot_threads.db"),
            groups_file: None,
            anthropic_api_key: None,
        }
    }
}

impl ProactiveConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let debounce = env_parse("GROUPBOT_DEBOUNCE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.debounce);

        let idle_timeout = env_parse("GROUPBOT_IDLE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.idle_timeout);

        let grace_window = env_parse("GROUPBOT_GRACE_WINDOW_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.grace_window);

        let db_path = std::env::var("GROUPBOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".local/share/groupbot/threads.db"))
                    .unwrap_or(defaults.db_path.clone())
            });

        Ok(Self {
            debounce,
            compression_threshold: env_parse("GROUPBOT_COMPRESSION_THRESHOLD")?
                .unwrap_or(defaults.compression_threshold),
            idle_timeout,
            grace_window,
            history_limit: env_parse("GROUPBOT_HISTORY_LIMIT")?.unwrap_or(defaults.history_limit),
            summary_ceiling: env_parse("GROUPBOT_SUMMARY_CEILING")?
                .unwrap_or(defaults.summary_ceiling),
            summary_segment: env_parse("GROUPBOT_SUMMARY_SEGMENT")?
                .unwrap_or(defaults.summary_segment),
            topic_clean_min_messages: env_parse("GROUPBOT_TOPIC_CLEAN_MIN")?
                .unwrap_or(defaults.topic_clean_min_messages),
            knowledge_limit: env_parse("GROUPBOT_KNOWLEDGE_LIMIT")?
                .unwrap_or(defaults.knowledge_limit),
            provider: std::env::var("GROUPBOT_PROVIDER").unwrap_or(defaults.provider),
            db_path,
            groups_file: std::env::var("GROUPBOT_GROUPS_FILE").ok().map(PathBuf::from),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
        })
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}

/// Persona configuration for one preference key
#[derive(Debug, Clone, Deserialize)]
pub struct PersonaSettings {
    /// Template rendered into the persona block
    pub template: String,

    /// Short description used when summarizing the persona for classifiers
    #[serde(default)]
    pub description: Option<String>,
}

/// Allowed preference keys for one group
#[derive(Debug, Clone, Deserialize)]
pub struct GroupEntry {
    pub preferences: Vec<String>,
}

/// Group and persona settings
///
/// ```toml
/// [personas.cooking]
/// template = "You are a friendly home cook..."
///
/// [groups.12345]
/// preferences = ["cooking"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupSettings {
    #[serde(default)]
    pub personas: HashMap<String, PersonaSettings>,

    /// Keyed by group id in decimal form (TOML keys are strings)
    #[serde(default)]
    pub groups: HashMap<String, GroupEntry>,
}

impl GroupSettings {
    /// Parse settings from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse group settings")
    }

    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&text)
    }

    /// Register a persona (builder style, mostly for tests)
    pub fn with_persona(mut self, key: &str, template: &str) -> Self {
        self.personas.insert(
            key.to_string(),
            PersonaSettings {
                template: template.to_string(),
                description: None,
            },
        );
        self
    }

    /// Allow a preference key in a group
    pub fn with_group(mut self, group_id: i64, keys: &[&str]) -> Self {
        self.groups.insert(
            group_id.to_string(),
            GroupEntry {
                preferences: keys.iter().map(|k| k.to_string()).collect(),
            },
        );
        self
    }

    /// Preference keys configured for a group
    pub fn preference_keys(&self, group_id: i64) -> &[String] {
        self.groups
            .get(&group_id.to_string())
            .map(|g| g.preferences.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `key` is in the group's allow-list
    pub fn is_allowed(&self, group_id: i64, key: &str) -> bool {
        self.preference_keys(group_id).iter().any(|k| k == key)
    }

    /// Fail with a configuration error unless `key` is allowed in the group
    pub fn check_allowed(&self, group_id: i64, key: &str) -> Result<(), ProactiveError> {
        if self.is_allowed(group_id, key) {
            Ok(())
        } else {
            Err(ProactiveError::PreferenceNotAllowed {
                group_id,
                key: key.to_string(),
            })
        }
    }

    /// Persona template for a preference key
    pub fn template(&self, key: &str) -> Option<&str> {
        self.personas.get(key).map(|p| p.template.as_str())
    }

    /// Short persona summary for classifiers; falls back to the template
    pub fn summary(&self, key: &str) -> Option<&str> {
        self.personas
            .get(key)
            .map(|p| p.description.as_deref().unwrap_or(&p.template))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_group_settings() {
        let settings = GroupSettings::from_toml(
            r#"
            [personas.cooking]
            template = "You love food."
            description = "food fan"

            [personas.games]
            template = "You play games."

            [groups.42]
            preferences = ["cooking", "games"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.preference_keys(42).len(), 2);
        assert!(settings.is_allowed(42, "games"));
        assert!(!settings.is_allowed(7, "games"));
        assert_eq!(settings.summary("cooking"), Some("food fan"));
        assert_eq!(settings.summary("games"), Some("You play games."));
    }

    #[test]
    fn test_check_allowed() {
        let settings = GroupSettings::default()
            .with_persona("p1", "persona one")
            .with_group(1, &["p1"]);

        assert!(settings.check_allowed(1, "p1").is_ok());
        assert!(matches!(
            settings.check_allowed(1, "p2"),
            Err(ProactiveError::PreferenceNotAllowed { .. })
        ));
    }

    #[test]
    fn test_defaults() {
        let config = ProactiveConfig::default();
        assert_eq!(config.debounce, Duration::from_secs(1));
        assert_eq!(config.compression_threshold, 10);
        assert!(config.grace_window < config.idle_timeout);
    }
}
