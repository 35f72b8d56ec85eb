//! GroupBot Proactive - Console Driver
//!
//! Reads `<group_id> <user_id> <text>` lines from stdin, records them as
//! group messages and lets the scheduler decide when to speak. Replies are
//! logged.

use groupbot_proactive::{
    ClaudeClient, Collaborators, GroupMessageEntry, GroupSettings, InMemoryHistory, LogSink,
    ProactiveConfig, ProactiveScheduler, SqliteThreadArchive,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("GroupBot Proactive v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: groupbot-proactive < messages.txt");
        println!();
        println!("Each stdin line: <group_id> <user_id> <text>");
        println!();
        println!("Environment variables:");
        println!("  ANTHROPIC_API_KEY          Claude API key (required)");
        println!("  GROUPBOT_GROUPS_FILE       TOML file with personas and groups");
        println!("  GROUPBOT_DB_PATH           SQLite archive for ended threads");
        println!("  GROUPBOT_DEBOUNCE_MS       Debounce delay (default: 1000)");
        println!("  GROUPBOT_LOG_JSON          Log as JSON to stderr");
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if std::env::var("GROUPBOT_LOG_JSON").is_ok() {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("GroupBot Proactive v{}", env!("CARGO_PKG_VERSION"));

    let config = ProactiveConfig::from_env()?;
    if config.anthropic_api_key.is_none() {
        anyhow::bail!("ANTHROPIC_API_KEY not set");
    }

    let settings = match config.groups_file {
        Some(ref path) => GroupSettings::load(path)?,
        None => anyhow::bail!("GROUPBOT_GROUPS_FILE not set"),
    };

    let claude = Arc::new(ClaudeClient::from_config(&config));
    let history = Arc::new(InMemoryHistory::new());
    let archive = Arc::new(SqliteThreadArchive::open(&config.db_path)?);

    let collaborators = Collaborators::new(
        history.clone(),
        claude.clone(),
        claude.clone(),
        Arc::new(LogSink),
        archive,
        claude.clone(),
    )
    .with_topic_filter(claude);

    let scheduler = ProactiveScheduler::new(config, Arc::new(settings), collaborators);
    let mut seen_groups = HashSet::new();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some((group_id, user_id, text)) = parse_line(&line) else {
            if !line.trim().is_empty() {
                warn!("Ignoring malformed line: {}", line);
            }
            continue;
        };

        let message_id = history.next_message_id(group_id);
        history.push(group_id, GroupMessageEntry::user(message_id, user_id, text));
        seen_groups.insert(group_id);
        scheduler.schedule(group_id, Some(user_id), false);
    }

    // Input closed: let armed timers fire, then drain every queue.
    tokio::time::sleep(scheduler.config().debounce * 2).await;
    for group_id in seen_groups {
        scheduler.flush(group_id).await;
    }

    let stats = scheduler.stats();
    info!(
        "Done: {} triggers, {} analyses, {} replies, {} threads created",
        stats.scheduled, stats.analyses_run, stats.replies_sent, stats.threads_created
    );
    Ok(())
}

fn parse_line(line: &str) -> Option<(i64, i64, &str)> {
    let mut parts = line.trim().splitn(3, ' ');
    let group_id = parts.next()?.parse().ok()?;
    let user_id = parts.next()?.parse().ok()?;
    let text = parts.next()?.trim();
    if text.is_empty() {
        return None;
    }
    Some((group_id, user_id, text))
}
