//! Session management commands.

use chrono::{DateTime, Local, Utc};

use parley_core::{Config, Message, Role, Session, SessionLink};
use parley_session::{
    open_backend, ContextUsage, ExcerptSummarizer, PersistenceManager, SessionStore,
    SessionSummary, StoreSettings,
};

use crate::{ExportFormat, SessionAction};

/// Format a datetime for display.
fn format_time(dt: &DateTime<Utc>) -> String {
    let local: DateTime<Local> = dt.with_timezone(&Local);
    local.format("%Y-%m-%d %H:%M").to_string()
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn format_link(link: Option<&SessionLink>) -> String {
    match link {
        Some(SessionLink::Assistant(id)) => format!("assistant {}", id),
        Some(SessionLink::ScheduledTask(id)) => format!("scheduled task {}", id),
        Some(SessionLink::Pipeline(id)) => format!("pipeline {}", id),
        None => "-".to_string(),
    }
}

/// Format a session summary for display.
fn format_session_summary(s: &SessionSummary) -> String {
    let title = s.title.as_deref().unwrap_or("(untitled)");
    format!(
        "{} {} {} ({} msgs, {} archived, {} tokens)",
        short_id(&s.id),
        title,
        format_time(&s.last_accessed_at),
        s.message_count,
        s.archived_count,
        s.total_tokens
    )
}

/// Open storage, start persistence and load every session.
pub async fn open_store(config: &Config) -> anyhow::Result<SessionStore> {
    config.validate().into_result()?;

    let storage = open_backend(config.storage.backend, config.storage.data_dir())?;
    let persistence = PersistenceManager::start(storage, config.persistence.clone());
    let store = SessionStore::new(persistence, StoreSettings::from_config(config));
    store.restore().await?;
    Ok(store)
}

pub async fn handle(action: SessionAction, config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;

    let outcome = execute(&store, action).await;

    // Always flush, even when the command failed
    store.shutdown().await?;
    outcome
}

async fn execute(store: &SessionStore, action: SessionAction) -> anyhow::Result<()> {
    match action {
        SessionAction::List { limit, json } => list_sessions(store, limit, json)?,
        SessionAction::Show { id, messages } => {
            let id = store.resolve_prefix(&id)?;
            show_session(store, &id, messages)?;
        }
        SessionAction::New {
            title,
            assistant,
            task,
            pipeline,
        } => {
            let link = assistant
                .map(SessionLink::Assistant)
                .or(task.map(SessionLink::ScheduledTask))
                .or(pipeline.map(SessionLink::Pipeline));
            let id = store.create(link)?;
            if title.is_some() {
                store.update_title(&id, title)?;
            }
            println!("{}", id);
        }
        SessionAction::Add {
            text,
            session,
            role,
            tokens,
            compact,
            context_window,
        } => {
            let id = session.map(|s| store.resolve_prefix(&s)).transpose()?;

            let mut message = Message::new(Role::from(role), text);
            if let Some(tokens) = tokens {
                message = message.with_actual_tokens(tokens);
            }
            let id = store.append_or_create(id.as_deref(), message)?;

            if compact {
                if let Some(result) = store
                    .compact_if_needed(&id, &ExcerptSummarizer, context_window)
                    .await?
                {
                    println!(
                        "Compacted {} messages ({:.0}% smaller)",
                        result.archived_messages.len(),
                        result.compression_ratio() * 100.0
                    );
                }
            }
            println!("{}", id);
        }
        SessionAction::Title { id, title, clear } => {
            let id = store.resolve_prefix(&id)?;
            match (title, clear) {
                (_, true) => {
                    store.update_title(&id, None)?;
                    println!("Title cleared");
                }
                (Some(title), false) => {
                    store.update_title(&id, Some(title))?;
                    let session = store.get(&id)?;
                    println!("Title set to: {}", session.title().unwrap_or("(untitled)"));
                }
                (None, false) => {
                    let session = store.get(&id)?;
                    println!("Title: {}", session.title().unwrap_or("(untitled)"));
                }
            }
        }
        SessionAction::Clear { id } => {
            let id = store.resolve_prefix(&id)?;
            store.clear(&id)?;
            println!("Cleared session: {}", id);
        }
        SessionAction::Copy { id } => {
            let id = store.resolve_prefix(&id)?;
            let new_id = store.copy(&id)?;
            println!("{}", new_id);
        }
        SessionAction::Delete { id } => {
            let id = store.resolve_prefix(&id)?;
            store.delete(&id).await?;
            println!("Deleted session: {}", id);
        }
        SessionAction::Compact {
            id,
            strategy,
            context_window,
            force,
        } => {
            let id = store.resolve_prefix(&id)?;
            compact_session(store, &id, strategy, context_window, force).await?;
        }
        SessionAction::Export {
            id,
            format,
            archive,
        } => {
            let id = store.resolve_prefix(&id)?;
            let session = store.get(&id)?;
            match format {
                ExportFormat::Json => println!("{}", serde_json::to_string_pretty(&session)?),
                ExportFormat::Markdown => print!("{}", render_markdown(&session, archive)),
            }
        }
    }

    Ok(())
}

fn list_sessions(store: &SessionStore, limit: usize, json: bool) -> anyhow::Result<()> {
    let sessions: Vec<SessionSummary> = store.list().into_iter().take(limit).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!("Sessions ({} of {}):", sessions.len(), store.len());
    println!();

    for session in &sessions {
        println!("{}", format_session_summary(session));
    }

    println!();
    println!("Use 'parley session show <id>' for details");

    Ok(())
}

fn show_session(store: &SessionStore, id: &str, recent: usize) -> anyhow::Result<()> {
    let session = store.get(id)?;
    let usage = ContextUsage::measure(session.messages(), None);
    let config = session.compression_config();

    println!("Session: {}", session.id());
    println!("================================================================================");
    println!();
    println!("Title:       {}", session.title().unwrap_or("(untitled)"));
    println!("Linked to:   {}", format_link(session.link()));
    println!();
    println!("Created:     {}", format_time(&session.created_at()));
    println!("Last Access: {}", format_time(&session.last_accessed_at()));
    println!();
    println!("Messages:    {}", usage.message_count);
    println!("Tokens:      {}", usage.total_tokens);
    println!("Archived:    {}", session.archived_messages().len());
    println!("Compactions: {}", session.compression_count());
    println!();
    println!("Compaction:");
    println!("  Strategy:  {}", config.strategy);
    println!(
        "  Full replacement at {} messages",
        config.full_replacement_message_threshold
    );
    println!(
        "  Sliding window at {} messages, keeping {}",
        config.sliding_window_message_threshold, config.sliding_window_keep_last
    );
    println!(
        "  Token based at {:.0}% of the window, keeping {:.0}%",
        config.token_based_threshold_percent * 100.0,
        config.token_based_keep_percent * 100.0
    );

    // Show recent messages
    let messages = session.messages();
    if recent > 0 && !messages.is_empty() {
        println!();
        println!("Recent Messages:");
        println!("----------------");

        let start = messages.len().saturating_sub(recent);
        for (idx, msg) in messages[start..].iter().enumerate() {
            println!("[{}] {}: {}", start + idx, msg.role.label(), preview(&msg.content.as_text(), 80));
        }
    }

    Ok(())
}

async fn compact_session(
    store: &SessionStore,
    id: &str,
    strategy: Option<parley_core::CompressionStrategy>,
    context_window: Option<u64>,
    force: bool,
) -> anyhow::Result<()> {
    if let Some(strategy) = strategy {
        let mut config = store.get(id)?.compression_config().clone();
        config.strategy = strategy;
        store.set_compression_config(id, config)?;
    }

    let result = if force {
        Some(store.compact(id, &ExcerptSummarizer, context_window).await?)
    } else {
        store
            .compact_if_needed(id, &ExcerptSummarizer, context_window)
            .await?
    };

    match result {
        Some(result) if result.summary_generated => {
            println!(
                "Compacted {} -> {} messages ({:.0}% smaller, {} archived)",
                result.original_message_count,
                result.new_message_count,
                result.compression_ratio() * 100.0,
                result.archived_messages.len()
            );
        }
        Some(_) => println!("Nothing to compact"),
        None => println!("Session is below its compaction threshold (use --force to compact anyway)"),
    }

    // Compaction rewrites history; do not leave it to the background loop
    store.save_now(id).await?;
    Ok(())
}

/// One-line preview, cut on a character boundary.
fn preview(text: &str, max_chars: usize) -> String {
    let line = text.replace('\n', " ");
    if line.chars().count() > max_chars {
        let cut: String = line.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        line
    }
}

fn render_markdown(session: &Session, include_archive: bool) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "# Session: {}\n\n",
        session.title().unwrap_or("Untitled")
    ));
    out.push_str(&format!("- **ID:** `{}`\n", session.id()));
    out.push_str(&format!("- **Created:** {}\n", format_time(&session.created_at())));
    out.push_str(&format!("- **Compactions:** {}\n\n", session.compression_count()));

    let mut section = |heading: &str, messages: &[Message]| {
        out.push_str(&format!("## {}\n\n", heading));
        for msg in messages {
            let role = match msg.role {
                Role::User => "**User**",
                Role::Assistant => "**Assistant**",
                Role::System => "**System**",
            };
            out.push_str(&format!("{}\n\n{}\n\n---\n\n", role, msg.content.as_text()));
        }
    };

    if include_archive && !session.archived_messages().is_empty() {
        section("Archived", session.archived_messages());
    }
    section("Conversation", session.messages());

    out
}
