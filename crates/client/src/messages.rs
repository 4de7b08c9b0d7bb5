//! Transcript message upsert.
//!
//! Appended and updated events both upsert by id. Updates may race ahead of
//! their own creation event, so an update for an unknown id builds a
//! placeholder that the later append merges into.
//!
//! `finalized` holds ids a content-bearing update has completed. The creation
//! event is older than any update, so merging it must not mark such a
//! message in progress again.

use std::collections::HashSet;

use orbitdock_protocol::{Message, MessageChanges, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged,
    Placeholder,
}

pub fn upsert_appended(
    messages: &mut Vec<Message>,
    finalized: &HashSet<String>,
    incoming: Message,
) -> UpsertOutcome {
    match messages.iter_mut().find(|m| m.id == incoming.id) {
        Some(existing) => {
            let settled = finalized.contains(&existing.id);
            merge_message(existing, incoming, settled);
            UpsertOutcome::Merged
        }
        None => {
            messages.push(incoming);
            UpsertOutcome::Inserted
        }
    }
}

pub fn upsert_updated(
    messages: &mut Vec<Message>,
    finalized: &mut HashSet<String>,
    session_id: &str,
    message_id: &str,
    changes: MessageChanges,
    now: &str,
) -> UpsertOutcome {
    let (outcome, content_bearing) = match messages.iter_mut().find(|m| m.id == message_id) {
        Some(existing) => (UpsertOutcome::Merged, apply_changes(existing, changes)),
        None => {
            let mut placeholder = placeholder_for(session_id, message_id, &changes, now);
            let content_bearing = apply_changes(&mut placeholder, changes);
            messages.push(placeholder);
            (UpsertOutcome::Placeholder, content_bearing)
        }
    };
    if content_bearing {
        finalized.insert(message_id.to_string());
    }
    outcome
}

/// Rebuild a list with unique ids, later duplicates merging into the first.
pub fn dedupe(messages: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let none = HashSet::new();
    for message in messages {
        upsert_appended(&mut out, &none, message);
    }
    out
}

/// The creation event is authoritative for the type; every other field keeps
/// the existing value unless the incoming one carries something.
fn merge_message(existing: &mut Message, incoming: Message, settled: bool) {
    existing.message_type = incoming.message_type;
    prefer_text(&mut existing.session_id, incoming.session_id);
    prefer_text(&mut existing.content, incoming.content);
    prefer_opt_text(&mut existing.tool_name, incoming.tool_name);
    prefer_opt_text(&mut existing.tool_input, incoming.tool_input);
    prefer_opt_text(&mut existing.tool_output, incoming.tool_output);
    prefer_text(&mut existing.timestamp, incoming.timestamp);
    prefer_opt(&mut existing.duration_ms, incoming.duration_ms);
    prefer_opt(&mut existing.input_tokens, incoming.input_tokens);
    prefer_opt(&mut existing.output_tokens, incoming.output_tokens);
    existing.is_error |= incoming.is_error;
    existing.is_in_progress = !settled && (existing.is_in_progress || incoming.is_in_progress);
}

/// Returns whether the update carried content.
fn apply_changes(existing: &mut Message, changes: MessageChanges) -> bool {
    let content_bearing = has_text(&changes.content) || has_text(&changes.tool_output);

    prefer_text(&mut existing.content, changes.content.unwrap_or_default());
    prefer_opt_text(&mut existing.tool_name, changes.tool_name);
    prefer_opt_text(&mut existing.tool_input, changes.tool_input);
    prefer_opt_text(&mut existing.tool_output, changes.tool_output);
    if let Some(is_error) = changes.is_error {
        existing.is_error = is_error;
    }
    prefer_opt(&mut existing.duration_ms, changes.duration_ms);
    prefer_opt(&mut existing.input_tokens, changes.input_tokens);
    prefer_opt(&mut existing.output_tokens, changes.output_tokens);

    existing.is_in_progress = if content_bearing {
        false
    } else {
        existing.is_in_progress || changes.is_in_progress == Some(true)
    };
    content_bearing
}

fn placeholder_for(
    session_id: &str,
    message_id: &str,
    changes: &MessageChanges,
    now: &str,
) -> Message {
    let looks_like_tool = changes.tool_name.is_some()
        || changes.tool_input.is_some()
        || changes.tool_output.is_some();
    Message {
        id: message_id.to_string(),
        session_id: session_id.to_string(),
        message_type: if looks_like_tool {
            MessageType::Tool
        } else {
            MessageType::Assistant
        },
        content: String::new(),
        tool_name: None,
        tool_input: None,
        tool_output: None,
        is_error: false,
        is_in_progress: false,
        timestamp: now.to_string(),
        duration_ms: None,
        input_tokens: None,
        output_tokens: None,
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

fn prefer_text(existing: &mut String, incoming: String) {
    if !incoming.is_empty() {
        *existing = incoming;
    }
}

fn prefer_opt_text(existing: &mut Option<String>, incoming: Option<String>) {
    if let Some(value) = incoming.filter(|v| !v.is_empty()) {
        *existing = Some(value);
    }
}

fn prefer_opt<T>(existing: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *existing = incoming;
    }
}
