//! Client history normalization.
//!
//! Browser clients send entries shaped roughly like `{ role, content }`, but
//! older builds and third-party frontends use `who`, `text` or `message`.
//! Everything is folded into the two-role [`Turn`] schema here.

use relay_llm::{Role, Turn, clamp_tail};
use serde_json::Value;

/// Field names consulted for the role label, highest priority first.
pub const ROLE_FIELDS: &[&str] = &["role", "who"];

/// Field names consulted for the message text, highest priority first.
pub const TEXT_FIELDS: &[&str] = &["content", "text", "message"];

const RESPONDER_LABELS: &[&str] = &["assistant", "bot", "model", "system"];

/// First field in `fields` holding a non-empty string.
pub fn first_string_field<'a>(entry: &'a Value, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .filter_map(|field| entry.get(*field).and_then(Value::as_str))
        .find(|value| !value.is_empty())
}

pub fn resolve_role(label: Option<&str>) -> Role {
    let Some(label) = label else {
        return Role::User;
    };
    let label = label.to_lowercase();
    if RESPONDER_LABELS.contains(&label.as_str()) {
        Role::Assistant
    } else {
        Role::User
    }
}

/// `None` for non-object entries and entries whose text trims to nothing.
pub fn normalize_entry(entry: &Value, max_chars: usize) -> Option<Turn> {
    if !entry.is_object() {
        return None;
    }
    let role = resolve_role(first_string_field(entry, ROLE_FIELDS));
    let text = match first_string_field(entry, TEXT_FIELDS) {
        Some(text) => text.to_string(),
        None => entry.to_string(),
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(Turn {
        role,
        text: clamp_tail(text, max_chars),
    })
}

pub fn normalize(entries: &[Value], max_chars: usize) -> Vec<Turn> {
    entries
        .iter()
        .filter_map(|entry| normalize_entry(entry, max_chars))
        .collect()
}
