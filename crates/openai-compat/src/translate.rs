//! Chat-completions to generateContent translation, both directions.
//!
//! The upstream knows two conversation roles, `user` and `model`, and has no
//! system slot in the request body. System text is folded forward: it is held
//! pending and prepended to the next user message, one fold per system
//! message. A later system message before any user message replaces the
//! pending text rather than stacking.

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::types::{
    AssistantMessage, ChatCompletionResponse, ChatMessage, Choice, Usage,
};

/// Build a `generateContent` request body from OpenAI chat messages.
pub fn chat_to_gemini(messages: &[ChatMessage]) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    let mut pending_system: Option<String> = None;

    for message in messages {
        if message.role == "system" {
            pending_system = Some(text_of(&message.content));
            continue;
        }

        let role = if message.role == "user" { "user" } else { "model" };
        let mut content = message.content.clone();
        if role == "user"
            && let Some(system) = pending_system.take()
        {
            content = prepend_text(&system, content);
        }

        contents.push(json!({
            "role": role,
            "parts": parts_of(&content),
        }));
    }

    json!({ "contents": contents })
}

/// Wrap upstream candidates in a chat.completion envelope.
///
/// Only the first text part of each candidate is surfaced; finish reasons
/// pass through lowercased with `stop` as the default.
pub fn gemini_to_chat(model: &str, response: &Value) -> ChatCompletionResponse {
    let choices = response
        .get("candidates")
        .and_then(Value::as_array)
        .map(|candidates| {
            candidates
                .iter()
                .enumerate()
                .map(|(i, candidate)| Choice {
                    index: candidate
                        .get("index")
                        .and_then(Value::as_u64)
                        .unwrap_or(i as u64),
                    message: AssistantMessage {
                        role: "assistant".into(),
                        content: first_text(candidate),
                    },
                    finish_reason: candidate
                        .get("finishReason")
                        .and_then(Value::as_str)
                        .map(str::to_lowercase)
                        .unwrap_or_else(|| "stop".into()),
                })
                .collect()
        })
        .unwrap_or_default();

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion".into(),
        created: Utc::now().timestamp(),
        model: model.to_string(),
        choices,
        usage: Usage::default(),
    }
}

/// Message content as upstream `parts`. A flat string becomes one text part;
/// a part list keeps its text parts and drops everything else.
fn parts_of(content: &Value) -> Vec<Value> {
    match content {
        Value::String(text) => vec![json!({ "text": text })],
        Value::Array(parts) => parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .map(|text| json!({ "text": text }))
            .collect(),
        _ => Vec::new(),
    }
}

/// Flatten content to plain text for system folding.
fn text_of(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Prepend folded system text onto user content, preserving its shape.
fn prepend_text(system: &str, content: Value) -> Value {
    match content {
        Value::String(text) => Value::String(format!("{system}\n{text}")),
        Value::Array(mut parts) => {
            let folded_into_first = parts
                .first_mut()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .and_then(|part| {
                    let text = part.get("text").and_then(Value::as_str)?.to_string();
                    part["text"] = Value::String(format!("{system}\n{text}"));
                    Some(())
                })
                .is_some();
            if !folded_into_first {
                parts.insert(0, json!({ "type": "text", "text": system }));
            }
            Value::Array(parts)
        }
        other => other,
    }
}

/// First text part of a candidate's content, or empty.
fn first_text(candidate: &Value) -> String {
    candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
