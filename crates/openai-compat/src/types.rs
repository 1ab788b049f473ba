//! OpenAI-compatible wire types
//!
//! Only the fields the proxy acts on are modeled; message `content` stays a
//! raw JSON value because it is either a flat string or a list of typed
//! parts, and the translator handles both.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound `POST /v1/chat/completions` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// One role-tagged chat message.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

/// Outbound chat.completion envelope.
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u64,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

/// Always zero: the upstream call shape carries no usage data.
#[derive(Debug, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// `GET /v1/models` catalog listing.
#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// Render the static model catalog in OpenAI list form.
pub fn model_list(models: &[String]) -> ModelList {
    let created = chrono::Utc::now().timestamp();
    ModelList {
        object: "list".into(),
        data: models
            .iter()
            .map(|id| ModelInfo {
                id: id.clone(),
                object: "model".into(),
                created,
                owned_by: "google".into(),
            })
            .collect(),
    }
}
