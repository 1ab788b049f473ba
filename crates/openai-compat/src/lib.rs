//! OpenAI-compatible chat surface for the Gemini upstream
//!
//! Translates between the OpenAI chat-completions shape
//! (`system`/`user`/`assistant` role-tagged messages) and the upstream's
//! two-role `generateContent` shape (`user`/`model`). The reverse direction
//! synthesizes a chat.completion envelope around the upstream candidates.
//!
//! The upstream call shape carries no per-response usage data, so usage
//! fields are always present and zero; actual usage is tracked per key by
//! the pool, not per response.

pub mod translate;
pub mod types;

pub use translate::{chat_to_gemini, gemini_to_chat};
pub use types::{
    AssistantMessage, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ModelInfo, ModelList, Usage, model_list,
};
