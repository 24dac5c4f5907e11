//! AI assistant gateway for the ERP bridge.
//!
//! Pure HTTP client for any OpenAI-compatible chat-completions endpoint. Used both by the
//! bridge's background worker and by the admin UI's direct chat.

mod client;
mod error;
mod openai;
mod types;

pub use client::{ChatCompletionClient, ChatCompletionConfig, validate_tool_name};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, ToolCall, ToolDefinition, Usage};
