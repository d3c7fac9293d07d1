//! Minimal agent abstraction over LLM completion APIs.
//!
//! - `Agent` drives single-shot or multi-turn conversations, resolving tool
//!   calls round by round until the model answers
//! - streaming and non-streaming paths produce the same transcript
//! - prompt templates, typed or raw JSON-schema response formats
//! - `ChatModel` is the provider boundary; `OpenAiModel` speaks the
//!   OpenAI-compatible chat-completions protocol

pub mod agent;
pub mod error;
pub mod llm;
pub mod prompt;
pub mod response;
pub mod tools;

pub use agent::{Agent, AgentBuilder, ConversationEvent, DEFAULT_INSTRUCTIONS, collect_context};
pub use error::{AgentError, ProviderError, SchemaError, TemplateError, ToolError};
pub use llm::{
    ChatModel, ChunkStream, Message, MessageChunk, ModelCompletion, ModelRequest, ModelUsage,
    OpenAiModel, OpenAiModelConfig, Role, ToolCallDelta, ToolCallRequest, ToolDefinition,
};
pub use prompt::{Prompt, PromptTemplate};
pub use response::{Response, ResponseFormat};
pub use tools::{Tool, ToolRegistry};
