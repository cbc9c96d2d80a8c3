//! Chatmeter API Library
//!
//! Configuration, error taxonomy, the upstream completion client, chat
//! history and the chat orchestration that sits behind the HTTP surface.

pub mod chat;
pub mod config;
pub mod error;
pub mod history;
pub mod state;
pub mod telemetry;
pub mod upstream;

pub use chat::{ChatRequest, ChatResponse, ChatService};
pub use config::{CacheBackend, Config, ConfigError, LogFormat, StoreBackend};
pub use error::{ApiError, ApiResult};
pub use history::{
    ChatHistory, ChatHistoryStore, ChatSession, InMemoryHistory, NewMessage, PgHistory,
    StoredMessage,
};
pub use state::{AppState, StartupError};
pub use telemetry::init_tracing;
pub use upstream::{
    ChatMessage, Completion, CompletionClient, CompletionRequest, OpenRouterClient, Role,
    TokenUsage, UpstreamError,
};
