//! Drive an OpenAI Responses (Codex) backend from Claude Messages API
//! clients.
//!
//! [`CodexExecutor`] is the entry point: it translates a client request,
//! calls the upstream and translates the reply back, one-shot or as a stream
//! of SSE records.

pub mod cache;
pub mod config;
pub mod credential;
pub mod error;
pub mod executor;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod refresh;
pub mod sse;
pub mod tokenizer;
pub mod translate;
pub mod usage;

pub use cache::ConversationCache;
pub use config::BridgeConfig;
pub use credential::Credential;
pub use error::{BridgeError, Result};
pub use executor::{into_stream, BridgeRequest, BridgeResponse, CodexExecutor, Options, StreamChunk};
pub use logging::SharedExchangeLog;
pub use translate::{Format, TranslationState};
pub use usage::{MemoryUsageSink, UsageDetail, UsageRecord, UsageSink};
