//! Gallus Context - conversational context cache and entity fusion engine.
//!
//! The stateful core of the Gallus poultry assistant: pattern extraction of
//! flock entities from free text, bounded caching of extraction results,
//! multi-turn context fusion, and per-session pending-intent tracking.
//! Transport, classification and answer generation live in the surrounding
//! request layer.

pub mod cache;
pub mod config;
pub mod continuation;
pub mod engine;
pub mod entities;
pub mod extraction;
pub mod llm_client;
pub mod merger;
pub mod state;

pub use cache::CacheStatus;
pub use config::{CacheConfig, EngineConfig, SessionConfig};
pub use continuation::{missing_fields_for, required_fields, should_continue, Intent};
pub use engine::ContextEngine;
pub use entities::{EntitySet, Field, Line, Sex, Species, MAX_AGE_DAYS};
pub use extraction::{ExtractionKind, PatternExtractor, ScalarValue};
pub use llm_client::{FakeLlmClient, HttpLlmClient, LlmClient, LlmConfig, LlmError};
pub use state::{ConversationState, ConversationStateStore, StateBackend};
