//! The context engine facade.
//!
//! One constructible service wiring the pattern extractor, the extraction
//! cache, the conversation-state store and the optional LLM fallback. The
//! request-handling layer builds one engine at startup and injects it; there
//! is no module-level global to reach for.
//!
//! Nothing in here raises to the caller during a turn: every fault path
//! degrades to an absent value, no continuation, or a dropped write.

use anyhow::Result;
use tracing::{info, warn};

use crate::cache::{CacheStatus, ExtractionCache};
use crate::config::EngineConfig;
use crate::continuation::{self, Intent};
use crate::entities::{EntitySet, Field, Line, Sex, Species};
use crate::extraction::{normalize_sign_token, ExtractionKind, PatternExtractor, ScalarValue};
use crate::llm_client::{HttpLlmClient, LlmClient};
use crate::merger;
use crate::state::{ConversationState, ConversationStateStore};

/// Constrained prompt for the clinical-sign fallback; the answer budget is a
/// single short token.
const SIGN_SYSTEM_PROMPT: &str = "Tu extrais le signe clinique principal d'un message d'éleveur \
de volailles. Réponds par un seul mot en minuscules (exemple: boiterie, apathie, diarrhee). \
Réponds \"aucun\" si aucun signe n'est décrit.";

/// Conversational context engine.
pub struct ContextEngine {
    config: EngineConfig,
    extractor: PatternExtractor,
    cache: ExtractionCache,
    store: ConversationStateStore,
    llm: Option<Box<dyn LlmClient>>,
}

impl ContextEngine {
    /// Build the engine from configuration. The state store silently falls
    /// back to memory when the durable backend cannot be opened; a broken
    /// LLM configuration only disables the sign fallback.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let config = config.normalized();
        let extractor = PatternExtractor::new()?;
        let cache = ExtractionCache::new(&config.cache);
        let store = ConversationStateStore::open(&config.session);

        let llm: Option<Box<dyn LlmClient>> = if config.llm.enabled {
            match HttpLlmClient::new(config.llm.clone()) {
                Ok(client) => Some(Box::new(client)),
                Err(error) => {
                    warn!("LLM client unavailable, sign fallback disabled: {:#}", error);
                    None
                }
            }
        } else {
            None
        };

        info!(
            cache_enabled = config.cache.enabled,
            durable_state = store.is_durable(),
            llm_fallback = llm.is_some(),
            "Context engine initialized"
        );

        Ok(Self {
            config,
            extractor,
            cache,
            store,
            llm,
        })
    }

    /// Swap the state store (tests, or callers managing their own backend).
    pub fn with_store(mut self, store: ConversationStateStore) -> Self {
        self.store = store;
        self
    }

    /// Swap the LLM client (tests inject a fake here).
    pub fn with_llm_client(mut self, llm: Box<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Clear transient state and release the engine.
    pub fn shutdown(self) {
        self.cache.clear();
        info!("Context engine shut down");
    }

    // ========================================================================
    // Cached extraction operations
    // ========================================================================

    /// Flock age in days, `[0, 70]`.
    pub fn extract_age_days(&self, text: &str) -> Option<u8> {
        self.cached_extract(text, ExtractionKind::AgeDays)
            .and_then(|value| value.as_age())
    }

    /// Sex category (male / female / as-hatched).
    pub fn normalize_sex(&self, text: &str) -> Option<Sex> {
        self.cached_extract(text, ExtractionKind::Sex)
            .and_then(|value| value.as_sex())
    }

    /// Genetic line code.
    pub fn extract_line(&self, text: &str) -> Option<Line> {
        self.cached_extract(text, ExtractionKind::Line)
            .and_then(|value| value.as_line())
    }

    /// Production species (broiler / layer).
    pub fn extract_species(&self, text: &str) -> Option<Species> {
        self.cached_extract(text, ExtractionKind::Species)
            .and_then(|value| value.as_species())
    }

    /// Clinical sign, two tiers: obvious vocabulary first, then the LLM
    /// fallback on a clean miss — and only while caching is enabled, so the
    /// expensive answer is never recomputed per turn.
    pub fn extract_signs(&self, text: &str) -> Option<String> {
        if let Some(cached) = self.cache.get(text, ExtractionKind::Signs) {
            return cached.and_then(|value| value.as_sign());
        }

        if let Some(token) = self.extractor.extract_obvious_sign(text) {
            self.cache
                .put(text, ExtractionKind::Signs, Some(ScalarValue::Sign(token.clone())));
            return Some(token);
        }

        if !self.cache.status().enabled {
            return None;
        }

        let Some(llm) = &self.llm else {
            self.cache.put(text, ExtractionKind::Signs, None);
            return None;
        };

        let user_prompt = format!("Message: \"{text}\"\nSigne clinique principal:");
        match llm.complete(SIGN_SYSTEM_PROMPT, &user_prompt) {
            Ok(answer) => {
                let token = normalize_sign_token(&answer);
                self.cache.put(
                    text,
                    ExtractionKind::Signs,
                    token.clone().map(ScalarValue::Sign),
                );
                token
            }
            Err(error) => {
                // Transient fault: not cached, the next turn may succeed
                warn!("Sign fallback failed, treating as no sign: {error}");
                None
            }
        }
    }

    // ========================================================================
    // Context fusion
    // ========================================================================

    /// Fuse session, auto-extracted and current-turn entities for one turn.
    pub fn merge_context(
        &self,
        current: &EntitySet,
        session: &EntitySet,
        text: &str,
    ) -> EntitySet {
        let auto = self.auto_extract(text);
        merger::fuse(session, &auto, current)
    }

    /// Run every extractor over the message.
    fn auto_extract(&self, text: &str) -> EntitySet {
        EntitySet {
            species: self.extract_species(text),
            line: self.extract_line(text),
            sex: self.normalize_sex(text),
            age_days: self.extract_age_days(text),
            signs: self.extract_signs(text),
        }
    }

    // ========================================================================
    // Conversation state
    // ========================================================================

    /// The stored state for a session, if any. Expiry is judged by the
    /// continuation decider, not here.
    pub fn session_state(&self, session_id: &str) -> Option<ConversationState> {
        self.store.get(session_id)
    }

    /// Does the new turn continue a pending clarification flow?
    pub fn should_continue(&self, session_id: &str, new_intent: Intent) -> bool {
        let state = self.store.get(session_id);
        continuation::should_continue(state.as_ref(), new_intent, self.store.inactivity_window())
    }

    /// Persist the pending state after a turn.
    pub fn save_state(
        &self,
        session_id: &str,
        pending_intent: Option<Intent>,
        entities: EntitySet,
        text: &str,
        missing_fields: Vec<Field>,
    ) {
        self.store
            .update(session_id, pending_intent, entities, text, missing_fields);
    }

    /// Forget a session.
    pub fn clear_state(&self, session_id: &str) {
        self.store.clear(session_id);
    }

    /// Sweep physically expired session rows. Returns rows removed.
    pub fn prune_expired_states(&self) -> usize {
        self.store.prune_expired()
    }

    // ========================================================================
    // Diagnostics and operator actions
    // ========================================================================

    pub fn cache_status(&self) -> CacheStatus {
        self.cache.status()
    }

    /// Operator action: drop every cached extraction.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Runtime cache switch; disabling clears on the next cache operation.
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache.set_enabled(enabled);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn cached_extract(&self, text: &str, kind: ExtractionKind) -> Option<ScalarValue> {
        if let Some(cached) = self.cache.get(text, kind) {
            return cached;
        }
        let value = self.extractor.extract(text, kind);
        self.cache.put(text, kind, value.clone());
        value
    }
}
