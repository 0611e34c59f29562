//! Per-session conversation state, persisted across turns.
//!
//! The store is backed by SQLite when a database can be opened, and by an
//! in-process map otherwise. Callers never learn which backend is active:
//! construction failures downgrade to the fallback with a warning, and
//! per-call backend errors degrade to "no state" / dropped write. Losing
//! conversational memory for one turn beats failing the request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::continuation::Intent;
use crate::entities::{EntitySet, Field};

/// What the engine remembers about one session between turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    /// The goal still awaiting completion, if a clarification is in flight
    pub pending_intent: Option<Intent>,
    /// Entities established so far
    pub entities: EntitySet,
    /// Fields still needed, in clarification order
    pub missing_fields: Vec<Field>,
    /// Raw text of the last user message
    #[serde(default)]
    pub last_message: String,
    /// When this state was last written
    pub last_updated: DateTime<Utc>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            pending_intent: None,
            entities: EntitySet::new(),
            missing_fields: Vec::new(),
            last_message: String::new(),
            last_updated: Utc::now(),
        }
    }

    /// A state older than the inactivity window is expired even if it has
    /// not been physically deleted yet.
    pub fn is_expired(&self, window: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_updated);
        age > chrono::Duration::seconds(window.as_secs() as i64)
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors from a state backend. These never cross the store boundary.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// Keyed get/update/clear over conversation state.
///
/// Two implementations: durable SQLite and the in-process fallback. The
/// choice is made once, at store construction.
pub trait StateBackend: Send + Sync {
    fn get(&self, session_id: &str) -> Result<Option<ConversationState>, StateError>;
    fn update(&self, session_id: &str, state: &ConversationState) -> Result<(), StateError>;
    fn clear(&self, session_id: &str) -> Result<(), StateError>;
    /// Physically delete states older than the window. Returns rows removed.
    fn prune_expired(&self, window: Duration) -> Result<usize, StateError>;
    fn is_durable(&self) -> bool;
}

// ============================================================================
// SQLite backend
// ============================================================================

/// Durable backend: one SQLite connection behind a mutex, WAL mode.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open state database {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("Failed to set synchronous mode")?;
        conn.busy_timeout(busy_timeout)
            .context("Failed to set busy timeout")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversation_state (
                session_id TEXT PRIMARY KEY,
                pending_intent TEXT,
                entities TEXT NOT NULL,
                missing_fields TEXT NOT NULL,
                last_message TEXT NOT NULL DEFAULT '',
                last_updated TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create conversation_state table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_state_last_updated
             ON conversation_state(last_updated)",
            [],
        )
        .context("Failed to create last_updated index")?;

        info!("Conversation state database ready at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StateBackend for SqliteStateBackend {
    fn get(&self, session_id: &str) -> Result<Option<ConversationState>, StateError> {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let row = conn
            .query_row(
                "SELECT pending_intent, entities, missing_fields, last_message, last_updated
                 FROM conversation_state WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((intent_tag, entities_json, missing_json, last_message, updated_raw)) = row else {
            return Ok(None);
        };

        // An unknown intent tag (schema drift) degrades to "no pending
        // intent" rather than failing the read.
        let pending_intent = intent_tag.as_deref().and_then(Intent::from_str);
        let entities: EntitySet = serde_json::from_str(&entities_json)?;
        let missing_fields: Vec<Field> = serde_json::from_str(&missing_json)?;
        let last_updated = DateTime::parse_from_rfc3339(&updated_raw)?.with_timezone(&Utc);

        Ok(Some(ConversationState {
            pending_intent,
            entities,
            missing_fields,
            last_message,
            last_updated,
        }))
    }

    fn update(&self, session_id: &str, state: &ConversationState) -> Result<(), StateError> {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        conn.execute(
            "INSERT OR REPLACE INTO conversation_state
             (session_id, pending_intent, entities, missing_fields, last_message, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                state.pending_intent.map(|intent| intent.as_str()),
                serde_json::to_string(&state.entities)?,
                serde_json::to_string(&state.missing_fields)?,
                state.last_message,
                state.last_updated.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn clear(&self, session_id: &str) -> Result<(), StateError> {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        conn.execute(
            "DELETE FROM conversation_state WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    fn prune_expired(&self, window: Duration) -> Result<usize, StateError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(window.as_secs() as i64);
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let removed = conn.execute(
            "DELETE FROM conversation_state WHERE last_updated < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(removed)
    }

    fn is_durable(&self) -> bool {
        true
    }
}

// ============================================================================
// In-memory fallback backend
// ============================================================================

/// Fallback backend: same semantics, no durability.
pub struct MemoryStateBackend {
    sessions: Mutex<HashMap<String, ConversationState>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStateBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StateBackend for MemoryStateBackend {
    fn get(&self, session_id: &str) -> Result<Option<ConversationState>, StateError> {
        let sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(sessions.get(session_id).cloned())
    }

    fn update(&self, session_id: &str, state: &ConversationState) -> Result<(), StateError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.insert(session_id.to_string(), state.clone());
        Ok(())
    }

    fn clear(&self, session_id: &str) -> Result<(), StateError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.remove(session_id);
        Ok(())
    }

    fn prune_expired(&self, window: Duration) -> Result<usize, StateError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = sessions.len();
        sessions.retain(|_, state| !state.is_expired(window));
        Ok(before - sessions.len())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

// ============================================================================
// Store
// ============================================================================

/// Session-keyed store over the selected backend.
///
/// Backend faults are absorbed here: reads degrade to "no state", writes to
/// a dropped write, both with a warning.
pub struct ConversationStateStore {
    backend: Box<dyn StateBackend>,
    inactivity_window: Duration,
}

impl ConversationStateStore {
    /// Open the durable backend, falling back to memory if that fails.
    pub fn open(config: &SessionConfig) -> Self {
        let window = Duration::from_secs(config.inactivity_secs);
        let busy_timeout = Duration::from_millis(config.db_busy_timeout_ms);

        let path = match config.db_path.clone().or_else(default_db_path) {
            Some(path) => path,
            None => {
                warn!("No usable state database path; conversation state is in-memory only");
                return Self::with_backend(Box::new(MemoryStateBackend::new()), window);
            }
        };

        match SqliteStateBackend::open(&path, busy_timeout) {
            Ok(backend) => Self::with_backend(Box::new(backend), window),
            Err(error) => {
                warn!(
                    "Falling back to in-memory conversation state: {:#}",
                    error
                );
                Self::with_backend(Box::new(MemoryStateBackend::new()), window)
            }
        }
    }

    /// Purely in-process store (tests, or callers that opt out of durability).
    pub fn in_memory(inactivity_window: Duration) -> Self {
        Self::with_backend(Box::new(MemoryStateBackend::new()), inactivity_window)
    }

    pub fn with_backend(backend: Box<dyn StateBackend>, inactivity_window: Duration) -> Self {
        Self {
            backend,
            inactivity_window,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<ConversationState> {
        match self.backend.get(session_id) {
            Ok(state) => state,
            Err(error) => {
                warn!(session_id, "State read failed, treating as no state: {error}");
                None
            }
        }
    }

    /// Persist the new pending state for a session. A backend failure drops
    /// the write.
    pub fn update(
        &self,
        session_id: &str,
        pending_intent: Option<Intent>,
        entities: EntitySet,
        last_message: &str,
        missing_fields: Vec<Field>,
    ) {
        let state = ConversationState {
            pending_intent,
            entities,
            missing_fields,
            last_message: last_message.to_string(),
            last_updated: Utc::now(),
        };
        if let Err(error) = self.backend.update(session_id, &state) {
            warn!(session_id, "State write failed, dropped: {error}");
        }
    }

    pub fn clear(&self, session_id: &str) {
        if let Err(error) = self.backend.clear(session_id) {
            warn!(session_id, "State clear failed: {error}");
        }
    }

    /// Sweep states older than the inactivity window.
    pub fn prune_expired(&self) -> usize {
        match self.backend.prune_expired(self.inactivity_window) {
            Ok(removed) => {
                if removed > 0 {
                    debug!(removed, "Pruned expired conversation states");
                }
                removed
            }
            Err(error) => {
                warn!("State prune failed: {error}");
                0
            }
        }
    }

    pub fn inactivity_window(&self) -> Duration {
        self.inactivity_window
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_durable()
    }
}

/// Default database location: `$XDG_DATA_HOME/gallus/sessions.db`, falling
/// back to `~/.local/share/gallus/sessions.db`.
fn default_db_path() -> Option<PathBuf> {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        if !xdg_data.is_empty() {
            return Some(PathBuf::from(xdg_data).join("gallus").join("sessions.db"));
        }
    }
    std::env::var("HOME")
        .ok()
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(".local/share/gallus/sessions.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Species;

    const WINDOW: Duration = Duration::from_secs(600);

    fn sample_state(age_secs: i64) -> ConversationState {
        ConversationState {
            pending_intent: Some(Intent::PerfTargets),
            entities: EntitySet::new().with_species(Species::Broiler).with_age_days(21),
            missing_fields: vec![Field::Line, Field::Sex],
            last_message: "mes poulets de chair ont 21 jours".to_string(),
            last_updated: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn fresh_state_is_not_expired() {
        let state = sample_state(300);
        assert!(!state.is_expired(WINDOW));
    }

    #[test]
    fn old_state_is_expired() {
        let state = sample_state(900);
        assert!(state.is_expired(WINDOW));
    }

    #[test]
    fn memory_backend_round_trip() {
        let backend = MemoryStateBackend::new();
        let state = sample_state(0);

        backend.update("session-1", &state).unwrap();
        assert_eq!(backend.get("session-1").unwrap(), Some(state.clone()));
        assert_eq!(backend.get("session-2").unwrap(), None);

        backend.clear("session-1").unwrap();
        assert_eq!(backend.get("session-1").unwrap(), None);
    }

    #[test]
    fn memory_backend_prunes_expired() {
        let backend = MemoryStateBackend::new();
        backend.update("fresh", &sample_state(60)).unwrap();
        backend.update("stale", &sample_state(3600)).unwrap();

        let removed = backend.prune_expired(WINDOW).unwrap();
        assert_eq!(removed, 1);
        assert!(backend.get("fresh").unwrap().is_some());
        assert!(backend.get("stale").unwrap().is_none());
    }

    #[test]
    fn sqlite_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let backend = SqliteStateBackend::open(&path, Duration::from_millis(100)).unwrap();

        let state = sample_state(0);
        backend.update("session-1", &state).unwrap();
        assert_eq!(backend.get("session-1").unwrap(), Some(state.clone()));

        // Survives a reopen
        drop(backend);
        let backend = SqliteStateBackend::open(&path, Duration::from_millis(100)).unwrap();
        assert_eq!(backend.get("session-1").unwrap(), Some(state));
        assert!(backend.is_durable());

        backend.clear("session-1").unwrap();
        assert_eq!(backend.get("session-1").unwrap(), None);
    }

    #[test]
    fn sqlite_backend_prunes_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let backend = SqliteStateBackend::open(&path, Duration::from_millis(100)).unwrap();

        backend.update("fresh", &sample_state(60)).unwrap();
        backend.update("stale", &sample_state(3600)).unwrap();

        assert_eq!(backend.prune_expired(WINDOW).unwrap(), 1);
        assert!(backend.get("fresh").unwrap().is_some());
        assert!(backend.get("stale").unwrap().is_none());
    }

    #[test]
    fn store_falls_back_to_memory_on_unopenable_path() {
        let config = SessionConfig {
            inactivity_secs: 600,
            db_path: Some(PathBuf::from("/dev/null/not-a-directory/sessions.db")),
            db_busy_timeout_ms: 100,
        };
        let store = ConversationStateStore::open(&config);
        assert!(!store.is_durable());

        // Identical read/write semantics on the fallback
        store.update(
            "session-1",
            Some(Intent::NutritionAdvice),
            EntitySet::new().with_age_days(7),
            "7 jours",
            vec![Field::Species],
        );
        let state = store.get("session-1").unwrap();
        assert_eq!(state.pending_intent, Some(Intent::NutritionAdvice));
        assert_eq!(state.entities.age_days, Some(7));
        assert_eq!(state.missing_fields, vec![Field::Species]);

        store.clear("session-1");
        assert!(store.get("session-1").is_none());
    }

    #[test]
    fn store_update_stamps_last_updated() {
        let store = ConversationStateStore::in_memory(WINDOW);
        store.update("session-1", None, EntitySet::new(), "bonjour", vec![]);

        let state = store.get("session-1").unwrap();
        assert!(!state.is_expired(WINDOW));
        assert_eq!(state.last_message, "bonjour");
    }
}
