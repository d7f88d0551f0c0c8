//! Persona store contract.
//!
//! Personas are opaque behavioural profiles loaded at dispatch time and
//! forwarded to the drone inside the command payload. The orchestrator
//! reads them in exactly one place of its own: the intervention rule
//! predicate inspects `traits`.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use apiary_types::{ErrorCode, PersonaId};

/// A behavioural profile a command executes as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Persona id.
    pub id: PersonaId,
    /// Free-form traits; intervention rules read these.
    #[serde(default)]
    pub traits: Value,
    /// Full profile document forwarded to the drone.
    #[serde(default)]
    pub profile: Value,
}

/// Failure talking to the persona store backend.
///
/// A missing persona is *not* an error: `load` returns `Ok(None)` and
/// the scheduler runs its backoff. This error is for the store itself
/// being unreachable.
#[derive(Debug, Error)]
pub enum PersonaStoreError {
    /// The backend could not be reached or answered malformed data.
    #[error("persona store unavailable: {0}")]
    Unavailable(String),
}

impl ErrorCode for PersonaStoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "PERSONA_STORE_UNAVAILABLE",
        }
    }

    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Read access to the persona store.
#[async_trait]
pub trait PersonaStore: Send + Sync {
    /// Loads a persona. `Ok(None)` means the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`PersonaStoreError`] when the backend is unreachable.
    async fn load(&self, id: &PersonaId) -> Result<Option<Persona>, PersonaStoreError>;
}

/// In-memory persona store for tests and single-process hosts.
#[derive(Debug, Default)]
pub struct InMemoryPersonaStore {
    personas: RwLock<HashMap<PersonaId, Persona>>,
}

impl InMemoryPersonaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a persona.
    pub fn insert(&self, persona: Persona) {
        self.personas.write().insert(persona.id.clone(), persona);
    }

    /// Removes a persona.
    pub fn remove(&self, id: &PersonaId) {
        self.personas.write().remove(id);
    }
}

#[async_trait]
impl PersonaStore for InMemoryPersonaStore {
    async fn load(&self, id: &PersonaId) -> Result<Option<Persona>, PersonaStoreError> {
        Ok(self.personas.read().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn load_returns_none_for_unknown_persona() {
        let store = InMemoryPersonaStore::new();
        let loaded = store.load(&PersonaId::new("pX")).await.expect("store ok");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn insert_then_load() {
        let store = InMemoryPersonaStore::new();
        store.insert(Persona {
            id: PersonaId::new("p1"),
            traits: json!({"requireIntervention": false}),
            profile: json!({"locale": "en-GB"}),
        });

        let loaded = store
            .load(&PersonaId::new("p1"))
            .await
            .expect("store ok")
            .expect("persona present");
        assert_eq!(loaded.profile["locale"], "en-GB");
    }

    #[tokio::test]
    async fn remove_makes_persona_missing() {
        let store = InMemoryPersonaStore::new();
        store.insert(Persona {
            id: PersonaId::new("p1"),
            traits: Value::Null,
            profile: Value::Null,
        });
        store.remove(&PersonaId::new("p1"));
        assert!(store
            .load(&PersonaId::new("p1"))
            .await
            .expect("store ok")
            .is_none());
    }
}
