//! Identifier types for the Apiary orchestrator.
//!
//! Unlike internally-minted ids, most Apiary identifiers originate on the
//! wire: a drone registers under the id it was provisioned with, and a
//! submitter chooses the command id it will later correlate results by.
//! The newtypes therefore wrap arbitrary strings and round-trip them
//! verbatim through serde.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for a single command dispatched to a drone.
///
/// Command ids are globally unique within the orchestrator: the lifecycle
/// tracker refuses to register the same id twice. The submitter supplies
/// the id so it can correlate acknowledgements and results.
///
/// # Example
///
/// ```
/// use apiary_types::CommandId;
///
/// let id = CommandId::new("c1");
/// assert_eq!(id.as_str(), "c1");
/// assert_eq!(id.replay_id().as_str(), "c1_replay");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Wraps an externally supplied command id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh random command id.
    ///
    /// Used for orchestrator-originated commands (e.g. queries) where no
    /// submitter chose an id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the id of the replayable copy of this command.
    ///
    /// An intervention session stores a deep clone of the interrupted
    /// command under this id so the resume path can re-run it without
    /// colliding with the original in the tracker.
    #[must_use]
    pub fn replay_id(&self) -> Self {
        Self(format!("{}_replay", self.0))
    }

    /// Returns `true` if the id is empty (rejected by task validation).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier for a registered drone (remote worker process).
///
/// The drone presents its id during registration; the orchestrator keys
/// queues, pacing tokens and registry entries by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DroneId(String);

impl DroneId {
    /// Wraps an externally supplied drone id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DroneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DroneId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier for a persona in the persona store.
///
/// Personas are opaque behavioural profiles fetched at dispatch time; the
/// orchestrator never inspects them beyond intervention-rule traits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaId(String);

impl PersonaId {
    /// Wraps an externally supplied persona id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the id is empty (rejected by task validation).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for PersonaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PersonaId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
