//! Task submission types.
//!
//! A [`Task`] is the northbound unit of work: everything the scheduler
//! needs to pick a drone, pace the dispatch, and compose the wire command.
//! Field names serialize in camelCase because submitters and drones share
//! the same JSON contract.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{CommandId, ErrorCode, PersonaId};

/// Validation failure for a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// A mandatory field was empty or absent.
    #[error("task is missing required field '{0}'")]
    MissingField(&'static str),
}

impl ErrorCode for TaskError {
    fn code(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "TASK_MISSING_FIELD",
        }
    }

    fn is_recoverable(&self) -> bool {
        // The submitter must fix the task; resubmitting as-is cannot help.
        false
    }
}

/// Dispatch priority of a task.
///
/// Priority orders the ready queue only; once a task enters a per-drone
/// queue it is plain FIFO.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    /// Background work, dispatched when nothing else is waiting.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Jumps ahead of Normal and Low work in the ready queue.
    High,
}

impl Priority {
    /// Numeric rank: Low 0, Normal 1, High 2. Used in selection scoring.
    #[must_use]
    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

/// Opaque session reference a command executes under.
///
/// The orchestrator forwards this to the drone untouched; only the
/// session registry interprets the lease id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    /// Lease id in the session registry.
    pub lease_id: String,
    /// Site the session belongs to.
    pub site: String,
    /// Identity the session authenticates as.
    pub identity: String,
}

/// A unit of browser-automation work awaiting dispatch.
///
/// Immutable after submission except for the scheduler-owned bookkeeping
/// fields `enqueued_at`, `priority` and `persona_retry_count`.
///
/// # Example
///
/// ```
/// use apiary_types::{Priority, Task};
///
/// let task = Task::new("c1", "navigate", "p1")
///     .with_domain("https://shop.example.co.uk/cart")
///     .with_priority(Priority::High);
/// assert!(task.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Globally unique command id chosen by the submitter.
    pub command_id: CommandId,
    /// Command kind label (e.g. `navigate`, `extract`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Persona the command executes as.
    pub persona_id: PersonaId,
    /// Capability labels the executing drone must advertise.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Source URL or host the command touches, when known.
    ///
    /// The scheduler reduces this to a registrable domain at submission;
    /// the domain limiter receives it already normalised.
    #[serde(default)]
    pub domain: Option<String>,
    /// Opaque structured payload forwarded to the drone.
    #[serde(default)]
    pub parameters: Value,
    /// Session the command executes under, when any.
    #[serde(default)]
    pub session: Option<SessionRef>,
    /// Execution timeout granted to the drone, in seconds.
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    /// Ready-queue priority.
    #[serde(default)]
    pub priority: Priority,
    /// When the task last entered the ready queue. Reset on requeue.
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
    /// How many times dispatch failed because the persona was missing.
    #[serde(default)]
    pub persona_retry_count: u32,
}

fn default_timeout_sec() -> u64 {
    60
}

impl Task {
    /// Creates a task with the mandatory fields and defaults elsewhere.
    #[must_use]
    pub fn new(
        command_id: impl Into<CommandId>,
        kind: impl Into<String>,
        persona_id: impl Into<PersonaId>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            kind: kind.into(),
            persona_id: persona_id.into(),
            required_capabilities: BTreeSet::new(),
            domain: None,
            parameters: Value::Null,
            session: None,
            timeout_sec: default_timeout_sec(),
            priority: Priority::Normal,
            enqueued_at: Utc::now(),
            persona_retry_count: 0,
        }
    }

    /// Sets the source domain or URL.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Sets the ready-queue priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the required capability labels.
    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the opaque command parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the session reference.
    #[must_use]
    pub fn with_session(mut self, session: SessionRef) -> Self {
        self.session = Some(session);
        self
    }

    /// Checks the fields submission refuses to accept without.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::MissingField`] naming the first empty
    /// mandatory field among `commandId`, `personaId` and `type`.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.command_id.is_empty() {
            return Err(TaskError::MissingField("commandId"));
        }
        if self.persona_id.is_empty() {
            return Err(TaskError::MissingField("personaId"));
        }
        if self.kind.trim().is_empty() {
            return Err(TaskError::MissingField("type"));
        }
        Ok(())
    }

    /// Stamps a fresh `enqueued_at`, used when a task re-enters the ready
    /// queue after a requeue or retry.
    pub fn touch_enqueued(&mut self) {
        self.enqueued_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_error_codes;
    use serde_json::json;

    #[test]
    fn priority_orders_low_to_high() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn validate_accepts_complete_task() {
        let task = Task::new("c1", "navigate", "p1");
        assert!(task.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let missing_command = Task::new("", "navigate", "p1");
        assert_eq!(
            missing_command.validate(),
            Err(TaskError::MissingField("commandId"))
        );

        let missing_persona = Task::new("c1", "navigate", "");
        assert_eq!(
            missing_persona.validate(),
            Err(TaskError::MissingField("personaId"))
        );

        let missing_kind = Task::new("c1", "  ", "p1");
        assert_eq!(missing_kind.validate(), Err(TaskError::MissingField("type")));
    }

    #[test]
    fn touch_enqueued_moves_timestamp_forward() {
        let mut task = Task::new("c1", "navigate", "p1");
        let before = task.enqueued_at;
        task.touch_enqueued();
        assert!(task.enqueued_at >= before);
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let task = Task::new("c1", "navigate", "p1")
            .with_parameters(json!({"url": "https://example.com"}));
        let value = serde_json::to_value(&task).expect("serialize task");
        assert_eq!(value["commandId"], "c1");
        assert_eq!(value["type"], "navigate");
        assert_eq!(value["personaId"], "p1");
        assert_eq!(value["personaRetryCount"], 0);
    }

    #[test]
    fn deserializes_with_defaults() {
        let task: Task = serde_json::from_value(json!({
            "commandId": "c9",
            "type": "extract",
            "personaId": "p3"
        }))
        .expect("deserialize minimal task");
        assert_eq!(task.priority, Priority::Normal);
        assert!(task.required_capabilities.is_empty());
        assert_eq!(task.timeout_sec, 60);
    }

    #[test]
    fn error_codes_follow_convention() {
        assert_error_codes(&[TaskError::MissingField("commandId")], "TASK_");
    }
}
