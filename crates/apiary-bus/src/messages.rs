//! Wire payloads exchanged over the drone message bus.
//!
//! The bus is group-based pub/sub with at-least-once delivery. The
//! orchestrator publishes to one group per drone and subscribes to the
//! shared drone→hub stream; operator consoles listen on a broadcast
//! group of their own.
//!
//! # Message Directions
//!
//! | Type | Direction | Group |
//! |------|-----------|-------|
//! | [`HubMessage`] | hub → drone | `drone_{droneId}` |
//! | [`DroneMessage`] | drone → hub | hub inbox |
//! | [`OperatorMessage`] | hub → operators | `operators` |
//!
//! Field names serialize in camelCase: the drones and operator tooling on
//! the other end of the bus are not Rust.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use apiary_types::{CommandId, DroneId, SessionRef};

/// Command execution order published to a drone's group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    /// Unique command id, echoed back in acks and results.
    pub command_id: CommandId,
    /// Command kind label.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque structured parameters.
    #[serde(default)]
    pub parameters: Value,
    /// Persona profile the drone executes as.
    #[serde(default)]
    pub persona: Value,
    /// Session the command runs under, when any.
    #[serde(default)]
    pub session: Option<SessionRef>,
    /// Execution timeout in seconds.
    pub timeout_sec: u64,
}

impl CommandPayload {
    /// Deep-clones this command under its replay id.
    ///
    /// Used by the intervention manager to store a re-runnable copy of
    /// the interrupted command.
    #[must_use]
    pub fn replay_clone(&self) -> Self {
        let mut clone = self.clone();
        clone.command_id = self.command_id.replay_id();
        clone
    }
}

/// Read-only query published to a drone's group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    /// Unique query id.
    pub query_id: CommandId,
    /// Query kind label.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque structured parameters.
    #[serde(default)]
    pub parameters: Value,
}

/// Messages the orchestrator publishes to a drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum HubMessage {
    /// Execute a command and report a result or error.
    ExecuteCommand(CommandPayload),
    /// Answer a read-only query.
    ExecuteQuery(QueryPayload),
}

/// Registration data a drone presents when it connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneRegistrationPayload {
    /// Id the drone was provisioned with.
    pub drone_id: DroneId,
    /// Transport connection handle.
    pub connection_id: String,
    /// Drone software version.
    pub version: String,
    /// Capability labels the drone can serve.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// One artifact attached to a command result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Artifact type label; `facts` and `snippets` route to dedicated
    /// sink operations, everything else to the generic store.
    #[serde(rename = "type")]
    pub kind: String,
    /// Artifact payload.
    pub data: Value,
    /// Optional artifact metadata.
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Successful command completion reported by a drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultPayload {
    /// Command this result belongs to.
    pub command_id: CommandId,
    /// Opaque result document.
    #[serde(default)]
    pub result: Value,
    /// Artifacts produced during execution.
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Session lease whose state should be persisted, when any.
    #[serde(default)]
    pub session_lease_id: Option<String>,
    /// Updated session state to persist under the lease.
    #[serde(default)]
    pub session_state: Option<Value>,
}

/// Command failure reported by a drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandErrorPayload {
    /// Command this error belongs to.
    pub command_id: CommandId,
    /// Human-readable error description.
    pub error: String,
    /// Machine-readable error classification.
    #[serde(default)]
    pub error_type: Option<String>,
    /// Whether the drone believes a retry could succeed.
    #[serde(default)]
    pub can_retry: bool,
}

/// Periodic drone status report; doubles as a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    /// Status label (`idle`, `busy`, `error`).
    pub status: String,
    /// Command currently executing, when busy.
    #[serde(default)]
    pub current_command: Option<CommandId>,
    /// Progress indication for the current command, 0..=100.
    #[serde(default)]
    pub progress: Option<u8>,
    /// Resident memory in bytes.
    #[serde(default)]
    pub memory_usage: Option<u64>,
    /// CPU utilisation fraction, 0.0..=1.0.
    #[serde(default)]
    pub cpu_usage: Option<f64>,
}

/// A drone's request for a human operator to take over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionPayload {
    /// Command that hit the blocking condition.
    pub command_id: CommandId,
    /// Condition label (e.g. `captcha`, `login_challenge`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form context captured by the drone.
    #[serde(default)]
    pub data: Value,
    /// Token the operator console presents to resume execution.
    #[serde(default)]
    pub resume_token: Option<String>,
}

/// Answer to an [`ExecuteQuery`](HubMessage::ExecuteQuery).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponsePayload {
    /// Query this response belongs to.
    pub query_id: CommandId,
    /// Opaque result document.
    #[serde(default)]
    pub result: Value,
}

/// Messages a drone sends to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum DroneMessage {
    /// Announce the drone and its capabilities.
    RegisterDrone(DroneRegistrationPayload),
    /// Confirm a command was received and started.
    AcknowledgeCommand {
        /// Command being acknowledged.
        #[serde(rename = "commandId")]
        command_id: CommandId,
    },
    /// Report successful completion.
    ReportResult(CommandResultPayload),
    /// Report a failure.
    ReportError(CommandErrorPayload),
    /// Periodic status/heartbeat.
    ReportStatus(StatusPayload),
    /// Ask for operator intervention.
    RequireIntervention(InterventionPayload),
    /// Answer a query.
    QueryResponse(QueryResponsePayload),
}

/// Notice broadcast to the operator group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionNotice {
    /// Command needing attention.
    pub command_id: CommandId,
    /// Drone the command was running on, when known.
    #[serde(default)]
    pub drone_id: Option<DroneId>,
    /// Notice type label.
    #[serde(rename = "type")]
    pub kind: String,
    /// Why the intervention is needed.
    pub reason: String,
    /// When the notice was raised.
    pub requested_at_utc: DateTime<Utc>,
    /// Free-form context for the operator console.
    #[serde(default)]
    pub metadata: Value,
}

/// Broadcasts to the `operators` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum OperatorMessage {
    /// A drone or the scheduler needs an operator to take over.
    RequireIntervention(InterventionNotice),
    /// An intervention session was opened.
    InterventionRequested(InterventionNotice),
}
