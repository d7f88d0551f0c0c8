//! Outbound sink contracts.
//!
//! Artifact storage, session persistence, dead-lettering and operator
//! notification are external systems. The runtime talks to them through
//! these seams and treats every sink failure as log-and-continue: a
//! broken sink must never stall the dispatch pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use apiary_bus::{Artifact, InterventionNotice};
use apiary_types::{CommandId, DroneId, ErrorCode, PersonaId};

/// Failure inside a sink backend.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The backend rejected the payload or could not be reached.
    #[error("sink operation failed: {0}")]
    Backend(String),
}

impl ErrorCode for SinkError {
    fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "SINK_BACKEND",
        }
    }

    fn is_recoverable(&self) -> bool {
        true
    }
}

/// A command that cannot be progressed any further.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The command that was abandoned.
    pub command_id: CommandId,
    /// Terminal reason label (e.g. `missing_persona`).
    pub reason: String,
    /// Persona the command was meant to run as, when relevant.
    #[serde(default)]
    pub persona_id: Option<PersonaId>,
    /// Drone the command was last routed to, when any.
    #[serde(default)]
    pub drone_id: Option<DroneId>,
    /// How many delivery attempts were made.
    pub retry_count: u32,
    /// When the command was abandoned.
    pub failed_at_utc: DateTime<Utc>,
    /// Free-form context for triage.
    #[serde(default)]
    pub metadata: Value,
}

/// Terminal sink for abandoned commands.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Records an abandoned command.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the backend rejects the record.
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), SinkError>;
}

/// Persistence for artifacts attached to command results.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Stores a batch of extracted facts.
    async fn store_facts(&self, facts: Vec<Value>) -> Result<(), SinkError>;

    /// Stores a batch of page snippets.
    async fn store_snippets(&self, snippets: Vec<Value>) -> Result<(), SinkError>;

    /// Stores any other artifact type.
    async fn store_artifact(&self, artifact: Artifact) -> Result<(), SinkError>;
}

/// Persistence for browser session state.
#[async_trait]
pub trait SessionSink: Send + Sync {
    /// Replaces the state stored under a session lease.
    async fn update_session_state(&self, lease_id: &str, state: Value) -> Result<(), SinkError>;
}

/// Delivery of intervention notices to operator-facing systems beyond
/// the bus broadcast (pagers, ticketing, dashboards).
#[async_trait]
pub trait InterventionNotifier: Send + Sync {
    /// Delivers a notice.
    async fn notify(&self, notice: InterventionNotice) -> Result<(), SinkError>;
}

/// Routes a result's artifacts to the matching sink operations.
///
/// `facts` and `snippets` artifacts unwrap their data arrays into the
/// dedicated batch calls; everything else goes to the generic store.
/// Failures are logged per artifact and never propagate.
pub async fn route_artifacts(sink: &dyn ArtifactSink, artifacts: Vec<Artifact>) {
    for artifact in artifacts {
        let outcome = match artifact.kind.as_str() {
            "facts" => sink.store_facts(value_batch(artifact.data)).await,
            "snippets" => sink.store_snippets(value_batch(artifact.data)).await,
            _ => sink.store_artifact(artifact).await,
        };
        if let Err(err) = outcome {
            warn!(%err, "artifact sink failed, dropping artifact");
        }
    }
}

/// Unwraps an artifact data value into a batch; a non-array becomes a
/// single-element batch.
fn value_batch(data: Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items,
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingArtifactSink {
        facts: Mutex<Vec<Value>>,
        snippets: Mutex<Vec<Value>>,
        other: Mutex<Vec<Artifact>>,
        fail_facts: bool,
    }

    #[async_trait]
    impl ArtifactSink for RecordingArtifactSink {
        async fn store_facts(&self, facts: Vec<Value>) -> Result<(), SinkError> {
            if self.fail_facts {
                return Err(SinkError::Backend("facts store down".into()));
            }
            self.facts.lock().extend(facts);
            Ok(())
        }

        async fn store_snippets(&self, snippets: Vec<Value>) -> Result<(), SinkError> {
            self.snippets.lock().extend(snippets);
            Ok(())
        }

        async fn store_artifact(&self, artifact: Artifact) -> Result<(), SinkError> {
            self.other.lock().push(artifact);
            Ok(())
        }
    }

    fn artifact(kind: &str, data: Value) -> Artifact {
        Artifact {
            kind: kind.into(),
            data,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn routes_by_artifact_type() {
        let sink = RecordingArtifactSink::default();
        route_artifacts(
            &sink,
            vec![
                artifact("facts", json!([{"k": 1}, {"k": 2}])),
                artifact("snippets", json!([{"text": "hi"}])),
                artifact("screenshot", json!({"path": "/tmp/x.png"})),
            ],
        )
        .await;

        assert_eq!(sink.facts.lock().len(), 2);
        assert_eq!(sink.snippets.lock().len(), 1);
        assert_eq!(sink.other.lock().len(), 1);
        assert_eq!(sink.other.lock()[0].kind, "screenshot");
    }

    #[tokio::test]
    async fn non_array_data_becomes_single_batch() {
        let sink = RecordingArtifactSink::default();
        route_artifacts(&sink, vec![artifact("facts", json!({"k": 1}))]).await;
        assert_eq!(sink.facts.lock().len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_routing() {
        let sink = RecordingArtifactSink {
            fail_facts: true,
            ..Default::default()
        };
        route_artifacts(
            &sink,
            vec![
                artifact("facts", json!([{"k": 1}])),
                artifact("snippets", json!([{"text": "hi"}])),
            ],
        )
        .await;

        // The failing facts batch is dropped; snippets still land.
        assert!(sink.facts.lock().is_empty());
        assert_eq!(sink.snippets.lock().len(), 1);
    }

    #[test]
    fn dead_letter_serializes_in_camel_case() {
        let record = DeadLetter {
            command_id: CommandId::new("c1"),
            reason: "missing_persona".into(),
            persona_id: Some(PersonaId::new("pX")),
            drone_id: None,
            retry_count: 3,
            failed_at_utc: Utc::now(),
            metadata: json!({"enqueuedAt": "2026-08-02T00:00:00Z"}),
        };
        let value = serde_json::to_value(&record).expect("serialize dead letter");
        assert_eq!(value["commandId"], "c1");
        assert_eq!(value["retryCount"], 3);
        assert_eq!(value["personaId"], "pX");
    }
}
