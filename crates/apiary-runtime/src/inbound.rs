//! Inbound drone message handling.
//!
//! The transport delivers authenticated drone→hub messages here; this
//! handler maps each onto the owning component: acknowledgements and
//! terminal signals to the lifecycle tracker, registrations and
//! heartbeats to the registry, artifacts and session state to their
//! sinks, intervention requests to the manager. Sink failures are
//! logged and swallowed; a broken sink never stalls message handling.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use apiary_bus::{
    BusPublisher, CommandErrorPayload, CommandPayload, CommandResultPayload, DroneMessage,
    InterventionNotice, InterventionPayload, OperatorMessage,
};
use apiary_types::{DroneId, ParamBag};

use crate::intervention::{InterventionError, InterventionManager};
use crate::registry::DroneRegistry;
use crate::sinks::{route_artifacts, ArtifactSink, SessionSink};
use crate::tracker::CommandLifecycleTracker;

/// Applies drone→hub messages to the runtime's components.
pub struct DroneEventHandler {
    tracker: Arc<CommandLifecycleTracker>,
    registry: Arc<DroneRegistry>,
    artifacts: Arc<dyn ArtifactSink>,
    sessions: Arc<dyn SessionSink>,
    interventions: InterventionManager,
    bus: Arc<dyn BusPublisher>,
}

impl DroneEventHandler {
    /// Wires the handler to the runtime's shared components.
    #[must_use]
    pub fn new(
        tracker: Arc<CommandLifecycleTracker>,
        registry: Arc<DroneRegistry>,
        artifacts: Arc<dyn ArtifactSink>,
        sessions: Arc<dyn SessionSink>,
        interventions: InterventionManager,
        bus: Arc<dyn BusPublisher>,
    ) -> Self {
        Self {
            tracker,
            registry,
            artifacts,
            sessions,
            interventions,
            bus,
        }
    }

    /// Handles one message from `drone_id`.
    pub async fn handle(&self, drone_id: &DroneId, message: DroneMessage) {
        match message {
            DroneMessage::RegisterDrone(payload) => {
                if payload.drone_id != *drone_id {
                    warn!(
                        claimed = %payload.drone_id,
                        connected = %drone_id,
                        "registration id does not match connection, ignoring"
                    );
                    return;
                }
                self.registry.register(payload);
            }
            DroneMessage::AcknowledgeCommand { command_id } => {
                self.tracker.mark_acknowledged(&command_id, drone_id);
            }
            DroneMessage::ReportResult(payload) => self.handle_result(drone_id, payload).await,
            DroneMessage::ReportError(payload) => self.handle_error(drone_id, payload),
            DroneMessage::ReportStatus(_payload) => {
                self.registry.touch_heartbeat(drone_id);
            }
            DroneMessage::RequireIntervention(payload) => {
                self.handle_intervention(drone_id, payload).await;
            }
            DroneMessage::QueryResponse(payload) => {
                debug!(query = %payload.query_id, "query response received");
            }
        }
    }

    async fn handle_result(&self, drone_id: &DroneId, payload: CommandResultPayload) {
        debug!(command = %payload.command_id, drone = %drone_id, "result received");
        self.tracker.complete(&payload.command_id, drone_id);
        self.registry.mark_idle(drone_id);
        self.registry.touch_heartbeat(drone_id);

        if !payload.artifacts.is_empty() {
            route_artifacts(self.artifacts.as_ref(), payload.artifacts).await;
        }
        if let (Some(lease_id), Some(state)) = (payload.session_lease_id, payload.session_state) {
            if let Err(err) = self.sessions.update_session_state(&lease_id, state).await {
                warn!(lease_id, %err, "session state update failed");
            }
        }
    }

    fn handle_error(&self, drone_id: &DroneId, payload: CommandErrorPayload) {
        let reason = payload
            .error_type
            .as_deref()
            .unwrap_or("drone_error")
            .to_string();
        warn!(
            command = %payload.command_id,
            drone = %drone_id,
            error = %payload.error,
            reason,
            can_retry = payload.can_retry,
            "error reported"
        );
        self.tracker.fail(&payload.command_id, drone_id, &reason);
        self.registry.record_error(drone_id);
        self.registry.mark_idle(drone_id);
        self.registry.touch_heartbeat(drone_id);
        if payload.can_retry {
            // The drone considers this transient; surfaced for the
            // submitter, which owns resubmission.
            info!(command = %payload.command_id, "drone marked the failure retryable");
        }
    }

    async fn handle_intervention(&self, drone_id: &DroneId, payload: InterventionPayload) {
        info!(
            command = %payload.command_id,
            drone = %drone_id,
            kind = %payload.kind,
            "drone requires intervention"
        );

        let notice = InterventionNotice {
            command_id: payload.command_id.clone(),
            drone_id: Some(drone_id.clone()),
            kind: payload.kind.clone(),
            reason: payload.kind.clone(),
            requested_at_utc: chrono::Utc::now(),
            metadata: payload.data.clone(),
        };
        if let Err(err) = self
            .bus
            .broadcast_operators(OperatorMessage::RequireIntervention(notice))
            .await
        {
            warn!(%err, "operator broadcast failed");
        }

        let parent = parent_from_intervention(&payload);
        match self.interventions.initiate(&payload.kind, parent).await {
            Ok(()) => {}
            Err(InterventionError::AlreadyActive) => {
                warn!(
                    command = %payload.command_id,
                    "intervention already active, request queued with operators only"
                );
            }
            Err(err) => warn!(%err, "failed to open intervention session"),
        }
    }
}

/// Reconstructs a parent command payload from an intervention request.
///
/// The drone reports the interrupted command's id and context, not the
/// original payload; the replayable action therefore carries the
/// captured context (including any resume token) as its parameters.
fn parent_from_intervention(payload: &InterventionPayload) -> CommandPayload {
    let kind = payload
        .data
        .get_str_ci("commandType")
        .unwrap_or("resume")
        .to_string();
    let mut parameters = payload.data.clone();
    if let (Some(obj), Some(token)) = (parameters.as_object_mut(), &payload.resume_token) {
        obj.insert("resumeToken".to_string(), Value::String(token.clone()));
    }
    CommandPayload {
        command_id: payload.command_id.clone(),
        kind,
        parameters,
        persona: Value::Null,
        session: None,
        timeout_sec: 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    use apiary_bus::{Artifact, BusError, DroneRegistrationPayload, HubMessage};
    use apiary_types::CommandId;

    use crate::config::InterventionConfig;
    use crate::intervention::{BrowserController, CommandExecutor, ControlError};
    use crate::registry::DroneStatus;
    use crate::sinks::SinkError;
    use crate::tracker::PacingToken;

    #[derive(Default)]
    struct MemoryArtifacts {
        facts: Mutex<Vec<Value>>,
        other: Mutex<Vec<Artifact>>,
    }

    #[async_trait]
    impl ArtifactSink for MemoryArtifacts {
        async fn store_facts(&self, facts: Vec<Value>) -> Result<(), SinkError> {
            self.facts.lock().extend(facts);
            Ok(())
        }

        async fn store_snippets(&self, _snippets: Vec<Value>) -> Result<(), SinkError> {
            Ok(())
        }

        async fn store_artifact(&self, artifact: Artifact) -> Result<(), SinkError> {
            self.other.lock().push(artifact);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemorySessions {
        updates: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl SessionSink for MemorySessions {
        async fn update_session_state(&self, lease_id: &str, state: Value) -> Result<(), SinkError> {
            self.updates.lock().push((lease_id.to_string(), state));
            Ok(())
        }
    }

    #[derive(Default)]
    struct NullBus {
        operator_messages: Mutex<Vec<OperatorMessage>>,
    }

    #[async_trait]
    impl BusPublisher for NullBus {
        async fn publish_to_drone(
            &self,
            _drone_id: &DroneId,
            _message: HubMessage,
        ) -> Result<(), BusError> {
            Ok(())
        }

        async fn broadcast_operators(&self, message: OperatorMessage) -> Result<(), BusError> {
            self.operator_messages.lock().push(message);
            Ok(())
        }
    }

    struct NullController;

    #[async_trait]
    impl BrowserController for NullController {
        async fn screenshot(&self) -> Result<Option<String>, ControlError> {
            Ok(None)
        }

        async fn current_url(&self) -> Result<Option<String>, ControlError> {
            Ok(None)
        }

        async fn dom_context(&self) -> Result<Value, ControlError> {
            Ok(Value::Null)
        }

        async fn set_operator_interaction(&self, _enabled: bool) -> Result<(), ControlError> {
            Ok(())
        }
    }

    struct NullExecutor;

    #[async_trait]
    impl CommandExecutor for NullExecutor {
        async fn execute(&self, _command: CommandPayload) -> Result<Value, ControlError> {
            Ok(Value::Null)
        }
    }

    struct Fixture {
        handler: DroneEventHandler,
        tracker: Arc<CommandLifecycleTracker>,
        registry: Arc<DroneRegistry>,
        artifacts: Arc<MemoryArtifacts>,
        sessions: Arc<MemorySessions>,
        bus: Arc<NullBus>,
        interventions: InterventionManager,
    }

    fn fixture() -> Fixture {
        let tracker = Arc::new(CommandLifecycleTracker::new());
        let registry = Arc::new(DroneRegistry::new());
        let artifacts = Arc::new(MemoryArtifacts::default());
        let sessions = Arc::new(MemorySessions::default());
        let bus = Arc::new(NullBus::default());
        let interventions = InterventionManager::new(
            InterventionConfig {
                attach_screenshot: false,
                ..InterventionConfig::default()
            },
            Arc::new(NullController),
            Arc::new(NullExecutor),
            Arc::clone(&bus) as Arc<dyn BusPublisher>,
            CancellationToken::new(),
        );
        let handler = DroneEventHandler::new(
            Arc::clone(&tracker),
            Arc::clone(&registry),
            Arc::clone(&artifacts) as Arc<dyn ArtifactSink>,
            Arc::clone(&sessions) as Arc<dyn SessionSink>,
            interventions.clone(),
            Arc::clone(&bus) as Arc<dyn BusPublisher>,
        );
        Fixture {
            handler,
            tracker,
            registry,
            artifacts,
            sessions,
            bus,
            interventions,
        }
    }

    fn drone() -> DroneId {
        DroneId::new("d1")
    }

    fn registered(f: &Fixture) {
        f.registry.register(DroneRegistrationPayload {
            drone_id: drone(),
            connection_id: "conn-1".into(),
            version: "1.0.0".into(),
            capabilities: vec![],
        });
    }

    fn track(f: &Fixture, command: &str) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&semaphore)
            .try_acquire_owned()
            .expect("permit available");
        f.tracker
            .register_dispatch(
                &CommandId::new(command),
                &drone(),
                PacingToken::new(permit),
                None,
            )
            .expect("register");
        f.registry.mark_busy(&drone(), &CommandId::new(command));
        semaphore
    }

    #[tokio::test]
    async fn register_message_populates_registry() {
        let f = fixture();
        f.handler
            .handle(
                &drone(),
                DroneMessage::RegisterDrone(DroneRegistrationPayload {
                    drone_id: drone(),
                    connection_id: "conn-1".into(),
                    version: "2.0.0".into(),
                    capabilities: vec!["browser".into()],
                }),
            )
            .await;
        let info = f.registry.snapshot(&drone()).expect("registered");
        assert_eq!(info.version, "2.0.0");
    }

    #[tokio::test]
    async fn mismatched_registration_is_ignored() {
        let f = fixture();
        f.handler
            .handle(
                &drone(),
                DroneMessage::RegisterDrone(DroneRegistrationPayload {
                    drone_id: DroneId::new("impostor"),
                    connection_id: "conn-x".into(),
                    version: "1.0.0".into(),
                    capabilities: vec![],
                }),
            )
            .await;
        assert!(f.registry.snapshot(&DroneId::new("impostor")).is_none());
    }

    #[tokio::test]
    async fn result_completes_command_and_routes_artifacts() {
        let f = fixture();
        registered(&f);
        let semaphore = track(&f, "c1");

        f.handler
            .handle(
                &drone(),
                DroneMessage::ReportResult(CommandResultPayload {
                    command_id: CommandId::new("c1"),
                    result: json!({"ok": true}),
                    artifacts: vec![Artifact {
                        kind: "facts".into(),
                        data: json!([{"k": 1}]),
                        metadata: None,
                    }],
                    session_lease_id: Some("lease-1".into()),
                    session_state: Some(json!({"cookies": []})),
                }),
            )
            .await;

        assert!(!f.tracker.is_tracked(&CommandId::new("c1")));
        assert_eq!(semaphore.available_permits(), 1);
        assert_eq!(f.artifacts.facts.lock().len(), 1);
        assert_eq!(f.sessions.updates.lock().len(), 1);
        assert_eq!(f.sessions.updates.lock()[0].0, "lease-1");
        assert!(f
            .registry
            .snapshot(&drone())
            .expect("snapshot")
            .status
            .is_idle());
    }

    #[tokio::test]
    async fn error_fails_command_and_counts_against_drone() {
        let f = fixture();
        registered(&f);
        let semaphore = track(&f, "c2");

        f.handler
            .handle(
                &drone(),
                DroneMessage::ReportError(CommandErrorPayload {
                    command_id: CommandId::new("c2"),
                    error: "page crashed".into(),
                    error_type: Some("renderer".into()),
                    can_retry: true,
                }),
            )
            .await;

        assert!(!f.tracker.is_tracked(&CommandId::new("c2")));
        assert_eq!(semaphore.available_permits(), 1);
        let info = f.registry.snapshot(&drone()).expect("snapshot");
        assert_eq!(info.error_count, 1);
        assert!(info.status.is_idle());
    }

    #[tokio::test]
    async fn ack_message_reaches_tracker() {
        let f = fixture();
        registered(&f);
        track(&f, "c3");

        f.handler
            .handle(
                &drone(),
                DroneMessage::AcknowledgeCommand {
                    command_id: CommandId::new("c3"),
                },
            )
            .await;
        let outcome = f
            .tracker
            .wait_for_acknowledgement(&CommandId::new("c3"), std::time::Duration::from_millis(50))
            .await;
        assert_eq!(outcome, crate::tracker::AckOutcome::Acknowledged);
    }

    #[tokio::test]
    async fn status_refreshes_heartbeat() {
        let f = fixture();
        registered(&f);
        f.registry.mark_disconnected(&drone());

        f.handler
            .handle(
                &drone(),
                DroneMessage::ReportStatus(apiary_bus::StatusPayload {
                    status: "idle".into(),
                    current_command: None,
                    progress: None,
                    memory_usage: None,
                    cpu_usage: None,
                }),
            )
            .await;
        assert_ne!(
            f.registry.snapshot(&drone()).expect("snapshot").status,
            DroneStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn intervention_request_notifies_and_opens_session() {
        let f = fixture();
        registered(&f);

        f.handler
            .handle(
                &drone(),
                DroneMessage::RequireIntervention(InterventionPayload {
                    command_id: CommandId::new("c4"),
                    kind: "captcha".into(),
                    data: json!({"commandType": "navigate"}),
                    resume_token: Some("tok-1".into()),
                }),
            )
            .await;

        // Operator broadcast plus the manager's own session-open notice.
        assert_eq!(f.bus.operator_messages.lock().len(), 2);
        let ctx = f.interventions.current().await.expect("session opened");
        assert_eq!(ctx.parent_command_id.as_str(), "c4");
        assert_eq!(ctx.parent_command.kind, "navigate");
        assert_eq!(
            ctx.replayable_action.parameters["resumeToken"],
            json!("tok-1")
        );
        assert_eq!(ctx.replayable_action.command_id.as_str(), "c4_replay");
    }

    #[tokio::test]
    async fn second_intervention_request_keeps_first_session() {
        let f = fixture();
        registered(&f);
        for cmd in ["c5", "c6"] {
            f.handler
                .handle(
                    &drone(),
                    DroneMessage::RequireIntervention(InterventionPayload {
                        command_id: CommandId::new(cmd),
                        kind: "captcha".into(),
                        data: json!({}),
                        resume_token: None,
                    }),
                )
                .await;
        }
        let ctx = f.interventions.current().await.expect("session");
        assert_eq!(ctx.parent_command_id.as_str(), "c5");
    }
}
