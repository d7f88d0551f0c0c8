//! Shared harness for the pipeline integration tests.
//!
//! Wires a real scheduler and inbound handler to in-memory doubles of
//! every external system: the bus records published messages, sinks
//! record what they were handed, and tests play the drone's side by
//! feeding messages back through the handler.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use apiary_bus::{
    Artifact, BusError, BusPublisher, CommandPayload, DroneMessage, DroneRegistrationPayload,
    HubMessage, InterventionNotice, OperatorMessage,
};
use apiary_types::DroneId;

use apiary_runtime::config::ApiaryConfig;
use apiary_runtime::domain::PublicSuffixIndex;
use apiary_runtime::intervention::{
    BrowserController, CommandExecutor, ControlError, InterventionManager,
};
use apiary_runtime::persona::{InMemoryPersonaStore, Persona, PersonaStore};
use apiary_runtime::registry::DroneRegistry;
use apiary_runtime::sinks::{
    ArtifactSink, DeadLetter, DeadLetterSink, InterventionNotifier, SessionSink, SinkError,
};
use apiary_runtime::tracker::CommandLifecycleTracker;
use apiary_runtime::{DroneEventHandler, Scheduler, SchedulerDeps};

/// Bus double that records every outbound message.
#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<Vec<(DroneId, HubMessage)>>,
    operator: Mutex<Vec<OperatorMessage>>,
    fail_publishes: Mutex<usize>,
}

impl MemoryBus {
    /// Makes the next `n` drone publishes fail.
    pub fn fail_next_publishes(&self, n: usize) {
        *self.fail_publishes.lock() = n;
    }

    /// Commands published so far, in order.
    pub fn commands(&self) -> Vec<(DroneId, CommandPayload)> {
        self.published
            .lock()
            .iter()
            .filter_map(|(drone, msg)| match msg {
                HubMessage::ExecuteCommand(payload) => Some((drone.clone(), payload.clone())),
                HubMessage::ExecuteQuery(_) => None,
            })
            .collect()
    }

    pub fn command_count(&self) -> usize {
        self.commands().len()
    }

    pub fn operator_messages(&self) -> Vec<OperatorMessage> {
        self.operator.lock().clone()
    }
}

#[async_trait]
impl BusPublisher for MemoryBus {
    async fn publish_to_drone(
        &self,
        drone_id: &DroneId,
        message: HubMessage,
    ) -> Result<(), BusError> {
        {
            let mut remaining = self.fail_publishes.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::GroupUnavailable(format!("drone_{drone_id}")));
            }
        }
        self.published.lock().push((drone_id.clone(), message));
        Ok(())
    }

    async fn broadcast_operators(&self, message: OperatorMessage) -> Result<(), BusError> {
        self.operator.lock().push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDeadLetters {
    records: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetters {
    pub fn records(&self) -> Vec<DeadLetter> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), SinkError> {
        self.records.lock().push(dead_letter);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<InterventionNotice>>,
}

impl MemoryNotifier {
    pub fn notices(&self) -> Vec<InterventionNotice> {
        self.notices.lock().clone()
    }
}

#[async_trait]
impl InterventionNotifier for MemoryNotifier {
    async fn notify(&self, notice: InterventionNotice) -> Result<(), SinkError> {
        self.notices.lock().push(notice);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryArtifacts {
    pub facts: Mutex<Vec<Value>>,
    pub snippets: Mutex<Vec<Value>>,
    pub other: Mutex<Vec<Artifact>>,
}

#[async_trait]
impl ArtifactSink for MemoryArtifacts {
    async fn store_facts(&self, facts: Vec<Value>) -> Result<(), SinkError> {
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

#[derive(Default)]
pub struct MemorySessions {
    pub updates: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl SessionSink for MemorySessions {
    async fn update_session_state(&self, lease_id: &str, state: Value) -> Result<(), SinkError> {
        self.updates.lock().push((lease_id.to_string(), state));
        Ok(())
    }
}

pub struct NullController;

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

pub struct NullExecutor;

#[async_trait]
impl CommandExecutor for NullExecutor {
    async fn execute(&self, _command: CommandPayload) -> Result<Value, ControlError> {
        Ok(Value::Null)
    }
}

/// A full pipeline with recording doubles at every seam.
pub struct Harness {
    pub scheduler: Scheduler,
    pub handler: DroneEventHandler,
    pub tracker: Arc<CommandLifecycleTracker>,
    pub registry: Arc<DroneRegistry>,
    pub personas: Arc<InMemoryPersonaStore>,
    pub bus: Arc<MemoryBus>,
    pub dead_letters: Arc<MemoryDeadLetters>,
    pub notifier: Arc<MemoryNotifier>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub sessions: Arc<MemorySessions>,
}

impl Harness {
    pub fn new(config: &ApiaryConfig) -> Self {
        let tracker = Arc::new(CommandLifecycleTracker::new());
        let registry = Arc::new(DroneRegistry::new());
        let personas = Arc::new(InMemoryPersonaStore::new());
        let bus = Arc::new(MemoryBus::default());
        let dead_letters = Arc::new(MemoryDeadLetters::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let artifacts = Arc::new(MemoryArtifacts::default());
        let sessions = Arc::new(MemorySessions::default());
        let suffix = Arc::new(PublicSuffixIndex::parse("com\nnet\norg\nuk\nco.uk"));

        let scheduler = Scheduler::new(
            config,
            SchedulerDeps {
                registry: Arc::clone(&registry),
                tracker: Arc::clone(&tracker),
                suffix,
                personas: Arc::clone(&personas) as Arc<dyn PersonaStore>,
                bus: Arc::clone(&bus) as Arc<dyn BusPublisher>,
                dead_letters: Arc::clone(&dead_letters) as Arc<dyn DeadLetterSink>,
                notifier: Arc::clone(&notifier) as Arc<dyn InterventionNotifier>,
            },
        );
        let interventions = InterventionManager::new(
            config.intervention.clone(),
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
            interventions,
            Arc::clone(&bus) as Arc<dyn BusPublisher>,
        );

        Self {
            scheduler,
            handler,
            tracker,
            registry,
            personas,
            bus,
            dead_letters,
            notifier,
            artifacts,
            sessions,
        }
    }

    /// Registers an idle drone with the given capabilities.
    pub fn register_drone(&self, id: &str, capabilities: &[&str]) {
        self.registry.register(DroneRegistrationPayload {
            drone_id: DroneId::new(id),
            connection_id: format!("conn-{id}"),
            version: "1.0.0".into(),
            capabilities: capabilities.iter().map(ToString::to_string).collect(),
        });
    }

    /// Seeds a persona with empty traits.
    pub fn seed_persona(&self, id: &str) {
        self.personas.insert(Persona {
            id: id.into(),
            traits: Value::Null,
            profile: serde_json::json!({"id": id}),
        });
    }

    /// Plays the drone side: acknowledge then report a plain result.
    pub async fn ack_and_complete(&self, drone: &str, command: &str) {
        let drone = DroneId::new(drone);
        self.handler
            .handle(
                &drone,
                DroneMessage::AcknowledgeCommand {
                    command_id: command.into(),
                },
            )
            .await;
        self.handler
            .handle(
                &drone,
                DroneMessage::ReportResult(apiary_bus::CommandResultPayload {
                    command_id: command.into(),
                    result: Value::Null,
                    artifacts: vec![],
                    session_lease_id: None,
                    session_state: None,
                }),
            )
            .await;
    }
}

/// Test config: small queues, fast timeouts, generous limits.
pub fn fast_config() -> ApiaryConfig {
    let mut config = ApiaryConfig::default();
    config.scheduling.ack_timeout_sec = 1;
    config.scheduling.dispatch_loop_delay_ms = 20;
    config.scheduling.persona_missing_base_delay_sec = 1;
    config.scheduling.persona_missing_max_backoff_sec = 2;
    config.limits.qps_per_drone = 1000.0;
    config.limits.burst_limit = 0;
    config
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
