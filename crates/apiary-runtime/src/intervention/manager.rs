//! Intervention session state machine.
//!
//! At most one intervention is active at a time. While active, the
//! drone's browser is handed to a human operator; only whitelisted
//! commands tagged for the session execute, and resuming replays a
//! stored deep-clone of the interrupted command.
//!
//! ```text
//!            initiate()                 resume() / window timeout
//!   Idle ───────────────────► Active ──────────────────────────► Idle
//!                               │  ▲
//!                 handle_command│  │ step recorded,
//!                 (whitelisted) └──┘ step timer reset
//! ```
//!
//! Every transition runs under one mutex; the window and step timers
//! re-check the state before acting, so a timer racing a resume is a
//! no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
// Timer deadlines and step timestamps must share the tokio clock.
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use apiary_bus::{BusPublisher, CommandPayload, InterventionNotice, OperatorMessage};
use apiary_types::{CommandId, ErrorCode, ParamBag};

use crate::config::InterventionConfig;
use crate::metrics::{
    inc_counter, inc_interventions, record_intervention_window_ms, INTERVENTION_STEP_TIMEOUTS,
    INTERVENTION_TIMEOUTS,
};

/// Failure inside the browser controller or command executor backend.
#[derive(Debug, Error)]
#[error("browser control failed: {0}")]
pub struct ControlError(pub String);

/// Operator-session view of the drone's browser.
///
/// Implemented by the host over the drone transport; the manager only
/// needs these four capabilities.
#[async_trait]
pub trait BrowserController: Send + Sync {
    /// Captures a screenshot, returning its storage path.
    async fn screenshot(&self) -> Result<Option<String>, ControlError>;

    /// Reads the browser's current URL.
    async fn current_url(&self) -> Result<Option<String>, ControlError>;

    /// Captures DOM context for the operator console.
    async fn dom_context(&self) -> Result<Value, ControlError>;

    /// Enables or disables direct operator interaction.
    async fn set_operator_interaction(&self, enabled: bool) -> Result<(), ControlError>;
}

/// Executes commands on the paused drone during and after a session.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs one command and returns its result document.
    async fn execute(&self, command: CommandPayload) -> Result<Value, ControlError>;
}

/// Intervention layer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterventionError {
    /// `initiate` was called while a session is active.
    #[error("intervention_active")]
    AlreadyActive,

    /// A session operation was called with no session active.
    #[error("no intervention in progress")]
    NotActive,

    /// The command is not allowed inside an intervention session.
    #[error("invalid_in_intervention_mode")]
    InvalidInInterventionMode,

    /// The executor failed to run an accepted command.
    #[error("intervention command failed: {0}")]
    Executor(String),
}

impl ErrorCode for InterventionError {
    fn code(&self) -> &'static str {
        match self {
            Self::AlreadyActive => "INTERVENTION_ACTIVE",
            Self::NotActive => "INTERVENTION_NOT_ACTIVE",
            Self::InvalidInInterventionMode => "INTERVENTION_INVALID_COMMAND",
            Self::Executor(_) => "INTERVENTION_EXECUTOR",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::AlreadyActive | Self::Executor(_))
    }
}

/// One operator action recorded during a session.
#[derive(Debug, Clone)]
pub struct InterventionStep {
    /// Command kind label.
    pub command_kind: String,
    /// When the step was accepted.
    pub timestamp: chrono::DateTime<Utc>,
    /// The full command.
    pub command: CommandPayload,
}

/// State of one intervention session.
#[derive(Debug, Clone)]
pub struct InterventionContext {
    /// Session id; equals the interrupted command's id.
    pub command_id: CommandId,
    /// The interrupted command's id.
    pub parent_command_id: CommandId,
    /// Why the session was opened.
    pub reason: String,
    /// When the session opened.
    pub started_at: Instant,
    /// Total window budget.
    pub window_ttl: Duration,
    /// Budget between operator steps.
    pub step_ttl: Duration,
    /// When the last step was accepted (session open when none).
    pub last_step_at: Instant,
    /// The interrupted command.
    pub parent_command: CommandPayload,
    /// Deep clone of the parent, id suffixed `_replay`, re-run on
    /// resume.
    pub replayable_action: CommandPayload,
    /// Screenshot captured at open, when enabled.
    pub screenshot_path: Option<String>,
    /// Browser URL at open.
    pub url: Option<String>,
    /// DOM context captured at open.
    pub dom_context: Value,
    /// Accepted operator steps, in order.
    pub steps: Vec<InterventionStep>,
}

/// Options for [`InterventionManager::resume`].
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    /// Command to execute instead of the stored replayable action.
    pub action_override: Option<CommandPayload>,
}

/// Result of a successful resume.
#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    /// Always `true`; kept for wire parity with operator tooling.
    pub resumed: bool,
    /// The interrupted command's id.
    pub parent_command_id: CommandId,
    /// How long the session lasted.
    pub duration: Duration,
}

struct ActiveSession {
    ctx: InterventionContext,
    window_timer: JoinHandle<()>,
    step_timer: JoinHandle<()>,
}

struct ManagerInner {
    config: InterventionConfig,
    controller: Arc<dyn BrowserController>,
    executor: Arc<dyn CommandExecutor>,
    bus: Arc<dyn BusPublisher>,
    stop: CancellationToken,
    state: tokio::sync::Mutex<Option<ActiveSession>>,
}

/// Manages the single intervention session.
#[derive(Clone)]
pub struct InterventionManager {
    inner: Arc<ManagerInner>,
}

impl InterventionManager {
    /// Creates a manager. `stop` silences the timers on shutdown.
    #[must_use]
    pub fn new(
        config: InterventionConfig,
        controller: Arc<dyn BrowserController>,
        executor: Arc<dyn CommandExecutor>,
        bus: Arc<dyn BusPublisher>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                controller,
                executor,
                bus,
                stop,
                state: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Opens a session for an interrupted command.
    ///
    /// Captures browser context (best effort), stores the replayable
    /// clone, arms the window and step timers, enables operator
    /// interaction and notifies the operator group.
    ///
    /// # Errors
    ///
    /// Returns [`InterventionError::AlreadyActive`] when a session is
    /// already open.
    pub async fn initiate(
        &self,
        reason: &str,
        parent: CommandPayload,
    ) -> Result<(), InterventionError> {
        let mut state = self.inner.state.lock().await;
        if state.is_some() {
            return Err(InterventionError::AlreadyActive);
        }

        let screenshot_path = if self.inner.config.attach_screenshot {
            self.inner.controller.screenshot().await.unwrap_or_else(|err| {
                warn!(%err, "screenshot capture failed");
                None
            })
        } else {
            None
        };
        let url = self.inner.controller.current_url().await.unwrap_or_else(|err| {
            warn!(%err, "url capture failed");
            None
        });
        let dom_context = self
            .inner
            .controller
            .dom_context()
            .await
            .unwrap_or_else(|err| {
                warn!(%err, "dom capture failed");
                Value::Null
            });

        let now = Instant::now();
        let window_ttl = Duration::from_secs(self.inner.config.window_ttl_sec);
        let step_ttl = Duration::from_secs(self.inner.config.step_ttl_sec);
        let ctx = InterventionContext {
            command_id: parent.command_id.clone(),
            parent_command_id: parent.command_id.clone(),
            reason: reason.to_string(),
            started_at: now,
            window_ttl,
            step_ttl,
            last_step_at: now,
            replayable_action: parent.replay_clone(),
            parent_command: parent,
            screenshot_path,
            url,
            dom_context,
            steps: Vec::new(),
        };

        if let Err(err) = self.inner.controller.set_operator_interaction(true).await {
            warn!(%err, "failed to enable operator interaction");
        }
        inc_interventions(reason);

        let notice = InterventionNotice {
            command_id: ctx.parent_command_id.clone(),
            drone_id: None,
            kind: "intervention".to_string(),
            reason: reason.to_string(),
            requested_at_utc: Utc::now(),
            metadata: serde_json::json!({
                "url": ctx.url,
                "screenshotPath": ctx.screenshot_path,
            }),
        };
        if let Err(err) = self
            .inner
            .bus
            .broadcast_operators(OperatorMessage::InterventionRequested(notice))
            .await
        {
            warn!(%err, "operator broadcast failed");
        }

        info!(
            command = %ctx.parent_command_id,
            reason,
            window_ttl_sec = self.inner.config.window_ttl_sec,
            "intervention session opened"
        );
        *state = Some(ActiveSession {
            ctx,
            window_timer: self.spawn_window_timer(window_ttl),
            step_timer: self.spawn_step_timer(step_ttl),
        });
        Ok(())
    }

    /// Handles an operator command during an active session.
    ///
    /// Accepts only commands whose parameters carry
    /// `mode == "intervention"` and the session's parent command id,
    /// and whose kind passes the whitelist. Accepted commands are
    /// recorded as steps (resetting the step budget) and forwarded to
    /// the executor.
    ///
    /// # Errors
    ///
    /// [`InterventionError::NotActive`] outside a session,
    /// [`InterventionError::InvalidInInterventionMode`] for rejected
    /// commands, [`InterventionError::Executor`] when the executor
    /// fails.
    pub async fn handle_command(
        &self,
        command: CommandPayload,
    ) -> Result<Value, InterventionError> {
        {
            let mut state = self.inner.state.lock().await;
            let Some(session) = state.as_mut() else {
                return Err(InterventionError::NotActive);
            };

            let mode_ok = command
                .parameters
                .get_str_ci("mode")
                .is_some_and(|mode| mode.eq_ignore_ascii_case("intervention"));
            let parent_ok = command.parameters.get_str_ci("parentCommandId")
                == Some(session.ctx.parent_command_id.as_str());
            if !mode_ok || !parent_ok || !is_whitelisted(&command) {
                debug!(kind = %command.kind, mode_ok, parent_ok, "intervention command rejected");
                return Err(InterventionError::InvalidInInterventionMode);
            }

            session.ctx.steps.push(InterventionStep {
                command_kind: command.kind.clone(),
                timestamp: Utc::now(),
                command: command.clone(),
            });
            // The step timer reads this on its next tick; a fresh step
            // pushes the deadline out.
            session.ctx.last_step_at = Instant::now();
        }

        self.inner
            .executor
            .execute(command)
            .await
            .map_err(|err| InterventionError::Executor(err.to_string()))
    }

    /// Closes the session and replays the stored action (or an
    /// override). Replay failures are logged, never propagated.
    ///
    /// # Errors
    ///
    /// Returns [`InterventionError::NotActive`] when no session is
    /// open.
    pub async fn resume(
        &self,
        options: Option<ResumeOptions>,
    ) -> Result<ResumeOutcome, InterventionError> {
        let session = {
            let mut state = self.inner.state.lock().await;
            state.take().ok_or(InterventionError::NotActive)?
        };
        session.window_timer.abort();
        session.step_timer.abort();

        if let Err(err) = self.inner.controller.set_operator_interaction(false).await {
            warn!(%err, "failed to disable operator interaction");
        }

        let action = options
            .and_then(|o| o.action_override)
            .unwrap_or_else(|| session.ctx.replayable_action.clone());
        let replay_id = action.command_id.clone();
        match self.inner.executor.execute(action).await {
            Ok(_) => debug!(command = %replay_id, "replay action executed"),
            Err(err) => warn!(command = %replay_id, %err, "replay action failed"),
        }

        let duration = session.ctx.started_at.elapsed();
        record_intervention_window_ms(duration.as_millis() as f64);
        info!(
            command = %session.ctx.parent_command_id,
            duration_ms = duration.as_millis() as u64,
            steps = session.ctx.steps.len(),
            "intervention session resumed"
        );
        Ok(ResumeOutcome {
            resumed: true,
            parent_command_id: session.ctx.parent_command_id.clone(),
            duration,
        })
    }

    /// Snapshot of the active session, when any.
    pub async fn current(&self) -> Option<InterventionContext> {
        self.inner.state.lock().await.as_ref().map(|s| s.ctx.clone())
    }

    fn spawn_window_timer(&self, window_ttl: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                () = inner.stop.cancelled() => return,
                () = tokio::time::sleep(window_ttl) => {}
            }

            let mut state = inner.state.lock().await;
            let Some(session) = state.take() else {
                // Resumed while the timer was waiting on the lock.
                return;
            };
            session.step_timer.abort();
            drop(state);

            warn!(
                command = %session.ctx.parent_command_id,
                "intervention window expired"
            );
            inc_counter(INTERVENTION_TIMEOUTS);
            if let Err(err) = inner.controller.set_operator_interaction(false).await {
                warn!(%err, "failed to disable operator interaction");
            }
        })
    }

    fn spawn_step_timer(&self, step_ttl: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut wait = step_ttl;
            loop {
                tokio::select! {
                    () = inner.stop.cancelled() => return,
                    () = tokio::time::sleep(wait) => {}
                }

                let mut state = inner.state.lock().await;
                let since_step = match state.as_ref() {
                    Some(session) => session.ctx.last_step_at.elapsed(),
                    None => return,
                };
                if since_step < step_ttl {
                    // A step landed; sleep out the remainder.
                    wait = step_ttl - since_step;
                    continue;
                }
                let Some(session) = state.take() else { return };
                session.window_timer.abort();
                drop(state);

                warn!(
                    command = %session.ctx.parent_command_id,
                    idle_sec = since_step.as_secs(),
                    "intervention step budget expired"
                );
                inc_counter(INTERVENTION_STEP_TIMEOUTS);
                if let Err(err) = inner.controller.set_operator_interaction(false).await {
                    warn!(%err, "failed to disable operator interaction");
                }
                return;
            }
        })
    }
}

/// Command kinds an operator may run inside a session.
fn is_whitelisted(command: &CommandPayload) -> bool {
    const DIRECT: &[&str] = &["navigate", "type", "click", "waitforelement"];

    let kind = command.kind.as_str();
    if DIRECT.iter().any(|allowed| kind.eq_ignore_ascii_case(allowed)) {
        return true;
    }
    if kind.eq_ignore_ascii_case("executescript") {
        return command.parameters.flag_ci("safe");
    }
    if kind.eq_ignore_ascii_case("managecookies") {
        return command
            .parameters
            .get_str_ci("operation")
            .or_else(|| command.parameters.get_str_ci("action"))
            .is_some_and(|op| {
                op.eq_ignore_ascii_case("import") || op.eq_ignore_ascii_case("export")
            });
    }

    let lower = kind.to_lowercase();
    lower.contains("wait") || lower.contains("scroll") || lower.contains("mousemove")
}
