//! Real-time voice preview against a remote voice-agent backend
//!
//! Captures the microphone, streams PCM16 frames over a WebSocket to the
//! backend, plays the agent's audio back gaplessly and halts playback when
//! the backend signals an interrupt.
//!
//! [`VoicePreview`] is the entry point. It owns a single-writer state loop:
//! every transition goes through [`state_machine::reduce`], and the effect
//! runner performs the I/O and reports back with events.

pub mod audio;
pub mod effects;
pub mod error;
pub mod interrupt;
pub mod metrics;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use effects::{EffectRunner, PreviewBackends, PreviewEffectRunner};
pub use error::{PreviewError, SessionOutcome};
pub use settings::PreviewSettings;

use state_machine::{reduce, Effect, Event, State};

const EVENT_QUEUE: usize = 64;

/// Session status published to observers.
/// Uses tagged union format: { "status": "idle" } or { "status": "active", "sessionId": "...", "elapsedSecs": 5 }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PreviewStatus {
    Idle,
    RequestingToken {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },
    Connecting {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        #[serde(rename = "deviceReady")]
        device_ready: bool,
    },
    Active {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
    },
    Stopping {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },
    Closed {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        outcome: SessionOutcome,
    },
    Errored {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        error: PreviewError,
        /// Whatever the failed start acquired has been released
        released: bool,
    },
}

impl PreviewStatus {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            PreviewStatus::Idle => None,
            PreviewStatus::RequestingToken { session_id }
            | PreviewStatus::Connecting { session_id, .. }
            | PreviewStatus::Active { session_id, .. }
            | PreviewStatus::Stopping { session_id }
            | PreviewStatus::Closed { session_id, .. }
            | PreviewStatus::Errored { session_id, .. } => Some(*session_id),
        }
    }

    /// Pending, active or tearing down
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            PreviewStatus::RequestingToken { .. }
                | PreviewStatus::Connecting { .. }
                | PreviewStatus::Active { .. }
                | PreviewStatus::Stopping { .. }
        )
    }

    /// Live, or failed with teardown still running
    pub fn holds_resources(&self) -> bool {
        self.is_live() || matches!(self, PreviewStatus::Errored { released: false, .. })
    }

    /// Terminal status of the last session, if it has ended
    pub fn outcome(&self) -> Option<SessionOutcome> {
        match self {
            PreviewStatus::Closed { outcome, .. } => Some(outcome.clone()),
            PreviewStatus::Errored { error, .. } => {
                Some(SessionOutcome::EndedWithError(error.clone()))
            }
            _ => None,
        }
    }
}

/// Convert internal State to PreviewStatus for observers
fn state_to_status(state: &State) -> PreviewStatus {
    match state {
        State::Idle => PreviewStatus::Idle,
        State::RequestingToken { session } => PreviewStatus::RequestingToken {
            session_id: session.id,
        },
        State::Connecting {
            session,
            device_ready,
            ..
        } => PreviewStatus::Connecting {
            session_id: session.id,
            device_ready: *device_ready,
        },
        State::Active {
            session,
            started_at,
        } => PreviewStatus::Active {
            session_id: session.id,
            elapsed_secs: started_at.elapsed().as_secs(),
        },
        State::Stopping { session, .. } => PreviewStatus::Stopping {
            session_id: session.id,
        },
        State::Closed {
            session_id,
            outcome,
        } => PreviewStatus::Closed {
            session_id: *session_id,
            outcome: outcome.clone(),
        },
        State::Errored {
            session_id,
            error,
            released,
        } => PreviewStatus::Errored {
            session_id: *session_id,
            error: error.clone(),
            released: *released,
        },
    }
}

/// What the watch channel carries
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: PreviewStatus,
    /// Id of the most recent `Start` the loop has processed, accepted or not
    pub last_start: Option<Uuid>,
}

impl Default for StatusUpdate {
    fn default() -> Self {
        Self {
            status: PreviewStatus::Idle,
            last_start: None,
        }
    }
}

/// How a `start()` call resolved
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// Session is streaming
    Active(Uuid),
    /// Another session is pending or active; nothing was started
    AlreadyRunning,
    /// The session was stopped or closed before it was seen active
    Ended {
        session_id: Uuid,
        outcome: SessionOutcome,
    },
}

async fn run_state_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    status_tx: watch::Sender<StatusUpdate>,
) {
    let mut state = State::default();
    let mut last_start = None;

    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            if state.is_live() {
                log::warn!("Exit requested with a live session: {:?}", state);
            }
            log::info!("Exit requested, shutting down state loop");
            break;
        }

        let start_id = match &event {
            Event::Start { id, .. } => Some(*id),
            _ => None,
        };

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        // Log state transitions
        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;

        let mut publish = start_id.is_some();
        if start_id.is_some() {
            last_start = start_id;
        }

        // Execute effects
        for eff in effects {
            match eff {
                Effect::EmitStatus => publish = true,
                other => effect_runner.spawn(other, tx.clone()),
            }
        }

        if publish {
            let update = StatusUpdate {
                status: state_to_status(&state),
                last_start,
            };
            log::debug!(
                "Status: {}",
                serde_json::to_string(&update.status).unwrap_or_default()
            );
            status_tx.send_replace(update);
        }
    }

    log::info!("State loop ended");
}

/// Handle to the preview engine. At most one session is live at a time.
///
/// Must be created inside a tokio runtime.
pub struct VoicePreview {
    tx: mpsc::Sender<Event>,
    status_rx: watch::Receiver<StatusUpdate>,
    runner: Arc<dyn EffectRunner>,
    state_loop: JoinHandle<()>,
    /// Serializes start/stop so each sees the other's effect on the status
    control: Mutex<()>,
}

impl VoicePreview {
    pub fn new(settings: PreviewSettings, backends: PreviewBackends) -> Result<Self, PreviewError> {
        let runner = PreviewEffectRunner::new(settings, backends)?;
        Ok(Self::with_runner(runner))
    }

    pub fn with_runner(runner: Arc<dyn EffectRunner>) -> Self {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_QUEUE);
        let (status_tx, status_rx) = watch::channel(StatusUpdate::default());
        let state_loop = tokio::spawn(run_state_loop(rx, tx.clone(), runner.clone(), status_tx));

        Self {
            tx,
            status_rx,
            runner,
            state_loop,
            control: Mutex::new(()),
        }
    }

    pub fn status(&self) -> PreviewStatus {
        self.status_rx.borrow().status.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusUpdate> {
        self.status_rx.clone()
    }

    /// Start a preview session and wait until it is streaming or has failed.
    ///
    /// A call while another session is live is a no-op that returns
    /// [`StartOutcome::AlreadyRunning`]. Start failures (device, token,
    /// channel) are returned as errors.
    pub async fn start(
        &self,
        agent_ref: &str,
        tenant_ref: &str,
    ) -> Result<StartOutcome, PreviewError> {
        let id = Uuid::new_v4();
        let mut status = self.status_rx.clone();

        {
            let _control = self.control.lock().await;
            self.tx
                .send(Event::Start {
                    id,
                    agent_ref: agent_ref.to_string(),
                    tenant_ref: tenant_ref.to_string(),
                })
                .await
                .map_err(|_| PreviewError::EngineStopped)?;

            let update = status
                .wait_for(|u| u.last_start == Some(id))
                .await
                .map_err(|_| PreviewError::EngineStopped)?;
            if update.status.session_id() != Some(id) {
                log::info!("Start ignored: session already in progress");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }

        // A failed start returns only after its teardown has finished
        let settled = status
            .wait_for(|u| {
                u.status.session_id() != Some(id)
                    || !matches!(
                        u.status,
                        PreviewStatus::RequestingToken { .. }
                            | PreviewStatus::Connecting { .. }
                            | PreviewStatus::Errored { released: false, .. }
                    )
            })
            .await
            .map_err(|_| PreviewError::EngineStopped)?
            .status
            .clone();

        match settled {
            PreviewStatus::Active { .. } => Ok(StartOutcome::Active(id)),
            PreviewStatus::Errored { error, .. } => Err(error),
            PreviewStatus::Closed { outcome, .. } => Ok(StartOutcome::Ended {
                session_id: id,
                outcome,
            }),
            _ => {
                let outcome = self.wait_for_session(id).await?;
                Ok(StartOutcome::Ended {
                    session_id: id,
                    outcome,
                })
            }
        }
    }

    /// Stop the live session and wait until its resources are released.
    /// No-op when nothing is running. After a failed start, waits for that
    /// start's teardown to finish.
    pub async fn stop(&self) -> Result<(), PreviewError> {
        let current = {
            let _control = self.control.lock().await;
            let current = self.status_rx.borrow().status.clone();
            if current.is_live() {
                self.tx
                    .send(Event::Stop)
                    .await
                    .map_err(|_| PreviewError::EngineStopped)?;
            }
            current
        };

        if !current.holds_resources() {
            return Ok(());
        }
        if let Some(id) = current.session_id() {
            self.wait_for_session(id).await?;
        }
        Ok(())
    }

    /// Wait until the most recent session has ended and released its
    /// resources, and return its outcome.
    ///
    /// Returns at once if that session has already ended. Before any session
    /// has started, waits for the first one to end.
    pub async fn wait_for_outcome(&self) -> Result<SessionOutcome, PreviewError> {
        let mut status = self.status_rx.clone();
        let update = status
            .wait_for(|u| u.status.outcome().is_some() && !u.status.holds_resources())
            .await
            .map_err(|_| PreviewError::EngineStopped)?;
        update.status.outcome().ok_or(PreviewError::EngineStopped)
    }

    async fn wait_for_session(&self, id: Uuid) -> Result<SessionOutcome, PreviewError> {
        let mut status = self.status_rx.clone();
        let update = status
            .wait_for(|u| u.status.session_id() != Some(id) || !u.status.holds_resources())
            .await
            .map_err(|_| PreviewError::EngineStopped)?;
        Ok(update
            .status
            .outcome()
            .unwrap_or(SessionOutcome::EndedNormally))
    }

    /// Stop any live session, end the state loop and wait for teardown to finish
    pub async fn shutdown(self) {
        if let Err(e) = self.stop().await {
            log::warn!("Stop during shutdown failed: {}", e);
        }
        let _ = self.tx.send(Event::Exit).await;
        if let Err(e) = self.state_loop.await {
            log::warn!("State loop ended abnormally: {}", e);
        }
        self.runner.drain().await;
    }
}
