//! Effect runner for voice preview
//!
//! Executes the effects produced by the state machine. Every resource a
//! session acquires lives in a [`LiveSession`] keyed by the session id, from
//! the token request until teardown removes it:
//!
//! - the cancellation token shared by every task of the session
//! - the transport channel (created up front so capture has an outlet)
//! - the device slot: capture session, playback scheduler, inbound pump
//!   and the device lease
//!
//! Completion of each step is reported back to the state loop as an Event.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::audio::{
    AudioCaptureSession, AudioError, AudioInputSource, AudioOutputDevice, CaptureConstraints,
    CpalInputSource, CpalOutputDevice, OutputConfig, PlaybackScheduler,
};
use crate::error::PreviewError;
use crate::interrupt::InterruptController;
use crate::metrics::{SessionClock, SessionMetrics, SessionSummary};
use crate::settings::PreviewSettings;
use crate::state_machine::{Effect, Event};
use crate::streaming::{
    ChannelEvent, FrameOutlet, HttpTokenIssuer, PreviewEndpoint, TokenIssuer, TransportChannel,
};

/// How often finished segments are reaped while no audio arrives
const REAP_INTERVAL: Duration = Duration::from_millis(250);

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
#[async_trait]
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);

    /// Wait for outstanding effect tasks to finish
    async fn drain(&self) {}
}

/// External collaborators a session talks to
#[derive(Clone)]
pub struct PreviewBackends {
    pub token_issuer: Arc<dyn TokenIssuer>,
    pub input: Arc<dyn AudioInputSource>,
    pub output: Arc<dyn AudioOutputDevice>,
}

impl PreviewBackends {
    /// HTTP token endpoint plus the default cpal input and output devices
    pub fn native(settings: &PreviewSettings) -> Result<Self, PreviewError> {
        let endpoint = PreviewEndpoint::new(&settings.backend_host)?;
        let issuer = HttpTokenIssuer::new(endpoint, settings.token_timeout())?;
        Ok(Self {
            token_issuer: Arc::new(issuer),
            input: Arc::new(CpalInputSource),
            output: Arc::new(CpalOutputDevice),
        })
    }
}

/// Audio resources of one session.
/// Locked for the whole of a device open so teardown waits for it.
#[derive(Default)]
struct DeviceSlot {
    capture: Option<AudioCaptureSession>,
    /// Present until the inbound pump takes it over
    scheduler: Option<PlaybackScheduler>,
    /// Hands the scheduler back when cancelled
    pump: Option<JoinHandle<PlaybackScheduler>>,
    /// Held while this session owns the audio devices
    lease: Option<OwnedSemaphorePermit>,
}

#[derive(Clone)]
struct LiveSession {
    cancel: CancellationToken,
    metrics: Arc<SessionMetrics>,
    clock: SessionClock,
    outlet: FrameOutlet,
    channel: Arc<AsyncMutex<TransportChannel>>,
    devices: Arc<AsyncMutex<DeviceSlot>>,
}

/// Real effect runner: HTTP token, cpal audio, WebSocket channel
pub struct PreviewEffectRunner {
    settings: PreviewSettings,
    endpoint: PreviewEndpoint,
    backends: PreviewBackends,
    sessions: Mutex<HashMap<Uuid, LiveSession>>,
    /// One permit: the audio devices belong to one session at a time
    device_lease: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl PreviewEffectRunner {
    pub fn new(
        settings: PreviewSettings,
        backends: PreviewBackends,
    ) -> Result<Arc<Self>, PreviewError> {
        let endpoint = PreviewEndpoint::new(&settings.backend_host)?;
        Ok(Arc::new(Self {
            settings,
            endpoint,
            backends,
            sessions: Mutex::new(HashMap::new()),
            device_lease: Arc::new(Semaphore::new(1)),
            tasks: TaskTracker::new(),
        }))
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<Uuid, LiveSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, id: Uuid) -> Option<LiveSession> {
        let live = self.lock_sessions().get(&id).cloned();
        if live.is_none() {
            log::warn!("Session {}: no live resources, effect skipped", id);
        }
        live
    }

    /// Number of sessions still holding resources
    pub fn live_sessions(&self) -> usize {
        self.lock_sessions().len()
    }
}

#[async_trait]
impl EffectRunner for PreviewEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::RequestToken { session } => {
                let id = session.id;
                let metrics = Arc::new(SessionMetrics::default());
                let channel = TransportChannel::new(
                    self.settings.outbound_queue_frames,
                    self.settings.connect_timeout(),
                    metrics.clone(),
                );
                let live = LiveSession {
                    cancel: CancellationToken::new(),
                    metrics,
                    clock: SessionClock::start(),
                    outlet: channel.outlet(),
                    channel: Arc::new(AsyncMutex::new(channel)),
                    devices: Arc::default(),
                };
                let cancel = live.cancel.clone();
                self.lock_sessions().insert(id, live);

                let issuer = self.backends.token_issuer.clone();
                self.tasks.spawn(async move {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => {
                            log::debug!("Session {}: token request abandoned", id);
                            return;
                        }
                        r = issuer.issue(&session.agent_ref, &session.tenant_ref) => r,
                    };
                    let event = match result {
                        Ok(token) => Event::TokenOk { id, token },
                        Err(e) => {
                            log::warn!("Session {}: {}", id, e);
                            Event::TokenFail { id, err: e.into() }
                        }
                    };
                    let _ = tx.send(event).await;
                });
            }

            Effect::StartSessionTimeout { id } => {
                let Some(live) = self.lookup(id) else { return };
                let timeout = self.settings.session_timeout();
                self.tasks.spawn(async move {
                    tokio::select! {
                        _ = live.cancel.cancelled() => {}
                        _ = tokio::time::sleep(timeout) => {
                            log::info!("Session {}: timeout of {:?} elapsed", id, timeout);
                            let _ = tx.send(Event::SessionTimeout { id }).await;
                        }
                    }
                });
            }

            Effect::OpenDevices { id } => {
                let Some(live) = self.lookup(id) else { return };
                let input = self.backends.input.clone();
                let output = self.backends.output.clone();
                let constraints = self.settings.capture_constraints();
                let output_config = self.settings.output_config();
                let sample_rate = self.settings.sample_rate;
                let lease = self.device_lease.clone();

                self.tasks.spawn(async move {
                    let mut slot = live.devices.lock().await;

                    let permit = tokio::select! {
                        _ = live.cancel.cancelled() => return,
                        permit = lease.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return,
                        },
                    };

                    let outlet = live.outlet.clone();
                    let metrics = live.metrics.clone();
                    let opened = tokio::task::spawn_blocking(move || {
                        open_devices(
                            &*input,
                            &*output,
                            &constraints,
                            &output_config,
                            sample_rate,
                            outlet,
                            metrics,
                        )
                    })
                    .await;

                    let event = match opened {
                        Ok(Ok((capture, scheduler))) => {
                            slot.capture = Some(capture);
                            slot.scheduler = Some(scheduler);
                            slot.lease = Some(permit);
                            Event::DeviceOpenOk { id }
                        }
                        Ok(Err(e)) => {
                            log::warn!("Session {}: {}", id, e);
                            Event::DeviceOpenFail { id, err: e.into() }
                        }
                        Err(e) => Event::DeviceOpenFail {
                            id,
                            err: PreviewError::DeviceUnavailable(format!("device task: {}", e)),
                        },
                    };
                    drop(slot);
                    let _ = tx.send(event).await;
                });
            }

            Effect::OpenChannel { session, token } => {
                let id = session.id;
                let Some(live) = self.lookup(id) else { return };
                let url = self
                    .endpoint
                    .channel_url(&session.agent_ref, &session.tenant_ref, &token);
                let inbound_capacity = self.settings.inbound_queue_frames.max(1);
                let tasks = self.tasks.clone();

                self.tasks.spawn(async move {
                    let (events_tx, events_rx) = mpsc::channel(inbound_capacity);
                    let opened = {
                        let mut channel = live.channel.lock().await;
                        tokio::select! {
                            _ = live.cancel.cancelled() => {
                                log::debug!("Session {}: channel open abandoned", id);
                                return;
                            }
                            r = channel.open(&url, events_tx) => r,
                        }
                    };

                    if let Err(e) = opened {
                        log::warn!("Session {}: {}", id, e);
                        let _ = tx
                            .send(Event::ChannelOpenFail { id, err: e.into() })
                            .await;
                        return;
                    }
                    if tx.send(Event::ChannelOpenOk { id }).await.is_err() {
                        return;
                    }

                    let mut slot = live.devices.lock().await;
                    if live.cancel.is_cancelled() {
                        return;
                    }
                    let Some(scheduler) = slot.scheduler.take() else {
                        log::warn!("Session {}: channel open without playback", id);
                        return;
                    };
                    let controller = InterruptController::new(live.metrics.clone());
                    slot.pump = Some(tasks.spawn(run_inbound_pump(
                        id,
                        scheduler,
                        events_rx,
                        controller,
                        live.metrics.clone(),
                        live.cancel.clone(),
                        tx,
                    )));
                });
            }

            Effect::Teardown { id } => {
                let live = self.lock_sessions().remove(&id);
                self.tasks.spawn(async move {
                    match live {
                        Some(live) => {
                            live.cancel.cancel();
                            let report = release_session(&live).await;
                            report.log(id);
                            SessionSummary::new(id, &live.clock, &live.metrics).log();
                        }
                        None => log::debug!("Session {}: nothing to tear down", id),
                    }
                    let _ = tx.send(Event::TeardownComplete { id }).await;
                });
            }

            Effect::EmitStatus => {
                log::error!("EmitStatus should be handled in run_state_loop");
            }
        }
    }

    async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Open input first, then output. Input is released again if output fails.
fn open_devices(
    input: &dyn AudioInputSource,
    output: &dyn AudioOutputDevice,
    constraints: &CaptureConstraints,
    output_config: &OutputConfig,
    sample_rate: u32,
    outlet: FrameOutlet,
    metrics: Arc<SessionMetrics>,
) -> Result<(AudioCaptureSession, PlaybackScheduler), AudioError> {
    let mut capture = AudioCaptureSession::open(input, constraints, outlet, metrics)?;
    match output.open(output_config) {
        Ok(sink) => Ok((capture, PlaybackScheduler::new(sink, sample_rate))),
        Err(e) => {
            if let Err(close_err) = capture.close() {
                log::warn!("Capture release after output failure: {}", close_err);
            }
            Err(e)
        }
    }
}

/// Feed inbound channel events to playback until the session is cancelled.
///
/// Returns the scheduler with all playback halted.
async fn run_inbound_pump(
    id: Uuid,
    mut scheduler: PlaybackScheduler,
    mut events: mpsc::Receiver<ChannelEvent>,
    controller: InterruptController,
    metrics: Arc<SessionMetrics>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Event>,
) -> PlaybackScheduler {
    let mut reap = tokio::time::interval(REAP_INTERVAL);
    reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let end = match event {
                    Some(ChannelEvent::Audio(frame)) => {
                        if scheduler.play(&frame).is_some() {
                            metrics.record_segment_scheduled();
                        }
                        None
                    }
                    Some(ChannelEvent::Control(message)) => {
                        controller.dispatch(&message, &mut scheduler);
                        None
                    }
                    Some(ChannelEvent::Closed(reason)) => Some(Event::ChannelClosed { id, reason }),
                    Some(ChannelEvent::Error(err)) => Some(Event::ChannelFailed {
                        id,
                        err: err.into(),
                    }),
                    None => Some(Event::ChannelClosed { id, reason: None }),
                };
                if let Some(end) = end {
                    let _ = tx.send(end).await;
                    // Teardown cancels us; keep playing what is queued until then
                    cancel.cancelled().await;
                    break;
                }
            }
            _ = reap.tick() => {
                scheduler.reap_finished();
            }
        }
    }

    scheduler.stop_all();
    scheduler
}

/// Outcome of each teardown step
#[derive(Debug, Default)]
struct TeardownReport {
    steps: Vec<(&'static str, Result<(), String>)>,
}

impl TeardownReport {
    fn record<E: std::fmt::Display>(&mut self, step: &'static str, result: Result<(), E>) {
        self.steps.push((step, result.map_err(|e| e.to_string())));
    }

    fn log(&self, id: Uuid) {
        let failures: Vec<_> = self
            .steps
            .iter()
            .filter_map(|(step, r)| r.as_ref().err().map(|e| (*step, e)))
            .collect();
        if failures.is_empty() {
            log::info!("Session {}: teardown complete", id);
        }
        for (step, err) in failures {
            log::warn!("Session {}: teardown step '{}' failed: {}", id, step, err);
        }
    }
}

/// Release a session's resources in order: playback, channel, capture,
/// output. Every step runs even if an earlier one fails.
async fn release_session(live: &LiveSession) -> TeardownReport {
    let mut report = TeardownReport::default();

    // Waits for an in-flight device open to finish
    let mut slot = live.devices.lock().await;

    let mut scheduler = match slot.pump.take() {
        Some(pump) => match pump.await {
            Ok(scheduler) => Some(scheduler),
            Err(e) => {
                report.record("stop playback", Err(format!("inbound pump: {}", e)));
                None
            }
        },
        None => slot.scheduler.take().map(|mut scheduler| {
            scheduler.stop_all();
            scheduler
        }),
    };
    if report.steps.is_empty() {
        report.record::<String>("stop playback", Ok(()));
    }

    let channel_result = live.channel.lock().await.close().await;
    report.record("close channel", channel_result);

    let capture_result = match slot.capture.take() {
        Some(mut capture) => capture.close(),
        None => Ok(()),
    };
    report.record("close capture", capture_result);

    let output_result = match scheduler.as_mut() {
        Some(scheduler) => scheduler.release(),
        None => Ok(()),
    };
    report.record("release output", output_result);

    slot.lease = None;
    report
}
