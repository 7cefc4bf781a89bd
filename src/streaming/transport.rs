//! Duplex WebSocket channel to the voice-agent backend
//!
//! # Connection Flow
//!
//! 1. `TransportChannel::new()` - create the bounded outbound queue; the
//!    [`FrameOutlet`] can be handed to capture before the socket exists
//! 2. `open()` - WebSocket handshake, then spawn the writer and reader tasks
//! 3. Capture pushes frames through the outlet; the reader forwards inbound
//!    audio and control messages as [`ChannelEvent`]s
//! 4. `close()` - send a Close frame and stop both tasks
//!
//! No retries: a failed handshake is returned to the caller, and a mid-session
//! error or remote close is reported once as `Closed`/`Error`.

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use super::protocol::ControlMessage;
use super::StreamingError;
use crate::audio::AudioFrame;
use crate::metrics::SessionMetrics;

/// How long `close()` waits for the Close frame to go out
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Log inbound progress every N frames
const RECEIVE_LOG_INTERVAL: u64 = 50;

/// Result of handing one frame to the outlet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame is queued for the writer task
    Queued,
    /// Channel is not open; frame dropped
    NotOpen,
    /// Writer is behind; frame dropped
    QueueFull,
}

/// Non-blocking producer side of the outbound queue.
///
/// Frames are accepted only while the channel is open. Sending never blocks
/// and never fails loudly, so it is safe to call from the audio callback.
#[derive(Debug, Clone)]
pub struct FrameOutlet {
    tx: mpsc::Sender<AudioFrame>,
    open: Arc<AtomicBool>,
}

impl FrameOutlet {
    /// Create an outlet and the receiver the writer task drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AudioFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outlet = Self {
            tx,
            open: Arc::new(AtomicBool::new(false)),
        };
        (outlet, rx)
    }

    pub fn mark_open(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn send(&self, frame: AudioFrame) -> SendOutcome {
        if !self.is_open() {
            return SendOutcome::NotOpen;
        }
        match self.tx.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::NotOpen,
        }
    }
}

/// Something the backend sent, or the end of the channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Binary payload: one frame of agent audio
    Audio(AudioFrame),
    /// Parsed text payload
    Control(ControlMessage),
    /// Remote closed the channel, with the close reason if one was given
    Closed(Option<String>),
    /// Transport failure
    Error(StreamingError),
}

/// One authenticated duplex channel for one preview session
pub struct TransportChannel {
    outlet: FrameOutlet,
    outbound_rx: Option<mpsc::Receiver<AudioFrame>>,
    connect_timeout: Duration,
    metrics: Arc<SessionMetrics>,
    shutdown: CancellationToken,
    writer: Option<JoinHandle<Result<(), StreamingError>>>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl TransportChannel {
    pub fn new(
        queue_frames: usize,
        connect_timeout: Duration,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        let (outlet, outbound_rx) = FrameOutlet::channel(queue_frames);
        Self {
            outlet,
            outbound_rx: Some(outbound_rx),
            connect_timeout,
            metrics,
            shutdown: CancellationToken::new(),
            writer: None,
            reader: None,
            closed: false,
        }
    }

    /// Producer handle for capture; frames are dropped until `open()` succeeds
    pub fn outlet(&self) -> FrameOutlet {
        self.outlet.clone()
    }

    pub fn is_open(&self) -> bool {
        self.outlet.is_open()
    }

    /// Connect to `url` and start forwarding inbound traffic to `events`.
    pub async fn open(
        &mut self,
        url: &Url,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), StreamingError> {
        if self.closed {
            return Err(StreamingError::ConnectionFailed(
                "channel already closed".to_string(),
            ));
        }
        let outbound_rx = self.outbound_rx.take().ok_or_else(|| {
            StreamingError::ConnectionFailed("channel already opened".to_string())
        })?;

        // The query carries the token, keep it out of the log
        log::info!(
            "Connecting preview channel to {}{}",
            url.origin().ascii_serialization(),
            url.path()
        );

        let (ws_stream, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(url.as_str(), None, true),
        )
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Before the reader exists, so its mark_closed() always wins
        self.outlet.mark_open();

        let writer_events = events.clone();
        let writer_outlet = self.outlet.clone();
        let shutdown = self.shutdown.clone();
        let writer = tokio::spawn(async move {
            let mut outbound_rx = outbound_rx;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = write.send(Message::Binary(frame.to_le_bytes())).await {
                            log::warn!("Preview channel send failed: {}", e);
                            writer_outlet.mark_closed();
                            let _ = writer_events
                                .send(ChannelEvent::Error(StreamingError::SendFailed(e.to_string())))
                                .await;
                            return Ok(());
                        }
                    }
                }
            }

            match write.close().await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(StreamingError::SendFailed(format!("close frame: {}", e))),
            }
        });

        let reader_outlet = self.outlet.clone();
        let metrics = self.metrics.clone();
        let reader = tokio::spawn(async move {
            let last = loop {
                match read.next().await {
                    Some(Ok(Message::Binary(bytes))) => {
                        let frame = AudioFrame::from_le_bytes(&bytes);
                        let received = metrics.record_frame_received();
                        if received % RECEIVE_LOG_INTERVAL == 0 {
                            log::debug!("Preview channel: {} frames received", received);
                        }
                        if events.send(ChannelEvent::Audio(frame)).await.is_err() {
                            log::debug!("Channel event receiver dropped");
                            return;
                        }
                    }
                    Some(Ok(Message::Text(text))) => match ControlMessage::parse(&text) {
                        Some(msg) => {
                            if events.send(ChannelEvent::Control(msg)).await.is_err() {
                                log::debug!("Channel event receiver dropped");
                                return;
                            }
                        }
                        None => {
                            metrics.record_malformed_control();
                            log::warn!(
                                "Ignoring malformed control message ({} bytes)",
                                text.len()
                            );
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        log::info!("Preview channel closed by backend: {:?}", reason);
                        break ChannelEvent::Closed(reason);
                    }
                    Some(Ok(_)) => {} // ping/pong
                    Some(Err(e)) => {
                        log::warn!("Preview channel error: {}", e);
                        break ChannelEvent::Error(StreamingError::ProtocolError(e.to_string()));
                    }
                    None => break ChannelEvent::Closed(None),
                }
            };
            reader_outlet.mark_closed();
            let _ = events.send(last).await;
        });

        self.writer = Some(writer);
        self.reader = Some(reader);
        log::info!("Preview channel open");
        Ok(())
    }

    /// Transmit one frame if the channel is open, otherwise drop it
    pub fn send(&self, frame: AudioFrame) -> SendOutcome {
        self.outlet.send(frame)
    }

    /// Gracefully shut the channel down. Safe to call more than once and
    /// before `open()`.
    pub async fn close(&mut self) -> Result<(), StreamingError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.outlet.mark_closed();
        self.outbound_rx = None;
        self.shutdown.cancel();

        let mut result = Ok(());
        if let Some(mut writer) = self.writer.take() {
            match timeout(CLOSE_TIMEOUT, &mut writer).await {
                Ok(Ok(r)) => result = r,
                Ok(Err(e)) => {
                    result = Err(StreamingError::Disconnected(format!("writer task: {}", e)));
                }
                Err(_) => {
                    writer.abort();
                    result = Err(StreamingError::SendFailed(
                        "timed out sending close frame".to_string(),
                    ));
                }
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        log::info!("Preview channel closed");
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.outlet.mark_closed();
        self.shutdown.cancel();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
