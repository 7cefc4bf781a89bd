//! Barge-in handling
//!
//! The backend sends `{"type":"interrupt"}` when the user starts talking over
//! the agent. Every scheduled or playing segment is halted immediately.

use std::sync::Arc;

use crate::audio::PlaybackScheduler;
use crate::metrics::SessionMetrics;
use crate::streaming::ControlMessage;

/// Routes control messages to the playback scheduler
#[derive(Debug, Clone)]
pub struct InterruptController {
    metrics: Arc<SessionMetrics>,
}

impl InterruptController {
    pub fn new(metrics: Arc<SessionMetrics>) -> Self {
        Self { metrics }
    }

    /// Apply one control message.
    ///
    /// Returns the number of segments stopped for an interrupt, `None` for
    /// messages that have no effect.
    pub fn dispatch(
        &self,
        message: &ControlMessage,
        scheduler: &mut PlaybackScheduler,
    ) -> Option<usize> {
        match message {
            ControlMessage::Interrupt => {
                let stopped = scheduler.stop_all();
                self.metrics.record_interrupt();
                log::info!("Interrupt: halted {} segments", stopped);
                Some(stopped)
            }
            ControlMessage::Unknown => {
                log::debug!("Ignoring unknown control message");
                None
            }
        }
    }
}
