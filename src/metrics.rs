//! Per-session counters for voice preview
//!
//! Counters are bumped from the capture callback, the inbound pump and the
//! transport reader, so they are plain atomics. A [`SessionSummary`] is
//! logged when the session has been torn down.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uuid::Uuid;

/// Live counters for one session
#[derive(Debug, Default)]
pub struct SessionMetrics {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_received: AtomicU64,
    segments_scheduled: AtomicU64,
    interrupts: AtomicU64,
    malformed_control: AtomicU64,
}

/// Point-in-time copy of [`SessionMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_received: u64,
    pub segments_scheduled: u64,
    pub interrupts: u64,
    pub malformed_control: u64,
}

impl SessionMetrics {
    /// Returns the running total
    pub fn record_frame_sent(&self) -> u64 {
        self.frames_sent.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_frame_dropped(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_frame_received(&self) -> u64 {
        self.frames_received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_segment_scheduled(&self) {
        self.segments_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_control(&self) {
        self.malformed_control.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            segments_scheduled: self.segments_scheduled.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            malformed_control: self.malformed_control.load(Ordering::Relaxed),
        }
    }
}

/// Wall-clock and monotonic start of a session
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// What a finished session did
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub counters: MetricsSnapshot,
}

impl SessionSummary {
    pub fn new(session_id: Uuid, clock: &SessionClock, metrics: &SessionMetrics) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at: clock.started_at(),
            duration_ms: clock.elapsed_ms(),
            counters: metrics.snapshot(),
        }
    }

    pub fn log(&self) {
        log::info!(
            "Session {} summary: {}ms since {}, sent={} dropped={} received={} scheduled={} interrupts={} malformed={}",
            self.session_id,
            self.duration_ms,
            self.started_at.to_rfc3339(),
            self.counters.frames_sent,
            self.counters.frames_dropped,
            self.counters.frames_received,
            self.counters.segments_scheduled,
            self.counters.interrupts,
            self.counters.malformed_control
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = SessionMetrics::default();
        assert_eq!(metrics.record_frame_sent(), 1);
        assert_eq!(metrics.record_frame_sent(), 2);
        metrics.record_frame_dropped();
        metrics.record_interrupt();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.interrupts, 1);
        assert_eq!(snap.frames_received, 0);
    }

    #[test]
    fn test_summary_serializes() {
        let metrics = SessionMetrics::default();
        metrics.record_frame_received();
        let summary = SessionSummary::new(Uuid::new_v4(), &SessionClock::start(), &metrics);

        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"frames_received\":1"));
        assert!(json.contains("\"started_at\""));
    }
}
