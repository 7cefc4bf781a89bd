//! Gapless playback scheduling for inbound agent audio
//!
//! Each inbound frame becomes one segment starting at
//! `max(clock_now, next_play_time)`. Frames that arrive faster than they play
//! queue back-to-back; a frame that arrives late starts immediately instead
//! of accumulating delay.

use std::collections::BTreeSet;

use super::codec::AudioFrame;
use super::device::{AudioOutputSink, SegmentId};
use super::AudioError;

/// Where and for how long one frame was scheduled
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSegment {
    pub id: SegmentId,
    pub start_time: f64,
    pub duration: f64,
}

/// Owns the output graph, the play cursor and the set of in-flight segments.
pub struct PlaybackScheduler {
    sink: Box<dyn AudioOutputSink>,
    sample_rate: u32,
    next_play_time: f64,
    active: BTreeSet<SegmentId>,
    next_id: SegmentId,
    released: bool,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn AudioOutputSink>, sample_rate: u32) -> Self {
        Self {
            sink,
            sample_rate,
            next_play_time: 0.0,
            active: BTreeSet::new(),
            next_id: 1,
            released: false,
        }
    }

    /// Decode `frame` and schedule it right after the previous segment.
    ///
    /// Returns `None` for empty frames or once the output has been released.
    pub fn play(&mut self, frame: &AudioFrame) -> Option<ScheduledSegment> {
        if self.released || frame.is_empty() {
            return None;
        }
        self.reap_finished();

        let samples = frame.to_float();
        let duration = frame.duration_secs(self.sample_rate);
        let start_time = self.sink.now().max(self.next_play_time);

        let id = self.next_id;
        self.next_id += 1;

        self.sink
            .schedule(id, samples, self.sample_rate, start_time);
        self.active.insert(id);
        self.next_play_time = start_time + duration;

        Some(ScheduledSegment {
            id,
            start_time,
            duration,
        })
    }

    /// Halt every scheduled or playing segment and reset the play cursor.
    ///
    /// Returns the number of segments stopped.
    pub fn stop_all(&mut self) -> usize {
        let stopped = std::mem::take(&mut self.active);
        for id in &stopped {
            self.sink.stop(*id);
        }
        // Anything that finished meanwhile is already gone from the graph
        let _ = self.sink.take_completed();
        self.next_play_time = 0.0;

        if !stopped.is_empty() {
            log::debug!("Playback: stopped {} segments", stopped.len());
        }
        stopped.len()
    }

    /// Drop segments that completed on their own from the active set.
    pub fn reap_finished(&mut self) -> usize {
        let completed = self.sink.take_completed();
        let mut reaped = 0;
        for id in completed {
            if self.active.remove(&id) {
                reaped += 1;
            }
        }
        reaped
    }

    /// Stop everything and release the output graph. Safe to call more than once.
    pub fn release(&mut self) -> Result<(), AudioError> {
        if self.released {
            return Ok(());
        }
        self.stop_all();
        self.released = true;
        self.sink.release()
    }

    pub fn next_play_time(&self) -> f64 {
        self.next_play_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: SegmentId) -> bool {
        self.active.contains(&id)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Current output clock in seconds
    pub fn clock(&self) -> f64 {
        self.sink.now()
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("sample_rate", &self.sample_rate)
            .field("next_play_time", &self.next_play_time)
            .field("active", &self.active.len())
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Shared view into a [`ManualSink`] for assertions
    #[derive(Debug, Default)]
    pub(crate) struct SinkLog {
        pub now: f64,
        pub scheduled: Vec<(SegmentId, f64, usize)>,
        pub stopped: Vec<SegmentId>,
        pub completed: Vec<SegmentId>,
        pub releases: u32,
    }

    /// Output sink with a hand-driven clock
    pub(crate) struct ManualSink(pub Arc<Mutex<SinkLog>>);

    impl AudioOutputSink for ManualSink {
        fn now(&self) -> f64 {
            self.0.lock().unwrap().now
        }

        fn schedule(&mut self, id: SegmentId, samples: Vec<f32>, _rate: u32, start_at: f64) {
            self.0
                .lock()
                .unwrap()
                .scheduled
                .push((id, start_at, samples.len()));
        }

        fn stop(&mut self, id: SegmentId) {
            self.0.lock().unwrap().stopped.push(id);
        }

        fn take_completed(&mut self) -> Vec<SegmentId> {
            std::mem::take(&mut self.0.lock().unwrap().completed)
        }

        fn release(&mut self) -> Result<(), AudioError> {
            self.0.lock().unwrap().releases += 1;
            Ok(())
        }
    }

    pub(crate) fn scheduler() -> (PlaybackScheduler, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let scheduler = PlaybackScheduler::new(Box::new(ManualSink(log.clone())), 24000);
        (scheduler, log)
    }

    fn frame(samples: usize) -> AudioFrame {
        AudioFrame::new(vec![100; samples])
    }

    #[test]
    fn frames_arriving_early_queue_back_to_back() {
        let (mut scheduler, _log) = scheduler();
        let sizes = [2400, 4800, 1200, 2400];

        let segments: Vec<_> = sizes
            .iter()
            .map(|&n| scheduler.play(&frame(n)).unwrap())
            .collect();

        assert_eq!(segments[0].start_time, 0.0);
        for pair in segments.windows(2) {
            let expected = pair[0].start_time + pair[0].duration;
            assert!((pair[1].start_time - expected).abs() < 1e-12);
        }
        let last = segments.last().unwrap();
        assert!((scheduler.next_play_time() - (last.start_time + last.duration)).abs() < 1e-12);
        assert_eq!(scheduler.active_count(), 4);
    }

    #[test]
    fn late_frame_starts_at_clock_now() {
        let (mut scheduler, log) = scheduler();
        scheduler.play(&frame(2400)).unwrap(); // ends at 0.1

        log.lock().unwrap().now = 0.5;
        let seg = scheduler.play(&frame(2400)).unwrap();

        assert_eq!(seg.start_time, 0.5);
        assert!((scheduler.next_play_time() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn next_play_time_never_decreases_while_streaming() {
        let (mut scheduler, log) = scheduler();
        let mut last = 0.0;
        for (i, now) in [0.0, 0.05, 0.3, 0.31, 0.9].iter().enumerate() {
            log.lock().unwrap().now = *now;
            scheduler.play(&frame(1200 * (i + 1))).unwrap();
            assert!(scheduler.next_play_time() >= last);
            last = scheduler.next_play_time();
        }
    }

    #[test]
    fn stop_all_clears_active_set_and_resets_cursor() {
        let (mut scheduler, log) = scheduler();
        let a = scheduler.play(&frame(24000)).unwrap();
        let b = scheduler.play(&frame(24000)).unwrap();
        assert!(scheduler.next_play_time() > 1.9);

        let stopped = scheduler.stop_all();

        assert_eq!(stopped, 2);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.next_play_time(), 0.0);
        assert_eq!(log.lock().unwrap().stopped, vec![a.id, b.id]);

        // Next frame starts at "now", not at the stale 2.0s cursor
        log.lock().unwrap().now = 0.25;
        let c = scheduler.play(&frame(2400)).unwrap();
        assert_eq!(c.start_time, 0.25);
    }

    #[test]
    fn completed_segments_leave_the_active_set() {
        let (mut scheduler, log) = scheduler();
        let a = scheduler.play(&frame(2400)).unwrap();
        let b = scheduler.play(&frame(2400)).unwrap();

        log.lock().unwrap().completed.push(a.id);
        assert_eq!(scheduler.reap_finished(), 1);

        assert!(!scheduler.is_active(a.id));
        assert!(scheduler.is_active(b.id));
    }

    #[test]
    fn empty_frame_is_not_scheduled() {
        let (mut scheduler, log) = scheduler();
        assert!(scheduler.play(&AudioFrame::default()).is_none());
        assert!(log.lock().unwrap().scheduled.is_empty());
    }

    #[test]
    fn release_is_idempotent_and_stops_playback() {
        let (mut scheduler, log) = scheduler();
        scheduler.play(&frame(2400)).unwrap();

        scheduler.release().unwrap();
        scheduler.release().unwrap();

        assert_eq!(log.lock().unwrap().releases, 1);
        assert_eq!(scheduler.active_count(), 0);
        assert!(scheduler.play(&frame(2400)).is_none());
    }
}
