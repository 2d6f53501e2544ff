// Tempo-skew clock driver
// Thin wrapper over the backend queue: tempo, skew, start/stop, drops

use std::sync::Arc;

use super::{RemoveSpec, Sequencer};

/// Drives the backend's single queue clock
///
/// Tempo is stored on the queue as microseconds per beat; skew is a
/// rational scaling of the future tick rate. Already-enqueued event
/// ticks are never recomputed here.
#[derive(Clone)]
pub struct QueueDriver {
    seq: Arc<dyn Sequencer>,
}

impl QueueDriver {
    pub fn new(seq: Arc<dyn Sequencer>) -> Self {
        Self { seq }
    }

    pub fn set_tempo(&self, bpm: f32, ppq: u32) {
        let micros_per_beat = (60_000_000.0 / bpm as f64) as u32;
        self.seq.set_queue_tempo(ppq, micros_per_beat);
    }

    /// Apply a fractional skew `value / skew_base` to the queue rate
    pub fn set_skew(&self, value: u32) {
        self.seq.set_queue_skew(value);
    }

    pub fn skew(&self) -> u32 {
        self.seq.queue_skew()
    }

    pub fn skew_base(&self) -> u32 {
        self.seq.queue_skew_base()
    }

    /// Current queue tick
    pub fn tick_time(&self) -> u64 {
        self.seq.queue_tick_time()
    }

    pub fn start(&self) {
        self.seq.start_queue();
    }

    pub fn stop(&self) {
        self.seq.stop_queue();
    }

    pub fn drop_output(&self) {
        self.seq.drop_output();
    }

    pub fn drop_input(&self) {
        self.seq.drop_input();
    }

    pub fn remove_from_output(&self, spec: &RemoveSpec) {
        self.seq.remove_output_events(spec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::VirtualSequencer;

    #[test]
    fn test_tempo_is_micros_per_beat() {
        let seq = Arc::new(VirtualSequencer::new("test"));
        let driver = QueueDriver::new(seq.clone());

        driver.set_tempo(120.0, 960);
        assert_eq!(seq.queue_tempo(), (960, 500_000));

        driver.set_tempo(90.0, 480);
        assert_eq!(seq.queue_tempo(), (480, 666_666));
    }

    #[test]
    fn test_skew_round_trip() {
        let seq = Arc::new(VirtualSequencer::new("test"));
        let driver = QueueDriver::new(seq);

        let base = driver.skew_base();
        assert_eq!(driver.skew(), base);
        driver.set_skew(base / 2);
        assert_eq!(driver.skew(), base / 2);
    }
}
