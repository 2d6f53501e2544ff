// MIDI activity monitor
// Running level meter fed from capture (direct) and enqueue (scheduled)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::audio::AtomicF32;

/// Per-bus / per-track event activity meter
///
/// Direct events bump the level immediately; scheduled events queue up
/// with their tick and are folded in as `update` sweeps past them, so
/// the meter follows the queue clock rather than the enqueue burst.
#[derive(Debug)]
pub struct MidiMonitor {
    level: AtomicU32,
    count: AtomicU64,
    origin_tick: AtomicU64,
    queue: Mutex<VecDeque<(u64, u8)>>,
    gain: AtomicF32,
    panning: AtomicF32,
}

impl Default for MidiMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiMonitor {
    pub fn new() -> Self {
        Self {
            level: AtomicU32::new(0),
            count: AtomicU64::new(0),
            origin_tick: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            gain: AtomicF32::new(1.0),
            panning: AtomicF32::new(0.0),
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.set(gain);
    }

    pub fn panning(&self) -> f32 {
        self.panning.get()
    }

    pub fn set_panning(&self, panning: f32) {
        self.panning.set(panning.clamp(-1.0, 1.0));
    }

    /// Immediate activity (capture path, direct sends)
    pub fn enqueue(&self, value: u8) {
        self.level.fetch_max(value as u32, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue-scheduled activity at `tick`
    pub fn enqueue_scheduled(&self, value: u8, tick: u64) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back((tick, value));
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Sweep the meter up to `tick`: fold in due scheduled events and
    /// decay the running level. Returns the current level (0..=127).
    pub fn update(&self, tick: u64) -> u8 {
        {
            let mut queue = self.queue.lock().unwrap();
            while queue.front().map(|(t, _)| *t <= tick).unwrap_or(false) {
                let (_, value) = queue.pop_front().unwrap();
                self.level.fetch_max(value as u32, Ordering::Relaxed);
            }
        }
        // Exponential-ish fall-off per sweep
        let level = self.level.load(Ordering::Relaxed);
        let decayed = level - (level >> 2);
        self.level.store(decayed, Ordering::Relaxed);
        level.min(127) as u8
    }

    /// Split the meter time axis at `tick` (tempo change): everything
    /// scheduled up to the split is folded in now so the old tempo's
    /// slots don't stretch into the new one.
    pub fn split_time(&self, tick: u64) {
        let mut queue = self.queue.lock().unwrap();
        while queue.front().map(|(t, _)| *t <= tick).unwrap_or(false) {
            let (_, value) = queue.pop_front().unwrap();
            self.level.fetch_max(value as u32, Ordering::Relaxed);
        }
        self.origin_tick.store(tick, Ordering::Relaxed);
    }

    pub fn event_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Drop pending scheduled activity, keep gain/panning
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
        self.level.store(0, Ordering::Relaxed);
    }

    /// Full reset back to the time origin
    pub fn reset(&self) {
        self.clear();
        self.count.store(0, Ordering::Relaxed);
        self.origin_tick.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_activity() {
        let mon = MidiMonitor::new();
        mon.enqueue(100);
        assert_eq!(mon.update(0), 100);
        assert_eq!(mon.event_count(), 1);
    }

    #[test]
    fn test_scheduled_waits_for_tick() {
        let mon = MidiMonitor::new();
        mon.enqueue_scheduled(90, 480);

        // Not due yet
        assert_eq!(mon.update(100), 0);
        // Due now
        assert_eq!(mon.update(480), 90);
    }

    #[test]
    fn test_level_decays() {
        let mon = MidiMonitor::new();
        mon.enqueue(64);
        let first = mon.update(0);
        let second = mon.update(0);
        assert!(second < first);
    }

    #[test]
    fn test_split_time_flushes_due_events() {
        let mon = MidiMonitor::new();
        mon.enqueue_scheduled(80, 100);
        mon.enqueue_scheduled(90, 900);
        mon.split_time(480);

        // The pre-split event is already folded in, the later one not
        assert_eq!(mon.update(480), 80);
        assert_eq!(mon.update(900), 90);
    }

    #[test]
    fn test_reset() {
        let mon = MidiMonitor::new();
        mon.set_gain(0.5);
        mon.enqueue(127);
        mon.reset();
        assert_eq!(mon.update(0), 0);
        assert_eq!(mon.event_count(), 0);
        // Gain survives reset
        assert_eq!(mon.gain(), 0.5);
    }
}
