// Track, clip and record-buffer model
// The engine renders clips of MIDI tracks and appends captured events
// to per-track record buffers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::event::MidiEvent;
use crate::monitor::MidiMonitor;
use crate::plugin::PluginChain;

pub type TrackId = usize;
pub type BusId = usize;

/// Piecewise-linear gain envelope over a clip, by frame offset
#[derive(Debug, Clone)]
pub struct GainCurve {
    points: Vec<(u64, f32)>,
}

impl Default for GainCurve {
    fn default() -> Self {
        Self::unity()
    }
}

impl GainCurve {
    pub fn unity() -> Self {
        Self { points: vec![(0, 1.0)] }
    }

    pub fn constant(gain: f32) -> Self {
        Self { points: vec![(0, gain)] }
    }

    pub fn from_points(mut points: Vec<(u64, f32)>) -> Self {
        if points.is_empty() {
            return Self::unity();
        }
        points.sort_by_key(|(offset, _)| *offset);
        Self { points }
    }

    /// Gain at a frame offset into the clip
    pub fn value_at(&self, offset: u64) -> f32 {
        let ix = self.points.partition_point(|(o, _)| *o <= offset);
        if ix == 0 {
            return self.points[0].1;
        }
        let (o0, g0) = self.points[ix - 1];
        match self.points.get(ix) {
            Some(&(o1, g1)) if o1 > o0 => {
                let t = (offset - o0) as f32 / (o1 - o0) as f32;
                g0 + (g1 - g0) * t
            }
            _ => g0,
        }
    }
}

/// A MIDI clip on the session timeline
///
/// Event times are in ticks relative to the clip start frame.
#[derive(Debug, Clone)]
pub struct MidiClip {
    pub name: String,
    pub start: u64,
    pub length: u64,
    pub events: Vec<MidiEvent>,
    pub gain: GainCurve,
}

impl MidiClip {
    pub fn new(name: &str, start: u64, length: u64) -> Self {
        Self {
            name: name.to_string(),
            start,
            length,
            events: Vec::new(),
            gain: GainCurve::unity(),
        }
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    pub fn overlaps(&self, frame_start: u64, frame_end: u64) -> bool {
        self.start < frame_end && self.end() > frame_start
    }

    pub fn add_event(&mut self, ev: MidiEvent) {
        let at = self.events.partition_point(|e| e.time <= ev.time);
        self.events.insert(at, ev);
    }
}

/// Real-time capture target of an armed track
///
/// Appended by the input worker only; everyone else reads snapshots.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    events: Vec<MidiEvent>,
}

impl RecordBuffer {
    pub fn push(&mut self, ev: MidiEvent) {
        self.events.push(ev);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn snapshot(&self) -> Vec<MidiEvent> {
        self.events.clone()
    }

    pub fn take(&mut self) -> Vec<MidiEvent> {
        std::mem::take(&mut self.events)
    }
}

/// One MIDI track of the session
pub struct Track {
    pub id: TrackId,
    pub name: String,
    /// MIDI channel this track plays on (0..15)
    pub channel: u8,
    /// Queue event tag; the low byte marks this track's events
    pub midi_tag: u16,
    /// Bank/program overrides; negative means "leave events alone"
    pub midi_bank: i32,
    pub midi_program: i32,
    pub bank_sel_method: i32,
    pub instrument_name: String,

    pub input_bus: Option<BusId>,
    pub output_bus: Option<BusId>,

    record: AtomicBool,
    monitor: AtomicBool,
    mute: AtomicBool,
    solo: AtomicBool,

    pub meter: Arc<MidiMonitor>,
    pub plugins: Arc<PluginChain>,
    pub record_buffer: Mutex<RecordBuffer>,
    clips: Mutex<Vec<MidiClip>>,
}

impl Track {
    pub fn new(id: TrackId, name: &str, channel: u8) -> Self {
        Self {
            id,
            name: name.to_string(),
            channel: channel & 0x0f,
            midi_tag: id as u16,
            midi_bank: -1,
            midi_program: -1,
            bank_sel_method: 0,
            instrument_name: String::new(),
            input_bus: None,
            output_bus: None,
            record: AtomicBool::new(false),
            monitor: AtomicBool::new(false),
            mute: AtomicBool::new(false),
            solo: AtomicBool::new(false),
            meter: Arc::new(MidiMonitor::new()),
            plugins: Arc::new(PluginChain::new(name)),
            record_buffer: Mutex::new(RecordBuffer::default()),
            clips: Mutex::new(Vec::new()),
        }
    }

    pub fn add_clip(&self, clip: MidiClip) {
        let mut clips = self.clips.lock().unwrap();
        let at = clips.partition_point(|c| c.start <= clip.start);
        clips.insert(at, clip);
    }

    /// Run `f` over the clips, in start order
    pub fn with_clips<R>(&self, f: impl FnOnce(&[MidiClip]) -> R) -> R {
        f(&self.clips.lock().unwrap())
    }

    pub fn is_record(&self) -> bool {
        self.record.load(Ordering::Relaxed)
    }

    pub fn set_record(&self, on: bool) {
        self.record.store(on, Ordering::Relaxed);
    }

    pub fn is_monitor(&self) -> bool {
        self.monitor.load(Ordering::Relaxed)
    }

    pub fn set_monitor(&self, on: bool) {
        self.monitor.store(on, Ordering::Relaxed);
    }

    pub fn is_mute(&self) -> bool {
        self.mute.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, on: bool) {
        self.mute.store(on, Ordering::Relaxed);
    }

    pub fn is_solo(&self) -> bool {
        self.solo.load(Ordering::Relaxed)
    }

    pub fn set_solo(&self, on: bool) {
        self.solo.store(on, Ordering::Relaxed);
    }

    pub fn tag(&self) -> u8 {
        (self.midi_tag & 0xff) as u8
    }
}
