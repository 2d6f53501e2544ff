// Core MIDI event form
// Tick-stamped events as stored in clips and record buffers

use serde::{Deserialize, Serialize};

/// Common MIDI controller numbers
pub mod cc {
    pub const BANK_SELECT_MSB: u8 = 0;
    pub const CHANNEL_VOLUME: u8 = 7;
    pub const CHANNEL_PANNING: u8 = 10;
    pub const BANK_SELECT_LSB: u8 = 32;
    pub const ALL_SOUND_OFF: u8 = 120;
    pub const ALL_CONTROLLERS_OFF: u8 = 121;
    pub const ALL_NOTES_OFF: u8 = 123;
}

/// Event payload by type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// Note On with note-duration bookkeeping (velocity 0 never stored;
    /// it collapses to NoteOff at capture time)
    NoteOn { note: u8, velocity: u8, duration: u64 },
    NoteOff { note: u8, velocity: u8 },
    /// Polyphonic key pressure
    KeyPress { note: u8, pressure: u8 },
    Controller { param: u8, value: u8 },
    ProgChange { program: u8 },
    ChanPress { pressure: u8 },
    /// Centered at 0, range -8192..=8191
    PitchBend { value: i16 },
    SysEx(Vec<u8>),
}

impl EventKind {
    /// Coarse value used by the activity monitors (velocity, controller
    /// value, pressure...)
    pub fn monitor_value(&self) -> u8 {
        match self {
            EventKind::NoteOn { velocity, .. } => *velocity,
            EventKind::NoteOff { velocity, .. } => *velocity,
            EventKind::KeyPress { pressure, .. } => *pressure,
            EventKind::Controller { value, .. } => *value,
            EventKind::ProgChange { program } => *program,
            EventKind::ChanPress { pressure } => *pressure,
            EventKind::PitchBend { value } => ((*value as i32 + 8192) >> 7) as u8,
            EventKind::SysEx(_) => 0,
        }
    }

    pub fn is_note_on(&self) -> bool {
        matches!(self, EventKind::NoteOn { .. })
    }
}

/// A tick-stamped MIDI event
///
/// `time` is in engine ticks; inside a clip it is relative to the clip
/// start, in a record buffer it is the stamped arrival tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub time: u64,
    pub channel: u8,
    pub kind: EventKind,
}

impl MidiEvent {
    pub fn new(time: u64, channel: u8, kind: EventKind) -> Self {
        Self { time, channel, kind }
    }

    /// Round the event time to the nearest multiple of `q` ticks
    /// Idempotent: re-quantizing with the same grid is a no-op
    pub fn quantize(&mut self, q: u64) {
        if q > 0 {
            self.time = q * ((self.time + (q >> 1)) / q);
        }
    }

    /// End tick of a note event (start + duration), start tick otherwise
    pub fn end_time(&self) -> u64 {
        match &self.kind {
            EventKind::NoteOn { duration, .. } => self.time + duration,
            _ => self.time,
        }
    }
}
