// Session export
// One-shot, non-playing conversion of live track clips in a frame range
// into a standard multi-track MIDI file

use std::io::Write;
use std::sync::Arc;

use crate::bus::MidiBus;
use crate::error::{EngineError, EngineResult};
use crate::event::{cc, EventKind, MidiEvent};
use crate::session::Session;
use crate::smf::{self, SmfEvent, TimedEvent};
use crate::track::{BusId, Track};

/// Target file layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// All tracks collapsed into 16 channel sequences, single chunk
    Format0,
    /// One chunk per track plus the meta track 0
    Format1,
}

/// One sequence on its way into the file
#[derive(Debug, Default)]
struct ExportSequence {
    name: String,
    channel: u8,
    bank: i32,
    program: i32,
    events: Vec<MidiEvent>,
}

impl ExportSequence {
    fn new(name: &str, channel: u8) -> Self {
        Self {
            name: name.to_string(),
            channel,
            bank: -1,
            program: -1,
            events: Vec::new(),
        }
    }
}

/// Export eligible track clips in `[frame_start, frame_end)` to `writer`
///
/// `target_bus` filters tracks by output bus; the first bus is assumed
/// when not given. SysEx setup of the target bus lands on the meta
/// track, and the session tempo map is folded in relative to the range
/// start.
pub fn export_session<W: Write>(
    session: &Session,
    buses: &[Arc<MidiBus>],
    target_bus: Option<BusId>,
    format: ExportFormat,
    frame_start: u64,
    frame_end: u64,
    export_name: &str,
    writer: &mut W,
) -> EngineResult<()> {
    if session.is_playing() {
        return Err(EngineError::ExportWhilePlaying);
    }
    if frame_start >= frame_end {
        return Err(EngineError::EmptyExportRange);
    }
    let target = target_bus.unwrap_or(0);
    if buses.get(target).is_none() {
        return Err(EngineError::NoEligibleTracks);
    }

    let ticks_per_beat = session.ticks_per_beat();
    let time_start = session.tick_from_frame(frame_start);
    let time_end = session.tick_from_frame(frame_end);

    // Collect the per-channel or per-track sequences
    let mut sequences: Vec<ExportSequence> = match format {
        ExportFormat::Format0 => (0..16).map(|ch| ExportSequence::new("", ch as u8)).collect(),
        ExportFormat::Format1 => Vec::new(),
    };

    let solo_filter = session.solo_tracks();
    for track in session.tracks().iter() {
        if track.is_mute() || (solo_filter && !track.is_solo()) {
            continue;
        }
        if track.output_bus.unwrap_or(usize::MAX) != target {
            continue;
        }

        let seq_ix = match format {
            ExportFormat::Format0 => {
                let ix = (track.channel & 0x0f) as usize;
                let seq = &mut sequences[ix];
                if seq.name.is_empty() {
                    seq.name = track.name.clone();
                } else {
                    seq.name = format!("{}; {}", seq.name, track.name);
                }
                ix
            }
            ExportFormat::Format1 => {
                sequences.push(ExportSequence::new(&track.name, track.channel));
                sequences.len() - 1
            }
        };
        let seq = &mut sequences[seq_ix];
        if seq.bank < 0 {
            seq.bank = track.midi_bank;
        }
        if seq.program < 0 {
            seq.program = track.midi_program;
        }

        collect_track_events(session, track, frame_start, time_start, time_end, seq);
        session.stabilize();
    }

    if format == ExportFormat::Format1 && sequences.iter().all(|s| s.events.is_empty()) {
        return Err(EngineError::NoEligibleTracks);
    }

    // Meta events: name, meter/tempo map, target bus SysEx setup
    let mut meta = vec![TimedEvent::new(0, SmfEvent::TrackName { name: export_name.to_string() }, 0)];
    session.with_timescale(|ts| {
        for node in ts.nodes() {
            if node.tick >= time_end {
                break;
            }
            let tick = node.tick.saturating_sub(time_start);
            meta.push(TimedEvent::new(
                tick,
                SmfEvent::TimeSignature {
                    numerator: node.beats_per_bar as u8,
                    denominator_power: smf::denominator_to_power(4),
                },
                1,
            ));
            meta.push(TimedEvent::new(
                tick,
                SmfEvent::SetTempo { micros_per_beat: node.micros_per_beat() },
                2,
            ));
        }
    });
    for item in buses[target].sysex_list() {
        meta.push(TimedEvent::new(0, SmfEvent::SysEx(item.data.clone()), 3));
    }

    // Roll the sequences into track chunks
    let mut tracks: Vec<Vec<TimedEvent>> = vec![meta];
    for seq in sequences.iter().filter(|s| !s.events.is_empty() || format == ExportFormat::Format1) {
        let mut chunk = Vec::new();
        if !seq.name.is_empty() {
            chunk.push(TimedEvent::new(0, SmfEvent::TrackName { name: seq.name.clone() }, 0));
        }
        if seq.bank >= 0 {
            chunk.push(TimedEvent::new(
                0,
                SmfEvent::Controller {
                    channel: seq.channel,
                    param: cc::BANK_SELECT_MSB,
                    value: ((seq.bank & 0x3f80) >> 7) as u8,
                },
                1,
            ));
            chunk.push(TimedEvent::new(
                0,
                SmfEvent::Controller {
                    channel: seq.channel,
                    param: cc::BANK_SELECT_LSB,
                    value: (seq.bank & 0x007f) as u8,
                },
                2,
            ));
        }
        if seq.program >= 0 {
            chunk.push(TimedEvent::new(
                0,
                SmfEvent::ProgChange { channel: seq.channel, program: seq.program as u8 },
                3,
            ));
        }
        for ev in &seq.events {
            push_event(&mut chunk, seq.channel, ev);
        }
        tracks.push(chunk);
    }

    let format_code = match format {
        ExportFormat::Format0 => {
            // A format-0 file is one chunk; merge everything into it
            let merged: Vec<TimedEvent> = tracks.drain(..).flatten().collect();
            tracks.push(merged);
            0
        }
        ExportFormat::Format1 => 1,
    };

    smf::write_smf(writer, format_code, ticks_per_beat as u16, &mut tracks)?;
    Ok(())
}

/// Copy the in-range events of every overlapping clip, shifting ticks
/// to the export origin, scaling note-on velocities by the clip gain
/// and clamping durations at the range end
fn collect_track_events(
    session: &Session,
    track: &Track,
    frame_start: u64,
    time_start: u64,
    time_end: u64,
    seq: &mut ExportSequence,
) {
    track.with_clips(|clips| {
        for clip in clips {
            if clip.end() <= frame_start {
                continue;
            }
            let time_clip = session.tick_from_frame(clip.start);
            for ev in &clip.events {
                let abs_tick = time_clip + ev.time;
                if abs_tick < time_start {
                    continue;
                }
                if abs_tick >= time_end {
                    break;
                }
                let mut copy = ev.clone();
                copy.time = abs_tick - time_start;
                if let EventKind::NoteOn { note, velocity, duration } = copy.kind {
                    let event_frame = session.frame_from_tick(abs_tick);
                    let gain = clip.gain.value_at(event_frame.saturating_sub(clip.start));
                    let scaled = ((gain * velocity as f32) as i32 & 0x7f) as u8;
                    let clamped = if abs_tick + duration > time_end {
                        time_end - abs_tick
                    } else {
                        duration
                    };
                    copy.kind = EventKind::NoteOn { note, velocity: scaled, duration: clamped };
                }
                seq.events.push(copy);
            }
        }
    });
}

fn push_event(chunk: &mut Vec<TimedEvent>, channel: u8, ev: &MidiEvent) {
    match &ev.kind {
        EventKind::NoteOn { note, velocity, duration } => {
            chunk.push(TimedEvent::new(
                ev.time,
                SmfEvent::NoteOn { channel, note: *note, velocity: *velocity },
                10,
            ));
            chunk.push(TimedEvent::new(
                ev.time + duration,
                SmfEvent::NoteOff { channel, note: *note, velocity: 0 },
                11,
            ));
        }
        EventKind::NoteOff { note, velocity } => {
            chunk.push(TimedEvent::new(
                ev.time,
                SmfEvent::NoteOff { channel, note: *note, velocity: *velocity },
                11,
            ));
        }
        EventKind::KeyPress { note, pressure } => {
            chunk.push(TimedEvent::new(
                ev.time,
                SmfEvent::KeyPress { channel, note: *note, pressure: *pressure },
                10,
            ));
        }
        EventKind::Controller { param, value } => {
            chunk.push(TimedEvent::new(
                ev.time,
                SmfEvent::Controller { channel, param: *param, value: *value },
                10,
            ));
        }
        EventKind::ProgChange { program } => {
            chunk.push(TimedEvent::new(
                ev.time,
                SmfEvent::ProgChange { channel, program: *program },
                10,
            ));
        }
        EventKind::ChanPress { pressure } => {
            chunk.push(TimedEvent::new(
                ev.time,
                SmfEvent::ChanPress { channel, pressure: *pressure },
                10,
            ));
        }
        EventKind::PitchBend { value } => {
            chunk.push(TimedEvent::new(
                ev.time,
                SmfEvent::PitchBend { channel, value: *value },
                10,
            ));
        }
        EventKind::SysEx(data) => {
            chunk.push(TimedEvent::new(ev.time, SmfEvent::SysEx(data.clone()), 10));
        }
    }
}
