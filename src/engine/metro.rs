// Metronome & clock generator
// Emits bar/beat notes and 24-ppq clock runs inside each output window,
// tracking tempo-map changes as it goes

use std::sync::Arc;

use crate::bus::{BusMode, MidiBus};
use crate::error::EngineResult;
use crate::seq::{RemoveSpec, SeqEvent, SeqEventKind};
use crate::timescale::TimeScaleCursor;

use super::{EngineCore, MidiEngine};

/// Queue tag marking engine-generated (metronome/tempo) events
pub const METRO_TAG: u8 = 0xff;

pub(crate) struct MetroState {
    pub enabled: bool,
    pub dedicated: bool,
    pub bus: Option<Arc<MidiBus>>,
    pub channel: u8,
    pub bar_note: u8,
    pub bar_velocity: u8,
    pub bar_duration: u64,
    pub beat_note: u8,
    pub beat_velocity: u8,
    pub beat_duration: u64,
    pub tempo: f32,
    pub cursor: TimeScaleCursor,
}

impl MetroState {
    pub fn new() -> Self {
        Self {
            enabled: false,
            dedicated: false,
            bus: None,
            channel: 9,       // GM drums channel (10)
            bar_note: 76,     // GM high wood block
            bar_velocity: 96,
            bar_duration: 48,
            beat_note: 77,    // GM low wood block
            beat_velocity: 64,
            beat_duration: 24,
            tempo: 0.0,
            cursor: TimeScaleCursor::new(),
        }
    }
}

impl EngineCore {
    /// Process metronome clicks and clock pulses over `[frame_start,
    /// frame_end)`
    ///
    /// A tempo-map change inside the window enqueues the queue-tempo
    /// event first, so the backend's effective tempo at the note ticks
    /// is already the new one; the monitor time axis splits at the same
    /// tick.
    pub fn process_metro(&self, frame_start: u64, frame_end: u64) {
        let clock_out = self.control.lock().unwrap().clock_mode.has_output();
        let clock_port = self.control_buses.lock().unwrap().output.as_ref().and_then(|b| b.port());
        let mut metro = self.metro.lock().unwrap();

        self.session.with_timescale(|ts| {
            let node = *metro.cursor.seek_frame(ts, frame_end);

            // Take this moment to check for tempo changes
            if node.tempo != metro.tempo {
                let node_time = if node.frame < frame_start {
                    node.tick_from_frame(frame_start)
                } else {
                    node.tick
                };
                let tick = self.queue_tick(node_time);
                let tempo_ev = SeqEvent {
                    kind: SeqEventKind::Tempo { micros_per_beat: node.micros_per_beat() },
                    channel: 0,
                    tag: METRO_TAG,
                    tick,
                    direct: false,
                    source: None,
                    dest: None,
                };
                self.seq.event_output(tempo_ev);
                metro.tempo = node.tempo;

                // Split the monitor time axis at the change
                for bus in self.buses.read().unwrap().iter() {
                    if let Some(monitor) = bus.monitor_in() {
                        monitor.split_time(tick);
                    }
                    if let Some(monitor) = bus.monitor_out() {
                        monitor.split_time(tick);
                    }
                }
                for track in self.session.tracks().iter() {
                    track.meter.split_time(tick);
                }
            }

            if !metro.enabled && !clock_out {
                return;
            }

            let time_end = node.tick_from_frame(frame_end);

            let mut node = *metro.cursor.seek_frame(ts, frame_start);
            let time_start = node.tick_from_frame(frame_start);
            let mut beat = node.beat_from_tick(time_start);
            let mut time = node.tick_from_beat(beat);

            let metro_port = metro.bus.as_ref().and_then(|b| b.port());
            let metro_monitor = metro.bus.as_ref().and_then(|b| b.monitor_out());

            while time < time_end {
                // 24 clock pulses per beat, clipped to the window
                if clock_out {
                    if let Some(port) = clock_port {
                        let ticks_per_clock = (node.ticks_per_beat / 24).max(1) as u64;
                        let mut clock_time = time;
                        for _ in 0..24 {
                            if clock_time >= time_end {
                                break;
                            }
                            if clock_time >= time_start {
                                let mut ev = SeqEvent::queued(
                                    SeqEventKind::Clock,
                                    0,
                                    port,
                                    self.queue_tick(clock_time),
                                );
                                ev.tag = METRO_TAG;
                                self.seq.event_output(ev);
                            }
                            clock_time += ticks_per_clock;
                        }
                    }
                }

                if metro.enabled && time >= time_start {
                    if let Some(port) = metro_port {
                        let tick = self.queue_tick(time);
                        let (note, velocity, duration) = if node.beat_is_bar(beat) {
                            (metro.bar_note, metro.bar_velocity, metro.bar_duration)
                        } else {
                            (metro.beat_note, metro.beat_velocity, metro.beat_duration)
                        };
                        let mut ev = SeqEvent::queued(
                            SeqEventKind::NoteOn { note, velocity, duration },
                            metro.channel,
                            port,
                            tick,
                        );
                        ev.tag = METRO_TAG;
                        self.seq.event_output(ev);
                        if let Some(monitor) = &metro_monitor {
                            monitor.enqueue_scheduled(velocity, tick);
                        }
                    }
                }

                time += node.ticks_per_beat as u64;
                beat += 1;
                node = *metro.cursor.seek_beat(ts, beat);
            }
        });
    }
}

impl MidiEngine {
    /// Switch the metronome on or off, choking or re-rendering the
    /// pending clicks mid-play
    pub fn set_metronome(&self, enabled: bool) {
        self.core().metro.lock().unwrap().enabled = enabled;
        if self.core().session.is_playing() {
            self.metro_mute(!enabled);
        }
    }

    pub fn is_metronome(&self) -> bool {
        self.core().metro.lock().unwrap().enabled
    }

    /// Mute drops already-queued metronome events past the playhead;
    /// unmute re-renders them from the playhead on
    pub fn metro_mute(&self, mute: bool) {
        let core = self.core();
        let frame = core.session.play_head();
        if mute {
            let tick = core.queue_tick(core.session.tick_from_frame(frame));
            core.driver.remove_from_output(&RemoveSpec {
                tag: Some(METRO_TAG),
                channel: None,
                after_tick: tick,
                ignore_off: false,
            });
        } else if core.session.is_playing() {
            self.metro_sync(frame);
        }
    }

    /// Use a dedicated "Metronome" output bus instead of the first
    /// engine output bus
    pub fn set_metro_bus(&self, dedicated: bool) -> EngineResult<()> {
        self.delete_metro_bus();
        self.core().metro.lock().unwrap().dedicated = dedicated;
        self.create_metro_bus();
        if self.core().is_activated() {
            self.open_metro_bus()?;
        }
        Ok(())
    }

    pub fn is_metro_bus(&self) -> bool {
        self.core().metro.lock().unwrap().dedicated
    }

    pub(crate) fn create_metro_bus(&self) {
        let core = self.core();
        let mut metro = core.metro.lock().unwrap();
        if metro.dedicated {
            metro.bus = Some(Arc::new(MidiBus::new("Metronome", BusMode::Output, false)));
        } else {
            let buses = core.buses.read().unwrap();
            metro.bus = buses.iter().find(|b| b.mode().has_output()).cloned();
        }
    }

    pub(crate) fn open_metro_bus(&self) -> EngineResult<()> {
        let core = self.core();
        let metro = core.metro.lock().unwrap();
        if metro.dedicated {
            if let Some(bus) = &metro.bus {
                if bus.port().is_none() {
                    bus.open(core.seq.as_ref())?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn delete_metro_bus(&self) {
        let core = self.core();
        let mut metro = core.metro.lock().unwrap();
        if metro.dedicated {
            if let Some(bus) = metro.bus.take() {
                bus.close(core.seq.as_ref());
            }
        } else {
            metro.bus = None;
        }
    }

    pub fn metro_bus(&self) -> Option<Arc<MidiBus>> {
        self.core().metro_bus()
    }

    pub fn set_metro_channel(&self, channel: u8) {
        self.core().metro.lock().unwrap().channel = channel & 0x0f;
    }

    pub fn metro_channel(&self) -> u8 {
        self.core().metro.lock().unwrap().channel
    }

    pub fn set_metro_bar(&self, note: u8, velocity: u8, duration: u64) {
        let mut metro = self.core().metro.lock().unwrap();
        metro.bar_note = note;
        metro.bar_velocity = velocity;
        metro.bar_duration = duration;
    }

    pub fn metro_bar_note(&self) -> u8 {
        self.core().metro.lock().unwrap().bar_note
    }

    pub fn metro_bar_velocity(&self) -> u8 {
        self.core().metro.lock().unwrap().bar_velocity
    }

    pub fn metro_bar_duration(&self) -> u64 {
        self.core().metro.lock().unwrap().bar_duration
    }

    pub fn set_metro_beat(&self, note: u8, velocity: u8, duration: u64) {
        let mut metro = self.core().metro.lock().unwrap();
        metro.beat_note = note;
        metro.beat_velocity = velocity;
        metro.beat_duration = duration;
    }

    pub fn metro_beat_note(&self) -> u8 {
        self.core().metro.lock().unwrap().beat_note
    }

    pub fn metro_beat_velocity(&self) -> u8 {
        self.core().metro.lock().unwrap().beat_velocity
    }

    pub fn metro_beat_duration(&self) -> u64 {
        self.core().metro.lock().unwrap().beat_duration
    }
}
