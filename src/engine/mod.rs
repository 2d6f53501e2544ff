// MIDI engine core
// Capture and enqueue pipelines, drift correction, transport control
// and the engine lifecycle around the input/output workers

pub mod input;
pub mod metro;
pub mod output;

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::audio::{AudioEngine, SessionCursor};
use crate::bus::{BankSelMethod, BusMode, MidiBus};
use crate::control::{
    encode_mmc, mmc_locate_data, mmc_masked_write_data, ClockEstimator, MmcCommand, MmcEvent,
    MmcSubCommand, SppCommand,
};
use crate::document::{self, EngineDocument};
use crate::error::{EngineError, EngineResult};
use crate::event::{cc, EventKind, MidiEvent};
use crate::export::{export_session, ExportFormat};
use crate::notify::{create_graph_channel, GraphConsumer, GraphProducer, TransportListener};
use crate::seq::{QueueDriver, RemoveSpec, SeqEvent, SeqEventKind, Sequencer};
use crate::session::Session;
use crate::track::{BusId, Track, TrackId};

use input::InputWorker;
use metro::MetroState;
use output::OutputWorker;

pub(crate) struct ControlState {
    pub mmc_mode: BusMode,
    pub mmc_device: u8,
    pub spp_mode: BusMode,
    pub clock_mode: BusMode,
    pub clock: ClockEstimator,
}

#[derive(Default)]
pub(crate) struct ControlBuses {
    pub dedicated: bool,
    pub input: Option<Arc<MidiBus>>,
    pub output: Option<Arc<MidiBus>>,
}

/// Shared engine innards, owned behind an `Arc` by the facade and both
/// workers
pub(crate) struct EngineCore {
    pub seq: Arc<dyn Sequencer>,
    pub driver: QueueDriver,
    pub session: Arc<Session>,
    pub audio: Arc<AudioEngine>,
    pub buses: RwLock<Vec<Arc<MidiBus>>>,
    pub midi_cursor: SessionCursor,
    pub read_ahead: AtomicU64,
    pub time_start: AtomicI64,
    pub time_drift: AtomicI64,
    pub activated: AtomicBool,
    pub capture_quantize: AtomicU32,
    pub reset_all: AtomicU32,
    pub control: Mutex<ControlState>,
    pub control_buses: Mutex<ControlBuses>,
    pub metro: Mutex<MetroState>,
    pub listener: Mutex<Option<Arc<dyn TransportListener>>>,
    pub graph_tx: Mutex<Option<GraphProducer>>,
}

impl EngineCore {
    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Relaxed)
    }

    pub fn time_start(&self) -> i64 {
        self.time_start.load(Ordering::Relaxed)
    }

    pub fn set_time_start(&self, time_start: i64) {
        self.time_start.store(time_start, Ordering::Relaxed);
    }

    /// Queue-relative schedule tick for an absolute engine tick
    pub fn queue_tick(&self, abs_tick: u64) -> u64 {
        let time_start = self.time_start();
        if (abs_tick as i64) > time_start {
            (abs_tick as i64 - time_start) as u64
        } else {
            0
        }
    }

    pub fn read_ahead(&self) -> u64 {
        self.read_ahead.load(Ordering::Relaxed)
    }

    /// MIDI may never run ahead of audio by more than the read-ahead
    pub fn midi_cursor_in_sync(&self) -> bool {
        let audio = self.audio.session_cursor();
        self.midi_cursor.frame_time() <= audio.frame_time() + self.read_ahead()
    }

    pub fn bus(&self, id: BusId) -> Option<Arc<MidiBus>> {
        self.buses.read().unwrap().get(id).cloned()
    }

    fn control_input(&self) -> Option<Arc<MidiBus>> {
        self.control_buses.lock().unwrap().input.clone()
    }

    fn control_output(&self) -> Option<Arc<MidiBus>> {
        self.control_buses.lock().unwrap().output.clone()
    }

    pub(crate) fn metro_bus(&self) -> Option<Arc<MidiBus>> {
        self.metro.lock().unwrap().bus.clone()
    }

    fn notify<F: FnOnce(&dyn TransportListener)>(&self, f: F) {
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            f(listener.as_ref());
        }
    }

    // --- capture pipeline ------------------------------------------------

    /// One arriving sequencer event through the capture pipeline
    pub fn capture(&self, ev: &mut SeqEvent) {
        // Capture quantization, to the nearest grid tick
        let quantize = self.capture_quantize.load(Ordering::Relaxed);
        if quantize > 0 {
            let q = (self.session.ticks_per_beat() / quantize).max(1) as u64;
            ev.tick = q * ((ev.tick + (q >> 1)) / q);
        }

        let control_port = self.control_input().and_then(|bus| bus.port());
        let on_control = control_port.is_some() && ev.dest == control_port;

        // Translate to the core form, collapsing NOTEON velocity 0
        let kind = match &ev.kind {
            SeqEventKind::NoteOn { note, velocity: 0, .. } => {
                EventKind::NoteOff { note: *note, velocity: 0 }
            }
            SeqEventKind::NoteOn { note, velocity, duration } => {
                EventKind::NoteOn { note: *note, velocity: *velocity, duration: *duration }
            }
            SeqEventKind::NoteOff { note, velocity, .. } => {
                EventKind::NoteOff { note: *note, velocity: *velocity }
            }
            SeqEventKind::KeyPress { note, pressure } => {
                EventKind::KeyPress { note: *note, pressure: *pressure }
            }
            SeqEventKind::Controller { param, value } => {
                // Transport controller sniffing on the control bus
                if on_control {
                    if *param > 0x7f || *value > 0x7f || *value < 0 {
                        return;
                    }
                    let (channel, param, value) = (ev.channel, *param, *value as u8);
                    self.notify(|l| l.on_ctl(channel, param, value));
                }
                EventKind::Controller { param: *param, value: (*value & 0x7f) as u8 }
            }
            SeqEventKind::ProgChange { value } => {
                EventKind::ProgChange { program: (*value & 0x7f) as u8 }
            }
            SeqEventKind::ChanPress { value } => {
                EventKind::ChanPress { pressure: (*value & 0x7f) as u8 }
            }
            SeqEventKind::PitchBend { value } => {
                EventKind::PitchBend { value: (*value).clamp(-8192, 8191) as i16 }
            }
            SeqEventKind::Start | SeqEventKind::Stop | SeqEventKind::Continue
            | SeqEventKind::SongPos { .. } => {
                // SPP family is control traffic, never forwarded
                let spp_in = self.control.lock().unwrap().spp_mode.has_input();
                if spp_in && on_control {
                    let (cmd, pos) = match &ev.kind {
                        SeqEventKind::Start => (SppCommand::Start, 0),
                        SeqEventKind::Stop => (SppCommand::Stop, 0),
                        SeqEventKind::Continue => (SppCommand::Continue, 0),
                        SeqEventKind::SongPos { value } => (SppCommand::SongPos, *value),
                        _ => unreachable!(),
                    };
                    self.notify(|l| l.on_spp(cmd, pos));
                }
                return;
            }
            SeqEventKind::Clock => {
                let clock_in = self.control.lock().unwrap().clock_mode.has_input();
                if clock_in && on_control {
                    let tempo = self.control.lock().unwrap().clock.pulse();
                    if let Some(tempo) = tempo {
                        self.notify(|l| l.on_clock(tempo));
                    }
                }
                return;
            }
            SeqEventKind::SysEx(bytes) => {
                // MMC command messages terminate here
                let (mmc_in, mmc_device) = {
                    let control = self.control.lock().unwrap();
                    (control.mmc_mode.has_input(), control.mmc_device)
                };
                if mmc_in
                    && bytes.len() > 3
                    && bytes[1] == 0x7f
                    && bytes[3] == 0x06
                    && on_control
                {
                    if let Some(mmc) = MmcEvent::decode(bytes) {
                        // Addressed to us or to the all-call id
                        if mmc.device == 0x7f || mmc.device == mmc_device {
                            self.notify(|l| l.on_mmc(mmc));
                        }
                    }
                    return;
                }
                EventKind::SysEx(bytes.to_vec())
            }
            SeqEventKind::Tempo { .. } => return,
        };

        let event = MidiEvent::new(ev.tick, ev.channel, kind);
        let buses = self.buses.read().unwrap();

        // Track dispatch: record, monitor, thru
        let recording = self.session.is_recording() && self.session.is_playing();
        for track in self.session.tracks().iter() {
            if !(track.is_record() || self.session.is_track_monitor(track)) {
                continue;
            }
            if !self.session.is_track_midi_channel(track, event.channel) {
                continue;
            }
            let in_bus = track.input_bus.and_then(|id| buses.get(id));
            let Some(in_bus) = in_bus else { continue };
            if ev.dest.is_none() || in_bus.port() != ev.dest {
                continue;
            }

            if track.is_record() && recording && self.in_punch_window(event.time) {
                track.record_buffer.lock().unwrap().push(event.clone());
            }
            track.meter.enqueue(event.kind.monitor_value());

            if self.session.is_track_monitor(track) {
                let out_bus = track.output_bus.and_then(|id| buses.get(id));
                if let Some(out_bus) = out_bus {
                    if let (Some(port), Some(monitor)) = (out_bus.port(), out_bus.monitor_out()) {
                        // MIDI-thru: same event redirected on the
                        // track's channel
                        let mut thru = ev.clone();
                        thru.channel = track.channel;
                        thru.source = Some(port);
                        thru.direct = true;
                        self.seq.event_output_direct(thru.clone());
                        monitor.enqueue(event.kind.monitor_value());
                        track.plugins.direct(&thru);
                    }
                }
            }
        }

        // Bus monitoring and passthrough
        for bus in buses.iter() {
            if bus.port() != ev.dest || ev.dest.is_none() {
                continue;
            }
            if let Some(monitor) = bus.monitor_in() {
                monitor.enqueue(event.kind.monitor_value());
            }
            if let Some(chain) = bus.plugins_in() {
                chain.direct(ev);
            }
            if bus.is_passthrough() {
                if let Some(chain) = bus.plugins_out() {
                    chain.direct(ev);
                }
                if let Some(monitor) = bus.monitor_out() {
                    let mut thru = ev.clone();
                    thru.source = bus.port();
                    thru.direct = true;
                    self.seq.event_output_direct(thru);
                    monitor.enqueue(event.kind.monitor_value());
                }
            }
        }
    }

    /// Punch filtering happens in ticks, against the live tempo map
    fn in_punch_window(&self, event_tick: u64) -> bool {
        if !self.session.is_punching() {
            return true;
        }
        let abs = event_tick as i64 + self.time_start();
        let punch_in = self.session.tick_from_frame(self.session.punch_in()) as i64;
        let punch_out = self.session.tick_from_frame(self.session.punch_out()) as i64;
        abs >= punch_in && abs < punch_out
    }

    // --- enqueue pipeline ------------------------------------------------

    /// Schedule one track event onto the backend queue
    pub fn enqueue(&self, track: &Track, out_bus: &MidiBus, event: &MidiEvent, abs_tick: u64, gain: f32) {
        let Some(port) = out_bus.port() else { return };
        let tick = self.queue_tick(abs_tick);

        let kind = match &event.kind {
            EventKind::NoteOn { note, velocity, duration } => SeqEventKind::NoteOn {
                note: *note,
                velocity: ((gain * *velocity as f32) as i32 & 0x7f) as u8,
                duration: *duration,
            },
            EventKind::NoteOff { note, velocity } => {
                SeqEventKind::NoteOff { note: *note, velocity: *velocity, duration: 0 }
            }
            EventKind::KeyPress { note, pressure } => {
                SeqEventKind::KeyPress { note: *note, pressure: *pressure }
            }
            EventKind::Controller { param, value } => {
                // Track bank override beats whatever the clip says
                let value = match *param {
                    cc::BANK_SELECT_MSB if track.midi_bank >= 0 => (track.midi_bank & 0x3f80) >> 7,
                    cc::BANK_SELECT_LSB if track.midi_bank >= 0 => track.midi_bank & 0x007f,
                    _ => *value as i32,
                };
                SeqEventKind::Controller { param: *param, value }
            }
            EventKind::ProgChange { program } => SeqEventKind::ProgChange {
                value: if track.midi_program >= 0 { track.midi_program } else { *program as i32 },
            },
            EventKind::ChanPress { pressure } => SeqEventKind::ChanPress { value: *pressure as i32 },
            EventKind::PitchBend { value } => SeqEventKind::PitchBend { value: *value as i32 },
            EventKind::SysEx(bytes) => SeqEventKind::SysEx(bytes.clone().into_boxed_slice()),
        };

        let monitor_value = event.kind.monitor_value();
        let mut out = SeqEvent::queued(kind, track.channel, port, tick);
        out.tag = track.tag();
        self.seq.event_output(out.clone());

        track.meter.enqueue_scheduled(monitor_value, tick);
        if let Some(monitor) = out_bus.monitor_out() {
            monitor.enqueue_scheduled(monitor_value, tick);
        }
        track.plugins.queued(&out);
        if let Some(chain) = out_bus.plugins_out() {
            chain.queued(&out);
        }
    }

    /// Render every un-muted track's clips over a frame range
    pub fn render_range(&self, frame_start: u64, frame_end: u64) {
        let solo_filter = self.session.solo_tracks();
        for track in self.session.tracks().iter() {
            if track.is_mute() || (solo_filter && !track.is_solo()) {
                continue;
            }
            self.render_track_range(track, frame_start, frame_end);
        }
    }

    /// Render one track's clips over a frame range
    pub fn render_track_range(&self, track: &Track, frame_start: u64, frame_end: u64) {
        if frame_start >= frame_end {
            return;
        }
        let Some(out_bus) = track.output_bus.and_then(|id| self.bus(id)) else { return };
        let tick_start = self.session.tick_from_frame(frame_start);
        let tick_end = self.session.tick_from_frame(frame_end);

        track.with_clips(|clips| {
            for clip in clips {
                if clip.start >= frame_end {
                    break;
                }
                if clip.end() <= frame_start {
                    continue;
                }
                let clip_tick = self.session.tick_from_frame(clip.start);
                for event in &clip.events {
                    let abs_tick = clip_tick + event.time;
                    if abs_tick < tick_start {
                        continue;
                    }
                    if abs_tick >= tick_end {
                        break;
                    }
                    let event_frame = self.session.frame_from_tick(abs_tick);
                    let gain = clip.gain.value_at(event_frame.saturating_sub(clip.start));
                    self.enqueue(track, &out_bus, event, abs_tick, gain);
                }
            }
        });
    }

    // --- drift correction ------------------------------------------------

    /// Compare the audio clock with the queue clock and warp the future
    /// queue rate over the accumulated phase offset
    pub fn drift(&self) {
        let audio_frame = self.session.play_head();
        let (audio_tick, delta_max) = self.session.with_timescale(|ts| {
            let node = ts.node_at_frame(audio_frame);
            let audio_tick = node.tick_from_frame(audio_frame) as i64;
            let ahead_tick = node.tick_from_frame(audio_frame + self.read_ahead()) as i64;
            (audio_tick, ahead_tick - audio_tick)
        });

        let time_drift = self.time_drift.load(Ordering::Relaxed);
        let midi_tick = self.time_start() + self.driver.tick_time() as i64;
        let delta = audio_tick - midi_tick;

        if audio_tick > delta_max
            && midi_tick > time_drift
            && delta != 0
            && delta > -delta_max
            && delta < delta_max
        {
            let skew_base = self.driver.skew_base();
            let skew_prev = self.driver.skew();
            let skew_next =
                (skew_base as f64 * audio_tick as f64 / (midi_tick - time_drift) as f64) as u32;
            if skew_next != skew_prev {
                self.driver.set_skew(skew_next);
            }
            self.time_drift.store(time_drift + delta, Ordering::Relaxed);
        }
    }

    /// Loop wrap: rewind the queue-relative origin by one loop length
    pub fn restart_loop(&self) {
        if self.session.is_looping() {
            let loop_ticks = self.session.tick_from_frame(self.session.loop_end()) as i64
                - self.session.tick_from_frame(self.session.loop_start()) as i64;
            self.time_start.fetch_sub(loop_ticks, Ordering::Relaxed);
            self.time_drift.store(0, Ordering::Relaxed);
        }
    }

    /// Realize the backend output queue
    pub fn flush(&self) {
        self.seq.drain_output();
    }

    // --- controller/monitor resets ---------------------------------------

    /// Recache the tempo node under the playhead onto the queue clock
    pub fn reset_tempo(&self) {
        if !self.activated.load(Ordering::Relaxed) {
            return;
        }
        let ppq = self.session.ticks_per_beat();
        let play_head = self.session.play_head();
        let tempo = self.session.with_timescale(|ts| {
            let mut metro = self.metro.lock().unwrap();
            metro.cursor.reset();
            metro.cursor.seek_frame(ts, play_head).tempo
        });
        self.driver.set_tempo(tempo, ppq);
        self.metro.lock().unwrap().tempo = tempo;
        self.control.lock().unwrap().clock.reset(tempo);
    }

    pub fn reset_all_monitors(&self) {
        for bus in self.buses.read().unwrap().iter() {
            if let Some(monitor) = bus.monitor_in() {
                monitor.reset();
            }
            if let Some(monitor) = bus.monitor_out() {
                monitor.reset();
            }
        }
        if let Some(bus) = self.metro_bus() {
            if let Some(monitor) = bus.monitor_out() {
                monitor.reset();
            }
        }
        for track in self.session.tracks().iter() {
            track.meter.reset();
        }
    }

    /// Re-send instrument/controller state on every bus and track;
    /// deferred by default, immediate when forced
    pub fn reset_all_controllers(&self, force: bool) {
        if !force {
            self.reset_all.fetch_add(1, Ordering::Relaxed);
            return;
        }

        for bus in self.buses.read().unwrap().iter() {
            if let Some(monitor) = bus.monitor_out() {
                bus.send_sysex_list(self.seq.as_ref());
                bus.set_master_volume(self.seq.as_ref(), monitor.gain());
                bus.set_master_panning(self.seq.as_ref(), monitor.panning());
            } else if let Some(monitor) = bus.monitor_in() {
                bus.set_master_volume(self.seq.as_ref(), monitor.gain());
                bus.set_master_panning(self.seq.as_ref(), monitor.panning());
            }
        }

        let buses = self.buses.read().unwrap();
        for track in self.session.tracks().iter() {
            let Some(bus) = track.output_bus.and_then(|id| buses.get(id)) else { continue };
            bus.set_patch(
                self.seq.as_ref(),
                track.channel,
                &track.instrument_name,
                BankSelMethod::from_i32(track.bank_sel_method),
                track.midi_bank,
                track.midi_program,
                Some(&track.plugins),
            );
            bus.set_volume(self.seq.as_ref(), track.channel, track.meter.gain());
            bus.set_panning(self.seq.as_ref(), track.channel, track.meter.panning());
        }

        self.reset_all.store(0, Ordering::Relaxed);
    }

    pub fn is_reset_all_controllers(&self) -> bool {
        self.reset_all.load(Ordering::Relaxed) > 0
    }
}

/// The engine facade: lifecycle, workers and host-facing operations
pub struct MidiEngine {
    core: Arc<EngineCore>,
    input: Option<InputWorker>,
    output: Option<OutputWorker>,
    graph_rx: Option<GraphConsumer>,
}

impl MidiEngine {
    pub fn new(seq: Arc<dyn Sequencer>, session: Arc<Session>, audio: Arc<AudioEngine>) -> Self {
        let read_ahead = (session.sample_rate() >> 1) as u64;
        let core = Arc::new(EngineCore {
            driver: QueueDriver::new(seq.clone()),
            seq,
            session,
            audio,
            buses: RwLock::new(Vec::new()),
            midi_cursor: SessionCursor::new(),
            read_ahead: AtomicU64::new(read_ahead),
            time_start: AtomicI64::new(0),
            time_drift: AtomicI64::new(0),
            activated: AtomicBool::new(false),
            capture_quantize: AtomicU32::new(0),
            reset_all: AtomicU32::new(0),
            control: Mutex::new(ControlState {
                mmc_mode: BusMode::Duplex,
                mmc_device: 0x7f,
                spp_mode: BusMode::Duplex,
                clock_mode: BusMode::None,
                clock: ClockEstimator::new(120.0),
            }),
            control_buses: Mutex::new(ControlBuses::default()),
            metro: Mutex::new(MetroState::new()),
            listener: Mutex::new(None),
            graph_tx: Mutex::new(None),
        });
        Self { core, input: None, output: None, graph_rx: None }
    }

    pub(crate) fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.core.session
    }

    pub fn audio(&self) -> &Arc<AudioEngine> {
        &self.core.audio
    }

    // --- buses -----------------------------------------------------------

    /// Register a bus with the engine; an active engine opens its port
    /// right away
    pub fn add_bus(&self, bus: MidiBus) -> EngineResult<BusId> {
        let bus = Arc::new(bus);
        if self.core.activated.load(Ordering::Relaxed) && bus.port().is_none() {
            bus.open(self.core.seq.as_ref())?;
        }
        let mut buses = self.core.buses.write().unwrap();
        buses.push(bus);
        Ok(buses.len() - 1)
    }

    pub fn bus(&self, id: BusId) -> Option<Arc<MidiBus>> {
        self.core.bus(id)
    }

    pub fn buses(&self) -> Vec<Arc<MidiBus>> {
        self.core.buses.read().unwrap().clone()
    }

    pub fn find_bus(&self, name: &str) -> Option<(BusId, Arc<MidiBus>)> {
        self.core
            .buses
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .find(|(_, bus)| bus.name() == name)
            .map(|(id, bus)| (id, bus.clone()))
    }

    // --- configuration ---------------------------------------------------

    pub fn set_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.core.listener.lock().unwrap() = Some(listener);
    }

    /// The port-graph change consumer; one per engine
    pub fn take_graph_consumer(&mut self) -> Option<GraphConsumer> {
        self.graph_rx.take()
    }

    pub fn set_capture_quantize(&self, quantize: u32) {
        self.core.capture_quantize.store(quantize, Ordering::Relaxed);
    }

    pub fn capture_quantize(&self) -> u32 {
        self.core.capture_quantize.load(Ordering::Relaxed)
    }

    pub fn set_mmc_mode(&self, mode: BusMode) {
        self.core.control.lock().unwrap().mmc_mode = mode;
    }

    pub fn mmc_mode(&self) -> BusMode {
        self.core.control.lock().unwrap().mmc_mode
    }

    pub fn set_mmc_device(&self, device: u8) {
        self.core.control.lock().unwrap().mmc_device = device & 0x7f;
    }

    pub fn mmc_device(&self) -> u8 {
        self.core.control.lock().unwrap().mmc_device
    }

    pub fn set_spp_mode(&self, mode: BusMode) {
        self.core.control.lock().unwrap().spp_mode = mode;
    }

    pub fn spp_mode(&self) -> BusMode {
        self.core.control.lock().unwrap().spp_mode
    }

    pub fn set_clock_mode(&self, mode: BusMode) {
        self.core.control.lock().unwrap().clock_mode = mode;
    }

    pub fn clock_mode(&self) -> BusMode {
        self.core.control.lock().unwrap().clock_mode
    }

    pub fn set_read_ahead(&self, frames: u64) {
        if let Some(output) = &self.output {
            output.set_read_ahead(frames);
        } else {
            self.core.read_ahead.store(frames, Ordering::Relaxed);
        }
    }

    pub fn read_ahead(&self) -> u64 {
        self.core.read_ahead()
    }

    pub fn time_start(&self) -> i64 {
        self.core.time_start()
    }

    pub fn time_drift(&self) -> i64 {
        self.core.time_drift.load(Ordering::Relaxed)
    }

    // --- control / metronome buses ---------------------------------------

    /// Use a dedicated duplex "Control" bus instead of the first
    /// regular engine buses
    pub fn set_control_bus(&self, dedicated: bool) -> EngineResult<()> {
        self.delete_control_buses();
        self.core.control_buses.lock().unwrap().dedicated = dedicated;
        self.create_control_buses();
        if self.core.activated.load(Ordering::Relaxed) {
            self.open_control_buses()?;
        }
        Ok(())
    }

    fn create_control_buses(&self) {
        let mut state = self.core.control_buses.lock().unwrap();
        if state.dedicated {
            let bus = Arc::new(MidiBus::new("Control", BusMode::Duplex, false));
            state.input = Some(bus.clone());
            state.output = Some(bus);
        } else {
            let buses = self.core.buses.read().unwrap();
            state.input = buses.iter().find(|b| b.mode().has_input()).cloned();
            state.output = buses.iter().find(|b| b.mode().has_output()).cloned();
        }
    }

    fn open_control_buses(&self) -> EngineResult<()> {
        let state = self.core.control_buses.lock().unwrap();
        if state.dedicated {
            if let Some(bus) = &state.input {
                if bus.port().is_none() {
                    bus.open(self.core.seq.as_ref())?;
                }
            }
        }
        Ok(())
    }

    fn delete_control_buses(&self) {
        let mut state = self.core.control_buses.lock().unwrap();
        if state.dedicated {
            if let Some(bus) = state.input.take() {
                bus.close(self.core.seq.as_ref());
            }
            state.output = None;
        } else {
            state.input = None;
            state.output = None;
        }
    }

    pub fn is_activated(&self) -> bool {
        self.core.is_activated()
    }

    pub fn is_control_bus(&self) -> bool {
        self.core.control_buses.lock().unwrap().dedicated
    }

    pub fn control_bus_in(&self) -> Option<Arc<MidiBus>> {
        self.core.control_input()
    }

    pub fn control_bus_out(&self) -> Option<Arc<MidiBus>> {
        self.core.control_output()
    }

    // --- lifecycle -------------------------------------------------------

    /// Wire up the control and metronome buses
    pub fn init(&mut self) -> EngineResult<()> {
        let (graph_tx, graph_rx) = create_graph_channel(256);
        *self.core.graph_tx.lock().unwrap() = Some(graph_tx);
        self.graph_rx = Some(graph_rx);

        self.create_control_buses();
        self.create_metro_bus();
        Ok(())
    }

    /// Spawn both workers
    pub fn activate(&mut self) -> EngineResult<()> {
        if self.core.activated.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        for bus in self.core.buses.read().unwrap().iter() {
            if bus.port().is_none() {
                bus.open(self.core.seq.as_ref())?;
            }
        }
        self.open_control_buses()?;
        self.open_metro_bus()?;

        self.core.set_time_start(0);
        self.core.time_drift.store(0, Ordering::Relaxed);

        self.input = Some(InputWorker::spawn(self.core.clone()));
        self.output = Some(OutputWorker::spawn(self.core.clone()));

        self.core.reset_all_monitors();
        Ok(())
    }

    /// Arm the queue and bump the first output window
    pub fn start(&self) -> EngineResult<()> {
        if !self.core.activated.load(Ordering::Relaxed) {
            return Err(EngineError::NotActive);
        }
        let output = self.output.as_ref().ok_or(EngineError::NotActive)?;

        // Seat the MIDI cursor on the audio cursor
        output.midi_cursor_sync(true);

        self.core.reset_tempo();
        self.core.reset_all_monitors();

        let frame = self.core.midi_cursor.frame();
        self.core.set_time_start(self.core.session.tick_from_frame(frame) as i64);
        self.core.time_drift.store(0, Ordering::Relaxed);

        self.core.driver.start();
        output.process_sync();
        Ok(())
    }

    /// Drop both queues and shut every bus off
    pub fn stop(&self) {
        if !self.core.activated.load(Ordering::Relaxed) {
            return;
        }
        self.core.driver.drop_input();
        self.core.driver.drop_output();
        self.core.driver.stop();

        for bus in self.core.buses.read().unwrap().iter() {
            bus.shut_off(self.core.seq.as_ref());
        }
        if let Some(bus) = self.core.metro_bus() {
            bus.shut_off(self.core.seq.as_ref());
        }
    }

    /// Wind both workers down cooperatively
    pub fn deactivate(&mut self) {
        self.core.session.set_playing(false);
        if let Some(input) = self.input.take() {
            input.shutdown();
        }
        if let Some(output) = self.output.take() {
            output.shutdown();
        }
        self.core.activated.store(false, Ordering::Relaxed);
    }

    /// Release every port and bus
    pub fn clean(&mut self) {
        self.delete_control_buses();
        self.delete_metro_bus();
        for bus in self.core.buses.write().unwrap().drain(..) {
            bus.close(self.core.seq.as_ref());
        }
        self.core.set_time_start(0);
        self.core.time_drift.store(0, Ordering::Relaxed);
        *self.core.graph_tx.lock().unwrap() = None;
    }

    // --- worker hand-offs ------------------------------------------------

    /// Conditional wake of the output worker; never blocks
    pub fn sync(&self) {
        if let Some(output) = &self.output {
            if self.core.midi_cursor_in_sync() {
                output.sync();
            }
        }
    }

    /// One blocking output cycle
    pub fn process_sync(&self) {
        if let Some(output) = &self.output {
            output.process_sync();
        }
    }

    /// Re-render one track from `frame` to the current MIDI cursor
    pub fn track_sync(&self, track_id: TrackId, frame: u64) {
        if let (Some(output), Some(track)) = (&self.output, self.core.session.track(track_id)) {
            output.track_sync(&track, frame);
        }
    }

    /// Re-render the metronome from `frame` to the current MIDI cursor
    pub fn metro_sync(&self, frame: u64) {
        if let Some(output) = &self.output {
            output.metro_sync(frame);
        }
    }

    // --- transport-control sends -----------------------------------------

    /// Generic MMC command on the control output bus
    pub fn send_mmc_command(&self, cmd: MmcCommand, data: &[u8]) {
        let control = self.core.control.lock().unwrap();
        if !control.mmc_mode.has_output() {
            return;
        }
        let device = control.mmc_device;
        drop(control);
        let Some(bus) = self.core.control_output() else { return };
        bus.send_sysex(self.core.seq.as_ref(), &encode_mmc(device, cmd, data));
    }

    /// MMC LOCATE at a 30 fps timecode frame
    pub fn send_mmc_locate(&self, frame: u64) {
        self.send_mmc_command(MmcCommand::Locate, &mmc_locate_data(frame));
    }

    /// MMC MASKED_WRITE for a track's record/mute state
    pub fn send_mmc_masked_write(&self, scmd: MmcSubCommand, track: u16, on: bool) {
        self.send_mmc_command(MmcCommand::MaskedWrite, &mmc_masked_write_data(scmd, track, on));
    }

    /// Direct SPP command on the control output bus
    pub fn send_spp_command(&self, cmd: SppCommand, song_pos: u16) {
        if !self.core.control.lock().unwrap().spp_mode.has_output() {
            return;
        }
        let Some(bus) = self.core.control_output() else { return };
        let Some(port) = bus.port() else { return };
        let kind = match cmd {
            SppCommand::Start => SeqEventKind::Start,
            SppCommand::Stop => SeqEventKind::Stop,
            SppCommand::Continue => SeqEventKind::Continue,
            SppCommand::SongPos => SeqEventKind::SongPos { value: song_pos },
        };
        self.core.seq.event_output_direct(SeqEvent::direct(kind, 0, port));
    }

    // --- resets / connects -----------------------------------------------

    pub fn reset_tempo(&self) {
        self.core.reset_tempo();
    }

    pub fn reset_all_monitors(&self) {
        self.core.reset_all_monitors();
    }

    pub fn reset_all_controllers(&self, force: bool) {
        self.core.reset_all_controllers(force);
    }

    pub fn is_reset_all_controllers(&self) -> bool {
        self.core.is_reset_all_controllers()
    }

    /// Retry the pending connection lists of every bus; forces any
    /// deferred controller reset through afterwards
    pub fn update_connects(&self) -> usize {
        let mut update = 0;
        for bus in self.core.buses.read().unwrap().iter() {
            update += self.update_bus_connects(bus);
        }
        let control = self.core.control_buses.lock().unwrap();
        if control.dedicated {
            if let Some(bus) = &control.input {
                update += self.update_bus_connects(bus);
            }
        }
        drop(control);
        let metro = self.core.metro.lock().unwrap();
        if metro.dedicated {
            if let Some(bus) = &metro.bus {
                update += self.update_bus_connects(bus);
            }
        }
        drop(metro);

        if update > 0 {
            self.core.reset_all_controllers(false);
        }
        if self.core.is_reset_all_controllers() {
            self.core.reset_all_controllers(true);
        }
        update
    }

    fn update_bus_connects(&self, bus: &Arc<MidiBus>) -> usize {
        let seq = self.core.seq.as_ref();
        let mut update = 0;
        {
            let mut pending = bus.pending_inputs();
            if !pending.is_empty() {
                update += bus.update_connects(seq, BusMode::Input, &mut pending, true);
            }
        }
        {
            let mut pending = bus.pending_outputs();
            if !pending.is_empty() {
                update += bus.update_connects(seq, BusMode::Output, &mut pending, true);
            }
        }
        update
    }

    // --- track operations ------------------------------------------------

    /// Immediate track mute: purge the queued tail, choke the channel
    pub fn track_mute(&self, track_id: TrackId, mute: bool) {
        let Some(track) = self.core.session.track(track_id) else { return };
        track.set_mute(mute);
        let frame = self.core.session.play_head();

        if mute {
            let tick = self.core.queue_tick(self.core.session.tick_from_frame(frame));
            self.core.driver.remove_from_output(&RemoveSpec {
                tag: Some(track.tag()),
                channel: Some(track.channel),
                after_tick: tick,
                ignore_off: true,
            });
            if let Some(bus) = track.output_bus.and_then(|id| self.core.bus(id)) {
                bus.set_controller(self.core.seq.as_ref(), track.channel, cc::ALL_NOTES_OFF, 0);
            }
            track.meter.clear();
        } else if self.core.session.is_playing() {
            if let Some(output) = &self.output {
                output.track_sync(&track, frame);
            }
        }
    }

    // --- document binding ------------------------------------------------

    /// Load the engine-owned document fields, rebuilding the bus set
    pub fn load_document(&mut self, doc: &EngineDocument) -> EngineResult<()> {
        {
            let mut control = self.core.control.lock().unwrap();
            control.mmc_mode = BusMode::from_str(&doc.control.mmc_mode);
            control.mmc_device = doc.control.mmc_device & 0x7f;
            control.spp_mode = BusMode::from_str(&doc.control.spp_mode);
            control.clock_mode = BusMode::from_str(&doc.control.clock_mode);
        }

        {
            let mut buses = self.core.buses.write().unwrap();
            for bus in buses.drain(..) {
                bus.close(self.core.seq.as_ref());
            }
            for bus_doc in &doc.buses {
                buses.push(Arc::new(document::bus_from_doc(bus_doc)));
            }
        }

        self.create_control_buses();
        self.create_metro_bus();

        let control = self.core.control_buses.lock().unwrap();
        if control.dedicated {
            if let Some(bus) = &control.input {
                *bus.pending_inputs() = document::connects_from_doc(&doc.control_inputs);
                *bus.pending_outputs() = document::connects_from_doc(&doc.control_outputs);
            }
        }
        drop(control);
        let metro = self.core.metro.lock().unwrap();
        if metro.dedicated {
            if let Some(bus) = &metro.bus {
                *bus.pending_outputs() = document::connects_from_doc(&doc.metronome_outputs);
            }
        }
        Ok(())
    }

    /// Snapshot the engine-owned document fields
    pub fn save_document(&self) -> EngineDocument {
        let seq = self.core.seq.as_ref();
        let control_state = self.core.control.lock().unwrap();
        let control = document::MidiControlDoc {
            mmc_mode: control_state.mmc_mode.as_str().to_string(),
            mmc_device: control_state.mmc_device,
            spp_mode: control_state.spp_mode.as_str().to_string(),
            clock_mode: control_state.clock_mode.as_str().to_string(),
        };
        drop(control_state);

        let buses = self
            .core
            .buses
            .read()
            .unwrap()
            .iter()
            .map(|bus| document::bus_to_doc(bus, seq))
            .collect();

        let mut doc = EngineDocument { control, buses, ..EngineDocument::default() };

        let control_buses = self.core.control_buses.lock().unwrap();
        if control_buses.dedicated {
            if let Some(bus) = &control_buses.input {
                let mut list = Vec::new();
                bus.update_connects(seq, BusMode::Input, &mut list, false);
                doc.control_inputs = document::connects_to_doc(&list);
                let mut list = Vec::new();
                bus.update_connects(seq, BusMode::Output, &mut list, false);
                doc.control_outputs = document::connects_to_doc(&list);
            }
        }
        drop(control_buses);
        let metro = self.core.metro.lock().unwrap();
        if metro.dedicated {
            if let Some(bus) = &metro.bus {
                let mut list = Vec::new();
                bus.update_connects(seq, BusMode::Output, &mut list, false);
                doc.metronome_outputs = document::connects_to_doc(&list);
            }
        }
        doc
    }

    // --- export ----------------------------------------------------------

    /// One-shot export of the session range into a standard MIDI file
    pub fn file_export<W: Write>(
        &self,
        writer: &mut W,
        format: ExportFormat,
        frame_start: u64,
        frame_end: u64,
        target_bus: Option<BusId>,
        export_name: &str,
    ) -> EngineResult<()> {
        let buses = self.buses();
        export_session(
            &self.core.session,
            &buses,
            target_bus,
            format,
            frame_start,
            frame_end,
            export_name,
            writer,
        )
    }
}

impl Drop for MidiEngine {
    fn drop(&mut self) {
        self.deactivate();
        self.clean();
    }
}
