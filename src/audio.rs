// Host audio-engine context
// Master sample-clock cursor, bus registry and lock-free parameters

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bus::{BusMode, ConnectList};

/// Thread-safe f32 parameter using atomic bit storage
/// Shared between control threads and the audio callback without locks
#[derive(Debug, Default)]
pub struct AtomicF32 {
    inner: AtomicU32,
}

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self { inner: AtomicU32::new(value.to_bits()) }
    }

    pub fn set(&self, value: f32) {
        self.inner.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.inner.load(Ordering::Relaxed))
    }
}

/// Play cursor over a sample clock
///
/// `frame` is the current play position; `frame_time` is the monotonic
/// stream time consumed so far. The audio callback advances both; the
/// MIDI side keeps its own cursor, seeking `frame` and consuming
/// `frame_time` one read-ahead window at a time.
#[derive(Debug, Default)]
pub struct SessionCursor {
    frame: AtomicU64,
    frame_time: AtomicU64,
}

impl SessionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    pub fn frame_time(&self) -> u64 {
        self.frame_time.load(Ordering::Relaxed)
    }

    pub fn seek(&self, frame: u64) {
        self.frame.store(frame, Ordering::Relaxed);
    }

    pub fn set_frame_time(&self, frame_time: u64) {
        self.frame_time.store(frame_time, Ordering::Relaxed);
    }

    /// Consume `frames` of stream time
    pub fn process(&self, frames: u64) {
        self.frame_time.fetch_add(frames, Ordering::Relaxed);
    }

    /// Advance both play position and stream time (audio callback side)
    pub fn advance(&self, frames: u64) {
        self.frame.fetch_add(frames, Ordering::Relaxed);
        self.frame_time.fetch_add(frames, Ordering::Relaxed);
    }
}

/// Named audio bus descriptor
///
/// The engine registry tracks names, channel counts and connection
/// lists; sample buffers belong to whoever processes the bus.
#[derive(Debug)]
pub struct AudioBus {
    name: String,
    mode: BusMode,
    channels: usize,
    inputs: Mutex<ConnectList>,
    outputs: Mutex<ConnectList>,
}

impl AudioBus {
    pub fn new(name: &str, mode: BusMode, channels: usize) -> Self {
        Self {
            name: name.to_string(),
            mode,
            channels,
            inputs: Mutex::new(ConnectList::new()),
            outputs: Mutex::new(ConnectList::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> BusMode {
        self.mode
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn inputs(&self) -> std::sync::MutexGuard<'_, ConnectList> {
        self.inputs.lock().unwrap()
    }

    pub fn outputs(&self) -> std::sync::MutexGuard<'_, ConnectList> {
        self.outputs.lock().unwrap()
    }
}

/// The master audio engine surface this crate depends on
pub struct AudioEngine {
    sample_rate: u32,
    buffer_size: usize,
    cursor: SessionCursor,
    buses: Mutex<Vec<Arc<AudioBus>>>,
    aux_buses: Mutex<Vec<Arc<AudioBus>>>,
}

impl AudioEngine {
    pub fn new(sample_rate: u32, buffer_size: usize) -> Self {
        Self {
            sample_rate,
            buffer_size,
            cursor: SessionCursor::new(),
            buses: Mutex::new(Vec::new()),
            aux_buses: Mutex::new(Vec::new()),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn session_cursor(&self) -> &SessionCursor {
        &self.cursor
    }

    pub fn add_bus(&self, bus: Arc<AudioBus>) {
        self.buses.lock().unwrap().push(bus);
    }

    pub fn find_bus(&self, name: &str) -> Option<Arc<AudioBus>> {
        self.buses.lock().unwrap().iter().find(|b| b.name() == name).cloned()
    }

    /// Auxiliary (exo) bus registry, used by insert plugins for
    /// connection persistence
    pub fn add_bus_ex(&self, bus: Arc<AudioBus>) {
        self.aux_buses.lock().unwrap().push(bus);
    }

    pub fn remove_bus_ex(&self, bus: &Arc<AudioBus>) {
        self.aux_buses.lock().unwrap().retain(|b| !Arc::ptr_eq(b, bus));
    }

    pub fn find_bus_ex(&self, name: &str) -> Option<Arc<AudioBus>> {
        self.aux_buses.lock().unwrap().iter().find(|b| b.name() == name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_f32() {
        let p = AtomicF32::new(1.0);
        assert_eq!(p.get(), 1.0);
        p.set(0.25);
        assert_eq!(p.get(), 0.25);
    }

    #[test]
    fn test_cursor_advance_and_seek() {
        let cursor = SessionCursor::new();
        cursor.advance(512);
        assert_eq!(cursor.frame(), 512);
        assert_eq!(cursor.frame_time(), 512);

        cursor.seek(96000);
        cursor.process(24000);
        assert_eq!(cursor.frame(), 96000);
        assert_eq!(cursor.frame_time(), 512 + 24000);
    }

    #[test]
    fn test_aux_bus_registry() {
        let engine = AudioEngine::new(48000, 512);
        let bus = Arc::new(AudioBus::new("Chain/Insert", BusMode::Duplex, 2));
        engine.add_bus_ex(bus.clone());

        assert!(engine.find_bus_ex("Chain/Insert").is_some());
        assert!(engine.find_bus("Chain/Insert").is_none());

        engine.remove_bus_ex(&bus);
        assert!(engine.find_bus_ex("Chain/Insert").is_none());
    }
}
