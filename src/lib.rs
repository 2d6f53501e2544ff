// seqcore - real-time MIDI engine core for a multi-track sequencer
// Capture, tick-scheduled playback, audio/MIDI drift correction,
// transport control and the insert-send audio primitive

pub mod audio;
pub mod bus;
pub mod control;
pub mod document;
pub mod engine;
pub mod error;
pub mod event;
pub mod export;
pub mod insert;
pub mod monitor;
pub mod notify;
pub mod plugin;
pub mod seq;
pub mod session;
pub mod smf;
pub mod timescale;
pub mod track;

// Re-export commonly used types for convenience
pub use audio::{AtomicF32, AudioBus, AudioEngine, SessionCursor};
pub use bus::{BankSelMethod, BusMode, ConnectItem, MidiBus, Patch};
pub use control::{MmcCommand, MmcEvent, MmcSubCommand, SppCommand};
pub use engine::MidiEngine;
pub use error::{EngineError, EngineResult};
pub use event::{EventKind, MidiEvent};
pub use export::ExportFormat;
pub use insert::InsertPlugin;
pub use monitor::MidiMonitor;
pub use notify::TransportListener;
pub use seq::{QueueDriver, SeqEvent, SeqEventKind, Sequencer, VirtualSequencer};
pub use session::Session;
pub use timescale::{TimeScale, TimeScaleCursor};
pub use track::{MidiClip, Track};
