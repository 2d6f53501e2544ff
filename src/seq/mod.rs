// Sequencer backend interface
// Queued, tick-timestamped MIDI delivery with adjustable tempo and skew

pub mod queue;
pub mod virt;

pub use queue::QueueDriver;
pub use virt::VirtualSequencer;

use std::time::Duration;

use crate::error::EngineResult;

pub type ClientId = u32;
pub type PortId = u32;

/// Port capability bit flags, backend convention
pub mod caps {
    /// Port can be read from (it is an output of ours)
    pub const READ: u32 = 1 << 0;
    /// Port can be written to (it is an input of ours)
    pub const WRITE: u32 = 1 << 1;
    pub const SUBS_READ: u32 = 1 << 2;
    pub const SUBS_WRITE: u32 = 1 << 3;
    /// Hidden from connection scans
    pub const NO_EXPORT: u32 = 1 << 4;
}

/// Full client:port address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    pub client: ClientId,
    pub port: PortId,
}

impl Addr {
    pub fn new(client: ClientId, port: PortId) -> Self {
        Self { client, port }
    }
}

/// A discoverable endpoint on the sequencer graph
#[derive(Debug, Clone, PartialEq)]
pub struct PortInfo {
    pub client: ClientId,
    pub port: PortId,
    pub client_name: String,
    pub port_name: String,
    pub caps: u32,
}

/// Subscription query direction, relative to our port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsDir {
    /// Who reads from us (our outputs)
    Read,
    /// Who writes into us (our inputs)
    Write,
}

/// Wire-form sequencer event payload
#[derive(Debug, Clone, PartialEq)]
pub enum SeqEventKind {
    NoteOn { note: u8, velocity: u8, duration: u64 },
    NoteOff { note: u8, velocity: u8, duration: u64 },
    KeyPress { note: u8, pressure: u8 },
    Controller { param: u8, value: i32 },
    ProgChange { value: i32 },
    ChanPress { value: i32 },
    /// Centered at 0
    PitchBend { value: i32 },
    SysEx(Box<[u8]>),
    /// 24-ppq transport clock pulse
    Clock,
    Start,
    Stop,
    Continue,
    SongPos { value: u16 },
    /// Queue tempo change, microseconds per beat
    Tempo { micros_per_beat: u32 },
}

/// One backend event
///
/// On input, `tick` is the queue tick stamped at arrival. On output it
/// is the schedule tick, honored unless `direct` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct SeqEvent {
    pub kind: SeqEventKind,
    pub channel: u8,
    pub tag: u8,
    pub tick: u64,
    pub direct: bool,
    pub source: Option<PortId>,
    pub dest: Option<PortId>,
}

impl SeqEvent {
    /// Unscheduled event, delivered immediately to subscribers
    pub fn direct(kind: SeqEventKind, channel: u8, source: PortId) -> Self {
        Self {
            kind,
            channel,
            tag: 0,
            tick: 0,
            direct: true,
            source: Some(source),
            dest: None,
        }
    }

    /// Queue-scheduled event
    pub fn queued(kind: SeqEventKind, channel: u8, source: PortId, tick: u64) -> Self {
        Self {
            kind,
            channel,
            tag: 0,
            tick,
            direct: false,
            source: Some(source),
            dest: None,
        }
    }
}

/// Selector for `remove_output_events`
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveSpec {
    pub tag: Option<u8>,
    pub channel: Option<u8>,
    /// Only events scheduled at or after this tick are removed
    pub after_tick: u64,
    /// Keep note-off events so sounding notes still terminate
    pub ignore_off: bool,
}

impl RemoveSpec {
    pub fn matches(&self, ev: &SeqEvent) -> bool {
        if ev.tick < self.after_tick {
            return false;
        }
        if let Some(tag) = self.tag {
            if ev.tag != tag {
                return false;
            }
        }
        if let Some(channel) = self.channel {
            if ev.channel != channel {
                return false;
            }
        }
        if self.ignore_off && matches!(ev.kind, SeqEventKind::NoteOff { .. }) {
            return false;
        }
        true
    }
}

/// Port-graph change announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChange {
    ClientStart { client: ClientId },
    ClientExit { client: ClientId },
    PortStart { client: ClientId, port: PortId },
    PortExit { client: ClientId, port: PortId },
    Subscribed { sender: Addr, dest: Addr },
    Unsubscribed { sender: Addr, dest: Addr },
}

/// The sequencer backend contract
///
/// One duplex client with one allocated queue. Scheduled output is
/// sorted by tick on the backend side; the queue clock rate follows the
/// last tempo/skew applied and never reorders already-enqueued events.
pub trait Sequencer: Send + Sync {
    fn client_id(&self) -> ClientId;

    fn create_port(&self, name: &str, caps: u32) -> EngineResult<PortId>;
    fn delete_port(&self, port: PortId) -> EngineResult<()>;
    /// Enable queue-tick timestamping of events arriving at `port`
    fn set_tick_stamping(&self, port: PortId) -> EngineResult<()>;

    fn subscribe(&self, sender: Addr, dest: Addr) -> EngineResult<()>;
    /// Current subscriptions of our `port` in the given direction
    fn query_subscriptions(&self, port: PortId, dir: SubsDir) -> Vec<PortInfo>;
    /// All visible endpoints carrying every capability bit of `caps`
    fn list_endpoints(&self, caps: u32) -> Vec<PortInfo>;

    /// Push an event onto the output queue (or straight out when direct)
    fn event_output(&self, ev: SeqEvent);
    /// Bypass the queue entirely
    fn event_output_direct(&self, ev: SeqEvent);
    fn drain_output(&self);
    fn drop_output(&self);
    fn drop_input(&self);
    fn remove_output_events(&self, spec: &RemoveSpec);

    fn set_queue_tempo(&self, ppq: u32, micros_per_beat: u32);
    fn set_queue_skew(&self, skew: u32);
    fn queue_skew(&self) -> u32;
    fn queue_skew_base(&self) -> u32;
    /// Current queue tick, as advanced by the queue clock
    fn queue_tick_time(&self) -> u64;
    fn start_queue(&self);
    fn stop_queue(&self);

    /// Block until input is pending or the timeout elapses
    fn poll_input(&self, timeout: Duration) -> bool;
    fn event_input(&self) -> Option<SeqEvent>;
    fn input_pending(&self) -> usize;

    /// Non-blocking read of the system announce stream
    fn poll_announce(&self) -> Option<PortChange>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_spec_matching() {
        let spec = RemoveSpec {
            tag: Some(3),
            channel: Some(9),
            after_tick: 100,
            ignore_off: true,
        };

        let mut ev = SeqEvent::queued(
            SeqEventKind::NoteOn { note: 60, velocity: 100, duration: 10 },
            9,
            0,
            150,
        );
        ev.tag = 3;
        assert!(spec.matches(&ev));

        // Too early
        let mut early = ev.clone();
        early.tick = 50;
        assert!(!spec.matches(&early));

        // Wrong tag
        let mut other = ev.clone();
        other.tag = 4;
        assert!(!spec.matches(&other));

        // Note-offs survive so sounding notes terminate
        let mut off = ev.clone();
        off.kind = SeqEventKind::NoteOff { note: 60, velocity: 0, duration: 0 };
        assert!(!spec.matches(&off));
    }
}
