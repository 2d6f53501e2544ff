// Host notification surfaces
// Transport-control listener capability and the lock-free port-graph
// change channel

use ringbuf::{traits::Split, HeapRb};

use crate::control::{MmcEvent, SppCommand};
use crate::seq::PortChange;

/// Transport notifications posted by the engine
///
/// Implementations forward to the host's own event loop; the engine
/// never calls back into host UI code synchronously.
pub trait TransportListener: Send + Sync {
    fn on_mmc(&self, ev: MmcEvent);
    fn on_ctl(&self, channel: u8, param: u8, value: u8);
    fn on_spp(&self, cmd: SppCommand, song_pos: u16);
    fn on_clock(&self, tempo: f32);
}

pub type GraphProducer = ringbuf::HeapProd<PortChange>;
pub type GraphConsumer = ringbuf::HeapCons<PortChange>;

/// Lock-free channel surfacing sequencer port-graph changes to the host
pub fn create_graph_channel(capacity: usize) -> (GraphProducer, GraphConsumer) {
    let rb = HeapRb::<PortChange>::new(capacity);
    rb.split()
}
