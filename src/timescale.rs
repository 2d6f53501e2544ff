// Tempo map - musical time scale with tempo/time-signature nodes
// Converts between audio frames, queue ticks and beats

/// One tempo/time-signature change
///
/// `frame`/`tick`/`beat` are the absolute position where the node takes
/// effect; nodes are kept on bar boundaries so that `beat_is_bar` can be
/// answered from the node-local beat offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoNode {
    pub frame: u64,
    pub tick: u64,
    pub beat: u32,
    pub tempo: f32,
    pub ticks_per_beat: u32,
    pub beats_per_bar: u16,
    sample_rate: u32,
}

impl TempoNode {
    fn ticks_per_frame(&self) -> f64 {
        (self.tempo as f64 * self.ticks_per_beat as f64) / (60.0 * self.sample_rate as f64)
    }

    pub fn tick_from_frame(&self, frame: u64) -> u64 {
        let delta = frame.saturating_sub(self.frame) as f64 * self.ticks_per_frame();
        self.tick + (delta + 0.5) as u64
    }

    pub fn frame_from_tick(&self, tick: u64) -> u64 {
        let delta = tick.saturating_sub(self.tick) as f64 / self.ticks_per_frame();
        self.frame + (delta + 0.5) as u64
    }

    pub fn beat_from_tick(&self, tick: u64) -> u32 {
        self.beat + (tick.saturating_sub(self.tick) / self.ticks_per_beat as u64) as u32
    }

    pub fn tick_from_beat(&self, beat: u32) -> u64 {
        self.tick + beat.saturating_sub(self.beat) as u64 * self.ticks_per_beat as u64
    }

    /// Whether `beat` falls on a bar line of this node's meter
    pub fn beat_is_bar(&self, beat: u32) -> bool {
        beat.saturating_sub(self.beat) % self.beats_per_bar as u32 == 0
    }

    /// Microseconds per quarter note, as the queue tempo wants it
    pub fn micros_per_beat(&self) -> u32 {
        (60_000_000.0 / self.tempo as f64) as u32
    }
}

/// Ordered tempo map with monotonic frame/tick/beat keys
#[derive(Debug, Clone)]
pub struct TimeScale {
    sample_rate: u32,
    ticks_per_beat: u32,
    nodes: Vec<TempoNode>,
}

impl TimeScale {
    pub fn new(sample_rate: u32, ticks_per_beat: u32) -> Self {
        Self::with_tempo(sample_rate, ticks_per_beat, 120.0)
    }

    pub fn with_tempo(sample_rate: u32, ticks_per_beat: u32, tempo: f32) -> Self {
        Self {
            sample_rate,
            ticks_per_beat,
            nodes: vec![TempoNode {
                frame: 0,
                tick: 0,
                beat: 0,
                tempo,
                ticks_per_beat,
                beats_per_bar: 4,
                sample_rate,
            }],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn ticks_per_beat(&self) -> u32 {
        self.ticks_per_beat
    }

    pub fn nodes(&self) -> &[TempoNode] {
        &self.nodes
    }

    /// Insert (or replace) a tempo/meter change at a beat boundary
    /// Positions of later nodes are recomputed to keep the keys monotonic
    pub fn add_node(&mut self, beat: u32, tempo: f32, beats_per_bar: u16) {
        let ix = self.nodes.partition_point(|n| n.beat < beat);
        if ix > 0 && self.nodes.get(ix).map(|n| n.beat) == Some(beat) {
            self.nodes[ix].tempo = tempo;
            self.nodes[ix].beats_per_bar = beats_per_bar;
        } else if beat == 0 {
            self.nodes[0].tempo = tempo;
            self.nodes[0].beats_per_bar = beats_per_bar;
        } else {
            let prev = self.nodes[ix - 1];
            let tick = prev.tick_from_beat(beat);
            let frame = prev.frame_from_tick(tick);
            self.nodes.insert(
                ix,
                TempoNode {
                    frame,
                    tick,
                    beat,
                    tempo,
                    ticks_per_beat: self.ticks_per_beat,
                    beats_per_bar,
                    sample_rate: self.sample_rate,
                },
            );
        }
        self.recompute_from(ix.max(1));
    }

    fn recompute_from(&mut self, start: usize) {
        for i in start..self.nodes.len() {
            let prev = self.nodes[i - 1];
            let beat = self.nodes[i].beat;
            let tick = prev.tick_from_beat(beat);
            let frame = prev.frame_from_tick(tick);
            let node = &mut self.nodes[i];
            node.tick = tick;
            node.frame = frame;
        }
    }

    pub fn node_at_frame(&self, frame: u64) -> &TempoNode {
        let ix = self.nodes.partition_point(|n| n.frame <= frame);
        &self.nodes[ix.saturating_sub(1)]
    }

    pub fn node_at_tick(&self, tick: u64) -> &TempoNode {
        let ix = self.nodes.partition_point(|n| n.tick <= tick);
        &self.nodes[ix.saturating_sub(1)]
    }

    pub fn node_at_beat(&self, beat: u32) -> &TempoNode {
        let ix = self.nodes.partition_point(|n| n.beat <= beat);
        &self.nodes[ix.saturating_sub(1)]
    }

    pub fn tick_from_frame(&self, frame: u64) -> u64 {
        self.node_at_frame(frame).tick_from_frame(frame)
    }

    pub fn frame_from_tick(&self, tick: u64) -> u64 {
        self.node_at_tick(tick).frame_from_tick(tick)
    }
}

/// Seek cursor over a `TimeScale`
///
/// Remembers the last node index so the windowed forward scans of the
/// output worker resolve in O(1); falls back to a binary search on an
/// arbitrary jump.
#[derive(Debug, Clone, Default)]
pub struct TimeScaleCursor {
    index: usize,
}

impl TimeScaleCursor {
    pub fn new() -> Self {
        Self { index: 0 }
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn seek_frame<'a>(&mut self, ts: &'a TimeScale, frame: u64) -> &'a TempoNode {
        let nodes = ts.nodes();
        self.index = self.index.min(nodes.len() - 1);
        let covers = |ix: usize| {
            nodes[ix].frame <= frame
                && nodes.get(ix + 1).map(|n| n.frame > frame).unwrap_or(true)
        };
        if !covers(self.index) {
            if self.index + 1 < nodes.len() && covers(self.index + 1) {
                self.index += 1;
            } else {
                self.index = nodes.partition_point(|n| n.frame <= frame).saturating_sub(1);
            }
        }
        &nodes[self.index]
    }

    pub fn seek_beat<'a>(&mut self, ts: &'a TimeScale, beat: u32) -> &'a TempoNode {
        let nodes = ts.nodes();
        self.index = self.index.min(nodes.len() - 1);
        let covers = |ix: usize| {
            nodes[ix].beat <= beat
                && nodes.get(ix + 1).map(|n| n.beat > beat).unwrap_or(true)
        };
        if !covers(self.index) {
            if self.index + 1 < nodes.len() && covers(self.index + 1) {
                self.index += 1;
            } else {
                self.index = nodes.partition_point(|n| n.beat <= beat).saturating_sub(1);
            }
        }
        &nodes[self.index]
    }
}
