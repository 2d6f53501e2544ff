// Insert pseudo-plugin
// Splices an external processor into an audio chain through a private
// duplex bus: input copies out as the send, the return comes back in

use std::sync::Arc;

use wide::f32x4;

use crate::audio::{AtomicF32, AudioBus, AudioEngine};
use crate::bus::{BusMode, ConnectItem};
use crate::error::{EngineError, EngineResult};
use crate::session::sanitize;

type SendGainFn = fn(&mut [Vec<f32>], usize, f32);
type DryWetFn = fn(&[Vec<f32>], &mut [Vec<f32>], usize, f32);

fn std_process_send_gain(frames: &mut [Vec<f32>], nframes: usize, gain: f32) {
    for channel in frames.iter_mut() {
        for sample in &mut channel[..nframes] {
            *sample *= gain;
        }
    }
}

fn std_process_dry_wet(inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], nframes: usize, gain: f32) {
    for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
        for (i, o) in input[..nframes].iter().zip(&mut output[..nframes]) {
            *o += gain * *i;
        }
    }
}

fn simd_process_send_gain(frames: &mut [Vec<f32>], nframes: usize, gain: f32) {
    let vgain = f32x4::from([gain; 4]);
    for channel in frames.iter_mut() {
        let mut chunks = channel[..nframes].chunks_exact_mut(4);
        for chunk in &mut chunks {
            let v = f32x4::from([chunk[0], chunk[1], chunk[2], chunk[3]]) * vgain;
            let out: [f32; 4] = v.into();
            chunk.copy_from_slice(&out);
        }
        for sample in chunks.into_remainder() {
            *sample *= gain;
        }
    }
}

fn simd_process_dry_wet(inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], nframes: usize, gain: f32) {
    let vgain = f32x4::from([gain; 4]);
    for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
        let mut out_chunks = output[..nframes].chunks_exact_mut(4);
        let mut in_chunks = input[..nframes].chunks_exact(4);
        for (o, i) in (&mut out_chunks).zip(&mut in_chunks) {
            let vi = f32x4::from([i[0], i[1], i[2], i[3]]);
            let vo = f32x4::from([o[0], o[1], o[2], o[3]]);
            let out: [f32; 4] = (vo + vi * vgain).into();
            o.copy_from_slice(&out);
        }
        for (o, i) in out_chunks.into_remainder().iter_mut().zip(in_chunks.remainder()) {
            *o += gain * *i;
        }
    }
}

fn select_send_gain_fn() -> SendGainFn {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("sse2") {
            return simd_process_send_gain;
        }
    }
    std_process_send_gain
}

fn select_dry_wet_fn() -> DryWetFn {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("sse2") {
            return simd_process_dry_wet;
        }
    }
    std_process_dry_wet
}

/// Frozen connect entry of the private bus, kept across re-channeling
#[derive(Debug, Clone, PartialEq)]
pub struct InsertConnect {
    pub output: bool,
    pub index: usize,
    pub client_name: String,
    pub port_name: String,
}

/// The insert-send pseudo-effect
///
/// Two parameters: send gain in [0, 2] (default 1) applied to the send,
/// dry/wet in [0, 1] (default 0) mixing the dry input back onto the
/// returned signal. `process` runs on the audio callback and only takes
/// atomic parameter snapshots.
pub struct InsertPlugin {
    audio: Arc<AudioEngine>,
    chain_name: String,
    channels: usize,
    bus: Option<Arc<AudioBus>>,
    send: Vec<Vec<f32>>,
    ret: Vec<Vec<f32>>,
    send_gain: AtomicF32,
    dry_wet: AtomicF32,
    frozen: Vec<InsertConnect>,
    fn_send_gain: SendGainFn,
    fn_dry_wet: DryWetFn,
}

impl InsertPlugin {
    pub const TYPE_NAME: &'static str = "Insert";

    pub fn new(audio: Arc<AudioEngine>, chain_name: &str, channels: usize) -> EngineResult<Self> {
        if channels < 1 {
            return Err(EngineError::InvalidChannels(channels));
        }
        let mut plugin = Self {
            audio,
            chain_name: chain_name.to_string(),
            channels: 0,
            bus: None,
            send: Vec::new(),
            ret: Vec::new(),
            send_gain: AtomicF32::new(1.0),
            dry_wet: AtomicF32::new(0.0),
            frozen: Vec::new(),
            fn_send_gain: select_send_gain_fn(),
            fn_dry_wet: select_dry_wet_fn(),
        };
        plugin.set_channels(channels)?;
        Ok(plugin)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn audio_bus(&self) -> Option<Arc<AudioBus>> {
        self.bus.clone()
    }

    pub fn send_gain(&self) -> f32 {
        self.send_gain.get()
    }

    pub fn set_send_gain(&self, gain: f32) {
        self.send_gain.set(gain.clamp(0.0, 2.0));
    }

    pub fn dry_wet(&self) -> f32 {
        self.dry_wet.get()
    }

    pub fn set_dry_wet(&self, mix: f32) {
        self.dry_wet.set(mix.clamp(0.0, 1.0));
    }

    /// Send buffers (what goes out to the external chain)
    pub fn sends(&self) -> &[Vec<f32>] {
        &self.send
    }

    /// Return buffers (what the external chain feeds back)
    pub fn returns_mut(&mut self) -> &mut [Vec<f32>] {
        &mut self.ret
    }

    /// (Re)configure the channel count
    ///
    /// Lazily builds the private duplex bus; unchanged counts are a
    /// no-op, a change closes and destroys the old bus first. Zero
    /// tears the instance down.
    pub fn set_channels(&mut self, channels: usize) -> EngineResult<()> {
        if channels == self.channels && self.bus.is_some() {
            return Ok(());
        }

        if let Some(bus) = self.bus.take() {
            self.freeze_configs(&bus);
            self.audio.remove_bus_ex(&bus);
        }

        self.channels = channels;
        if channels < 1 {
            self.send.clear();
            self.ret.clear();
            return Ok(());
        }

        // The private bus name must be unique across the whole engine
        let prefix = sanitize(&format!("{}/{}", self.chain_name, Self::TYPE_NAME));
        let mut name = prefix.clone();
        let mut index = 1;
        while self.audio.find_bus(&name).is_some() || self.audio.find_bus_ex(&name).is_some() {
            index += 1;
            name = format!("{}_{}", prefix, index);
        }

        let bus = Arc::new(AudioBus::new(&name, BusMode::Duplex, channels));
        self.configure(&bus);
        self.audio.add_bus_ex(bus.clone());
        self.bus = Some(bus);

        let nframes = self.audio.buffer_size();
        self.send = vec![vec![0.0; nframes]; channels];
        self.ret = vec![vec![0.0; nframes]; channels];
        Ok(())
    }

    fn freeze_configs(&mut self, bus: &AudioBus) {
        self.frozen.clear();
        for (output, list) in [(false, bus.inputs()), (true, bus.outputs())] {
            for (index, item) in list.iter().enumerate() {
                self.frozen.push(InsertConnect {
                    output,
                    index,
                    client_name: item.client_name.clone(),
                    port_name: item.port_name.clone(),
                });
            }
        }
    }

    fn configure(&self, bus: &AudioBus) {
        for item in &self.frozen {
            let connect = ConnectItem::named(&item.client_name, &item.port_name);
            if item.output {
                bus.outputs().push(connect);
            } else {
                bus.inputs().push(connect);
            }
        }
    }

    /// The audio callback: input copies to the sends, the returns copy
    /// to the output, send gain applies in place, and the dry signal
    /// mixes on top when dry/wet is up
    pub fn process(&mut self, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], nframes: usize) {
        if self.bus.is_none() {
            return;
        }

        for i in 0..self.channels {
            self.send[i][..nframes].copy_from_slice(&inputs[i][..nframes]);
            outputs[i][..nframes].copy_from_slice(&self.ret[i][..nframes]);
        }

        let send_gain = self.send_gain.get();
        (self.fn_send_gain)(&mut self.send, nframes, send_gain);

        let dry_wet = self.dry_wet.get();
        if dry_wet > 0.001 {
            (self.fn_dry_wet)(inputs, outputs, nframes, dry_wet);
        }
    }
}

impl Drop for InsertPlugin {
    fn drop(&mut self) {
        let _ = self.set_channels(0);
    }
}
