//! Insert-plugin processing benchmarks
//!
//! Measures the send/return copy path and the SIMD send-gain / dry-wet
//! kernels across typical audio buffer sizes.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use seqcore::{AudioEngine, InsertPlugin};

fn buffers(channels: usize, nframes: usize) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    let inputs = (0..channels)
        .map(|c| (0..nframes).map(|i| (c + i) as f32 * 0.001).collect())
        .collect();
    let outputs = vec![vec![0.0; nframes]; channels];
    (inputs, outputs)
}

fn bench_insert_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_process");

    for &nframes in &[64usize, 256, 512, 1024] {
        group.bench_with_input(
            BenchmarkId::new("send_only", nframes),
            &nframes,
            |b, &nframes| {
                let audio = Arc::new(AudioEngine::new(48000, nframes));
                let mut plugin = InsertPlugin::new(audio, "Bench", 2).unwrap();
                let (inputs, mut outputs) = buffers(2, nframes);
                b.iter(|| {
                    plugin.process(black_box(&inputs), black_box(&mut outputs), nframes);
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("send_and_dry_wet", nframes),
            &nframes,
            |b, &nframes| {
                let audio = Arc::new(AudioEngine::new(48000, nframes));
                let mut plugin = InsertPlugin::new(audio, "Bench", 2).unwrap();
                plugin.set_send_gain(1.5);
                plugin.set_dry_wet(0.5);
                let (inputs, mut outputs) = buffers(2, nframes);
                b.iter(|| {
                    plugin.process(black_box(&inputs), black_box(&mut outputs), nframes);
                });
            },
        );
    }

    group.finish();
}

fn bench_insert_rechannel(c: &mut Criterion) {
    c.bench_function("insert_set_channels", |b| {
        let audio = Arc::new(AudioEngine::new(48000, 512));
        let mut plugin = InsertPlugin::new(audio, "Bench", 2).unwrap();
        let mut channels = 2;
        b.iter(|| {
            channels = if channels == 2 { 4 } else { 2 };
            plugin.set_channels(black_box(channels)).unwrap();
        });
    });
}

criterion_group!(benches, bench_insert_process, bench_insert_rechannel);
criterion_main!(benches);
