use criterion::{black_box, criterion_group, criterion_main, Criterion};
use loomgraph_checkpoint::{
    ChannelVersion, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, MemorySaver,
};
use std::collections::HashMap;

fn populated_checkpoint(channels: usize) -> Checkpoint {
    let mut checkpoint = Checkpoint::new();
    for i in 0..channels {
        let name = format!("chan_{}", i);
        checkpoint
            .channel_values
            .insert(name.clone(), serde_json::json!({"idx": i, "payload": "x".repeat(64)}));
        checkpoint
            .channel_versions
            .insert(name, ChannelVersion::Int(i as i64));
    }
    checkpoint
}

fn checkpoint_save_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("checkpoint save (32 channels)", |b| {
        b.to_async(&runtime).iter(|| async {
            let saver = MemorySaver::new();
            let config = CheckpointConfig::new("bench-thread");
            saver
                .put(
                    &config,
                    black_box(populated_checkpoint(32)),
                    CheckpointMetadata::new(),
                    HashMap::new(),
                )
                .await
                .unwrap();
        });
    });
}

fn checkpoint_load_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("checkpoint load (32 channels)", |b| {
        b.to_async(&runtime).iter(|| async {
            let saver = MemorySaver::new();
            let config = CheckpointConfig::new("bench-thread");
            let saved = saver
                .put(
                    &config,
                    populated_checkpoint(32),
                    CheckpointMetadata::new(),
                    HashMap::new(),
                )
                .await
                .unwrap();
            saver.get_tuple(black_box(&saved)).await.unwrap();
        });
    });
}

criterion_group!(benches, checkpoint_save_benchmark, checkpoint_load_benchmark);
criterion_main!(benches);
