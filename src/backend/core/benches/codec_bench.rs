//! Codec benchmarks. Run with: cargo bench --bench codec_bench
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;
use taskflow_core::events::{
    Codec, OwnerId, RecurrenceRule, ReminderFired, ReminderId, TaskDelta, TaskEvent, TaskId, TaskSnapshot,
};

fn created(description_len: usize) -> TaskEvent {
    TaskEvent::created(
        TaskId::new(),
        OwnerId::new("owner-42"),
        Utc::now(),
        TaskSnapshot::new("Quarterly planning review")
            .with_description("x".repeat(description_len))
            .with_due_at(Utc::now()),
    )
    .with_recurrence(RecurrenceRule::weekly())
}

fn updated() -> TaskEvent {
    TaskEvent::updated(
        TaskId::new(),
        OwnerId::new("owner-42"),
        Utc::now(),
        TaskDelta { title: Some("Renamed".into()), ..TaskDelta::default() },
    )
}

fn bench_encode(c: &mut Criterion) {
    let mut g = c.benchmark_group("codec_encode"); g.measurement_time(Duration::from_secs(5));
    let codec = Codec::default();
    g.bench_function("task_created", |b| { let e = created(64); b.iter(|| black_box(codec.encode(&e).unwrap())); });
    g.bench_function("task_updated", |b| { let e = updated(); b.iter(|| black_box(codec.encode(&e).unwrap())); });
    g.bench_function("task_deleted", |b| { let e = TaskEvent::deleted(TaskId::new(), OwnerId::new("o"), Utc::now()); b.iter(|| black_box(codec.encode(&e).unwrap())); });
    g.bench_function("reminder_fired", |b| {
        let id = ReminderId::new();
        let e = ReminderFired { event_id: ReminderFired::event_id_for(id), reminder_id: id, task_id: TaskId::new(), owner_id: OwnerId::new("o"), fire_at: Utc::now(), fired_at: Utc::now() };
        b.iter(|| black_box(codec.encode(&e).unwrap()));
    });
    g.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut g = c.benchmark_group("codec_decode"); g.measurement_time(Duration::from_secs(5));
    let codec = Codec::default();
    for &len in &[0usize, 1024, 16 * 1024] {
        let record = codec.encode(&created(len)).unwrap();
        g.throughput(Throughput::Bytes(record.payload.len() as u64));
        g.bench_with_input(BenchmarkId::new("task_created", len), &record, |b, r| { b.iter(|| black_box(codec.decode::<TaskEvent>(&r.payload).unwrap())); });
    }
    g.bench_function("peek_envelope", |b| { let r = codec.encode(&updated()).unwrap(); b.iter(|| black_box(codec.peek(&r.payload).unwrap())); });
    g.bench_function("reject_malformed", |b| { let bytes = br#"{"schema_version":1,"event_type":"TaskExploded"}"#.to_vec(); b.iter(|| black_box(codec.decode::<TaskEvent>(&bytes).is_err())); });
    g.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
