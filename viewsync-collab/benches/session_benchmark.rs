use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use viewsync_collab::{
    AppRoot, ClientMirror, CommandManager, FnCommand, Principal, ProcessingQueue, Reply,
    SessionConfig, UserSession,
};
use viewsync_core::{
    Change, CommandInstruction, InstructionId, Model, NodeId, Payload, Response, Schema,
    SchemaRegistry,
};

fn counter_root() -> AppRoot {
    let schemas = SchemaRegistry::new()
        .with(Schema::builder("Counter").value("currentCount").build())
        .unwrap();
    let mut model = Model::new(schemas);
    let counter = model.create("Counter").unwrap();
    model.set(counter, "currentCount", 0).unwrap();
    let mut commands = CommandManager::new();
    commands
        .register(
            "Increment",
            FnCommand::new(|view, inv| {
                let n = view.get(inv.target, "currentCount")?.as_i64().unwrap_or(0);
                view.set_property(inv.target, "currentCount", n + 1)?;
                Ok(())
            }),
        )
        .unwrap();
    AppRoot::new(model, counter, commands)
}

fn list_snapshot(rows: u32) -> Response {
    let mut changes = vec![Change::property(NodeId(0), "rows", Payload::reference(NodeId(1), true))];
    for i in 0..rows {
        let id = NodeId(i + 2);
        changes.push(Change::item_added(
            NodeId(1),
            Payload::reference(id, false),
            Some(i as usize),
            InstructionId::NONE,
        ));
        changes.push(Change::property(id, "label", json!(format!("row {i}")).into()));
    }
    Response::new(changes, false)
}

fn bench_execute_and_flush(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let session = runtime
        .block_on(async { UserSession::new(counter_root(), SessionConfig::for_testing()) })
        .unwrap();
    let principal = Principal::anonymous();

    c.bench_function("execute_command_and_flush", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let pending = session
                    .execute_command(CommandInstruction::new("Increment", NodeId(0)), &principal)
                    .unwrap();
                black_box(pending.await.unwrap());
                black_box(session.flush());
            })
        })
    });
}

fn bench_queue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ProcessingQueue");
    group.throughput(Throughput::Elements(1000));
    group.bench_function("enqueue_process_1000", |b| {
        let queue = ProcessingQueue::new(|| {});
        b.iter(|| {
            for i in 0..1000u64 {
                queue.enqueue(i);
            }
            while let Some(item) = queue.try_dequeue() {
                queue.on_processed(&item).unwrap();
            }
        })
    });
    group.finish();
}

fn bench_mirror_apply_snapshot(c: &mut Criterion) {
    let snapshot = list_snapshot(1000);
    let mut group = c.benchmark_group("ClientMirror");
    group.throughput(Throughput::Elements(snapshot.changes.len() as u64));
    group.bench_function("apply_snapshot_1000_rows", |b| {
        b.iter(|| {
            let mut mirror = ClientMirror::new();
            mirror.apply(black_box(&snapshot)).unwrap();
            black_box(mirror.len());
        })
    });
    group.finish();
}

fn bench_reply_encode(c: &mut Criterion) {
    let reply = Reply::ok(1, list_snapshot(100));
    let encoded = reply.encode().unwrap();

    c.bench_function("reply_encode_100_rows", |b| {
        b.iter(|| black_box(reply.encode().unwrap()))
    });
    c.bench_function("reply_decode_100_rows", |b| {
        b.iter(|| black_box(Reply::decode(black_box(&encoded)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_execute_and_flush,
    bench_queue_throughput,
    bench_mirror_apply_snapshot,
    bench_reply_encode,
);
criterion_main!(benches);
