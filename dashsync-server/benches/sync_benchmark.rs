use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dashsync_core::{DashboardData, Settings, Tab, Widget, WidgetType};
use dashsync_server::broadcast::{BroadcastGroup, Recipients, SessionPeer};
use dashsync_server::engine::SyncEngine;
use dashsync_server::protocol::{ClientMessage, DashboardSyncedBody, ServerMessage};
use dashsync_server::storage::{DashboardStore, MemoryStore};
use uuid::Uuid;

fn sample_data(widgets: usize) -> DashboardData {
    let mut tab = Tab::new("main", "Main");
    for w in 0..widgets {
        tab = tab.with_widget(
            Widget::new(format!("w-{w}"), WidgetType::Note, "Note")
                .with_data(serde_json::json!({ "text": "remember the milk" })),
        );
    }
    DashboardData::new(vec![tab], Settings::default())
}

fn bench_update_encode(c: &mut Criterion) {
    let msg = ClientMessage::DashboardUpdate {
        data: sample_data(20),
        version: 41,
    };

    c.bench_function("update_encode_20_widgets", |b| {
        b.iter(|| black_box(msg.encode(black_box("laptop")).unwrap()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = ClientMessage::DashboardUpdate {
        data: sample_data(20),
        version: 41,
    }
    .encode("laptop")
    .unwrap();

    c.bench_function("update_decode_20_widgets", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(1024);
    let sender = Uuid::new_v4();

    // Keep receivers alive so messages are actually fanned out
    let _receivers: Vec<_> = rt.block_on(async {
        let mut receivers = Vec::new();
        for i in 0..10 {
            let session_id = if i == 0 { sender } else { Uuid::new_v4() };
            receivers.push(
                group
                    .add_peer(SessionPeer {
                        session_id,
                        device_id: format!("device-{i}"),
                        device_name: None,
                    })
                    .await,
            );
        }
        receivers
    });

    let msg = ServerMessage::DashboardSynced(DashboardSyncedBody {
        data: sample_data(20),
        version: 42,
        updated_by: Some("device-0".into()),
        conflict_resolved: false,
    });

    c.bench_function("broadcast_synced_10_devices", |b| {
        b.iter(|| {
            black_box(
                group
                    .broadcast(Recipients::AllExcept(sender), black_box(&msg))
                    .unwrap(),
            )
        })
    });
}

fn bench_compare_and_swap(c: &mut Criterion) {
    let store = MemoryStore::new();
    let data = sample_data(20);
    store.load("bench").unwrap();

    c.bench_function("memory_cas_20_widgets", |b| {
        b.iter(|| {
            let version = store.load("bench").unwrap().version;
            black_box(store.compare_and_swap("bench", version, data.clone()).unwrap())
        })
    });
}

fn bench_engine_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = SyncEngine::in_memory();
    let data = sample_data(20);
    rt.block_on(engine.authenticate("bench", "laptop", None)).unwrap();

    c.bench_function("engine_submit_20_widgets", |b| {
        b.iter(|| {
            rt.block_on(async {
                let version = engine.current("bench").unwrap().version;
                black_box(
                    engine
                        .submit_update("bench", "laptop", None, data.clone(), version)
                        .await
                        .unwrap(),
                )
            })
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_broadcast_fanout,
    bench_compare_and_swap,
    bench_engine_submit,
);
criterion_main!(benches);
