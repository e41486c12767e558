//! End-to-end tests: frames in through a scripted transport, events and
//! merged batches out.

use std::sync::Arc;
use std::time::Duration;

use danmaku_live::codec::compress_batch;
use danmaku_live::{
    ClientConfig, ConnectionState, DanmakuClient, DisplayMessage, Frame, LiveEvent, MemoryTransport,
    MergeBatcher, MergeConfig, Operation, ProtocolVersion, merge,
};

fn danmu_frame(text: &str, uid: u64) -> Frame {
    let body = serde_json::json!({
        "cmd": "DANMU_MSG",
        "info": [[0, 1, 25, 16777215], text, [uid, format!("user{uid}")]]
    });
    Frame::new(Operation::Message, serde_json::to_vec(&body).unwrap())
        .with_version(ProtocolVersion::Plain)
}

#[test]
fn burst_of_identical_messages_becomes_one_highlight() {
    let batch: Vec<DisplayMessage> = [0, 100, 200, 2900, 3000, 3100]
        .into_iter()
        .map(|at| DisplayMessage::text("666", at).with_weight(0))
        .collect();

    let result = merge(&batch, 500);

    assert_eq!(result.highlight_items.len(), 1);
    let highlight = &result.highlight_items[0];
    assert_eq!(highlight.content, "666");
    assert_eq!(highlight.count, 6);
    assert_eq!(highlight.start_time, 0);
    assert_eq!(highlight.accumulation_duration, 3100);
    assert_eq!(highlight.duration, 6100);
    assert_eq!(result.standard_items, batch);
}

#[tokio::test(start_paused = true)]
async fn live_frames_flow_into_merge_windows() {
    let transport = Arc::new(MemoryTransport::new());
    let client = DanmakuClient::new(transport.clone(), ClientConfig::default());
    let mut events = client.subscribe();

    client.connect("wss://memory/sub", "token", 7, 0).unwrap();
    let mut peer = transport.accept().await.unwrap();
    let auth = peer.recv_frame().await.unwrap();
    assert_eq!(auth.operation, Operation::Auth);

    // Server batches: one brotli frame with six identical chats, one zlib
    // frame with unrelated chatter.
    let burst: Vec<Frame> = (0..6).map(|uid| danmu_frame("gg", uid)).collect();
    let chatter = vec![danmu_frame("hello", 10), danmu_frame("hi", 11)];
    for (version, frames) in [
        (ProtocolVersion::Brotli, burst),
        (ProtocolVersion::Zlib, chatter),
    ] {
        let frame = compress_batch(version, Operation::Message, &frames).unwrap();
        peer.send(frame.encode()).await;
    }

    let mut batcher = MergeBatcher::new(MergeConfig::default(), 1000);
    for show_at in 0..8 {
        let event = events.recv().await.unwrap();
        let LiveEvent::Danmu(msg) = event else {
            panic!("expected chat, got {event:?}");
        };
        batcher.push(DisplayMessage::from_danmu(&msg, show_at * 10));
    }

    let result = batcher.poll(1000).unwrap();
    assert_eq!(result.highlight_items.len(), 1);
    assert_eq!(result.highlight_items[0].content, "gg");
    assert_eq!(result.highlight_items[0].count, 6);
    assert_eq!(result.standard_items.len(), 8);

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn session_survives_server_kick() {
    let transport = Arc::new(MemoryTransport::new());
    let client = DanmakuClient::new(transport.clone(), ClientConfig::default());
    let mut state = client.watch_state();

    client.connect("wss://memory/sub", "", 7, 0).unwrap();
    let peer = transport.accept().await.unwrap();
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();

    peer.close(4001, "kicked").await;
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert!(!client.is_connected());

    let started = tokio::time::Instant::now();
    let _peer = transport.accept().await.unwrap();
    assert_eq!(started.elapsed(), Duration::from_millis(1000));
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(client.retry_count(), 0);

    client.disconnect().await;
}
