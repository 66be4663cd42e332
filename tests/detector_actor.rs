//! Integration tests for the detector actor and its handle
//!
//! Covers command serialization around background loads, the state labels
//! published on the watch channel, and a full series over a real PUSH socket.

use simplon_sim::codec::{decode_frame, Compression};
use simplon_sim::dataset::memory::{MemoryCatalog, SimulatedAcquisition};
use simplon_sim::dataset::{DatasetOpener, DatasetSource, PixelType};
use simplon_sim::detector::DetectorState;
use simplon_sim::error::{DetectorError, DetectorResult};
use simplon_sim::messages::{decode_message, StreamMessage};
use simplon_sim::stream::{
    ChannelTransport, DetectorActor, DetectorHandle, LoadRequest, StreamEngine, Transport,
    ZmqPushTransport,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use zeromq::{PullSocket, Socket, SocketRecv};

const MASTER: &str = "/data/scan_master.h5";
const WIDE: &str = "/data/wide_master.h5";

/// Delays every open so loads stay pending long enough to observe.
struct SlowCatalog {
    inner: MemoryCatalog,
    delay: Duration,
}

impl DatasetOpener for SlowCatalog {
    fn open(&self, path: &Path) -> DetectorResult<Box<dyn DatasetSource>> {
        std::thread::sleep(self.delay);
        self.inner.open(path)
    }
}

fn catalog() -> MemoryCatalog {
    MemoryCatalog::new()
        .with_dataset(
            MASTER,
            SimulatedAcquisition::new(16, 16, 3, PixelType::U16).build().unwrap(),
        )
        .with_dataset(
            WIDE,
            SimulatedAcquisition::new(24, 20, 2, PixelType::U32).build().unwrap(),
        )
}

fn spawn_slow(delay: Duration) -> (DetectorHandle, UnboundedReceiver<Vec<u8>>) {
    let (transport, rx) = ChannelTransport::pair();
    let opener = Arc::new(SlowCatalog {
        inner: catalog(),
        delay,
    });
    let engine = StreamEngine::new(transport, opener).with_frame_delay(Duration::ZERO);
    let (handle, _task) = DetectorActor::spawn(engine);
    (handle, rx)
}

async fn wait_for_state(handle: &DetectorHandle, wanted: DetectorState) {
    let mut state = handle.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached in time")
        .unwrap();
}

// =============================================================================
// Background loads
// =============================================================================

#[tokio::test]
async fn test_second_load_during_pending_load_is_rejected() {
    let (handle, _rx) = spawn_slow(Duration::from_millis(300));

    let loader = handle.clone();
    let first = tokio::spawn(async move {
        loader
            .load(LoadRequest::new(MASTER, Compression::Bslz4, None))
            .await
    });
    wait_for_state(&handle, DetectorState::Configure).await;

    let err = handle
        .load(LoadRequest::new(MASTER, Compression::None, None))
        .await
        .unwrap_err();
    assert!(matches!(err, DetectorError::LoadInProgress));

    let err = handle.set_compression("none").await.unwrap_err();
    assert!(matches!(err, DetectorError::LoadInProgress));

    first.await.unwrap().unwrap();
    assert_eq!(handle.state(), DetectorState::Idle);
    let status = handle.status().await.unwrap();
    assert_eq!(status.loaded_frames, 3);
    assert_eq!(status.state.compression, Compression::Bslz4);
}

#[tokio::test]
async fn test_queries_answer_while_load_is_pending() {
    let (handle, _rx) = spawn_slow(Duration::from_millis(300));

    let loader = handle.clone();
    let first = tokio::spawn(async move {
        loader
            .load(LoadRequest::new(MASTER, Compression::Bslz4, None))
            .await
    });
    wait_for_state(&handle, DetectorState::Configure).await;

    let status = handle.status().await.unwrap();
    assert!(status.dataset.is_none());
    assert_eq!(handle.stream_configuration().await.unwrap().format, "cbor");
    assert!(matches!(handle.arm().await, Err(DetectorError::NotLoaded)));

    first.await.unwrap().unwrap();
    assert!(handle.status().await.unwrap().dataset.is_some());
}

#[tokio::test]
async fn test_compression_reload_runs_in_background() {
    let (handle, _rx) = spawn_slow(Duration::from_millis(50));
    handle
        .load(LoadRequest::new(MASTER, Compression::Bslz4, None))
        .await
        .unwrap();

    handle.set_compression("None").await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.state.compression, Compression::None);
    assert_eq!(status.loaded_frames, 3);

    let err = handle.set_compression("xyz").await.unwrap_err();
    assert!(matches!(err, DetectorError::UnsupportedCompression(_)));
    assert_eq!(handle.status().await.unwrap().state.compression, Compression::None);
}

#[tokio::test]
async fn test_load_waits_for_running_trigger() {
    let (handle, mut rx) = spawn_slow(Duration::ZERO);
    handle
        .load(LoadRequest::new(MASTER, Compression::Bslz4, None))
        .await
        .unwrap();
    handle.set_frame_delay(Duration::from_millis(20)).await.unwrap();
    handle.set_frames_per_trigger(10).await.unwrap();
    handle.arm().await.unwrap();

    let trigger = handle.clone();
    let acquisition = tokio::spawn(async move { trigger.trigger().await });
    wait_for_state(&handle, DetectorState::Acquire).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // queued behind the trigger; frames are swapped only after it returns
    handle
        .load(LoadRequest::new(WIDE, Compression::Bslz4, None))
        .await
        .unwrap();
    let summary = acquisition.await.unwrap().unwrap();
    assert_eq!(summary.frames_sent, 10);

    let mut shapes = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        if let StreamMessage::Image(image) = decode_message(&bytes).unwrap() {
            let frame = decode_frame(image.frame().unwrap()).unwrap();
            shapes.push((frame.shape, frame.pixel_type));
        }
    }
    assert_eq!(shapes.len(), 10);
    assert!(shapes.iter().all(|s| *s == ([16, 16], PixelType::U16)));

    let start = handle.start_message().await.unwrap();
    assert_eq!((start.image_size_x, start.image_size_y), (24, 20));
}

// =============================================================================
// State labels
// =============================================================================

#[tokio::test]
async fn test_trigger_publishes_acquire() {
    let (handle, mut rx) = spawn_slow(Duration::ZERO);
    handle
        .load(LoadRequest::new(MASTER, Compression::None, None))
        .await
        .unwrap();
    handle.set_frame_delay(Duration::from_millis(40)).await.unwrap();
    handle.arm().await.unwrap();
    assert_eq!(handle.state(), DetectorState::Ready);

    let trigger = handle.clone();
    let acquisition = tokio::spawn(async move { trigger.trigger().await });
    wait_for_state(&handle, DetectorState::Acquire).await;

    let summary = acquisition.await.unwrap().unwrap();
    assert_eq!(summary.frames_sent, 3);
    assert_eq!(handle.state(), DetectorState::Ready);

    handle.disarm().await.unwrap();
    assert_eq!(handle.state(), DetectorState::Idle);

    let mut kinds = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        kinds.push(decode_message(&bytes).unwrap().kind());
    }
    assert_eq!(kinds, vec!["start", "image", "image", "image", "end"]);
}

#[tokio::test]
async fn test_shutdown_publishes_na() {
    let (handle, _rx) = spawn_slow(Duration::ZERO);
    let mut state = handle.subscribe_state();
    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == DetectorState::Na))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(handle.status().await, Err(DetectorError::ActorStopped)));
}

#[tokio::test]
async fn test_header_appendix_reaches_start_message() {
    let (handle, mut rx) = spawn_slow(Duration::ZERO);
    handle
        .load(LoadRequest::new(MASTER, Compression::Bslz4, None))
        .await
        .unwrap();
    handle
        .set_header_appendix(serde_json::json!({"beamline": "id23"}))
        .await
        .unwrap();
    handle.arm().await.unwrap();

    match decode_message(&rx.recv().await.unwrap()).unwrap() {
        StreamMessage::Start(start) => {
            assert_eq!(start.user_data["beamline"], "id23");
            assert_eq!(start.number_of_images, 3);
        }
        other => panic!("expected start, got {}", other.kind()),
    }
}

// =============================================================================
// ZeroMQ end to end
// =============================================================================

#[tokio::test]
async fn test_series_over_zmq_push_socket() {
    let transport = ZmqPushTransport::bind("tcp://127.0.0.1:0").await.unwrap();
    let endpoint = transport.endpoint();

    let mut pull = PullSocket::new();
    pull.connect(&endpoint).await.unwrap();
    // let the peer handshake finish before the first send
    tokio::time::sleep(Duration::from_millis(200)).await;

    let engine = StreamEngine::new(transport, Arc::new(catalog())).with_frame_delay(Duration::ZERO);
    let (handle, _task) = DetectorActor::spawn(engine);
    handle
        .load(LoadRequest::new(MASTER, Compression::Bslz4, None))
        .await
        .unwrap();
    handle.set_frames_per_trigger(2).await.unwrap();
    handle.arm().await.unwrap();
    handle.trigger().await.unwrap();
    handle.disarm().await.unwrap();

    let mut messages = Vec::new();
    for _ in 0..4 {
        let msg = tokio::time::timeout(Duration::from_secs(5), pull.recv())
            .await
            .unwrap()
            .unwrap();
        let frames = msg.into_vec();
        messages.push(decode_message(&frames[0]).unwrap());
    }
    let kinds: Vec<&str> = messages.iter().map(StreamMessage::kind).collect();
    assert_eq!(kinds, vec!["start", "image", "image", "end"]);

    handle.shutdown().await.unwrap();
}
