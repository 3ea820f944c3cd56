//! Session manager tests against the in-memory adapter.

mod common;

use bluetooth_basic::bluetooth::BackendConnector;
use bluetooth_basic::error::ExecutorError;
use bluetooth_basic::events::{Notification, NotificationSink};
use bluetooth_basic::executor::OperationKind;
use bluetooth_basic::session::{SessionManager, SlotId, SlotState};
use common::{session_config, FakeBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn manager() -> (
    Arc<FakeBackend>,
    SessionManager,
    async_channel::Receiver<Notification>,
) {
    let backend = Arc::new(FakeBackend::new());
    let (sink, rx) = NotificationSink::channel();
    let connector = Arc::new(BackendConnector(backend.clone()));
    let manager = SessionManager::new(connector, sink, &session_config());
    (backend, manager, rx)
}

#[tokio::test]
async fn test_write_reaches_device_after_open() {
    let (backend, manager, _rx) = manager();

    manager.connect(SlotId::DEFAULT, "AA:BB").await.unwrap();
    manager.write(SlotId::DEFAULT, vec![0, 127, 128, 255]).unwrap();
    manager.flush().await;

    assert_eq!(backend.opens(), vec!["AA:BB".to_string()]);
    assert_eq!(manager.slot_state(SlotId::DEFAULT), SlotState::Open);

    let mut peer = backend.take_peer("AA:BB").unwrap();
    let mut received = [0u8; 4];
    peer.read_exact(&mut received).await.unwrap();
    let signed: Vec<i8> = received.iter().map(|&b| b as i8).collect();
    assert_eq!(signed, vec![0, 127, -128, -1]);
}

#[tokio::test]
async fn test_operations_run_in_submission_order() {
    let (backend, manager, _rx) = manager();
    backend.set_open_delay(Duration::from_millis(30));

    // The write waits behind the slow open instead of failing on an empty slot
    manager.connect(SlotId::DEFAULT, "AA:BB").await.unwrap();
    manager.write(SlotId::DEFAULT, vec![1, 2]).unwrap();
    let mut failures = manager.subscribe_failures();
    manager.flush().await;

    let mut peer = backend.take_peer("AA:BB").unwrap();
    let mut received = [0u8; 2];
    peer.read_exact(&mut received).await.unwrap();
    assert_eq!(received, [1, 2]);
    assert!(failures.try_recv().is_err());
}

#[tokio::test]
async fn test_connect_replaces_previous_session() {
    let (backend, manager, _rx) = manager();

    manager.connect(SlotId::DEFAULT, "AA").await.unwrap();
    manager.connect(SlotId::DEFAULT, "BB").await.unwrap();
    manager.flush().await;

    assert_eq!(manager.slot_address(SlotId::DEFAULT).as_deref(), Some("BB"));
    assert_eq!(manager.open_sessions(), 1);

    // Whichever way the race went, A's transport is closed
    let mut peer_a = backend.take_peer("AA").unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(peer_a.read(&mut buf).await.unwrap(), 0);

    manager.write(SlotId::DEFAULT, vec![42]).unwrap();
    manager.flush().await;
    let mut peer_b = backend.take_peer("BB").unwrap();
    peer_b.read_exact(&mut buf[..1]).await.unwrap();
    assert_eq!(buf[0], 42);
}

#[tokio::test]
async fn test_connect_while_open_is_slow() {
    let (backend, manager, _rx) = manager();
    backend.set_open_delay(Duration::from_millis(20));

    manager.connect(SlotId::DEFAULT, "AA").await.unwrap();
    manager.connect(SlotId::DEFAULT, "BB").await.unwrap();
    assert_eq!(manager.slot_state(SlotId::DEFAULT), SlotState::Connecting);
    manager.flush().await;

    assert_eq!(backend.opens(), vec!["AA".to_string(), "BB".to_string()]);
    assert_eq!(manager.slot_address(SlotId::DEFAULT).as_deref(), Some("BB"));
    assert_eq!(manager.open_sessions(), 1);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (backend, manager, _rx) = manager();

    assert!(manager.disconnect(SlotId::DEFAULT).await);
    assert_eq!(manager.slot_state(SlotId::DEFAULT), SlotState::Empty);

    manager.connect(SlotId::DEFAULT, "AA").await.unwrap();
    manager.flush().await;
    assert!(manager.disconnect(SlotId::DEFAULT).await);
    assert!(manager.disconnect(SlotId::DEFAULT).await);
    assert_eq!(manager.slot_state(SlotId::DEFAULT), SlotState::Empty);

    let mut peer = backend.take_peer("AA").unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_destroy_shuts_executor_down() {
    let (_backend, manager, _rx) = manager();

    manager.connect(SlotId::DEFAULT, "AA").await.unwrap();
    manager.flush().await;
    let executor = manager.current_executor().unwrap();

    assert!(manager.destroy().await);
    assert!(!manager.is_executor_alive());
    assert_eq!(manager.open_sessions(), 0);
    assert_eq!(manager.slot_state(SlotId::DEFAULT), SlotState::Empty);

    let rejected = executor.submit(OperationKind::Write, SlotId::DEFAULT, async { Ok(()) });
    assert_eq!(rejected, Err(ExecutorError::ShutDown));

    // Next use starts over with a fresh executor
    manager.connect(SlotId::DEFAULT, "BB").await.unwrap();
    manager.flush().await;
    assert!(manager.is_executor_alive());
    assert_eq!(manager.slot_state(SlotId::DEFAULT), SlotState::Open);
}

#[tokio::test]
async fn test_write_without_session_is_published() {
    let (_backend, manager, _rx) = manager();
    let mut failures = manager.subscribe_failures();

    manager.write(SlotId::DEFAULT, vec![1]).unwrap();
    manager.flush().await;

    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.kind, OperationKind::Write);
    assert_eq!(failure.slot, SlotId::DEFAULT);
    assert!(failure.message.contains("no open session"));
}

#[tokio::test]
async fn test_out_of_range_write_is_published() {
    let (backend, manager, _rx) = manager();
    let mut failures = manager.subscribe_failures();

    manager.connect(SlotId::DEFAULT, "AA").await.unwrap();
    manager.write(SlotId::DEFAULT, vec![1, 256]).unwrap();
    manager.write(SlotId::DEFAULT, vec![7]).unwrap();
    manager.flush().await;

    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.kind, OperationKind::Write);

    // Nothing of the rejected write went out, the next one did
    let mut peer = backend.take_peer("AA").unwrap();
    let mut buf = [0u8; 1];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [7]);
}

#[tokio::test]
async fn test_failed_open_clears_slot() {
    let (backend, manager, _rx) = manager();
    backend.set_unreachable("AA");
    let mut failures = manager.subscribe_failures();

    manager.connect(SlotId::DEFAULT, "AA").await.unwrap();
    manager.flush().await;

    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.kind, OperationKind::Open);
    assert!(failure.message.contains("AA"));
    assert_eq!(manager.slot_state(SlotId::DEFAULT), SlotState::Empty);
}

#[tokio::test]
async fn test_inbound_bytes_are_notified() {
    let (backend, manager, rx) = manager();

    manager.connect(SlotId::DEFAULT, "AA").await.unwrap();
    manager.flush().await;

    let mut peer = backend.take_peer("AA").unwrap();
    peer.write_all(b"ok").await.unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        notification,
        Notification::DataReceived {
            slot: SlotId::DEFAULT,
            bytes: b"ok".to_vec(),
        }
    );
}

#[tokio::test]
async fn test_released_executor_keeps_operations_serial() {
    let (backend, manager, _rx) = manager();
    backend.set_open_delay(Duration::from_millis(100));

    manager.connect(SlotId::DEFAULT, "AA").await.unwrap();
    manager.write(SlotId::DEFAULT, vec![1]).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // An adapter event drops the executor while the open of AA is running
    manager.release_executor();
    assert!(!manager.is_executor_alive());

    manager.connect(SlotId::DEFAULT, "BB").await.unwrap();
    assert!(manager.is_executor_alive());
    manager.flush().await;

    assert_eq!(backend.peak_concurrent_opens(), 1);
    assert_eq!(backend.opens(), vec!["AA".to_string(), "BB".to_string()]);
    assert_eq!(manager.slot_address(SlotId::DEFAULT).as_deref(), Some("BB"));
    assert_eq!(manager.open_sessions(), 1);
}

#[tokio::test]
async fn test_disconnect_interrupts_stalled_write() {
    let (backend, manager, _rx) = manager();
    let mut failures = manager.subscribe_failures();

    manager.connect(SlotId::DEFAULT, "AA").await.unwrap();
    manager.flush().await;

    // The device never reads, so this fills the pipe and blocks the worker
    manager.write(SlotId::DEFAULT, vec![1; 4096]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let disconnected =
        tokio::time::timeout(Duration::from_secs(2), manager.disconnect(SlotId::DEFAULT))
            .await
            .expect("disconnect waited on the stalled write");
    assert!(disconnected);
    assert_eq!(manager.slot_state(SlotId::DEFAULT), SlotState::Empty);

    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.kind, OperationKind::Write);
    assert!(failure.message.contains("closed during write"));

    // The worker is free again
    manager.connect(SlotId::DEFAULT, "BB").await.unwrap();
    manager.flush().await;
    assert_eq!(manager.slot_state(SlotId::DEFAULT), SlotState::Open);
    assert!(backend.take_peer("AA").is_some());
}

#[tokio::test]
async fn test_destroy_interrupts_stalled_write() {
    let (_backend, manager, _rx) = manager();

    manager.connect(SlotId::DEFAULT, "AA").await.unwrap();
    manager.flush().await;
    manager.write(SlotId::DEFAULT, vec![1; 4096]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let destroyed = tokio::time::timeout(Duration::from_secs(2), manager.destroy())
        .await
        .expect("destroy waited on the stalled write");
    assert!(destroyed);
    assert_eq!(manager.open_sessions(), 0);
}
