//! Covers the rate-limit gate blocking an upload until `reset_at` elapses,
//! and writer poisoning on upload failure for both the sequential and
//! parallel writers.

mod common;

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chunkvault_core::{Error, Manager};
use common::{FakeHost, UploadBehavior};

#[tokio::test]
async fn upload_blocks_until_reset_at_then_proceeds() {
    let host = FakeHost::spawn().await;
    let manager = Manager::from_webhook_urls(&[host.webhook_url()]).unwrap();

    let reset_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
        + 1;
    host.set_next_upload_behavior(UploadBehavior {
        status: 200,
        remaining: Some(0),
        reset_at_unix: Some(reset_at),
    })
    .await;

    // First upload: succeeds, but its response headers arm the gate with
    // remaining=0 for one second out.
    manager.write(b"first".to_vec()).await.unwrap();

    let started = Instant::now();
    manager.write(b"second".to_vec()).await.unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(850),
        "second upload should have waited for reset_at, elapsed = {elapsed:?}"
    );
}

#[tokio::test]
async fn first_upload_error_poisons_the_sequential_writer() {
    let host = FakeHost::spawn().await;
    host.set_next_upload_behavior(UploadBehavior {
        status: 500,
        remaining: None,
        reset_at_unix: None,
    })
    .await;
    let manager = std::sync::Arc::new(Manager::from_webhook_urls(&[host.webhook_url()]).unwrap());

    let on_chunk: chunkvault_core::OnChunk = Box::new(|_| {});
    let mut writer = manager.new_writer(4, false, on_chunk).unwrap();
    writer.write(b"12345678").await.unwrap_err();

    let close_err = writer.close().await.unwrap_err();
    assert!(matches!(close_err, Error::Poisoned(_) | Error::AlreadyClosed));

    let second_write_err = writer.write(b"more").await.unwrap_err();
    assert!(matches!(
        second_write_err,
        Error::Poisoned(_) | Error::Closed
    ));
}

#[tokio::test]
async fn parallel_writer_poisons_on_first_worker_error() {
    let host = FakeHost::spawn().await;
    host.set_next_upload_behavior(UploadBehavior {
        status: 500,
        remaining: None,
        reset_at_unix: None,
    })
    .await;
    let webhook = host.webhook_url();
    let manager = std::sync::Arc::new(
        Manager::from_webhook_urls(&[webhook.clone(), webhook]).unwrap(),
    );

    let on_chunk: chunkvault_core::OnChunk = Box::new(|_| {});
    let mut writer = manager.new_writer(4, true, on_chunk).unwrap();
    // One of these chunks hits the 500; close must surface it.
    let _ = writer.write(&[1u8; 20]).await;
    let close_err = writer.close().await.unwrap_err();
    assert!(matches!(close_err, Error::Poisoned(_) | Error::Cancelled));
}
