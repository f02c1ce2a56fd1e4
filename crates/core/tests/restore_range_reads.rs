//! Covers ranged reads spanning a chunk boundary, a non-206 response
//! surfacing as `Error::Remote`, and seek behavior: idempotent repositioning
//! and a no-op when seeking to the current position.

mod common;

use std::io::SeekFrom;
use std::sync::Arc;

use chunkvault_core::{Error, Manager};
use common::FakeHost;

async fn upload_fixture(manager: &Arc<Manager>, chunk_size: u64, body: &[u8]) -> chunkvault_core::Manifest {
    let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
    let collected_cb = Arc::clone(&collected);
    let on_chunk: chunkvault_core::OnChunk = Box::new(move |a| collected_cb.lock().unwrap().push(a));
    let mut writer = manager.new_writer(chunk_size, false, on_chunk).unwrap();
    writer.write(body).await.unwrap();
    writer.close().await.unwrap();
    chunkvault_core::Manifest::new(collected.lock().unwrap().clone()).unwrap()
}

#[tokio::test]
async fn s3_ranged_read_spans_two_chunks() {
    let host = FakeHost::spawn().await;
    let manager = Arc::new(Manager::from_webhook_urls(&[host.webhook_url()]).unwrap());
    let manifest = upload_fixture(&manager, 4, b"0123456789").await;
    assert_eq!(manifest.offsets(), vec![(0, 4), (4, 8), (8, 10)]);

    let mut reader = manager.new_reader(manifest, 3).unwrap();
    let mut buf = [0u8; 4];
    let mut read = 0;
    while read < 4 {
        let n = reader.read(&mut buf[read..]).await.unwrap();
        assert!(n > 0);
        read += n;
    }
    assert_eq!(&buf, b"3456");
}

#[tokio::test]
async fn s5_non_206_fetch_surfaces_as_remote_error() {
    let host = FakeHost::spawn().await;
    let manager = Arc::new(Manager::from_webhook_urls(&[host.webhook_url()]).unwrap());
    let manifest = upload_fixture(&manager, 4, b"abcd").await;

    host.set_fetch_status_override(200).await;
    let mut reader = manager.new_reader(manifest, 0).unwrap();
    let mut buf = [0u8; 4];
    let err = reader.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::Remote { status: 200 }));
}

#[tokio::test]
async fn seek_is_idempotent_and_current_zero_delta_is_a_no_op() {
    let host = FakeHost::spawn().await;
    let manager = Arc::new(Manager::from_webhook_urls(&[host.webhook_url()]).unwrap());
    let manifest = upload_fixture(&manager, 4, b"0123456789").await;

    let mut reader = manager.new_reader(manifest.clone(), 0).unwrap();
    reader.seek(SeekFrom::Start(5)).unwrap();
    let mut first = [0u8; 3];
    let mut read = 0;
    while read < 3 {
        read += reader.read(&mut first[read..]).await.unwrap();
    }

    let mut reader2 = manager.new_reader(manifest, 0).unwrap();
    reader2.seek(SeekFrom::Start(5)).unwrap();
    let mut second = [0u8; 3];
    let mut read = 0;
    while read < 3 {
        read += reader2.read(&mut second[read..]).await.unwrap();
    }
    assert_eq!(first, second);
    assert_eq!(&first, b"567");

    let pos_before = reader2.position();
    assert_eq!(reader2.seek(SeekFrom::Current(0)).unwrap(), pos_before);
}
