use std::sync::Arc;

use anyhow::Result;
use ferry::testing::{md5_base64, MemoryBlobStore};
use ferry::{
    BlobLocation, BlobType, BlobUri, Credentials, StreamHandle, TransferConfig, TransferContext,
    TransferManager, TransferOutcome,
};

fn manager(store: &MemoryBlobStore) -> TransferManager {
    let config = TransferConfig {
        parallel_operations: 4,
        maximum_cache_size: Some(16 * 4 * 1024 * 1024),
        ..TransferConfig::default()
    };
    TransferManager::new(Arc::new(store.clone()), config)
}

fn blob(uri: &str) -> BlobLocation {
    BlobLocation::new(
        BlobUri::parse(uri).unwrap(),
        BlobType::Block,
        Credentials::Anonymous,
    )
}

fn write_file(path: &std::path::Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_upload_sets_content_md5() -> Result<()> {
    let store = MemoryBlobStore::new();
    let m = manager(&store);
    let tmp = tempfile::tempdir()?;
    let src = tmp.path().join("abc.txt");
    write_file(&src, b"abc")?;

    let mut dest = blob("https://e/c/abc.txt");
    dest.request_options.store_blob_content_md5 = true;
    let ctx = TransferContext::default();
    let totals = m.upload(&src, dest, &ctx).await?;

    assert_eq!(totals.bytes, 3);
    assert_eq!(totals.files_transferred, 1);
    assert_eq!(totals.files_skipped, 0);
    assert_eq!(totals.files_failed, 0);
    assert_eq!(store.blob_data("https://e/c/abc.txt").unwrap(), b"abc");
    assert_eq!(
        store.blob_md5("https://e/c/abc.txt").unwrap(),
        "kAFQmDzST7DWlj99KOF/cg=="
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overwrite_refused_is_skipped() -> Result<()> {
    let store = MemoryBlobStore::new();
    store.insert_blob(
        "https://e/c/existing",
        b"original".to_vec(),
        BlobType::Block,
        Default::default(),
    );
    let m = manager(&store);
    let tmp = tempfile::tempdir()?;
    let src = tmp.path().join("x.txt");
    write_file(&src, b"x")?;

    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let events2 = Arc::clone(&events);
    let ctx = TransferContext {
        should_overwrite: Some(Arc::new(|_, _| false)),
        event_handler: Some(Arc::new(move |e: &ferry::TransferEvent| {
            events2.lock().push(e.outcome);
        })),
        ..TransferContext::default()
    };
    let totals = m.upload(&src, blob("https://e/c/existing"), &ctx).await?;

    assert_eq!(totals.files_skipped, 1);
    assert_eq!(totals.files_failed, 0);
    assert_eq!(totals.files_transferred, 0);
    // Remote content untouched, and a Skipped event was emitted.
    assert_eq!(store.blob_data("https://e/c/existing").unwrap(), b"original");
    assert_eq!(events.lock().as_slice(), &[TransferOutcome::Skipped]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_download_md5_round_trip() -> Result<()> {
    let store = MemoryBlobStore::new();
    let m = manager(&store);
    let tmp = tempfile::tempdir()?;
    let src = tmp.path().join("data.bin");
    // Spans several cells but stays within the single-put limit.
    let mut contents = vec![0u8; 13 * 1024 * 1024 + 17];
    let mut v: u8 = 0;
    for b in contents.iter_mut() {
        *b = v;
        v = v.wrapping_add(7);
    }
    write_file(&src, &contents)?;
    let before = md5_base64(&contents);

    let mut dest = blob("https://e/c/data.bin");
    dest.request_options.store_blob_content_md5 = true;
    let ctx = TransferContext::default();
    m.upload(&src, dest, &ctx).await?;
    assert_eq!(store.blob_md5("https://e/c/data.bin").unwrap(), before);

    let back = tmp.path().join("back.bin");
    let totals = m
        .download(blob("https://e/c/data.bin"), &back, &ctx)
        .await?;
    assert_eq!(totals.bytes, contents.len() as u64);
    let round = std::fs::read(&back)?;
    assert_eq!(md5_base64(&round), before);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_upload_stages_blocks_when_pool_is_small() -> Result<()> {
    let store = MemoryBlobStore::new();
    // A pool of two cells cannot stage the payload at once, so the upload
    // must go through put-block/commit instead of one put.
    let config = TransferConfig {
        parallel_operations: 4,
        maximum_cache_size: Some(2 * 4 * 1024 * 1024),
        ..TransferConfig::default()
    };
    let m = TransferManager::new(Arc::new(store.clone()), config);
    let tmp = tempfile::tempdir()?;
    let src = tmp.path().join("staged.bin");
    let mut contents = vec![0u8; 13 * 1024 * 1024 + 17];
    let mut v: u8 = 3;
    for b in contents.iter_mut() {
        *b = v;
        v = v.wrapping_add(11);
    }
    write_file(&src, &contents)?;
    let before = md5_base64(&contents);

    let mut dest = blob("https://e/c/staged.bin");
    dest.request_options.store_blob_content_md5 = true;
    let ctx = TransferContext::default();
    m.upload(&src, dest, &ctx).await?;

    // 8 MiB blocks over 13 MiB: two staged blocks, then the commit.
    assert_eq!(store.put_block_calls("https://e/c/staged.bin"), 2);
    assert_eq!(store.blob_md5("https://e/c/staged.bin").unwrap(), before);

    let back = tmp.path().join("staged-back.bin");
    m.download(blob("https://e/c/staged.bin"), &back, &ctx).await?;
    assert_eq!(md5_base64(&std::fs::read(&back)?), before);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_upload_and_download() -> Result<()> {
    let store = MemoryBlobStore::new();
    let m = manager(&store);
    let payload = b"streamed payload".to_vec();
    let ctx = TransferContext::default();

    m.upload_stream(
        StreamHandle::new(payload.clone()),
        blob("https://e/c/streamed"),
        &ctx,
    )
    .await?;
    assert_eq!(store.blob_data("https://e/c/streamed").unwrap(), payload);

    let sink = StreamHandle::new(Vec::new());
    m.download_to_stream(blob("https://e/c/streamed"), sink.clone(), &ctx)
        .await?;
    assert_eq!(sink.contents(), payload);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_chunk_errors_retry() -> Result<()> {
    let store = MemoryBlobStore::new();
    store.insert_blob(
        "https://e/c/flaky",
        vec![9u8; 128 * 1024],
        BlobType::Block,
        Default::default(),
    );
    // Two transient failures, fewer than the retry budget.
    store.inject_fault("get_range", 2);
    let m = manager(&store);
    let tmp = tempfile::tempdir()?;
    let dest = tmp.path().join("flaky.bin");
    let mut source = blob("https://e/c/flaky");
    source.request_options.retry_interval = std::time::Duration::from_millis(10);
    let ctx = TransferContext::default();
    let totals = m.download(source, &dest, &ctx).await?;
    assert_eq!(totals.files_transferred, 1);
    assert_eq!(std::fs::read(&dest)?, vec![9u8; 128 * 1024]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn should_transfer_false_skips_without_touching_destination() -> Result<()> {
    let store = MemoryBlobStore::new();
    let m = manager(&store);
    let tmp = tempfile::tempdir()?;
    let src = tmp.path().join("skip.me");
    write_file(&src, b"data")?;

    let ctx = TransferContext {
        should_transfer: Some(Arc::new(|_| Ok(false))),
        ..TransferContext::default()
    };
    let totals = m.upload(&src, blob("https://e/c/skip.me"), &ctx).await?;
    assert_eq!(totals.files_skipped, 1);
    assert_eq!(totals.bytes, 0);
    assert!(store.blob_data("https://e/c/skip.me").is_none());
    Ok(())
}
