use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ferry::testing::MemoryBlobStore;
use ferry::{
    BlobLocation, BlobType, BlobUri, CopyState, CopyStatus, Credentials, ErrorKind,
    TransferConfig, TransferContext, TransferError, TransferManager, TransferMethod,
    TransferOutcome,
};

fn blob(uri: &str) -> BlobLocation {
    BlobLocation::new(
        BlobUri::parse(uri).unwrap(),
        BlobType::Block,
        Credentials::Anonymous,
    )
}

fn pending(copied: u64, total: u64) -> CopyState {
    CopyState {
        status: CopyStatus::Pending,
        bytes_copied: copied,
        total_bytes: total,
        status_description: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_copy_polls_to_completion() -> Result<()> {
    let store = MemoryBlobStore::new();
    store.insert_blob(
        "https://e/c/source",
        vec![5u8; 1000],
        BlobType::Block,
        Default::default(),
    );
    store.script_copy_status(
        "https://e/c/copied",
        vec![
            pending(0, 1000),
            pending(400, 1000),
            pending(800, 1000),
            CopyState {
                status: CopyStatus::Success,
                bytes_copied: 1000,
                total_bytes: 1000,
                status_description: None,
            },
        ],
    );

    let m = TransferManager::new(Arc::new(store.clone()), TransferConfig::default());
    let ctx = TransferContext::default();
    let totals = m
        .copy(
            blob("https://e/c/source"),
            blob("https://e/c/copied"),
            TransferMethod::ServiceSideAsyncCopy,
            &ctx,
        )
        .await?;

    assert_eq!(totals.bytes, 1000);
    assert_eq!(totals.files_transferred, 1);
    assert_eq!(store.blob_data("https://e/c/copied").unwrap(), vec![5u8; 1000]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_copy_completes_in_one_call_flow() -> Result<()> {
    let store = MemoryBlobStore::new();
    store.insert_blob(
        "https://e/c/source",
        b"sync copy payload".to_vec(),
        BlobType::Block,
        Default::default(),
    );
    let m = TransferManager::new(Arc::new(store.clone()), TransferConfig::default());
    let ctx = TransferContext::default();
    let totals = m
        .copy(
            blob("https://e/c/source"),
            blob("https://e/c/mirror"),
            TransferMethod::ServiceSideSyncCopy,
            &ctx,
        )
        .await?;
    assert_eq!(totals.files_transferred, 1);
    assert_eq!(
        store.blob_data("https://e/c/mirror").unwrap(),
        b"sync copy payload"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_copy_fails_with_transfer_stuck() -> Result<()> {
    let store = MemoryBlobStore::new();
    store.insert_blob(
        "https://e/c/source",
        vec![1u8; 4096],
        BlobType::Block,
        Default::default(),
    );
    // Progress freezes at 100 bytes forever.
    store.script_copy_status("https://e/c/stuck", vec![pending(100, 4096)]);

    let config = TransferConfig {
        stall_timeout: Duration::from_millis(250),
        ..TransferConfig::default()
    };
    let m = TransferManager::new(Arc::new(store), config);
    let outcomes = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let outcomes2 = Arc::clone(&outcomes);
    let ctx = TransferContext {
        event_handler: Some(Arc::new(move |e: &ferry::TransferEvent| {
            outcomes2.lock().push((e.outcome, e.error.clone()));
        })),
        ..TransferContext::default()
    };
    let result = m
        .copy(
            blob("https://e/c/source"),
            blob("https://e/c/stuck"),
            TransferMethod::ServiceSideAsyncCopy,
            &ctx,
        )
        .await;

    let err = match result {
        Err(e) => e,
        Ok(_) => panic!("stalled copy must fail"),
    };
    assert_eq!(err.kind(), ErrorKind::TransferStuck);
    assert!(matches!(err, TransferError::TransferStuck(_)));
    let events = outcomes.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, TransferOutcome::Failed);
    assert!(events[0].1.as_deref().unwrap_or("").contains("no copy progress"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn copy_from_uri_uses_given_source() -> Result<()> {
    let store = MemoryBlobStore::new();
    store.insert_blob(
        "https://elsewhere/c/obj",
        b"from afar".to_vec(),
        BlobType::Block,
        Default::default(),
    );
    let m = TransferManager::new(Arc::new(store.clone()), TransferConfig::default());
    let ctx = TransferContext::default();
    let totals = m
        .copy_from_uri("https://elsewhere/c/obj", blob("https://e/c/landed"), &ctx)
        .await?;
    assert_eq!(totals.files_transferred, 1);
    assert_eq!(store.blob_data("https://e/c/landed").unwrap(), b"from afar");
    Ok(())
}
