use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use ferry::testing::{md5_base64, MemoryBlobStore};
use ferry::{
    BlobDirLocation, BlobLocation, BlobType, BlobUri, Credentials, DirectoryMode,
    DirectoryOptions, ProgressSnapshot, TransferCheckpoint, TransferConfig, TransferContext,
    TransferManager, TransferOutcome,
};

const CELL: u64 = 4 * 1024 * 1024;

fn manager(store: &MemoryBlobStore) -> Arc<TransferManager> {
    let config = TransferConfig {
        parallel_operations: 4,
        maximum_cache_size: Some(16 * CELL),
        ..TransferConfig::default()
    };
    Arc::new(TransferManager::new(Arc::new(store.clone()), config))
}

fn blob(uri: &str) -> BlobLocation {
    BlobLocation::new(
        BlobUri::parse(uri).unwrap(),
        BlobType::Block,
        Credentials::Anonymous,
    )
}

fn blob_dir(uri: &str, prefix: &str) -> BlobDirLocation {
    BlobDirLocation::new(
        BlobUri::parse(uri).unwrap(),
        prefix.to_string(),
        Credentials::Anonymous,
    )
}

fn open_checkpoint(path: &Path) -> Result<Arc<TransferCheckpoint>> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(Arc::new(TransferCheckpoint::open_journal(
        Box::new(file),
        true,
    )?))
}

fn patterned(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let mut v: u8 = 1;
    for b in data.iter_mut() {
        *b = v;
        v = v.wrapping_mul(31).wrapping_add(13);
    }
    data
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn download_resumes_from_chunk_boundary() -> Result<()> {
    let store = MemoryBlobStore::new();
    let contents = patterned(3 * CELL as usize);
    store.insert_blob(
        "https://e/c/big",
        contents.clone(),
        BlobType::Block,
        Default::default(),
    );

    let tmp = tempfile::tempdir()?;
    let journal_path = tmp.path().join("transfer.journal");
    let dest = tmp.path().join("big.bin");

    // First run: cancel once the first chunk lands, as a kill would.
    let m1 = manager(&store);
    let canceller = Arc::clone(&m1);
    let ctx1 = TransferContext {
        checkpoint: Some(open_checkpoint(&journal_path)?),
        progress_handler: Some(Arc::new(move |s: &ProgressSnapshot| {
            if s.bytes >= CELL {
                canceller.cancel();
            }
        })),
        ..TransferContext::default()
    };
    let interrupted = m1.download(blob("https://e/c/big"), &dest, &ctx1).await;
    assert!(interrupted.is_err(), "cancelled run must not report success");
    drop(ctx1);

    // Second run: fresh process, same journal bytes.
    let m2 = manager(&store);
    let ctx2 = TransferContext {
        checkpoint: Some(open_checkpoint(&journal_path)?),
        ..TransferContext::default()
    };
    let totals = m2.download(blob("https://e/c/big"), &dest, &ctx2).await?;

    assert_eq!(totals.bytes, contents.len() as u64);
    assert_eq!(totals.files_transferred, 1);
    assert_eq!(md5_base64(&std::fs::read(&dest)?), md5_base64(&contents));
    // Only the unconfirmed window was refetched, never the whole object
    // twice.
    let served = store.read_bytes("https://e/c/big");
    assert!(
        served < 2 * contents.len() as u64,
        "served {served} bytes for a {} byte object",
        contents.len()
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn directory_resume_reaches_full_count_without_full_retransfer() -> Result<()> {
    let store = MemoryBlobStore::new();
    let size = 256 * 1024usize;
    let names: Vec<String> = (0..6)
        .map(|i| {
            if i < 4 {
                format!("f{i}.bin")
            } else {
                format!("nest/f{i}.bin")
            }
        })
        .collect();
    for name in &names {
        store.insert_blob(
            &format!("https://e/c/tree/{name}"),
            patterned(size),
            BlobType::Block,
            Default::default(),
        );
    }

    let tmp = tempfile::tempdir()?;
    let journal_path = tmp.path().join("dir.journal");
    let dest_root = tmp.path().join("out");

    let completed_first = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let m1 = manager(&store);
    let canceller = Arc::clone(&m1);
    let completed_sink = Arc::clone(&completed_first);
    let ctx1 = TransferContext {
        checkpoint: Some(open_checkpoint(&journal_path)?),
        progress_handler: Some(Arc::new(move |s: &ProgressSnapshot| {
            if s.files_transferred >= 2 {
                canceller.cancel();
            }
        })),
        event_handler: Some(Arc::new(move |e: &ferry::TransferEvent| {
            if e.outcome == TransferOutcome::Completed {
                completed_sink.lock().push(e.source.clone());
            }
        })),
        ..TransferContext::default()
    };
    let interrupted = m1
        .download_directory(
            blob_dir("https://e/c", "tree"),
            &dest_root,
            DirectoryOptions::default(),
            DirectoryMode::Hierarchical,
            &ctx1,
        )
        .await;
    assert!(interrupted.is_err());
    drop(ctx1);

    let m2 = manager(&store);
    let ctx2 = TransferContext {
        checkpoint: Some(open_checkpoint(&journal_path)?),
        ..TransferContext::default()
    };
    let totals = m2
        .download_directory(
            blob_dir("https://e/c", "tree"),
            &dest_root,
            DirectoryOptions::default(),
            DirectoryMode::Hierarchical,
            &ctx2,
        )
        .await?;

    // Every source file reaches a terminal outcome exactly once.
    assert_eq!(totals.files_total(), names.len() as u64);
    assert_eq!(totals.files_failed, 0);
    for name in &names {
        let local = dest_root.join(name.replace('/', std::path::MAIN_SEPARATOR_STR));
        assert_eq!(
            md5_base64(&std::fs::read(&local)?),
            md5_base64(&patterned(size)),
            "content mismatch for {name}"
        );
    }
    // Files that finished before the kill were not fetched again.
    for uri in completed_first.lock().iter() {
        if uri.starts_with("https://") {
            assert_eq!(
                store.read_bytes(uri),
                size as u64,
                "{uri} was re-read after resume"
            );
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_transfer_reexecutes_as_noop() -> Result<()> {
    let store = MemoryBlobStore::new();
    let tmp = tempfile::tempdir()?;
    let journal_path = tmp.path().join("noop.journal");
    let src = tmp.path().join("a.bin");
    std::fs::write(&src, b"payload")?;

    let m = manager(&store);
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&journal_path)?;
    let checkpoint = Arc::new(m.open_checkpoint(Box::new(file))?);
    let ctx = TransferContext {
        checkpoint: Some(Arc::clone(&checkpoint)),
        ..TransferContext::default()
    };
    let first = m.upload(&src, blob("https://e/c/a.bin"), &ctx).await?;
    assert_eq!(first.files_transferred, 1);

    // Same checkpoint, same key: the finished transfer is returned and
    // re-execution changes nothing.
    let second = m.upload(&src, blob("https://e/c/a.bin"), &ctx).await?;
    assert_eq!(second.files_transferred, 1);
    assert_eq!(second.bytes, first.bytes);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_root_accepts_fresh_credentials() -> Result<()> {
    let store = MemoryBlobStore::new();
    let contents = patterned(64 * 1024);
    store.insert_blob(
        "https://e/c/guarded",
        contents.clone(),
        BlobType::Block,
        Default::default(),
    );
    let tmp = tempfile::tempdir()?;
    let journal_path = tmp.path().join("creds.journal");
    let dest = tmp.path().join("guarded.bin");

    // Seed the journal with a fresh (unexecuted) transfer record.
    {
        let checkpoint = open_checkpoint(&journal_path)?;
        let mut source = blob("https://e/c/guarded");
        source.credentials = Credentials::Sas {
            token: "sig=expired".into(),
        };
        let key = ferry::transfer::TransferKey::new(
            &ferry::TransferLocation::RemoteBlob(source.clone()),
            &ferry::TransferLocation::local_file(&dest),
        );
        checkpoint.get_transfer(&key, || {
            ferry::Transfer::new_single(
                ferry::TransferLocation::RemoteBlob(source),
                ferry::TransferLocation::local_file(&dest),
                ferry::TransferMethod::SyncCopy,
            )
        })?;
    }

    // Resume with new credentials on the same identity.
    let m = manager(&store);
    let mut source = blob("https://e/c/guarded");
    source.credentials = Credentials::Sas {
        token: "sig=fresh".into(),
    };
    let ctx = TransferContext {
        checkpoint: Some(open_checkpoint(&journal_path)?),
        ..TransferContext::default()
    };
    let totals = m.download(source, &dest, &ctx).await?;
    assert_eq!(totals.files_transferred, 1);
    assert_eq!(std::fs::read(&dest)?, contents);
    Ok(())
}
