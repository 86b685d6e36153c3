use std::sync::Arc;

use anyhow::Result;
use ferry::testing::MemoryBlobStore;
use ferry::{
    BlobDirLocation, BlobType, BlobUri, Credentials, DirectoryMode, DirectoryOptions,
    TransferConfig, TransferContext, TransferManager,
};

fn manager(store: &MemoryBlobStore) -> TransferManager {
    let config = TransferConfig {
        parallel_operations: 4,
        maximum_cache_size: Some(16 * 4 * 1024 * 1024),
        ..TransferConfig::default()
    };
    TransferManager::new(Arc::new(store.clone()), config)
}

fn blob_dir(uri: &str, prefix: &str) -> BlobDirLocation {
    BlobDirLocation::new(
        BlobUri::parse(uri).unwrap(),
        prefix.to_string(),
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
async fn flat_upload_maps_separators() -> Result<()> {
    let store = MemoryBlobStore::new();
    let m = manager(&store);
    let tmp = tempfile::tempdir()?;
    write_file(&tmp.path().join("a.txt"), b"aa")?;
    write_file(&tmp.path().join("sub/b.txt"), b"bbb")?;
    write_file(&tmp.path().join("sub/deep/c.txt"), b"c")?;

    let ctx = TransferContext::default();
    let totals = m
        .upload_directory(
            tmp.path(),
            blob_dir("https://e/c", "up"),
            DirectoryOptions::default(),
            DirectoryMode::Flat,
            &ctx,
        )
        .await?;

    assert_eq!(totals.files_transferred, 3);
    assert_eq!(totals.files_failed, 0);
    assert_eq!(totals.bytes, 6);
    assert_eq!(store.blob_data("https://e/c/up/a.txt").unwrap(), b"aa");
    assert_eq!(store.blob_data("https://e/c/up/sub/b.txt").unwrap(), b"bbb");
    assert_eq!(
        store.blob_data("https://e/c/up/sub/deep/c.txt").unwrap(),
        b"c"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hierarchical_download_creates_marker_directories() -> Result<()> {
    let store = MemoryBlobStore::new();
    store.insert_blob(
        "https://e/c/root/f.txt",
        b"top".to_vec(),
        BlobType::Block,
        Default::default(),
    );
    store.insert_folder_marker("https://e/c/root/sub");
    store.insert_blob(
        "https://e/c/root/sub/inner.txt",
        b"inner".to_vec(),
        BlobType::Block,
        Default::default(),
    );

    let m = manager(&store);
    let tmp = tempfile::tempdir()?;
    let ctx = TransferContext::default();
    let totals = m
        .download_directory(
            blob_dir("https://e/c", "root"),
            tmp.path(),
            DirectoryOptions::default(),
            DirectoryMode::Hierarchical,
            &ctx,
        )
        .await?;

    // Marker counts as one transferred file that moves no payload.
    assert_eq!(totals.files_transferred, 3);
    assert_eq!(totals.bytes, 8);
    assert!(tmp.path().join("sub").is_dir());
    assert_eq!(std::fs::read(tmp.path().join("f.txt"))?, b"top");
    assert_eq!(std::fs::read(tmp.path().join("sub/inner.txt"))?, b"inner");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hierarchical_copy_between_containers() -> Result<()> {
    let store = MemoryBlobStore::new();
    for (name, data) in [("one", b"11".as_slice()), ("n/two", b"222".as_slice())] {
        store.insert_blob(
            &format!("https://e/c/src/{name}"),
            data.to_vec(),
            BlobType::Block,
            Default::default(),
        );
    }
    let m = manager(&store);
    let ctx = TransferContext::default();
    let totals = m
        .copy_directory(
            blob_dir("https://e/c", "src"),
            blob_dir("https://e/c", "dst"),
            ferry::TransferMethod::ServiceSideAsyncCopy,
            DirectoryOptions::default(),
            DirectoryMode::Hierarchical,
            &ctx,
        )
        .await?;

    assert_eq!(totals.files_transferred, 2);
    assert_eq!(store.blob_data("https://e/c/dst/one").unwrap(), b"11");
    assert_eq!(store.blob_data("https://e/c/dst/n/two").unwrap(), b"222");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flat_download_skips_refused_overwrites_without_stopping_peers() -> Result<()> {
    let store = MemoryBlobStore::new();
    for name in ["keep.txt", "fresh.txt"] {
        store.insert_blob(
            &format!("https://e/c/d/{name}"),
            b"remote".to_vec(),
            BlobType::Block,
            Default::default(),
        );
    }
    let m = manager(&store);
    let tmp = tempfile::tempdir()?;
    // Destination for keep.txt already exists; the callback refuses it.
    write_file(&tmp.path().join("keep.txt"), b"local")?;

    let ctx = TransferContext {
        should_overwrite: Some(Arc::new(|_, _| false)),
        ..TransferContext::default()
    };
    let totals = m
        .download_directory(
            blob_dir("https://e/c", "d"),
            tmp.path(),
            DirectoryOptions::default(),
            DirectoryMode::Flat,
            &ctx,
        )
        .await?;

    assert_eq!(totals.files_transferred, 1);
    assert_eq!(totals.files_skipped, 1);
    assert_eq!(totals.files_failed, 0);
    assert_eq!(std::fs::read(tmp.path().join("keep.txt"))?, b"local");
    assert_eq!(std::fs::read(tmp.path().join("fresh.txt"))?, b"remote");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn search_pattern_filters_uploads() -> Result<()> {
    let store = MemoryBlobStore::new();
    let m = manager(&store);
    let tmp = tempfile::tempdir()?;
    write_file(&tmp.path().join("keep.log"), b"k")?;
    write_file(&tmp.path().join("skip.txt"), b"s")?;

    let options = DirectoryOptions {
        search_pattern: Some("*.log".into()),
        ..DirectoryOptions::default()
    };
    let ctx = TransferContext::default();
    let totals = m
        .upload_directory(
            tmp.path(),
            blob_dir("https://e/c", "logs"),
            options,
            DirectoryMode::Flat,
            &ctx,
        )
        .await?;
    assert_eq!(totals.files_transferred, 1);
    assert!(store.blob_data("https://e/c/logs/keep.log").is_some());
    assert!(store.blob_data("https://e/c/logs/skip.txt").is_none());
    Ok(())
}
