//! Transfer locations: the addressable endpoints of a transfer
//!
//! A location knows its own type, can produce a stable identity string for
//! the (source, destination) transfer key, and serializes itself with an
//! explicit discriminator so a journal written by one build reopens in
//! another. Credentials are replaceable at resume without relocating;
//! stream locations are never serialized.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, TransferError};
use crate::journal::codec::{ByteReader, ByteWriter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlobType {
    #[default]
    Unspecified,
    Block,
    Page,
    Append,
}

impl BlobType {
    fn tag(self) -> u8 {
        match self {
            BlobType::Unspecified => 0,
            BlobType::Block => 1,
            BlobType::Page => 2,
            BlobType::Append => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => BlobType::Unspecified,
            1 => BlobType::Block,
            2 => BlobType::Page,
            3 => BlobType::Append,
            other => {
                return Err(TransferError::JournalCorrupt(format!(
                    "unknown blob type tag {other}"
                )))
            }
        })
    }
}

/// Credentials for a remote endpoint. Replaced wholesale on resume via
/// [`TransferLocation::update_credentials`]; never part of a location's
/// identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    SharedKey { account: String, key: String },
    Sas { token: String },
}

impl Credentials {
    fn encode(&self, w: &mut ByteWriter) {
        match self {
            Credentials::Anonymous => w.put_u8(0),
            Credentials::SharedKey { account, key } => {
                w.put_u8(1);
                w.put_str(account);
                w.put_str(key);
            }
            Credentials::Sas { token } => {
                w.put_u8(2);
                w.put_str(token);
            }
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match r.u8()? {
            0 => Credentials::Anonymous,
            1 => Credentials::SharedKey {
                account: r.str()?,
                key: r.str()?,
            },
            2 => Credentials::Sas { token: r.str()? },
            other => {
                return Err(TransferError::JournalCorrupt(format!(
                    "unknown credentials tag {other}"
                )))
            }
        })
    }
}

/// Conditional-request guard forwarded to the storage collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessCondition {
    pub if_match_etag: Option<String>,
}

/// Per-request knobs the engine threads through to every RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    pub server_timeout: Option<Duration>,
    pub maximum_execution_time: Option<Duration>,
    /// Compute and set the destination blob's content MD5 on upload.
    pub store_blob_content_md5: bool,
    /// Attach per-chunk MD5s to block writes.
    pub use_transactional_md5: bool,
    pub retry_count: u32,
    pub retry_interval: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            server_timeout: None,
            maximum_execution_time: None,
            store_blob_content_md5: false,
            use_transactional_md5: false,
            retry_count: 3,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl RequestOptions {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_opt_u64(self.server_timeout.map(|d| d.as_millis() as u64));
        w.put_opt_u64(self.maximum_execution_time.map(|d| d.as_millis() as u64));
        w.put_bool(self.store_blob_content_md5);
        w.put_bool(self.use_transactional_md5);
        w.put_u32(self.retry_count);
        w.put_u64(self.retry_interval.as_millis() as u64);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(RequestOptions {
            server_timeout: r.opt_u64()?.map(Duration::from_millis),
            maximum_execution_time: r.opt_u64()?.map(Duration::from_millis),
            store_blob_content_md5: r.bool()?,
            use_transactional_md5: r.bool()?,
            retry_count: r.u32()?,
            retry_interval: Duration::from_millis(r.u64()?),
        })
    }
}

/// Parsed blob URI: `<scheme>://<host>/<container>[/<blob path>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobUri {
    pub endpoint: String,
    pub container: String,
    pub blob: String,
}

impl BlobUri {
    pub fn parse(uri: &str) -> Result<BlobUri> {
        let trimmed = uri.trim();
        let scheme_end = trimmed.find("://").ok_or_else(|| {
            TransferError::Uncategorized(format!("blob uri has no scheme: {uri}"))
        })?;
        let rest = &trimmed[scheme_end + 3..];
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        if host.is_empty() {
            return Err(TransferError::Uncategorized(format!(
                "blob uri has no host: {uri}"
            )));
        }
        let (container, blob) = path.split_once('/').unwrap_or((path, ""));
        if container.is_empty() {
            return Err(TransferError::Uncategorized(format!(
                "blob uri has no container: {uri}"
            )));
        }
        Ok(BlobUri {
            endpoint: format!("{}://{}", &trimmed[..scheme_end], host),
            container: container.to_string(),
            blob: blob.to_string(),
        })
    }

    /// URI of a blob under this one, treating `blob` as a directory prefix.
    pub fn join(&self, rel: &str) -> BlobUri {
        let mut blob = self.blob.clone();
        if !blob.is_empty() && !blob.ends_with('/') {
            blob.push('/');
        }
        blob.push_str(rel);
        BlobUri {
            endpoint: self.endpoint.clone(),
            container: self.container.clone(),
            blob,
        }
    }

    pub fn to_uri_string(&self) -> String {
        if self.blob.is_empty() {
            format!("{}/{}", self.endpoint, self.container)
        } else {
            format!("{}/{}/{}", self.endpoint, self.container, self.blob)
        }
    }
}

impl std::fmt::Display for BlobUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_uri_string())
    }
}

#[derive(Debug, Clone)]
pub struct BlobLocation {
    pub uri: BlobUri,
    pub snapshot: Option<String>,
    pub blob_type: BlobType,
    pub credentials: Credentials,
    pub access_condition: Option<AccessCondition>,
    pub request_options: RequestOptions,
}

impl BlobLocation {
    pub fn new(uri: BlobUri, blob_type: BlobType, credentials: Credentials) -> Self {
        BlobLocation {
            uri,
            snapshot: None,
            blob_type,
            credentials,
            access_condition: None,
            request_options: RequestOptions::default(),
        }
    }

    pub fn identity(&self) -> String {
        match &self.snapshot {
            Some(s) => format!("{}?snapshot={s}", self.uri),
            None => self.uri.to_uri_string(),
        }
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.put_str(&self.uri.to_uri_string());
        w.put_opt_str(self.snapshot.as_deref());
        w.put_u8(self.blob_type.tag());
        self.credentials.encode(w);
        match &self.access_condition {
            Some(c) => {
                w.put_u8(1);
                w.put_opt_str(c.if_match_etag.as_deref());
            }
            None => w.put_u8(0),
        }
        self.request_options.encode(w);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let uri = BlobUri::parse(&r.str()?)?;
        let snapshot = r.opt_str()?;
        let blob_type = BlobType::from_tag(r.u8()?)?;
        let credentials = Credentials::decode(r)?;
        let access_condition = if r.u8()? == 1 {
            Some(AccessCondition {
                if_match_etag: r.opt_str()?,
            })
        } else {
            None
        };
        let request_options = RequestOptions::decode(r)?;
        Ok(BlobLocation {
            uri,
            snapshot,
            blob_type,
            credentials,
            access_condition,
            request_options,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BlobDirLocation {
    pub container_uri: BlobUri,
    pub prefix: String,
    pub credentials: Credentials,
    pub request_options: RequestOptions,
}

impl BlobDirLocation {
    pub fn new(container_uri: BlobUri, prefix: String, credentials: Credentials) -> Self {
        BlobDirLocation {
            container_uri,
            prefix,
            credentials,
            request_options: RequestOptions::default(),
        }
    }

    pub fn identity(&self) -> String {
        format!("{}/{}", self.container_uri.to_uri_string(), self.prefix)
    }

    /// Location of one blob under this directory. `rel` uses `/` separators.
    pub fn blob(&self, rel: &str, blob_type: BlobType) -> BlobLocation {
        let mut prefix = self.prefix.clone();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        let mut uri = self.container_uri.clone();
        uri.blob = format!("{prefix}{rel}");
        let mut loc = BlobLocation::new(uri, blob_type, self.credentials.clone());
        loc.request_options = self.request_options.clone();
        loc
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.put_str(&self.container_uri.to_uri_string());
        w.put_str(&self.prefix);
        self.credentials.encode(w);
        self.request_options.encode(w);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(BlobDirLocation {
            container_uri: BlobUri::parse(&r.str()?)?,
            prefix: r.str()?,
            credentials: Credentials::decode(r)?,
            request_options: RequestOptions::decode(r)?,
        })
    }
}

/// An in-memory stream endpoint. Shared, seekable, never serialized.
#[derive(Clone)]
pub struct StreamHandle {
    buf: Arc<Mutex<Cursor<Vec<u8>>>>,
}

impl StreamHandle {
    pub fn new(initial: Vec<u8>) -> Self {
        StreamHandle {
            buf: Arc::new(Mutex::new(Cursor::new(initial))),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().get_ref().clone()
    }

    pub fn len(&self) -> u64 {
        self.buf.lock().get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let cursor = self.buf.lock();
        let data = cursor.get_ref();
        if offset >= data.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) {
        let mut cursor = self.buf.lock();
        let vec = cursor.get_mut();
        let end = offset as usize + data.len();
        if vec.len() < end {
            vec.resize(end, 0);
        }
        vec[offset as usize..end].copy_from_slice(data);
    }

    fn identity(&self) -> String {
        format!("stream:{:p}", Arc::as_ptr(&self.buf))
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum TransferLocation {
    LocalFile {
        path: PathBuf,
        rel_path: Option<String>,
    },
    LocalDirectory {
        dir: PathBuf,
    },
    RemoteBlob(BlobLocation),
    RemoteBlobDirectory(BlobDirLocation),
    Stream(StreamHandle),
    SourceUri {
        uri: String,
    },
}

impl TransferLocation {
    pub fn local_file(path: impl Into<PathBuf>) -> Self {
        TransferLocation::LocalFile {
            path: path.into(),
            rel_path: None,
        }
    }

    pub fn local_directory(dir: impl Into<PathBuf>) -> Self {
        TransferLocation::LocalDirectory { dir: dir.into() }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TransferLocation::LocalFile { .. } => "local file",
            TransferLocation::LocalDirectory { .. } => "local directory",
            TransferLocation::RemoteBlob(_) => "blob",
            TransferLocation::RemoteBlobDirectory(_) => "blob directory",
            TransferLocation::Stream(_) => "stream",
            TransferLocation::SourceUri { .. } => "uri",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(
            self,
            TransferLocation::LocalFile { .. }
                | TransferLocation::LocalDirectory { .. }
                | TransferLocation::Stream(_)
        )
    }

    pub fn is_directory(&self) -> bool {
        matches!(
            self,
            TransferLocation::LocalDirectory { .. } | TransferLocation::RemoteBlobDirectory(_)
        )
    }

    /// Stable string identity used in the `(source, destination)` transfer
    /// key. Credentials and request options are deliberately excluded.
    pub fn identity(&self) -> String {
        match self {
            TransferLocation::LocalFile { path, .. } => format!("file://{}", path.display()),
            TransferLocation::LocalDirectory { dir } => format!("dir://{}", dir.display()),
            TransferLocation::RemoteBlob(b) => b.identity(),
            TransferLocation::RemoteBlobDirectory(d) => d.identity(),
            TransferLocation::Stream(s) => s.identity(),
            TransferLocation::SourceUri { uri } => uri.clone(),
        }
    }

    /// Swap in fresh credentials on resume. No-op for local endpoints.
    pub fn update_credentials(&mut self, credentials: Credentials) {
        match self {
            TransferLocation::RemoteBlob(b) => b.credentials = credentials,
            TransferLocation::RemoteBlobDirectory(d) => d.credentials = credentials,
            _ => {}
        }
    }

    pub fn as_blob(&self) -> Option<&BlobLocation> {
        match self {
            TransferLocation::RemoteBlob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_local_path(&self) -> Option<&Path> {
        match self {
            TransferLocation::LocalFile { path, .. } => Some(path),
            TransferLocation::LocalDirectory { dir } => Some(dir),
            _ => None,
        }
    }

    pub fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        match self {
            TransferLocation::LocalFile { path, rel_path } => {
                w.put_u8(0);
                w.put_str(&path.to_string_lossy());
                w.put_opt_str(rel_path.as_deref());
            }
            TransferLocation::LocalDirectory { dir } => {
                w.put_u8(1);
                w.put_str(&dir.to_string_lossy());
            }
            TransferLocation::RemoteBlob(b) => {
                w.put_u8(2);
                b.encode(w);
            }
            TransferLocation::RemoteBlobDirectory(d) => {
                w.put_u8(3);
                d.encode(w);
            }
            TransferLocation::SourceUri { uri } => {
                w.put_u8(4);
                w.put_str(uri);
            }
            TransferLocation::Stream(_) => return Err(TransferError::StreamNotResumable),
        }
        Ok(())
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match r.u8()? {
            0 => TransferLocation::LocalFile {
                path: PathBuf::from(r.str()?),
                rel_path: r.opt_str()?,
            },
            1 => TransferLocation::LocalDirectory {
                dir: PathBuf::from(r.str()?),
            },
            2 => TransferLocation::RemoteBlob(BlobLocation::decode(r)?),
            3 => TransferLocation::RemoteBlobDirectory(BlobDirLocation::decode(r)?),
            4 => TransferLocation::SourceUri { uri: r.str()? },
            other => {
                return Err(TransferError::JournalCorrupt(format!(
                    "unknown location tag {other}"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_blob_uri() {
        let uri = BlobUri::parse("https://acct.blob.example.net/stuff/a/b.txt").unwrap();
        assert_eq!(uri.endpoint, "https://acct.blob.example.net");
        assert_eq!(uri.container, "stuff");
        assert_eq!(uri.blob, "a/b.txt");

        let container = BlobUri::parse("https://acct.blob.example.net/stuff").unwrap();
        assert_eq!(container.blob, "");
        assert!(BlobUri::parse("no-scheme/x").is_err());
        assert!(BlobUri::parse("https://host-only").is_err());
    }

    #[test]
    fn blob_dir_child() {
        let dir = BlobDirLocation::new(
            BlobUri::parse("https://e/c").unwrap(),
            "pre".into(),
            Credentials::Anonymous,
        );
        let child = dir.blob("sub/f.bin", BlobType::Block);
        assert_eq!(child.uri.blob, "pre/sub/f.bin");
        assert_eq!(child.uri.container, "c");
    }

    #[test]
    fn location_round_trip() {
        let locations = vec![
            TransferLocation::local_file("/tmp/a"),
            TransferLocation::local_directory("/tmp/d"),
            TransferLocation::RemoteBlob(BlobLocation {
                uri: BlobUri::parse("https://e/c/b").unwrap(),
                snapshot: Some("2026-01-01".into()),
                blob_type: BlobType::Append,
                credentials: Credentials::Sas {
                    token: "sig=abc".into(),
                },
                access_condition: Some(AccessCondition {
                    if_match_etag: Some("etag-1".into()),
                }),
                request_options: RequestOptions {
                    store_blob_content_md5: true,
                    ..RequestOptions::default()
                },
            }),
            TransferLocation::RemoteBlobDirectory(BlobDirLocation::new(
                BlobUri::parse("https://e/c").unwrap(),
                "p/q".into(),
                Credentials::SharedKey {
                    account: "acct".into(),
                    key: "k".into(),
                },
            )),
            TransferLocation::SourceUri {
                uri: "https://elsewhere/object".into(),
            },
        ];
        for loc in locations {
            let mut w = ByteWriter::new();
            loc.encode(&mut w).unwrap();
            let bytes = w.into_bytes();
            let decoded = TransferLocation::decode(&mut ByteReader::new(&bytes)).unwrap();
            assert_eq!(decoded.identity(), loc.identity());
        }
    }

    #[test]
    fn streams_never_serialize() {
        let loc = TransferLocation::Stream(StreamHandle::new(vec![1, 2, 3]));
        let mut w = ByteWriter::new();
        assert!(matches!(
            loc.encode(&mut w),
            Err(TransferError::StreamNotResumable)
        ));
    }

    #[test]
    fn credential_refresh_keeps_identity() {
        let mut loc = TransferLocation::RemoteBlob(BlobLocation::new(
            BlobUri::parse("https://e/c/b").unwrap(),
            BlobType::Block,
            Credentials::Anonymous,
        ));
        let before = loc.identity();
        loc.update_credentials(Credentials::Sas {
            token: "sig=new".into(),
        });
        assert_eq!(loc.identity(), before);
        match loc {
            TransferLocation::RemoteBlob(b) => {
                assert_eq!(
                    b.credentials,
                    Credentials::Sas {
                        token: "sig=new".into()
                    }
                );
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn stream_random_access() {
        let s = StreamHandle::new(Vec::new());
        s.write_at(4, b"abcd");
        assert_eq!(s.len(), 8);
        let mut buf = [0u8; 8];
        let n = s.read_at(0, &mut buf);
        assert_eq!(n, 8);
        assert_eq!(&buf, b"\0\0\0\0abcd");
        assert_eq!(s.read_at(8, &mut buf), 0);
    }
}
