//! Source enumeration: lazy, restartable entry sequences
//!
//! Every enumerator yields file, directory, and error entries in a
//! deterministic order (lexicographic within a directory level) and keeps a
//! continuation token current as it goes. Resuming with a token yields
//! exactly the entries that would have followed had enumeration not been
//! interrupted, provided the source tree is unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::{BlobClient, BlobItem, ListItem};
use crate::error::{Result, TransferError};
use crate::journal::codec::{ByteReader, ByteWriter};
use crate::location::BlobDirLocation;

/// Opaque resume point for an enumerator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ContinuationToken {
    #[default]
    Start,
    /// Local walks record the last relative path yielded.
    Local { last_rel: String },
    /// Blob listings record the service marker of the current page and the
    /// last name yielded within it.
    Blob {
        marker: Option<String>,
        last_name: Option<String>,
    },
    Done,
}

impl ContinuationToken {
    pub fn encode(&self, w: &mut ByteWriter) {
        match self {
            ContinuationToken::Start => w.put_u8(0),
            ContinuationToken::Local { last_rel } => {
                w.put_u8(1);
                w.put_str(last_rel);
            }
            ContinuationToken::Blob { marker, last_name } => {
                w.put_u8(2);
                w.put_opt_str(marker.as_deref());
                w.put_opt_str(last_name.as_deref());
            }
            ContinuationToken::Done => w.put_u8(3),
        }
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match r.u8()? {
            0 => ContinuationToken::Start,
            1 => ContinuationToken::Local { last_rel: r.str()? },
            2 => ContinuationToken::Blob {
                marker: r.opt_str()?,
                last_name: r.opt_str()?,
            },
            3 => ContinuationToken::Done,
            other => {
                return Err(TransferError::JournalCorrupt(format!(
                    "unknown continuation token tag {other}"
                )))
            }
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(&mut ByteReader::new(bytes))
    }
}

/// Where a file entry's bytes live.
#[derive(Debug, Clone)]
pub enum EntrySource {
    LocalFile { full_path: PathBuf },
    Blob(BlobItem),
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the enumeration root. `/`-separated for blobs,
    /// platform-separated for local walks.
    pub rel_path: String,
    pub size: Option<u64>,
    pub source: EntrySource,
}

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub rel_path: String,
}

#[derive(Debug)]
pub struct ErrorEntry {
    pub rel_path: Option<String>,
    pub error: TransferError,
}

#[derive(Debug)]
pub enum TransferEntry {
    File(FileEntry),
    Directory(DirectoryEntry),
    Error(ErrorEntry),
}

#[async_trait]
pub trait TransferEnumerator: Send {
    /// Next entry, or `None` when exhausted.
    async fn next_entry(&mut self) -> Option<TransferEntry>;

    /// Token describing the position just after the last yielded entry.
    fn continuation_token(&self) -> ContinuationToken;
}

/// Wildcard match supporting `*` as a leading, trailing, or surrounding
/// run around a required fragment.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.contains('*') {
        if pattern.starts_with('*') && pattern.ends_with('*') {
            let middle = &pattern[1..pattern.len() - 1];
            return text.contains(middle);
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            return text.ends_with(suffix);
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            return text.starts_with(prefix);
        }
    }
    pattern == text
}

fn matches_pattern(pattern: Option<&str>, name: &str) -> bool {
    match pattern {
        Some(p) => glob_match(p, name),
        None => true,
    }
}

/// Flat local enumerator: files only, in depth-first lexicographic order.
pub struct LocalFileEnumerator {
    root: PathBuf,
    walker: walkdir::IntoIter,
    search_pattern: Option<String>,
    token: ContinuationToken,
    /// Set while resuming: entries are discarded until this one is seen.
    skip_through: Option<String>,
}

impl LocalFileEnumerator {
    pub fn new(
        root: impl Into<PathBuf>,
        recursive: bool,
        follow_symlink: bool,
        search_pattern: Option<String>,
        resume: ContinuationToken,
    ) -> Self {
        let root = root.into();
        let mut walk = walkdir::WalkDir::new(&root)
            .follow_links(follow_symlink)
            .sort_by_file_name();
        if !recursive {
            walk = walk.max_depth(1);
        }
        let (token, skip_through) = match resume {
            ContinuationToken::Local { last_rel } => (
                ContinuationToken::Local {
                    last_rel: last_rel.clone(),
                },
                Some(last_rel),
            ),
            ContinuationToken::Done => (ContinuationToken::Done, None),
            _ => (ContinuationToken::Start, None),
        };
        LocalFileEnumerator {
            root,
            walker: walk.into_iter(),
            search_pattern,
            token,
            skip_through,
        }
    }

    fn rel_of(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

#[async_trait]
impl TransferEnumerator for LocalFileEnumerator {
    async fn next_entry(&mut self) -> Option<TransferEntry> {
        if self.token == ContinuationToken::Done {
            return None;
        }
        loop {
            let next = match self.walker.next() {
                Some(n) => n,
                None => {
                    self.token = ContinuationToken::Done;
                    return None;
                }
            };
            let entry = match next {
                Ok(e) => e,
                Err(e) => {
                    let rel = e.path().map(|p| self.rel_of(p));
                    return Some(TransferEntry::Error(ErrorEntry {
                        rel_path: rel.clone(),
                        error: TransferError::FailToEnumerateDirectory {
                            path: rel.unwrap_or_else(|| self.root.display().to_string()),
                            source: Box::new(TransferError::Uncategorized(e.to_string())),
                        },
                    }));
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = self.rel_of(entry.path());
            if self.skip_through.is_some() {
                if self.skip_through.as_deref() == Some(rel.as_str()) {
                    self.skip_through = None;
                }
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !matches_pattern(self.search_pattern.as_deref(), &name) {
                continue;
            }
            let size = entry.metadata().ok().map(|m| m.len());
            self.token = ContinuationToken::Local {
                last_rel: rel.clone(),
            };
            return Some(TransferEntry::File(FileEntry {
                rel_path: rel,
                size,
                source: EntrySource::LocalFile {
                    full_path: entry.path().to_path_buf(),
                },
            }));
        }
    }

    fn continuation_token(&self) -> ContinuationToken {
        self.token.clone()
    }
}

/// Hierarchical local enumerator: one directory level, files and child
/// directories, lexicographic. The parent recurses one directory at a time.
pub struct LocalHierarchyEnumerator {
    entries: std::vec::IntoIter<TransferEntry>,
    token: ContinuationToken,
}

impl LocalHierarchyEnumerator {
    pub fn new(
        root: &Path,
        sub_rel: &str,
        follow_symlink: bool,
        search_pattern: Option<&str>,
        resume: ContinuationToken,
    ) -> Self {
        let dir = if sub_rel.is_empty() {
            root.to_path_buf()
        } else {
            root.join(sub_rel)
        };
        let mut collected = Vec::new();
        match std::fs::read_dir(&dir) {
            Ok(read) => {
                let mut named: Vec<(String, std::fs::DirEntry)> = read
                    .filter_map(|e| e.ok())
                    .map(|e| (e.file_name().to_string_lossy().into_owned(), e))
                    .collect();
                named.sort_by(|a, b| a.0.cmp(&b.0));
                let resume_after = match &resume {
                    ContinuationToken::Local { last_rel } => Some(last_rel.clone()),
                    _ => None,
                };
                for (name, entry) in named {
                    if let Some(after) = &resume_after {
                        if name.as_str() <= after.as_str() {
                            continue;
                        }
                    }
                    let rel = join_rel(sub_rel, &name);
                    let file_type = if follow_symlink {
                        entry.path().metadata().map(|m| m.file_type())
                    } else {
                        entry.file_type()
                    };
                    match file_type {
                        Ok(ft) if ft.is_dir() => {
                            collected.push(TransferEntry::Directory(DirectoryEntry {
                                rel_path: rel,
                            }));
                        }
                        Ok(ft) if ft.is_file() => {
                            if matches_pattern(search_pattern, &name) {
                                let size = entry.metadata().ok().map(|m| m.len());
                                collected.push(TransferEntry::File(FileEntry {
                                    rel_path: rel,
                                    size,
                                    source: EntrySource::LocalFile {
                                        full_path: entry.path(),
                                    },
                                }));
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            collected.push(TransferEntry::Error(ErrorEntry {
                                rel_path: Some(rel.clone()),
                                error: TransferError::io(entry.path(), e),
                            }));
                        }
                    }
                }
            }
            Err(e) => {
                collected.push(TransferEntry::Error(ErrorEntry {
                    rel_path: Some(sub_rel.to_string()),
                    error: TransferError::FailToEnumerateDirectory {
                        path: dir.display().to_string(),
                        source: Box::new(TransferError::io(dir.clone(), e)),
                    },
                }));
            }
        }
        let token = match resume {
            ContinuationToken::Done => ContinuationToken::Done,
            other @ ContinuationToken::Local { .. } => other,
            _ => ContinuationToken::Start,
        };
        LocalHierarchyEnumerator {
            entries: collected.into_iter(),
            token,
        }
    }
}

fn join_rel(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}{}{name}", std::path::MAIN_SEPARATOR)
    }
}

#[async_trait]
impl TransferEnumerator for LocalHierarchyEnumerator {
    async fn next_entry(&mut self) -> Option<TransferEntry> {
        match self.entries.next() {
            Some(entry) => {
                if let TransferEntry::File(f) = &entry {
                    let name = Path::new(&f.rel_path)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| f.rel_path.clone());
                    self.token = ContinuationToken::Local { last_rel: name };
                } else if let TransferEntry::Directory(d) = &entry {
                    let name = Path::new(&d.rel_path)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| d.rel_path.clone());
                    self.token = ContinuationToken::Local { last_rel: name };
                }
                Some(entry)
            }
            None => {
                self.token = ContinuationToken::Done;
                None
            }
        }
    }

    fn continuation_token(&self) -> ContinuationToken {
        self.token.clone()
    }
}

/// Flat blob enumerator: every blob under the directory prefix, paged
/// through the service listing.
pub struct BlobFlatEnumerator {
    client: Arc<dyn BlobClient>,
    directory: BlobDirLocation,
    search_pattern: Option<String>,
    /// Forwarded to the listing when the collaborator supports snapshot
    /// enumeration.
    pub include_snapshots: bool,
    page: std::collections::VecDeque<BlobItem>,
    marker: Option<String>,
    last_name: Option<String>,
    exhausted: bool,
    no_more_pages: bool,
    page_size: usize,
}

impl BlobFlatEnumerator {
    pub const DEFAULT_PAGE_SIZE: usize = 250;

    pub fn new(
        client: Arc<dyn BlobClient>,
        directory: BlobDirLocation,
        search_pattern: Option<String>,
        include_snapshots: bool,
        resume: ContinuationToken,
    ) -> Self {
        // On resume the last yielded name is the authoritative position: the
        // saved page marker points past entries that were fetched but never
        // yielded.
        let (marker, last_name, exhausted) = match resume {
            ContinuationToken::Blob { marker, last_name } => {
                (last_name.clone().or(marker), last_name, false)
            }
            ContinuationToken::Done => (None, None, true),
            _ => (None, None, false),
        };
        BlobFlatEnumerator {
            client,
            directory,
            search_pattern,
            include_snapshots,
            page: Default::default(),
            marker,
            last_name,
            exhausted,
            no_more_pages: false,
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    async fn fill_page(&mut self) -> Result<()> {
        let segment = self
            .client
            .list_blobs_segmented(
                &self.directory,
                None,
                self.marker.as_deref(),
                self.page_size,
            )
            .await?;
        for item in segment.items {
            if let ListItem::Blob(blob) = item {
                if let Some(last) = &self.last_name {
                    if blob.name.as_str() <= last.as_str() {
                        continue;
                    }
                }
                self.page.push_back(blob);
            }
        }
        self.no_more_pages = segment.next_token.is_none();
        self.marker = segment.next_token;
        Ok(())
    }
}

#[async_trait]
impl TransferEnumerator for BlobFlatEnumerator {
    async fn next_entry(&mut self) -> Option<TransferEntry> {
        loop {
            if self.exhausted {
                return None;
            }
            if let Some(blob) = self.page.pop_front() {
                let name = blob
                    .name
                    .rsplit('/')
                    .next()
                    .unwrap_or(blob.name.as_str())
                    .to_string();
                self.last_name = Some(blob.name.clone());
                if !matches_pattern(self.search_pattern.as_deref(), &name) {
                    continue;
                }
                return Some(TransferEntry::File(FileEntry {
                    rel_path: blob.name.clone(),
                    size: Some(blob.length),
                    source: EntrySource::Blob(blob),
                }));
            }
            if self.no_more_pages {
                self.exhausted = true;
                return None;
            }
            if let Err(error) = self.fill_page().await {
                self.exhausted = true;
                return Some(TransferEntry::Error(ErrorEntry {
                    rel_path: None,
                    error: TransferError::FailToEnumerateDirectory {
                        path: self.directory.identity(),
                        source: Box::new(error),
                    },
                }));
            }
        }
    }

    fn continuation_token(&self) -> ContinuationToken {
        if self.exhausted {
            ContinuationToken::Done
        } else {
            ContinuationToken::Blob {
                marker: self.marker.clone(),
                last_name: self.last_name.clone(),
            }
        }
    }
}

/// Hierarchical blob enumerator: one level under the prefix via delimiter
/// folding; reports both blobs and child directory prefixes.
pub struct BlobHierarchyEnumerator {
    client: Arc<dyn BlobClient>,
    directory: BlobDirLocation,
    sub_rel: String,
    delimiter: char,
    search_pattern: Option<String>,
    page: std::collections::VecDeque<ListItem>,
    marker: Option<String>,
    last_name: Option<String>,
    exhausted: bool,
    no_more_pages: bool,
    page_size: usize,
}

impl BlobHierarchyEnumerator {
    pub fn new(
        client: Arc<dyn BlobClient>,
        directory: &BlobDirLocation,
        sub_rel: &str,
        delimiter: char,
        search_pattern: Option<String>,
        resume: ContinuationToken,
    ) -> Self {
        // Listing happens under the sub-directory's own prefix.
        let mut scoped = directory.clone();
        if !sub_rel.is_empty() {
            let mut prefix = scoped.prefix.clone();
            if !prefix.is_empty() && !prefix.ends_with(delimiter) {
                prefix.push(delimiter);
            }
            prefix.push_str(sub_rel);
            scoped.prefix = prefix;
        }
        let (marker, last_name, exhausted) = match resume {
            ContinuationToken::Blob { marker, last_name } => {
                (last_name.clone().or(marker), last_name, false)
            }
            ContinuationToken::Done => (None, None, true),
            _ => (None, None, false),
        };
        BlobHierarchyEnumerator {
            client,
            directory: scoped,
            sub_rel: sub_rel.to_string(),
            delimiter,
            search_pattern,
            page: Default::default(),
            marker,
            last_name,
            exhausted,
            no_more_pages: false,
            page_size: BlobFlatEnumerator::DEFAULT_PAGE_SIZE,
        }
    }

    fn qualify(&self, name: &str) -> String {
        if self.sub_rel.is_empty() {
            name.to_string()
        } else {
            format!("{}{}{name}", self.sub_rel, self.delimiter)
        }
    }
}

#[async_trait]
impl TransferEnumerator for BlobHierarchyEnumerator {
    async fn next_entry(&mut self) -> Option<TransferEntry> {
        loop {
            if self.exhausted {
                return None;
            }
            if let Some(item) = self.page.pop_front() {
                match item {
                    ListItem::Prefix(p) => {
                        let position = format!("{p}{}\u{10FFFF}", self.delimiter);
                        if self.last_name.as_deref().is_some_and(|l| position.as_str() <= l) {
                            continue;
                        }
                        self.last_name = Some(position);
                        return Some(TransferEntry::Directory(DirectoryEntry {
                            rel_path: self.qualify(&p),
                        }));
                    }
                    ListItem::Blob(blob) => {
                        if self
                            .last_name
                            .as_deref()
                            .is_some_and(|l| blob.name.as_str() <= l)
                        {
                            continue;
                        }
                        self.last_name = Some(blob.name.clone());
                        if !matches_pattern(self.search_pattern.as_deref(), &blob.name) {
                            continue;
                        }
                        let rel = self.qualify(&blob.name);
                        return Some(TransferEntry::File(FileEntry {
                            rel_path: rel,
                            size: Some(blob.length),
                            source: EntrySource::Blob(blob),
                        }));
                    }
                }
            }
            if self.no_more_pages {
                self.exhausted = true;
                return None;
            }
            let segment = match self
                .client
                .list_blobs_segmented(
                    &self.directory,
                    Some(self.delimiter),
                    self.marker.as_deref(),
                    self.page_size,
                )
                .await
            {
                Ok(s) => s,
                Err(error) => {
                    self.exhausted = true;
                    return Some(TransferEntry::Error(ErrorEntry {
                        rel_path: Some(self.sub_rel.clone()),
                        error: TransferError::FailToEnumerateDirectory {
                            path: self.directory.identity(),
                            source: Box::new(error),
                        },
                    }));
                }
            };
            self.no_more_pages = segment.next_token.is_none();
            self.marker = segment.next_token;
            self.page.extend(segment.items);
        }
    }

    fn continuation_token(&self) -> ContinuationToken {
        if self.exhausted {
            ContinuationToken::Done
        } else {
            ContinuationToken::Blob {
                marker: self.marker.clone(),
                last_name: self.last_name.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{BlobUri, Credentials};
    use crate::testing::MemoryBlobStore;
    use std::io::Write;

    fn touch(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    async fn drain(e: &mut dyn TransferEnumerator) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(entry) = e.next_entry().await {
            match entry {
                TransferEntry::File(f) => out.push(f.rel_path),
                TransferEntry::Directory(d) => out.push(format!("{}/", d.rel_path)),
                TransferEntry::Error(e) => panic!("unexpected error entry: {:?}", e.error),
            }
        }
        out
    }

    #[tokio::test]
    async fn local_flat_orders_and_resumes() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["b.txt", "a.txt", "sub/c.txt"] {
            touch(&tmp.path().join(name), b"x");
        }
        let mut e = LocalFileEnumerator::new(
            tmp.path(),
            true,
            false,
            None,
            ContinuationToken::Start,
        );
        let first = match e.next_entry().await.unwrap() {
            TransferEntry::File(f) => f.rel_path,
            other => panic!("expected file, got {other:?}"),
        };
        assert_eq!(first, "a.txt");
        let token = e.continuation_token();

        let mut resumed =
            LocalFileEnumerator::new(tmp.path(), true, false, None, token);
        let rest = drain(&mut resumed).await;
        assert_eq!(rest, vec!["b.txt".to_string(), format!("sub{}c.txt", std::path::MAIN_SEPARATOR)]);
        assert_eq!(resumed.continuation_token(), ContinuationToken::Done);
    }

    #[tokio::test]
    async fn local_flat_applies_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["keep.log", "skip.txt"] {
            touch(&tmp.path().join(name), b"x");
        }
        let mut e = LocalFileEnumerator::new(
            tmp.path(),
            true,
            false,
            Some("*.log".into()),
            ContinuationToken::Start,
        );
        assert_eq!(drain(&mut e).await, vec!["keep.log"]);
    }

    #[tokio::test]
    async fn local_hierarchy_single_level() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("z.txt"), b"x");
        touch(&tmp.path().join("nested/inner.txt"), b"x");
        std::fs::create_dir_all(tmp.path().join("also")).unwrap();

        let mut e = LocalHierarchyEnumerator::new(
            tmp.path(),
            "",
            false,
            None,
            ContinuationToken::Start,
        );
        let got = drain(&mut e).await;
        assert_eq!(got, vec!["also/", "nested/", "z.txt"]);
    }

    #[tokio::test]
    async fn local_hierarchy_resumes_mid_level() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            touch(&tmp.path().join(name), b"x");
        }
        let mut e = LocalHierarchyEnumerator::new(
            tmp.path(),
            "",
            false,
            None,
            ContinuationToken::Local {
                last_rel: "a.txt".into(),
            },
        );
        assert_eq!(drain(&mut e).await, vec!["b.txt", "c.txt"]);
    }

    fn seeded_store() -> (MemoryBlobStore, BlobDirLocation) {
        let store = MemoryBlobStore::new();
        for name in ["a.bin", "n/one.bin", "n/two.bin", "z.bin"] {
            store.insert_blob(
                &format!("https://e/c/{name}"),
                vec![0u8; 4],
                crate::location::BlobType::Block,
                Default::default(),
            );
        }
        let dir = BlobDirLocation::new(
            BlobUri::parse("https://e/c").unwrap(),
            String::new(),
            Credentials::Anonymous,
        );
        (store, dir)
    }

    #[tokio::test]
    async fn blob_flat_pages_and_resumes() {
        let (store, dir) = seeded_store();
        let mut e = BlobFlatEnumerator::new(
            Arc::new(store.clone()),
            dir.clone(),
            None,
            false,
            ContinuationToken::Start,
        );
        e.page_size = 2;
        let first = match e.next_entry().await.unwrap() {
            TransferEntry::File(f) => f.rel_path,
            other => panic!("{other:?}"),
        };
        assert_eq!(first, "a.bin");
        let token = e.continuation_token();

        let mut resumed = BlobFlatEnumerator::new(
            Arc::new(store),
            dir,
            None,
            false,
            token,
        );
        resumed.page_size = 2;
        assert_eq!(
            drain(&mut resumed).await,
            vec!["n/one.bin", "n/two.bin", "z.bin"]
        );
    }

    #[tokio::test]
    async fn blob_hierarchy_reports_prefixes() {
        let (store, dir) = seeded_store();
        let mut e = BlobHierarchyEnumerator::new(
            Arc::new(store.clone()),
            &dir,
            "",
            '/',
            None,
            ContinuationToken::Start,
        );
        assert_eq!(drain(&mut e).await, vec!["a.bin", "n/", "z.bin"]);

        let mut nested = BlobHierarchyEnumerator::new(
            Arc::new(store),
            &dir,
            "n",
            '/',
            None,
            ContinuationToken::Start,
        );
        assert_eq!(drain(&mut nested).await, vec!["n/one.bin", "n/two.bin"]);
    }
}
