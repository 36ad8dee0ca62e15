//! # Chunk Codec (encode side)
//!
//! Turns a list of top-level file-system entries into the ordered chunk stream
//! that `StartTransfer` delivers. The walk is depth-first with every directory
//! emitted before its children and siblings sorted by file name, so both ends
//! agree on the order without negotiating it.
//!
//! Per entry:
//! - directory: exactly one chunk, no payload, carrying its mtime
//! - file: one chunk per `chunk_size` bytes; only the first carries the mtime.
//!   An empty file still produces one empty chunk.
//! - symlink: one chunk carrying the link target
//!
//! [`ChunkReader`] is a one-shot iterator. A read failure yields one `Err` and
//! then the sequence ends; cancellation is observed between chunks.

use serde::{Deserialize, Serialize};
use std::fs::{File, Metadata};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use walkdir::WalkDir;

/// Default payload size of a file chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

/// Modification time as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTime {
    pub seconds: u64,
    pub micros: u32,
}

impl FileTime {
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self {
            seconds: since_epoch.as_secs(),
            micros: since_epoch.subsec_micros(),
        }
    }

    /// `None` when the value is not a representable instant, e.g. `micros` of a
    /// second or more, or seconds past what the platform's clock can hold.
    pub fn to_system_time(self) -> Option<SystemTime> {
        if self.micros >= 1_000_000 {
            return None;
        }
        UNIX_EPOCH.checked_add(Duration::new(self.seconds, self.micros * 1_000))
    }
}

/// One unit of the transfer stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// `/`-separated path whose first component is a top-level entry name.
    pub relative_path: String,
    pub entry_type: EntryType,
    pub mode: u32,
    pub time: Option<FileTime>,
    pub payload: Vec<u8>,
    pub symlink_target: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("unsupported entry at {0}")]
    UnsupportedEntry(PathBuf),
    #[error("{0} has no usable file name")]
    InvalidName(PathBuf),
}

impl ChunkError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ChunkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Shared cancellation flag, checked at chunk boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Size and entry count of a set of top-level entries, as announced in a transfer request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub total_size: u64,
    pub entry_count: u64,
}

/// Walk the entries the same way [`ChunkReader`] will and add them up.
pub fn scan_totals(paths: &[PathBuf]) -> Result<TransferTotals, ChunkError> {
    let mut totals = TransferTotals::default();

    for root in paths {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root.as_path()).to_path_buf();
                ChunkError::Io {
                    source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk error")),
                    path,
                }
            })?;
            let file_type = entry.file_type();
            if file_type.is_file() {
                let metadata = entry.metadata().map_err(|e| ChunkError::Io {
                    path: entry.path().to_path_buf(),
                    source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("metadata")),
                })?;
                totals.total_size += metadata.len();
            } else if !file_type.is_dir() && !file_type.is_symlink() {
                continue;
            }
            totals.entry_count += 1;
        }
    }

    Ok(totals)
}

/// Base name of a top-level entry, which becomes the first component of every
/// relative path under it.
pub fn top_level_name(path: &Path) -> Result<String, ChunkError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ChunkError::InvalidName(path.to_path_buf()))
}

struct OpenFile {
    file: File,
    path: PathBuf,
    relative_path: String,
    mode: u32,
    time: FileTime,
    first: bool,
}

/// Lazy, one-shot producer of [`Chunk`]s for a set of top-level entries.
pub struct ChunkReader {
    roots: std::vec::IntoIter<PathBuf>,
    current_root: Option<(PathBuf, walkdir::IntoIter)>,
    open_file: Option<OpenFile>,
    chunk_size: usize,
    cancel: CancelHandle,
    done: bool,
}

impl ChunkReader {
    pub fn new(paths: Vec<PathBuf>, chunk_size: usize, cancel: CancelHandle) -> Self {
        Self {
            roots: paths.into_iter(),
            current_root: None,
            open_file: None,
            chunk_size: chunk_size.max(1),
            cancel,
            done: false,
        }
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkError> {
        if self.cancel.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }

        if let Some(chunk) = self.read_open_file()? {
            return Ok(Some(chunk));
        }

        loop {
            if self.current_root.is_none() {
                match self.roots.next() {
                    Some(root) => {
                        let parent = root.parent().map(Path::to_path_buf).unwrap_or_default();
                        let walker = WalkDir::new(&root)
                            .follow_links(false)
                            .sort_by_file_name()
                            .into_iter();
                        self.current_root = Some((parent, walker));
                    }
                    None => return Ok(None),
                }
            }

            let Some((parent, walker)) = self.current_root.as_mut() else {
                continue;
            };

            let entry = match walker.next() {
                Some(entry) => entry.map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                    ChunkError::Io { path, source }
                })?,
                None => {
                    self.current_root = None;
                    continue;
                }
            };

            let path = entry.path().to_path_buf();
            let relative_path = wire_relative_path(parent, &path)?;
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| ChunkError::io(&path, e))?;
            let file_type = metadata.file_type();
            let time = metadata.modified().ok().map(FileTime::from_system_time);

            if file_type.is_dir() {
                debug!("Chunking directory {}", relative_path);
                return Ok(Some(Chunk {
                    relative_path,
                    entry_type: EntryType::Directory,
                    mode: entry_mode(&metadata, 0o755),
                    time,
                    payload: Vec::new(),
                    symlink_target: String::new(),
                }));
            }

            if file_type.is_symlink() {
                let target = std::fs::read_link(&path).map_err(|e| ChunkError::io(&path, e))?;
                return Ok(Some(Chunk {
                    relative_path,
                    entry_type: EntryType::Symlink,
                    mode: entry_mode(&metadata, 0o777),
                    time,
                    payload: Vec::new(),
                    symlink_target: target.to_string_lossy().into_owned(),
                }));
            }

            if file_type.is_file() {
                debug!("Chunking file {}", relative_path);
                let file = File::open(&path).map_err(|e| ChunkError::io(&path, e))?;
                self.open_file = Some(OpenFile {
                    file,
                    path,
                    relative_path,
                    mode: entry_mode(&metadata, 0o644),
                    time: time.unwrap_or(FileTime {
                        seconds: 0,
                        micros: 0,
                    }),
                    first: true,
                });
                if let Some(chunk) = self.read_open_file()? {
                    return Ok(Some(chunk));
                }
                continue;
            }

            return Err(ChunkError::UnsupportedEntry(path));
        }
    }

    fn read_open_file(&mut self) -> Result<Option<Chunk>, ChunkError> {
        let Some(open) = self.open_file.as_mut() else {
            return Ok(None);
        };

        let mut payload = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < payload.len() {
            let n = open
                .file
                .read(&mut payload[filled..])
                .map_err(|e| ChunkError::io(&open.path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        payload.truncate(filled);

        if filled == 0 && !open.first {
            self.open_file = None;
            return Ok(None);
        }

        let chunk = Chunk {
            relative_path: open.relative_path.clone(),
            entry_type: EntryType::File,
            mode: open.mode,
            time: open.first.then_some(open.time),
            payload,
            symlink_target: String::new(),
        };
        open.first = false;

        if filled < self.chunk_size {
            self.open_file = None;
        }

        Ok(Some(chunk))
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Chunk, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.open_file = None;
                Some(Err(e))
            }
        }
    }
}

fn wire_relative_path(parent: &Path, path: &Path) -> Result<String, ChunkError> {
    let relative = path
        .strip_prefix(parent)
        .map_err(|_| ChunkError::InvalidName(path.to_path_buf()))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| ChunkError::InvalidName(path.to_path_buf()))?;
        parts.push(part);
    }

    if parts.is_empty() {
        return Err(ChunkError::InvalidName(path.to_path_buf()));
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn entry_mode(metadata: &Metadata, _fallback: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(_metadata: &Metadata, fallback: u32) -> u32 {
    fallback
}
