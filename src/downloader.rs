//! # Chunk Codec (decode side)
//!
//! [`TransferDownloader`] rebuilds the sender's entries inside a save directory
//! from the chunk stream of one transfer. It is the security boundary of the
//! receiver: every relative path and every symlink target is normalized
//! arithmetically and must land under one of the transfer's announced top-level
//! names. Anything else is rejected before the file system is touched.
//!
//! Text checks alone are not enough once symlinks are allowed, because the file
//! system follows links the transfer itself created. No chunk is ever written
//! through a symlink: a path whose ancestor under the save directory is a link
//! is rejected, and a link target may only step back out (`..`) of components
//! that are real directories on disk.
//!
//! Chunks must arrive in producer order. The first chunk seen for a path
//! creates (and truncates) the file; later chunks append to it and re-apply the
//! recorded modification time.

use crate::chunk::{Chunk, EntryType, FileTime};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid top-level entry name {0:?}")]
    InvalidTopDirBasenames(String),
    #[error("relative path {0:?} escapes the transfer's top-level entries")]
    InvalidRelativePath(String),
    #[error("symlink {path:?} points outside the transfer: {target:?}")]
    InvalidSymLinkTarget { path: String, target: String },
    #[error("directory chunk {0:?} carries no modification time")]
    TimeNotSet(String),
    #[error("chunk {0:?} carries an out-of-range modification time")]
    InvalidTime(String),
    #[error("symlinks are not supported ({0:?})")]
    SymLinksAreNotSupported(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    /// Whether the error is an attempt to leave the save area, as opposed to a
    /// protocol or I/O failure.
    pub fn is_path_violation(&self) -> bool {
        matches!(
            self,
            DownloadError::InvalidTopDirBasenames(_)
                | DownloadError::InvalidRelativePath(_)
                | DownloadError::InvalidSymLinkTarget { .. }
        )
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        DownloadError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Resolve `.` and `..` segments of a `/`-separated path on top of `base`.
/// Returns `None` when a `..` would climb above the start of `base`.
fn normalize<'a>(mut base: Vec<&'a str>, path: &'a str) -> Option<Vec<&'a str>> {
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                base.pop()?;
            }
            other => base.push(other),
        }
    }
    Some(base)
}

fn looks_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('\\')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

fn has_forbidden_chars(path: &str) -> bool {
    path.contains('\\') || path.contains('\0')
}

/// Validate a top-level entry name: it has to normalize to exactly one component.
pub fn sanitize_top_dir_name(name: &str) -> Result<String, DownloadError> {
    let invalid = || {
        warn!(target: "lanwarp::security", "Rejected top-level name {:?}", name);
        DownloadError::InvalidTopDirBasenames(name.to_string())
    };

    if looks_absolute(name) || has_forbidden_chars(name) {
        return Err(invalid());
    }

    match normalize(Vec::new(), name) {
        Some(components) if components.len() == 1 && !name.contains("..") => {
            Ok(components[0].to_string())
        }
        _ => Err(invalid()),
    }
}

/// Receiver-side state for one inbound transfer.
pub struct TransferDownloader {
    top_dir_basenames: HashSet<String>,
    save_directory: PathBuf,
    allow_symlinks: bool,
    seen_paths: HashMap<PathBuf, Option<FileTime>>,
    file_modes: Vec<(PathBuf, u32)>,
    directories: Vec<(PathBuf, FileTime, u32)>,
    current: Option<(PathBuf, File)>,
    bytes_written: u64,
}

impl TransferDownloader {
    pub fn new(
        save_directory: impl Into<PathBuf>,
        top_dir_basenames: &[String],
        allow_symlinks: bool,
    ) -> Result<Self, DownloadError> {
        let mut names = HashSet::new();
        for name in top_dir_basenames {
            names.insert(sanitize_top_dir_name(name)?);
        }

        Ok(Self {
            top_dir_basenames: names,
            save_directory: save_directory.into(),
            allow_symlinks,
            seen_paths: HashMap::new(),
            file_modes: Vec::new(),
            directories: Vec::new(),
            current: None,
            bytes_written: 0,
        })
    }

    pub fn save_directory(&self) -> &Path {
        &self.save_directory
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Map a wire path to a location under the save directory.
    pub fn sanitize_relative_path(&self, relative_path: &str) -> Result<PathBuf, DownloadError> {
        let invalid = || {
            warn!(target: "lanwarp::security", "Rejected relative path {:?}", relative_path);
            DownloadError::InvalidRelativePath(relative_path.to_string())
        };

        if looks_absolute(relative_path) || has_forbidden_chars(relative_path) {
            return Err(invalid());
        }

        let components = normalize(Vec::new(), relative_path).ok_or_else(invalid)?;
        match components.first() {
            Some(first) if self.top_dir_basenames.contains(*first) => {
                let mut local = self.save_directory.clone();
                local.extend(components);
                Ok(local)
            }
            _ => Err(invalid()),
        }
    }

    /// Check that a symlink target stays inside the transfer. Relative targets are
    /// resolved against the link's own directory; the original text is returned.
    /// A `..` may only step out of a component that is a real directory on disk.
    pub fn sanitize_symlink_target(
        &self,
        relative_path: &str,
        target: &str,
    ) -> Result<String, DownloadError> {
        let invalid = || {
            warn!(
                target: "lanwarp::security",
                "Rejected symlink {:?} -> {:?}", relative_path, target
            );
            DownloadError::InvalidSymLinkTarget {
                path: relative_path.to_string(),
                target: target.to_string(),
            }
        };

        if target.is_empty() || looks_absolute(target) || has_forbidden_chars(target) {
            return Err(invalid());
        }

        let mut link_dir = normalize(Vec::new(), relative_path).ok_or_else(invalid)?;
        if link_dir.pop().is_none() {
            return Err(invalid());
        }

        // Walk the target from the link's directory. Once a component is not a
        // real directory here, its `..` would resolve wherever a link points.
        let mut resolved = link_dir;
        let mut opaque = false;
        for segment in target.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if opaque {
                        return Err(invalid());
                    }
                    resolved.pop().ok_or_else(invalid)?;
                }
                other => {
                    resolved.push(other);
                    opaque = opaque || !self.is_real_directory(&resolved);
                }
            }
        }

        match resolved.first() {
            Some(first) if self.top_dir_basenames.contains(*first) => Ok(target.to_string()),
            _ => Err(invalid()),
        }
    }

    fn is_real_directory(&self, components: &[&str]) -> bool {
        let mut path = self.save_directory.clone();
        path.extend(components);
        fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_dir())
    }

    /// Refuse `local` when one of its ancestors below the save directory (or the
    /// path itself, with `include_self`) is a symlink.
    fn reject_symlinked_path(
        &self,
        relative_path: &str,
        local: &Path,
        include_self: bool,
    ) -> Result<(), DownloadError> {
        let Ok(relative) = local.strip_prefix(&self.save_directory) else {
            return Err(DownloadError::InvalidRelativePath(relative_path.to_string()));
        };

        let components: Vec<_> = relative.components().collect();
        let checked = if include_self {
            components.len()
        } else {
            components.len().saturating_sub(1)
        };

        let mut current = self.save_directory.clone();
        for component in &components[..checked] {
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(metadata) if metadata.file_type().is_symlink() => {
                    warn!(
                        target: "lanwarp::security",
                        "Rejected {:?}: {} is a symlink", relative_path, current.display()
                    );
                    return Err(DownloadError::InvalidRelativePath(relative_path.to_string()));
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Apply one chunk to the file system.
    pub fn handle_chunk(&mut self, chunk: &Chunk) -> Result<(), DownloadError> {
        if let Some(time) = chunk.time {
            disk_time(&chunk.relative_path, time)?;
        }

        match chunk.entry_type {
            EntryType::File => self.handle_file(chunk),
            EntryType::Directory => self.handle_directory(chunk),
            EntryType::Symlink => self.handle_symlink(chunk),
        }
    }

    /// Close the open file and restore permissions and directory timestamps.
    /// Directory modes wait until here so a read-only directory still receives its children.
    pub fn finish(&mut self) -> Result<(), DownloadError> {
        self.current = None;

        for (path, mode) in self.file_modes.drain(..) {
            // A later symlink chunk may have replaced the file.
            if !is_symlink(&path) {
                set_mode(&path, mode)?;
            }
        }

        // Writing children moved the directories' mtimes; restore deepest first.
        self.directories
            .sort_by_key(|(path, _, _)| std::cmp::Reverse(path.components().count()));
        for (path, time, mode) in &self.directories {
            set_mode(path, *mode)?;
            let time = disk_time(&path.to_string_lossy(), *time)?;
            filetime::set_file_mtime(path, time).map_err(|e| DownloadError::io(path, e))?;
        }

        Ok(())
    }

    fn handle_file(&mut self, chunk: &Chunk) -> Result<(), DownloadError> {
        let path = self.sanitize_relative_path(&chunk.relative_path)?;
        self.reject_symlinked_path(&chunk.relative_path, &path, false)?;

        match self.seen_paths.get(&path).copied() {
            None => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| DownloadError::io(parent, e))?;
                }
                remove_if_symlink(&path)?;

                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|e| DownloadError::io(&path, e))?;
                file.write_all(&chunk.payload)
                    .map_err(|e| DownloadError::io(&path, e))?;
                if let Some(time) = chunk.time {
                    set_handle_mtime(&file, &path, &chunk.relative_path, time)?;
                }

                debug!("Created {} ({} bytes)", path.display(), chunk.payload.len());
                self.seen_paths.insert(path.clone(), chunk.time);
                self.file_modes.push((path.clone(), chunk.mode));
                self.current = Some((path, file));
            }
            Some(recorded) => {
                let reuse = matches!(&self.current, Some((open, _)) if *open == path);
                if !reuse {
                    self.reject_symlinked_path(&chunk.relative_path, &path, true)?;
                    let file = OpenOptions::new()
                        .append(true)
                        .open(&path)
                        .map_err(|e| DownloadError::io(&path, e))?;
                    self.current = Some((path.clone(), file));
                }

                if let Some((_, file)) = self.current.as_mut() {
                    file.write_all(&chunk.payload)
                        .map_err(|e| DownloadError::io(&path, e))?;
                    if let Some(time) = recorded {
                        set_handle_mtime(file, &path, &chunk.relative_path, time)?;
                    }
                }
            }
        }

        self.bytes_written += chunk.payload.len() as u64;
        Ok(())
    }

    fn handle_directory(&mut self, chunk: &Chunk) -> Result<(), DownloadError> {
        let path = self.sanitize_relative_path(&chunk.relative_path)?;
        let time = chunk
            .time
            .ok_or_else(|| DownloadError::TimeNotSet(chunk.relative_path.clone()))?;
        self.reject_symlinked_path(&chunk.relative_path, &path, true)?;

        fs::create_dir_all(&path).map_err(|e| DownloadError::io(&path, e))?;
        let disk = disk_time(&chunk.relative_path, time)?;
        filetime::set_file_mtime(&path, disk).map_err(|e| DownloadError::io(&path, e))?;

        debug!("Created directory {}", path.display());
        self.seen_paths.insert(path.clone(), Some(time));
        self.directories.push((path, time, chunk.mode));
        Ok(())
    }

    fn handle_symlink(&mut self, chunk: &Chunk) -> Result<(), DownloadError> {
        if !self.allow_symlinks {
            return Err(DownloadError::SymLinksAreNotSupported(chunk.relative_path.clone()));
        }

        let path = self.sanitize_relative_path(&chunk.relative_path)?;
        self.reject_symlinked_path(&chunk.relative_path, &path, false)?;
        let target = self.sanitize_symlink_target(&chunk.relative_path, &chunk.symlink_target)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DownloadError::io(parent, e))?;
        }
        if matches!(&self.current, Some((open, _)) if *open == path) {
            self.current = None;
        }
        create_symlink(&target, &path, &chunk.relative_path)?;

        if let Some(time) = chunk.time {
            let time = disk_time(&chunk.relative_path, time)?;
            filetime::set_symlink_file_times(&path, time, time)
                .map_err(|e| DownloadError::io(&path, e))?;
        }

        self.seen_paths.insert(path, chunk.time);
        Ok(())
    }
}

fn disk_time(relative_path: &str, time: FileTime) -> Result<filetime::FileTime, DownloadError> {
    time.to_system_time()
        .map(filetime::FileTime::from_system_time)
        .ok_or_else(|| DownloadError::InvalidTime(relative_path.to_string()))
}

fn set_handle_mtime(
    file: &File,
    path: &Path,
    relative_path: &str,
    time: FileTime,
) -> Result<(), DownloadError> {
    let time = disk_time(relative_path, time)?;
    filetime::set_file_handle_times(file, None, Some(time)).map_err(|e| DownloadError::io(path, e))
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

fn remove_if_symlink(path: &Path) -> Result<(), DownloadError> {
    if is_symlink(path) {
        fs::remove_file(path).map_err(|e| DownloadError::io(path, e))?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), DownloadError> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| DownloadError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), DownloadError> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, path: &Path, _relative_path: &str) -> Result<(), DownloadError> {
    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path).map_err(|e| DownloadError::io(path, e))?;
    }
    std::os::unix::fs::symlink(target, path).map_err(|e| DownloadError::io(path, e))
}

#[cfg(not(unix))]
fn create_symlink(_target: &str, _path: &Path, relative_path: &str) -> Result<(), DownloadError> {
    Err(DownloadError::SymLinksAreNotSupported(relative_path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn downloader(dir: &TempDir, names: &[&str]) -> TransferDownloader {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        TransferDownloader::new(dir.path(), &names, false).unwrap()
    }

    fn file_chunk(path: &str, payload: &[u8], time: Option<FileTime>) -> Chunk {
        Chunk {
            relative_path: path.to_string(),
            entry_type: EntryType::File,
            mode: 0o644,
            time,
            payload: payload.to_vec(),
            symlink_target: String::new(),
        }
    }

    fn dir_chunk(path: &str, time: Option<FileTime>) -> Chunk {
        Chunk {
            relative_path: path.to_string(),
            entry_type: EntryType::Directory,
            mode: 0o755,
            time,
            payload: Vec::new(),
            symlink_target: String::new(),
        }
    }

    fn symlink_chunk(path: &str, target: &str) -> Chunk {
        Chunk {
            relative_path: path.to_string(),
            entry_type: EntryType::Symlink,
            mode: 0o777,
            time: None,
            payload: Vec::new(),
            symlink_target: target.to_string(),
        }
    }

    const T1: FileTime = FileTime {
        seconds: 1_600_000_000,
        micros: 0,
    };

    fn mtime_secs(path: &Path) -> i64 {
        filetime::FileTime::from_last_modification_time(&fs::metadata(path).unwrap()).unix_seconds()
    }

    #[test]
    fn test_top_dir_names() {
        assert_eq!(sanitize_top_dir_name("versions").unwrap(), "versions");
        assert_eq!(sanitize_top_dir_name("solution (copy).ipynb").unwrap(), "solution (copy).ipynb");

        for bad in ["", ".", "..", "a/b", "/etc", "../x", "a\\b", "C:evil"] {
            assert_matches!(
                sanitize_top_dir_name(bad),
                Err(DownloadError::InvalidTopDirBasenames(_)),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_new_rejects_bad_top_dir_names() {
        let dir = TempDir::new().unwrap();
        let result = TransferDownloader::new(dir.path(), &["../up".to_string()], false);
        assert_matches!(result.err(), Some(DownloadError::InvalidTopDirBasenames(_)));
    }

    #[test]
    fn test_sanitize_relative_path() {
        let dir = TempDir::new().unwrap();
        let d = downloader(&dir, &["versions"]);

        assert_eq!(
            d.sanitize_relative_path("versions/solution (copy).ipynb").unwrap(),
            dir.path().join("versions").join("solution (copy).ipynb")
        );
        assert_eq!(
            d.sanitize_relative_path("versions/../versions/x").unwrap(),
            dir.path().join("versions").join("x")
        );
        assert_matches!(
            d.sanitize_relative_path("solution (copy).ipynb"),
            Err(DownloadError::InvalidRelativePath(_))
        );
        assert_matches!(
            d.sanitize_relative_path("versions/../solution (copy).ipynb"),
            Err(DownloadError::InvalidRelativePath(_))
        );
        assert_matches!(
            d.sanitize_relative_path("../versions/x"),
            Err(DownloadError::InvalidRelativePath(_))
        );
        assert_matches!(
            d.sanitize_relative_path("/versions/x"),
            Err(DownloadError::InvalidRelativePath(_))
        );
        assert_matches!(d.sanitize_relative_path(""), Err(DownloadError::InvalidRelativePath(_)));
    }

    #[test]
    fn test_sanitize_symlink_target() {
        let dir = TempDir::new().unwrap();
        let single = downloader(&dir, &["versions"]);
        assert_matches!(
            single.sanitize_symlink_target("versions/link", "../outside"),
            Err(DownloadError::InvalidSymLinkTarget { .. })
        );
        assert_matches!(
            single.sanitize_symlink_target("versions/link", "/etc/passwd"),
            Err(DownloadError::InvalidSymLinkTarget { .. })
        );
        assert_eq!(
            single.sanitize_symlink_target("versions/a/link", "../b/./c").unwrap(),
            "../b/./c"
        );

        let pair = downloader(&dir, &["versions", "other"]);
        assert_eq!(
            pair.sanitize_symlink_target("versions/link", "../other/newtarget").unwrap(),
            "../other/newtarget"
        );
    }

    #[test]
    fn test_symlink_target_steps_back_only_out_of_real_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("versions/sub")).unwrap();
        let d = downloader(&dir, &["versions"]);

        assert_eq!(
            d.sanitize_symlink_target("versions/link", "sub/../x").unwrap(),
            "sub/../x"
        );
        assert_matches!(
            d.sanitize_symlink_target("versions/link", "missing/../x"),
            Err(DownloadError::InvalidSymLinkTarget { .. })
        );
    }

    #[test]
    fn test_out_of_range_times_are_rejected_before_writing() {
        let dir = TempDir::new().unwrap();
        let mut d = downloader(&dir, &["notes.txt"]);

        let huge = FileTime {
            seconds: u64::MAX,
            micros: 0,
        };
        assert_matches!(
            d.handle_chunk(&file_chunk("notes.txt", b"x", Some(huge))),
            Err(DownloadError::InvalidTime(_))
        );

        let bad_micros = FileTime {
            seconds: 1,
            micros: u32::MAX,
        };
        let err = d
            .handle_chunk(&file_chunk("notes.txt", b"x", Some(bad_micros)))
            .unwrap_err();
        assert_matches!(err, DownloadError::InvalidTime(_));
        assert!(!err.is_path_violation());
        assert!(!dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_path_violations_are_classified() {
        assert!(DownloadError::InvalidRelativePath("x".into()).is_path_violation());
        assert!(!DownloadError::TimeNotSet("x".into()).is_path_violation());
        assert!(!DownloadError::SymLinksAreNotSupported("x".into()).is_path_violation());
    }

    #[test]
    fn test_file_chunks_create_then_append() {
        let dir = TempDir::new().unwrap();
        let mut d = downloader(&dir, &["notes.txt"]);

        d.handle_chunk(&file_chunk("notes.txt", b"hello ", Some(T1))).unwrap();
        d.handle_chunk(&file_chunk("notes.txt", b"world", None)).unwrap();
        d.finish().unwrap();

        let path = dir.path().join("notes.txt");
        assert_eq!(fs::read(&path).unwrap(), b"hello world");
        assert_eq!(mtime_secs(&path), T1.seconds as i64);
        assert_eq!(d.bytes_written(), 11);
    }

    #[test]
    fn test_first_chunk_truncates_existing_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), b"old content that is longer").unwrap();

        let mut d = downloader(&dir, &["notes.txt"]);
        d.handle_chunk(&file_chunk("notes.txt", b"new", Some(T1))).unwrap();
        d.finish().unwrap();

        assert_eq!(fs::read(dir.path().join("notes.txt")).unwrap(), b"new");
    }

    #[test]
    fn test_directory_requires_time() {
        let dir = TempDir::new().unwrap();
        let mut d = downloader(&dir, &["versions"]);

        assert_matches!(
            d.handle_chunk(&dir_chunk("versions", None)),
            Err(DownloadError::TimeNotSet(_))
        );
        assert!(!dir.path().join("versions").exists());
    }

    #[test]
    fn test_directory_tree_and_timestamps() {
        let dir = TempDir::new().unwrap();
        let mut d = downloader(&dir, &["versions"]);

        d.handle_chunk(&dir_chunk("versions", Some(T1))).unwrap();
        d.handle_chunk(&dir_chunk("versions/sub", Some(T1))).unwrap();
        d.handle_chunk(&file_chunk("versions/sub/a.txt", b"a", Some(T1))).unwrap();
        d.finish().unwrap();

        assert_eq!(fs::read(dir.path().join("versions/sub/a.txt")).unwrap(), b"a");
        assert_eq!(mtime_secs(&dir.path().join("versions")), T1.seconds as i64);
        assert_eq!(mtime_secs(&dir.path().join("versions/sub")), T1.seconds as i64);
    }

    #[test]
    fn test_traversal_is_rejected_before_writing() {
        let dir = TempDir::new().unwrap();
        let save = dir.path().join("save");
        fs::create_dir_all(&save).unwrap();
        let mut d = TransferDownloader::new(&save, &["versions".to_string()], false).unwrap();

        let err = d
            .handle_chunk(&file_chunk("versions/../../escaped.txt", b"x", Some(T1)))
            .unwrap_err();

        assert!(err.is_path_violation());
        assert!(!dir.path().join("escaped.txt").exists());
    }

    #[test]
    fn test_symlinks_rejected_by_default() {
        let dir = TempDir::new().unwrap();
        let mut d = downloader(&dir, &["versions"]);

        assert_matches!(
            d.handle_chunk(&symlink_chunk("versions/link", "target")),
            Err(DownloadError::SymLinksAreNotSupported(_))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_created_when_enabled() {
        let dir = TempDir::new().unwrap();
        let names = vec!["versions".to_string()];
        let mut d = TransferDownloader::new(dir.path(), &names, true).unwrap();

        d.handle_chunk(&dir_chunk("versions", Some(T1))).unwrap();
        d.handle_chunk(&symlink_chunk("versions/link", "./target.txt")).unwrap();

        let link = dir.path().join("versions/link");
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("./target.txt"));

        assert_matches!(
            d.handle_chunk(&symlink_chunk("versions/bad", "../../etc")),
            Err(DownloadError::InvalidSymLinkTarget { .. })
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_chained_symlinks_cannot_carry_writes_out() {
        let dir = TempDir::new().unwrap();
        let save = dir.path().join("save");
        fs::create_dir_all(&save).unwrap();
        let names = vec!["versions".to_string()];
        let mut d = TransferDownloader::new(&save, &names, true).unwrap();

        d.handle_chunk(&dir_chunk("versions", Some(T1))).unwrap();
        d.handle_chunk(&dir_chunk("versions/a", Some(T1))).unwrap();
        d.handle_chunk(&symlink_chunk("versions/a/b", "..")).unwrap();

        let err = d
            .handle_chunk(&symlink_chunk("versions/a/b/l", "../.."))
            .unwrap_err();
        assert!(err.is_path_violation());
        let err = d
            .handle_chunk(&file_chunk("versions/a/b/l/evil.txt", b"x", Some(T1)))
            .unwrap_err();
        assert!(err.is_path_violation());
        let err = d
            .handle_chunk(&dir_chunk("versions/a/b", Some(T1)))
            .unwrap_err();
        assert!(err.is_path_violation());

        assert!(!dir.path().join("evil.txt").exists());
        assert!(!save.join("versions/l").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_target_cannot_step_back_through_a_link() {
        let dir = TempDir::new().unwrap();
        let save = dir.path().join("save");
        fs::create_dir_all(&save).unwrap();
        let names = vec!["versions".to_string()];
        let mut d = TransferDownloader::new(&save, &names, true).unwrap();

        d.handle_chunk(&dir_chunk("versions", Some(T1))).unwrap();
        d.handle_chunk(&dir_chunk("versions/x", Some(T1))).unwrap();
        d.handle_chunk(&symlink_chunk("versions/x/b", "../../versions")).unwrap();

        // Textually this stays under versions/, but b/.. is the save directory.
        assert_matches!(
            d.handle_chunk(&symlink_chunk("versions/x/c", "b/../../y")),
            Err(DownloadError::InvalidSymLinkTarget { .. })
        );
        assert!(!save.join("versions/x/c").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_replaced_by_symlink_is_not_appended_through() {
        let dir = TempDir::new().unwrap();
        let names = vec!["versions".to_string()];
        let mut d = TransferDownloader::new(dir.path(), &names, true).unwrap();

        d.handle_chunk(&dir_chunk("versions", Some(T1))).unwrap();
        d.handle_chunk(&file_chunk("versions/target.txt", b"keep", Some(T1))).unwrap();
        d.handle_chunk(&file_chunk("versions/f", b"first", Some(T1))).unwrap();
        d.handle_chunk(&symlink_chunk("versions/f", "target.txt")).unwrap();

        let err = d
            .handle_chunk(&file_chunk("versions/f", b"more", None))
            .unwrap_err();
        assert!(err.is_path_violation());
        assert_eq!(fs::read(dir.path().join("versions/target.txt")).unwrap(), b"keep");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions_applied_on_finish() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mut d = downloader(&dir, &["run.sh"]);
        let mut chunk = file_chunk("run.sh", b"#!/bin/sh", Some(T1));
        chunk.mode = 0o700;

        d.handle_chunk(&chunk).unwrap();
        d.finish().unwrap();

        let mode = fs::metadata(dir.path().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    proptest! {
        #[test]
        fn test_sanitized_paths_stay_under_roots(
            segments in proptest::collection::vec(
                prop_oneof![Just("..".to_string()), Just(".".to_string()), "[a-z]{1,6}"],
                1..8,
            )
        ) {
            let dir = TempDir::new().unwrap();
            let d = downloader(&dir, &["root"]);
            let candidate = segments.join("/");

            if let Ok(local) = d.sanitize_relative_path(&candidate) {
                prop_assert!(local.starts_with(dir.path().join("root")));
            }
        }
    }
}
