//! # Transfer Operations
//!
//! One [`TransferOperation`] per transfer request, outbound (`Upload`) or
//! inbound (`Download`). Both directions share one state machine:
//!
//! ```text
//! Initialized ──Requested──▶ Requested ──Start──▶ Started ──Completed──▶ Completed
//!      │                         │                   │  ╲                   │
//!      └──── cancel ─────────────┴─▶ RequestCanceled │   Failure            │
//!                                                    │     ▼                │
//!                                   TransferCanceled ◀─────┴── stop ────────┘
//! ```
//!
//! Cancellation after completion is accepted: either side may stop just before
//! it observes the other's completion.

use crate::chunk::{scan_totals, top_level_name, CancelHandle, ChunkError};
use crate::rpc::{OpInfo, TransferRequest};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Upload created locally, request not yet delivered.
    Initialized,
    Requested,
    Started,
    RequestCanceled,
    TransferCanceled,
    Failed(String),
    Completed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::RequestCanceled
                | TransferState::TransferCanceled
                | TransferState::Failed(_)
                | TransferState::Completed
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            TransferState::RequestCanceled | TransferState::TransferCanceled
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferState::Initialized => write!(f, "initialized"),
            TransferState::Requested => write!(f, "requested"),
            TransferState::Started => write!(f, "started"),
            TransferState::RequestCanceled => write!(f, "requestCanceled"),
            TransferState::TransferCanceled => write!(f, "transferCanceled"),
            TransferState::Failed(reason) => write!(f, "failed({})", reason),
            TransferState::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Requested,
    Start,
    CancelledByUser,
    RequestCancelledByRemote,
    /// Local stop of a running transfer.
    Stopped,
    TransferCancelledByRemote,
    Completed,
    Failure(String),
}

/// Remote call a transition asks the owner to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    SendCancelRequest,
    SendStopTransfer,
}

/// Pure transition function. Events that do not apply to `state` leave it unchanged.
pub fn transition(state: &TransferState, event: &TransferEvent) -> (TransferState, Option<SideEffect>) {
    use TransferEvent as E;
    use TransferState as S;

    match (state, event) {
        (S::Initialized, E::Requested) | (S::Requested, E::Requested) => (S::Requested, None),

        (S::Requested, E::Start) => (S::Started, None),

        (S::Initialized, E::CancelledByUser) | (S::Initialized, E::RequestCancelledByRemote) => {
            (S::RequestCanceled, None)
        }
        (S::Requested, E::CancelledByUser) => (S::RequestCanceled, Some(SideEffect::SendCancelRequest)),
        (S::Requested, E::RequestCancelledByRemote) => (S::RequestCanceled, None),

        (S::Started, E::Stopped) => (S::TransferCanceled, Some(SideEffect::SendStopTransfer)),
        (S::Completed, E::Stopped)
        | (S::Started, E::TransferCancelledByRemote)
        | (S::Completed, E::TransferCancelledByRemote) => (S::TransferCanceled, None),

        (S::Started, E::Completed) => (S::Completed, None),

        (S::Started, E::Failure(reason)) | (S::Failed(_), E::Failure(reason)) => {
            (S::Failed(reason.clone()), None)
        }

        (current, _) => (current.clone(), None),
    }
}

/// User-facing actions for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Accept,
    Cancel,
    Remove,
    Reveal,
}

pub fn available_actions(direction: Direction, state: &TransferState) -> Vec<UserAction> {
    match (direction, state) {
        (Direction::Download, TransferState::Requested) => vec![UserAction::Accept, UserAction::Cancel],
        (Direction::Download, TransferState::Completed) => vec![UserAction::Remove, UserAction::Reveal],
        (_, TransferState::Initialized) | (_, TransferState::Started) => vec![UserAction::Cancel],
        (_, state) if state.is_terminal() => vec![UserAction::Remove],
        _ => Vec::new(),
    }
}

static LAST_TRANSFER_ID: AtomicI64 = AtomicI64::new(0);

/// Submission timestamp in microseconds, bumped so ids never repeat within a process.
pub fn next_transfer_id() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);

    let mut last = LAST_TRANSFER_ID.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(last + 1);
        match LAST_TRANSFER_ID.compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

/// Progress and throughput of one transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferMetrics {
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub chunks: u64,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl TransferMetrics {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            ..Default::default()
        }
    }

    pub fn record_chunk(&mut self, bytes: usize) {
        self.bytes_transferred += bytes as u64;
        self.chunks += 1;
    }

    /// Fraction in `0.0..=1.0`. An empty transfer is complete once it finished.
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return if self.finished_at.is_some() { 1.0 } else { 0.0 };
        }
        (self.bytes_transferred as f64 / self.total_size as f64).min(1.0)
    }

    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Average bytes per second since the transfer started.
    pub fn average_throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= f64::EPSILON {
            return 0.0;
        }
        self.bytes_transferred as f64 / secs
    }
}

fn guess_mime(path: &Path) -> String {
    if path.is_dir() {
        return "inode/directory".to_string();
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// A single transfer and everything needed to drive it.
#[derive(Debug, Clone)]
pub struct TransferOperation {
    pub transfer_id: i64,
    pub direction: Direction,
    /// Id of the owning peer; looked up through the registry when needed.
    pub peer_id: String,
    pub sender_name: String,
    pub title: String,
    pub mime_type: String,
    pub total_size: u64,
    pub entry_count: u64,
    pub top_dir_basenames: Vec<String>,
    /// Local sources of an upload.
    pub source_paths: Vec<PathBuf>,
    state: TransferState,
    metrics: TransferMetrics,
    cancel: CancelHandle,
}

impl TransferOperation {
    /// Build an upload from local paths. Sizes are taken now, at submission.
    pub fn new_upload(peer_id: impl Into<String>, paths: Vec<PathBuf>) -> Result<Self, ChunkError> {
        let totals = scan_totals(&paths)?;
        let names = paths
            .iter()
            .map(|p| top_level_name(p))
            .collect::<Result<Vec<_>, _>>()?;

        let (title, mime_type) = match paths.as_slice() {
            [single] => (names[0].clone(), guess_mime(single)),
            _ => (format!("{} files", names.len()), String::new()),
        };

        Ok(Self {
            transfer_id: next_transfer_id(),
            direction: Direction::Upload,
            peer_id: peer_id.into(),
            sender_name: String::new(),
            title,
            mime_type,
            total_size: totals.total_size,
            entry_count: totals.entry_count,
            top_dir_basenames: names,
            source_paths: paths,
            state: TransferState::Initialized,
            metrics: TransferMetrics::new(totals.total_size),
            cancel: CancelHandle::new(),
        })
    }

    /// Build a download from a received request. It starts out `Requested`.
    pub fn new_download(request: &TransferRequest) -> Self {
        let title = if request.top_dir_basenames.len() == 1 && !request.name_if_single.is_empty() {
            request.name_if_single.clone()
        } else {
            format!("{} files", request.top_dir_basenames.len())
        };

        Self {
            transfer_id: request.transfer_id,
            direction: Direction::Download,
            peer_id: request.sender_id.clone(),
            sender_name: request.sender_name.clone(),
            title,
            mime_type: request.mime_if_single.clone(),
            total_size: request.size,
            entry_count: request.count,
            top_dir_basenames: request.top_dir_basenames.clone(),
            source_paths: Vec::new(),
            state: TransferState::Requested,
            metrics: TransferMetrics::new(request.size),
            cancel: CancelHandle::new(),
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut TransferMetrics {
        &mut self.metrics
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn available_actions(&self) -> Vec<UserAction> {
        available_actions(self.direction, &self.state)
    }

    /// Feed an event through the state machine.
    pub fn apply(&mut self, event: TransferEvent) -> Option<SideEffect> {
        let (next, effect) = transition(&self.state, &event);
        if next == self.state {
            debug!(
                "Transfer {} ignored {:?} in state {}",
                self.transfer_id, event, self.state
            );
            return None;
        }

        info!("Transfer {}: {} -> {}", self.transfer_id, self.state, next);

        match next {
            TransferState::Started => self.metrics.started_at = Some(Instant::now()),
            _ if next.is_terminal() && self.metrics.finished_at.is_none() => {
                self.metrics.finished_at = Some(Instant::now());
            }
            _ => {}
        }
        if next.is_canceled() {
            self.cancel.cancel();
        }

        self.state = next;
        effect
    }

    /// The cancel action, mapped to the event that fits the current state.
    pub fn user_cancel(&mut self) -> Option<SideEffect> {
        match self.state {
            TransferState::Started | TransferState::Completed => self.apply(TransferEvent::Stopped),
            _ => self.apply(TransferEvent::CancelledByUser),
        }
    }

    pub fn to_request(&self, sender_id: &str, sender_name: &str) -> TransferRequest {
        let single = self.top_dir_basenames.len() == 1;
        TransferRequest {
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            transfer_id: self.transfer_id,
            size: self.total_size,
            count: self.entry_count,
            name_if_single: if single { self.title.clone() } else { String::new() },
            mime_if_single: if single { self.mime_type.clone() } else { String::new() },
            top_dir_basenames: self.top_dir_basenames.clone(),
        }
    }

    pub fn op_info(&self, ident: &str) -> OpInfo {
        OpInfo {
            ident: ident.to_string(),
            transfer_id: self.transfer_id,
            readable_name: self.title.clone(),
        }
    }
}
