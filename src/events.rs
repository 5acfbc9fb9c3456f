use crossbeam_channel::Sender;
use serde::Serialize;

/// Compact view of one enumerated file carried in events.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub relative_path: String,
    pub full_path: String,
    pub size: u64,
    pub local_path: String,
}

/// Snapshot of one tunnel/agent for UI observers.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub id: usize,
    pub ready: bool,
    pub busy: bool,
    pub unhealthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
}

/// Description of one dispatched job, as observers see it.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub remote_path: String,
    pub local_path: String,
    /// 1-based chunk position, `None` for whole-file jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<(u32, u32)>,
    pub bytes: u64,
}

/// The observable lifecycle stream. `Start` precedes any `FileStart`;
/// `Complete` (if emitted) is the last non-error event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TransferEvent {
    #[serde(rename = "start")]
    Start { total_bytes: u64, total_files: usize, files: Vec<FileInfo> },
    #[serde(rename = "tunnel:ready")]
    TunnelReady { id: usize },
    #[serde(rename = "tunnel:status")]
    TunnelStatusUpdate { tunnels: Vec<TunnelStatus> },
    #[serde(rename = "file:start")]
    FileStart { file: FileInfo, job: JobInfo },
    #[serde(rename = "file:progress")]
    FileProgress { file: String, chunk_bytes: u64, bytes_received: u64, total_bytes: u64 },
    #[serde(rename = "file:skip")]
    FileSkip { file: FileInfo, size: u64 },
    #[serde(rename = "file:complete")]
    FileComplete { file: FileInfo },
    #[serde(rename = "complete")]
    Complete { bytes_received: u64, skipped_bytes: u64, files: usize },
    #[serde(rename = "error")]
    Error { error: String },
}

/// Single-subscriber event fan-out. Sends never block and failures are
/// ignored: a consumer that went away must not wedge the transfer.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<Sender<TransferEvent>>,
}

impl EventSender {
    pub fn new(tx: Sender<TransferEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sender that drops every event, for tests and library callers that
    /// only want the final result.
    pub fn sink() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
