use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{RecvTimeoutError, unbounded};

use super::agent::Agent;
use super::downloader;
use super::enumeration::FileEntry;
use super::pool::AgentPool;
use crate::error::error_is_agent_level;
use crate::events::{EventSender, FileInfo, JobInfo, TransferEvent};
use crate::TransferError;

/// Files at or above this size are split across tunnels.
pub const PARALLEL_THRESHOLD: u64 = 50 * 1024 * 1024;

/// A job fails the transfer on its third job-level failure. Agent-level
/// failures never touch this budget.
pub const JOB_RETRY_LIMIT: u8 = 3;

/// Unit of dispatch: one whole file or one contiguous chunk of one.
#[derive(Debug, Clone)]
pub enum Job {
    Whole {
        file: FileEntry,
        local_path: PathBuf,
    },
    Range {
        file: FileEntry,
        local_path: PathBuf,
        start: u64,
        end: u64,
        chunk_index: u32,
        total_chunks: u32,
    },
}

impl Job {
    pub fn file(&self) -> &FileEntry {
        match self {
            Job::Whole { file, .. } | Job::Range { file, .. } => file,
        }
    }

    pub fn local_path(&self) -> &Path {
        match self {
            Job::Whole { local_path, .. } | Job::Range { local_path, .. } => local_path,
        }
    }

    /// Human-facing label: `<remotePath>` or `<remotePath> chunk k/total`.
    pub fn label(&self) -> String {
        match self {
            Job::Whole { file, .. } => file.full_path.clone(),
            Job::Range { file, chunk_index, total_chunks, .. } => {
                format!("{} chunk {}/{}", file.full_path, chunk_index + 1, total_chunks)
            }
        }
    }

    pub fn bytes(&self) -> u64 {
        match self {
            Job::Whole { file, .. } => file.size,
            Job::Range { start, end, .. } => end - start + 1,
        }
    }

    /// Retry ledger key. A local path carries either one whole job or range
    /// jobs, never both, so (path, chunk) cannot collide.
    fn retry_key(&self) -> (PathBuf, u32) {
        match self {
            Job::Whole { local_path, .. } => (local_path.clone(), 0),
            Job::Range { local_path, chunk_index, .. } => (local_path.clone(), *chunk_index),
        }
    }

    fn info(&self) -> JobInfo {
        match self {
            Job::Whole { file, local_path } => JobInfo {
                remote_path: file.full_path.clone(),
                local_path: local_path.display().to_string(),
                chunk: None,
                bytes: file.size,
            },
            Job::Range { file, local_path, start, end, chunk_index, total_chunks } => JobInfo {
                remote_path: file.full_path.clone(),
                local_path: local_path.display().to_string(),
                chunk: Some((*chunk_index + 1, *total_chunks)),
                bytes: end - start + 1,
            },
        }
    }
}

fn file_info(file: &FileEntry, local_path: &Path) -> FileInfo {
    FileInfo {
        relative_path: file.relative_path.clone(),
        full_path: file.full_path.clone(),
        size: file.size,
        local_path: local_path.display().to_string(),
    }
}

/// Planned work for one transfer.
#[derive(Debug, Default)]
pub struct Plan {
    pub jobs: VecDeque<Job>,
    pub skipped: Vec<(FileEntry, PathBuf)>,
    pub skipped_bytes: u64,
    /// Files covered by range jobs; preallocated once before dispatch.
    pub preallocations: Vec<(PathBuf, u64)>,
}

/// Plan per-file jobs. Files already present locally with the right size
/// are skipped; files at or past the threshold are split into
/// `ceil(size / tunnel_count)` sized chunks, dropping degenerate tails.
pub fn plan_jobs(
    files: &[(FileEntry, PathBuf)],
    tunnel_count: usize,
    parallel_threshold: u64,
) -> Plan {
    let mut plan = Plan::default();
    let mut preallocated: HashSet<PathBuf> = HashSet::new();
    for (file, local_path) in files {
        if let Ok(md) = std::fs::metadata(local_path) {
            if md.is_file() && md.len() == file.size {
                plan.skipped.push((file.clone(), local_path.clone()));
                plan.skipped_bytes += file.size;
                continue;
            }
        }
        if file.size >= parallel_threshold && tunnel_count > 1 {
            let chunk_size = file.size.div_ceil(tunnel_count as u64);
            let mut ranges = Vec::new();
            for i in 0..tunnel_count as u64 {
                let start = i * chunk_size;
                let end = ((i + 1) * chunk_size).min(file.size) - 1;
                if start > end || start >= file.size {
                    // Degenerate tail: ceil rounding already covered the
                    // file with fewer chunks.
                    break;
                }
                ranges.push((start, end));
            }
            let total_chunks = ranges.len() as u32;
            for (chunk_index, (start, end)) in ranges.into_iter().enumerate() {
                plan.jobs.push_back(Job::Range {
                    file: file.clone(),
                    local_path: local_path.clone(),
                    start,
                    end,
                    chunk_index: chunk_index as u32,
                    total_chunks,
                });
            }
            if preallocated.insert(local_path.clone()) {
                plan.preallocations.push((local_path.clone(), file.size));
            }
        } else {
            plan.jobs.push_back(Job::Whole {
                file: file.clone(),
                local_path: local_path.clone(),
            });
        }
    }
    plan
}

/// Cooperative cancellation plus the live set of temp files. `abort` flips
/// the flag and hands the snapshot to the caller, who owns unlinking.
#[derive(Default)]
pub struct AbortHandle {
    aborted: AtomicBool,
    temps: Mutex<HashSet<PathBuf>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Idempotent. Returns the active temp paths and clears the set in the
    /// same critical section.
    pub fn abort(&self) -> Vec<PathBuf> {
        self.aborted.store(true, Ordering::SeqCst);
        let mut temps = self.temps.lock().expect("temp set lock");
        temps.drain().collect()
    }

    /// Snapshot without aborting, for error-path cleanup.
    pub fn take_temps(&self) -> Vec<PathBuf> {
        let mut temps = self.temps.lock().expect("temp set lock");
        temps.drain().collect()
    }

    fn register_temp(&self, path: &Path) {
        self.temps.lock().expect("temp set lock").insert(path.to_path_buf());
    }

    fn unregister_temp(&self, path: &Path) {
        self.temps.lock().expect("temp set lock").remove(path);
    }
}

/// Scheduler result. `aborted` is a resolution, not an error.
#[derive(Debug)]
pub struct SchedulerOutcome {
    pub aborted: bool,
    pub bytes_received: u64,
    pub skipped_bytes: u64,
    pub files_completed: usize,
    pub files_skipped: usize,
}

struct JobDone {
    agent_id: usize,
    agent: Agent,
    job: Job,
    result: Result<()>,
}

/// Everything the dispatch loop shares with job executor threads.
pub struct SchedulerCtx {
    pub pool: Arc<AgentPool>,
    pub events: EventSender,
    pub abort: Arc<AbortHandle>,
    pub total_bytes: u64,
}

/// Run a plan to completion, abort, or terminal failure. The loop itself is
/// single-threaded; each in-flight job runs on its own thread against the
/// one agent it acquired.
pub fn run(ctx: &SchedulerCtx, plan: Plan) -> Result<SchedulerOutcome> {
    let Plan { jobs: mut pending, skipped, skipped_bytes, preallocations } = plan;

    for (file, local_path) in &skipped {
        tracing::debug!("[get][sched] skip {} (already complete)", local_path.display());
        ctx.events.emit(TransferEvent::FileSkip {
            file: file_info(file, local_path),
            size: file.size,
        });
    }
    for (local_path, size) in &preallocations {
        let tmp = downloader::preallocate(local_path, *size)?;
        ctx.abort.register_temp(&tmp);
        tracing::debug!("[get][sched] preallocated {} ({} bytes)", tmp.display(), size);
    }

    let bytes_received = Arc::new(AtomicU64::new(0));
    let (done_tx, done_rx) = unbounded::<JobDone>();
    let mut active: HashMap<usize, String> = HashMap::new();
    let mut completed_chunks: HashMap<PathBuf, HashSet<u32>> = HashMap::new();
    let mut job_retries: HashMap<(PathBuf, u32), u8> = HashMap::new();
    let mut files_completed = 0usize;

    loop {
        if ctx.abort.is_aborted() {
            tracing::debug!("[get][sched] abort observed, resolving");
            return Ok(SchedulerOutcome {
                aborted: true,
                bytes_received: bytes_received.load(Ordering::SeqCst),
                skipped_bytes,
                files_completed,
                files_skipped: skipped.len(),
            });
        }

        // Dispatch as much as the pool allows. Never blocks on acquire.
        while !pending.is_empty() {
            let Some((agent_id, agent)) = ctx.pool.acquire() else { break };
            let job = pending.pop_front().expect("pending non-empty");
            ctx.pool.set_job_label(agent_id, Some(job.label()));
            active.insert(agent_id, job.label());
            if matches!(job, Job::Whole { .. }) {
                ctx.abort.register_temp(&downloader::temp_path_for(job.local_path()));
            }
            ctx.events.emit(TransferEvent::FileStart {
                file: file_info(job.file(), job.local_path()),
                job: job.info(),
            });
            spawn_executor(ctx, agent_id, agent, job, done_tx.clone(), bytes_received.clone());
        }

        if pending.is_empty() && active.is_empty() {
            return Ok(SchedulerOutcome {
                aborted: false,
                bytes_received: bytes_received.load(Ordering::SeqCst),
                skipped_bytes,
                files_completed,
                files_skipped: skipped.len(),
            });
        }

        // Jobs are queued but nothing can run them and nothing is in
        // flight: the pool is exhausted.
        if active.is_empty() && !pending.is_empty() && ctx.pool.healthy_count() == 0 {
            let label = pending.front().expect("pending non-empty").label();
            return Err(TransferError::NoHealthyAgents(label).into());
        }

        let done = match done_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(done) => done,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => unreachable!("done_tx held by this scope"),
        };
        active.remove(&done.agent_id);
        match done.result {
            Ok(()) => {
                ctx.pool.release(done.agent_id, done.agent);
                match &done.job {
                    Job::Whole { file, local_path } => {
                        ctx.abort.unregister_temp(&downloader::temp_path_for(local_path));
                        files_completed += 1;
                        ctx.events.emit(TransferEvent::FileComplete {
                            file: file_info(file, local_path),
                        });
                    }
                    Job::Range { file, local_path, chunk_index, total_chunks, .. } => {
                        let chunks =
                            completed_chunks.entry(local_path.clone()).or_default();
                        chunks.insert(*chunk_index);
                        if chunks.len() as u32 == *total_chunks {
                            downloader::finalize(local_path, file.mode, file.mtime)?;
                            ctx.abort.unregister_temp(&downloader::temp_path_for(local_path));
                            files_completed += 1;
                            ctx.events.emit(TransferEvent::FileComplete {
                                file: file_info(file, local_path),
                            });
                        }
                    }
                }
            }
            Err(err) => {
                let label = done.job.label();
                if error_is_agent_level(&err) {
                    // Quarantine the channel; the job itself is innocent
                    // and goes back to the queue with its budget intact.
                    let reason = err.to_string();
                    ctx.pool.mark_unhealthy(done.agent_id, &reason, Some(done.agent));
                    if let Some(tail) = ctx.pool.stderr_tail(done.agent_id) {
                        if !tail.trim().is_empty() {
                            tracing::debug!(
                                "[get][sched] tunnel {} stderr tail: {}",
                                done.agent_id,
                                tail.trim()
                            );
                        }
                    }
                    if ctx.pool.healthy_count() > 0 {
                        tracing::warn!(
                            "[get][sched] {} re-queued after agent failure: {}",
                            label,
                            reason
                        );
                        pending.push_back(done.job);
                        continue;
                    }
                    // No siblings left; charge the job so the transfer can
                    // terminate with a cause instead of spinning.
                    let exhausted = format!("{} (all agents exhausted)", reason);
                    if charge_job(&mut job_retries, &done.job) {
                        return Err(TransferError::JobFailed(label, exhausted).into());
                    }
                    pending.push_back(done.job);
                } else {
                    ctx.pool.release(done.agent_id, done.agent);
                    tracing::warn!("[get][sched] {} failed: {}", label, err);
                    if charge_job(&mut job_retries, &done.job) {
                        return Err(
                            TransferError::JobFailed(label, err.to_string()).into()
                        );
                    }
                    pending.push_back(done.job);
                }
            }
        }
    }
}

/// Count one job-level failure; true when the budget is spent.
fn charge_job(retries: &mut HashMap<(PathBuf, u32), u8>, job: &Job) -> bool {
    let count = retries.entry(job.retry_key()).or_insert(0);
    *count += 1;
    *count >= JOB_RETRY_LIMIT
}

fn spawn_executor(
    ctx: &SchedulerCtx,
    agent_id: usize,
    mut agent: Agent,
    job: Job,
    done_tx: crossbeam_channel::Sender<JobDone>,
    bytes_received: Arc<AtomicU64>,
) {
    let events = ctx.events.clone();
    let total_bytes = ctx.total_bytes;
    std::thread::spawn(move || {
        let local_display = job.local_path().display().to_string();
        let mut on_bytes = |n: u64| {
            let total_now = bytes_received.fetch_add(n, Ordering::SeqCst) + n;
            events.emit(TransferEvent::FileProgress {
                file: local_display.clone(),
                chunk_bytes: n,
                bytes_received: total_now,
                total_bytes,
            });
        };
        let result = match &job {
            Job::Whole { file, local_path } => downloader::download_whole(
                &mut agent,
                &file.full_path,
                local_path,
                file.size,
                file.mode,
                file.mtime,
                &mut on_bytes,
            ),
            Job::Range { file, local_path, start, end, .. } => downloader::download_range(
                &mut agent,
                &file.full_path,
                local_path,
                *start,
                *end,
                &mut on_bytes,
            ),
        };
        // The receiver disappears on abort or terminal failure; the agent
        // is dropped (and its channel closed) with the failed send.
        let _ = done_tx.send(JobDone { agent_id, agent, job, result });
    });
}
