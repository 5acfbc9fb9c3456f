// transfer module: parallel download orchestration over an agent pool
mod agent;
mod downloader;
mod enumeration;
mod framing;
mod helpers;
#[cfg(test)]
pub(crate) mod mock_agent;
mod pool;
mod scheduler;
pub(crate) mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

pub use downloader::{TEMP_SUFFIX, cleanup_temp, temp_path_for};
pub use enumeration::{FileEntry, RemoteEnumerator, StatSyntax};
pub use framing::{decode_request, encode_request, encode_response_header};
pub use helpers::local_target_for;
pub use scheduler::{AbortHandle, JOB_RETRY_LIMIT, Job, PARALLEL_THRESHOLD, Plan, plan_jobs};
pub use session::SshSettings;

use crate::events::{EventSender, FileInfo, TransferEvent};
use pool::AgentPool;
use scheduler::SchedulerCtx;

/// Arguments for `handle_get` grouped to avoid too-many-arguments lint.
#[derive(Clone)]
pub struct HandleGetArgs {
    pub sources: Vec<String>,
    pub dest: String,
    pub tunnels: usize,
    pub port: u16,
    pub identity: Option<PathBuf>,
    pub password: Option<String>,
    pub compress: bool,
}

/// What a finished (or aborted) transfer amounted to.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub aborted: bool,
    pub bytes_received: u64,
    pub skipped_bytes: u64,
    pub files: usize,
}

/// Download subcommand main entry: parse and validate sources, bring up the
/// pool, enumerate, schedule, and settle the event stream.
///
/// Event contract: `start` precedes any `file:*`; `complete` is emitted only
/// on a fully successful run; an abort suppresses both `complete` and
/// `error`. Cleanup (closing agents, unlinking known temps) happens on every
/// exit path; temps already handed out by `AbortHandle::abort` belong to
/// that caller.
pub fn handle_get(
    args: &HandleGetArgs,
    events: &EventSender,
    abort: &Arc<AbortHandle>,
) -> Result<TransferSummary> {
    let pool = Arc::new(AgentPool::new(events.clone()));
    let result = run_pipeline(args, events, abort, &pool);
    pool.close();
    match result {
        Ok(summary) => {
            if summary.aborted {
                cleanup_registered_temps(abort);
                return Ok(summary);
            }
            events.emit(TransferEvent::Complete {
                bytes_received: summary.bytes_received,
                skipped_bytes: summary.skipped_bytes,
                files: summary.files,
            });
            Ok(summary)
        }
        Err(err) => {
            cleanup_registered_temps(abort);
            if abort.is_aborted() {
                // In-flight failures racing an abort are expected noise.
                tracing::debug!("[get] error suppressed after abort: {}", err);
                return Ok(TransferSummary {
                    aborted: true,
                    bytes_received: 0,
                    skipped_bytes: 0,
                    files: 0,
                });
            }
            events.emit(TransferEvent::Error { error: format!("{:#}", err) });
            Err(err)
        }
    }
}

fn run_pipeline(
    args: &HandleGetArgs,
    events: &EventSender,
    abort: &Arc<AbortHandle>,
    pool: &Arc<AgentPool>,
) -> Result<TransferSummary> {
    crate::parse::check_destination(&args.dest)?;
    let sources = crate::parse::parse_sources(&args.sources)?;
    let settings = SshSettings {
        user: sources[0].user.clone(),
        host: sources[0].host.clone(),
        port: args.port,
        identity: args.identity.as_ref().map(|p| expand_tilde(p)),
        password: args.password.clone(),
        compress: args.compress,
    };
    let enumerator = RemoteEnumerator::new(&settings);

    // Wildcard sources expand remotely first; a pattern with no matches is
    // fatal before any agent spawns.
    let mut roots: Vec<String> = Vec::new();
    for source in &sources {
        if source.has_wildcard() {
            let expanded = enumerator.expand_wildcard(&source.path)?;
            if expanded.is_empty() {
                return Err(crate::TransferError::WildcardNoMatches(source.path.clone()).into());
            }
            tracing::debug!("[get] {} expanded to {} paths", source.path, expanded.len());
            roots.extend(expanded);
        } else {
            roots.push(source.path.clone());
        }
    }

    let tunnels = args.tunnels.max(1);
    pool.connect(&settings, tunnels, &enumerator)?;

    let mut entries: Vec<FileEntry> = Vec::new();
    for root in &roots {
        entries.extend(enumerator.list_files(root)?);
    }

    let literal_single = args.sources.len() == 1
        && !sources[0].has_wildcard()
        && entries.len() == 1
        && !entries[0].matched_root_is_dir;
    let files: Vec<(FileEntry, PathBuf)> = entries
        .into_iter()
        .map(|entry| {
            let local = local_target_for(&entry, &args.dest, literal_single);
            (entry, local)
        })
        .collect();

    let total_bytes: u64 = files.iter().map(|(f, _)| f.size).sum();
    let infos: Vec<FileInfo> = files
        .iter()
        .map(|(f, local)| FileInfo {
            relative_path: f.relative_path.clone(),
            full_path: f.full_path.clone(),
            size: f.size,
            local_path: local.display().to_string(),
        })
        .collect();
    tracing::info!(
        "[get] {} files, {} bytes over {} tunnels from {}",
        files.len(),
        total_bytes,
        tunnels,
        settings.endpoint()
    );
    events.emit(TransferEvent::Start {
        total_bytes,
        total_files: files.len(),
        files: infos,
    });

    let plan = plan_jobs(&files, tunnels, PARALLEL_THRESHOLD);
    let ctx = SchedulerCtx {
        pool: pool.clone(),
        events: events.clone(),
        abort: abort.clone(),
        total_bytes,
    };
    let outcome = scheduler::run(&ctx, plan)?;
    Ok(TransferSummary {
        aborted: outcome.aborted,
        bytes_received: outcome.bytes_received,
        skipped_bytes: outcome.skipped_bytes,
        files: outcome.files_completed + outcome.files_skipped,
    })
}

/// Unlink whatever temps are still registered. Temps already returned by an
/// earlier `abort()` call were that caller's to remove.
fn cleanup_registered_temps(abort: &AbortHandle) {
    for temp in abort.take_temps() {
        tracing::debug!("[get] removing leftover temp {}", temp.display());
        let _ = std::fs::remove_file(&temp);
    }
}

/// `~/` in an identity path is expanded here because the value goes to ssh
/// as an argument, not through a shell.
fn expand_tilde(path: &std::path::Path) -> PathBuf {
    let Some(s) = path.to_str() else { return path.to_path_buf() };
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
