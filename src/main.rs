use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use indicatif::ProgressStyle;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

mod cli;
mod error;
mod events;
mod parse;
mod transfer;
mod util;

pub use error::TransferError;
pub use error::error_is_agent_level;

use events::{EventSender, TransferEvent};
use transfer::{AbortHandle, HandleGetArgs};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    init_tracing(cli.verbose);

    let password = if cli.password {
        Some(rpassword::prompt_password(format!("{}'s password: ", cli.sources[0]))?)
    } else {
        None
    };

    let args = HandleGetArgs {
        sources: cli.sources.clone(),
        dest: cli.dest.clone(),
        tunnels: cli.tunnels,
        port: cli.port,
        identity: cli.identity.clone(),
        password,
        compress: cli.compress,
    };

    let abort = Arc::new(AbortHandle::new());
    spawn_signal_handler(abort.clone());

    let render_progress = !cli.no_progress && !cli.quiet && !cli.json;
    let (events, consumer) = if cli.json {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = std::thread::spawn(move || consume_events_json(rx));
        (EventSender::new(tx), Some(handle))
    } else if render_progress {
        let (tx, rx) = crossbeam_channel::unbounded();
        let endpoint = endpoint_for_display(&cli.sources);
        let tunnels = cli.tunnels;
        let verbose = cli.verbose;
        let handle =
            std::thread::spawn(move || consume_events_progress(rx, endpoint, tunnels, verbose));
        (EventSender::new(tx), Some(handle))
    } else {
        (EventSender::sink(), None)
    };

    let start = Instant::now();
    let result = transfer::handle_get(&args, &events, &abort);
    drop(events);
    if let Some(handle) = consumer {
        let _ = handle.join();
    }

    let summary = result?;
    if summary.aborted {
        if !cli.quiet && !cli.json {
            eprintln!("aborted; partial temp files removed");
        }
        return Ok(());
    }
    if !cli.quiet && !cli.json {
        util::print_summary(
            summary.bytes_received,
            summary.skipped_bytes,
            start.elapsed().as_secs_f64(),
            summary.files,
        );
    }
    Ok(())
}

/// Best-effort endpoint for the header line; real validation happens in the
/// transfer pipeline.
fn endpoint_for_display(sources: &[String]) -> String {
    parse::parse_source(sources.first().map(String::as_str).unwrap_or(""))
        .map(|s| s.endpoint())
        .unwrap_or_default()
}

/// First SIGINT/SIGTERM aborts cooperatively: flip the flag, unlink the temp
/// snapshot, let the scheduler wind down and main exit 0. A second signal
/// exits immediately.
fn spawn_signal_handler(abort: Arc<AbortHandle>) {
    let mut signals = Signals::new([SIGINT, SIGTERM]).expect("install signal handler");
    std::thread::spawn(move || {
        let seen = AtomicBool::new(false);
        for sig in &mut signals {
            if seen.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
            tracing::info!("[get] received signal {}, aborting", sig);
            eprintln!("\ninterrupt: finishing up, cleaning temp files");
            for temp in abort.abort() {
                let _ = std::fs::remove_file(&temp);
            }
        }
    });
}

fn consume_events_json(rx: crossbeam_channel::Receiver<TransferEvent>) {
    for event in rx {
        if let Ok(line) = serde_json::to_string(&event) {
            println!("{}", line);
        }
    }
}

fn consume_events_progress(
    rx: crossbeam_channel::Receiver<TransferEvent>,
    endpoint: String,
    tunnels: usize,
    verbose: bool,
) {
    let total_style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {wide_msg}",
    )
    .expect("valid progress template")
    .progress_chars("=> ");
    let (mp, total_pb, header) = util::init_progress_and_mp(verbose, 0, &total_style);

    for event in rx {
        match event {
            TransferEvent::Start { total_bytes, total_files, .. } => {
                total_pb.set_length(total_bytes);
                util::set_startup_header(&header, &endpoint, tunnels, total_files, total_bytes);
            }
            TransferEvent::TunnelReady { id } => {
                tracing::debug!("[get][ui] tunnel {} ready", id);
            }
            TransferEvent::TunnelStatusUpdate { .. } => {}
            TransferEvent::FileStart { file, job } => {
                // One message per file, keyed on the first chunk.
                if job.chunk.map(|(k, _)| k == 1).unwrap_or(true) {
                    total_pb.set_message(file.relative_path.clone());
                }
            }
            TransferEvent::FileProgress { chunk_bytes, .. } => {
                total_pb.inc(chunk_bytes);
            }
            TransferEvent::FileSkip { file, size } => {
                total_pb.inc(size);
                let _ = mp.println(format!("skip {} (already complete)", file.relative_path));
            }
            TransferEvent::FileComplete { file } => {
                tracing::debug!("[get][ui] complete {}", file.relative_path);
            }
            TransferEvent::Complete { .. } => {
                total_pb.finish_and_clear();
            }
            TransferEvent::Error { error } => {
                let _ = mp.println(format!("error: {}", error));
            }
        }
    }
    header.finish_and_clear();
    total_pb.finish_and_clear();
    let _ = mp.clear();
}

fn init_tracing(verbose: bool) {
    // All tracing goes to stderr: stdout carries progress rendering or the
    // JSON event stream.
    let (writer, guard) = non_blocking(std::io::stderr());
    // Leak the worker guard so the background thread stays alive for the
    // whole process; dropping it would lose trailing log lines.
    let _ = Box::leak(Box::new(guard));
    let level = if verbose { "debug" } else { "warn" };
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(EnvFilter::new(level));
    tracing_subscriber::registry().with(layer).init();
}
