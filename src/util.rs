use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;
use std::sync::Arc;

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Initialize a MultiProgress with a header spinner plus a total ProgressBar.
/// The header shows a single-line startup summary above the total progress.
pub fn init_progress_and_mp(
    verbose: bool,
    total: u64,
    total_style: &ProgressStyle,
) -> (Arc<MultiProgress>, ProgressBar, ProgressBar) {
    let mp = Arc::new(if verbose {
        MultiProgress::with_draw_target(ProgressDrawTarget::stdout())
    } else {
        MultiProgress::new()
    });
    let header = mp.add(ProgressBar::new_spinner());
    header.set_style(ProgressStyle::with_template("{msg}").expect("valid header template"));
    let total_pb = mp.add(ProgressBar::new(total));
    total_pb.set_style(total_style.clone());
    (mp, total_pb, header)
}

/// Populate the startup header line: host, tunnel count, file count, total size.
pub fn set_startup_header(
    header: &ProgressBar,
    endpoint: &str,
    tunnels: usize,
    files: usize,
    total_bytes: u64,
) {
    let host_field = format!("{:<24}", format!("Host:{}", endpoint));
    let tunnel_field = format!("{:<12}", format!("Tunnels:{}", tunnels));
    let files_field = format!("{:<12}", format!("Files:{}", files));
    let size_field = format!("{:<14}", format!("Total:{}", human_bytes(total_bytes)));
    header.set_message(format!(
        "{}    {}    {}    {}",
        host_field.green(),
        tunnel_field.cyan(),
        files_field.yellow(),
        size_field.magenta()
    ));
}

/// Print a concise summary line for a completed transfer.
pub fn print_summary(bytes_received: u64, skipped_bytes: u64, elapsed_secs: f64, files: usize) {
    if elapsed_secs > 0.0 && bytes_received > 0 {
        let mb = bytes_received as f64 / 1024.0 / 1024.0;
        println!(
            "average rate: {:.2} MB/s ({} received, {} skipped, {:.2}s, {} files)",
            mb / elapsed_secs,
            human_bytes(bytes_received),
            human_bytes(skipped_bytes),
            elapsed_secs,
            files
        );
    } else {
        println!(
            "nothing transferred ({} skipped, {} files)",
            human_bytes(skipped_bytes),
            files
        );
    }
}
