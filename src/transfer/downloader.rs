use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use filetime::FileTime;

use super::agent::Agent;
use crate::TransferError;

/// Companion temp suffix. A target is only ever visible at its final path
/// after the rename in `finalize`.
pub const TEMP_SUFFIX: &str = ".sshget.tmp";

pub fn temp_path_for(local_path: &Path) -> PathBuf {
    let mut name = local_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TEMP_SUFFIX);
    local_path.with_file_name(name)
}

fn local_io(path: &Path, err: std::io::Error) -> TransferError {
    TransferError::LocalIo(path.display().to_string(), err.to_string())
}

/// Create missing intermediate directories for a target.
pub fn ensure_parent_dirs(local_path: &Path) -> Result<()> {
    if let Some(parent) = local_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| local_io(parent, e))?;
        }
    }
    Ok(())
}

/// Create the temp file as a sparse file of the exact final size. Range
/// writers then write into it at their own offsets; truncate-to-size means
/// no zero-fill pass.
pub fn preallocate(local_path: &Path, size: u64) -> Result<PathBuf> {
    ensure_parent_dirs(local_path)?;
    let tmp = temp_path_for(local_path);
    let f = File::create(&tmp).map_err(|e| local_io(&tmp, e))?;
    f.set_len(size).map_err(|e| local_io(&tmp, e))?;
    Ok(tmp)
}

/// Stream one whole file sequentially into its temp and commit it.
pub fn download_whole(
    agent: &mut Agent,
    remote_path: &str,
    local_path: &Path,
    size: u64,
    mode: u16,
    mtime: i64,
    on_bytes: &mut dyn FnMut(u64),
) -> Result<()> {
    ensure_parent_dirs(local_path)?;
    let tmp = temp_path_for(local_path);
    let mut f = File::create(&tmp).map_err(|e| local_io(&tmp, e))?;
    let mut written = 0u64;
    agent.read_range_streaming(remote_path, 0, size, &mut |chunk| {
        f.write_all(chunk).map_err(|e| local_io(&tmp, e))?;
        written += chunk.len() as u64;
        on_bytes(chunk.len() as u64);
        Ok(())
    })?;
    f.sync_all().map_err(|e| local_io(&tmp, e))?;
    drop(f);
    if written < size {
        return Err(TransferError::RemoteRead(format!(
            "{}: remote delivered {} of {} bytes",
            remote_path, written, size
        ))
        .into());
    }
    finalize(local_path, mode, mtime)
}

/// Stream one byte range (`start..=end`) into the preallocated temp at its
/// offset. Commit happens separately once every chunk of the file landed.
pub fn download_range(
    agent: &mut Agent,
    remote_path: &str,
    local_path: &Path,
    start: u64,
    end: u64,
    on_bytes: &mut dyn FnMut(u64),
) -> Result<()> {
    let tmp = temp_path_for(local_path);
    let mut f = OpenOptions::new().write(true).open(&tmp).map_err(|e| local_io(&tmp, e))?;
    let length = end - start + 1;
    let mut written = 0u64;
    agent.read_range_streaming(remote_path, start, length, &mut |chunk| {
        f.seek(SeekFrom::Start(start + written)).map_err(|e| local_io(&tmp, e))?;
        f.write_all(chunk).map_err(|e| local_io(&tmp, e))?;
        written += chunk.len() as u64;
        on_bytes(chunk.len() as u64);
        Ok(())
    })?;
    f.sync_all().map_err(|e| local_io(&tmp, e))?;
    if written < length {
        return Err(TransferError::RemoteRead(format!(
            "{}: remote delivered {} of {} bytes at offset {}",
            remote_path, written, length, start
        ))
        .into());
    }
    Ok(())
}

/// Commit: atomic rename of the temp onto the target, then metadata. The
/// rename failing fails the transfer; mode/mtime failures are logged and
/// swallowed.
pub fn finalize(local_path: &Path, mode: u16, mtime: i64) -> Result<()> {
    let tmp = temp_path_for(local_path);
    std::fs::rename(&tmp, local_path).map_err(|e| local_io(local_path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode as u32);
        if let Err(e) = std::fs::set_permissions(local_path, perms) {
            tracing::warn!("[get][dl] chmod {:o} {} failed: {}", mode, local_path.display(), e);
        }
    }
    let ft = FileTime::from_unix_time(mtime, 0);
    if let Err(e) = filetime::set_file_times(local_path, ft, ft) {
        tracing::warn!("[get][dl] utimes {} failed: {}", local_path.display(), e);
    }
    Ok(())
}

/// Remove a leftover temp. Missing files are fine; anything else is only
/// worth a log line during teardown.
pub fn cleanup_temp(local_path: &Path) {
    let tmp = temp_path_for(local_path);
    if let Err(e) = std::fs::remove_file(&tmp) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("[get][dl] could not remove {}: {}", tmp.display(), e);
        }
    }
}
