use std::sync::OnceLock;

use anyhow::Result;

use super::session::{RemoteShell, quote_path};
use crate::TransferError;

/// One remote file slated for download. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the queried root (basename for single-file roots).
    pub relative_path: String,
    pub full_path: String,
    pub size: u64,
    /// POSIX permission bits.
    pub mode: u16,
    /// Seconds since epoch.
    pub mtime: i64,
    /// The enumeration root this entry came from.
    pub matched_root: String,
    pub matched_root_is_dir: bool,
}

/// GNU and BSD stat disagree on everything; one probe against /dev/null
/// decides which dialect the remote speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatSyntax {
    Gnu,
    Bsd,
}

impl StatSyntax {
    fn stat_one(&self, quoted_path: &str) -> String {
        match self {
            StatSyntax::Gnu => format!("stat -c '%s %a %Y %n' {}", quoted_path),
            StatSyntax::Bsd => format!("stat -f '%z %Lp %m %N' {}", quoted_path),
        }
    }

    fn find_with_stat(&self, quoted_root: &str) -> String {
        // -exec ... {} + batches paths into few stat invocations; -P keeps
        // symlinks un-followed.
        match self {
            StatSyntax::Gnu => {
                format!("find -P {} -type f -exec stat -c '%s %a %Y %n' {{}} +", quoted_root)
            }
            StatSyntax::Bsd => {
                format!("find -P {} -type f -exec stat -f '%z %Lp %m %N' {{}} +", quoted_root)
            }
        }
    }
}

/// Result of classifying one remote path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub exists: bool,
    pub is_directory: bool,
}

/// Remote filesystem questions over one-shot command channels. File payload
/// reads never come through here; that is the agents' job.
pub struct RemoteEnumerator<'a> {
    shell: &'a dyn RemoteShell,
    syntax: OnceLock<StatSyntax>,
}

impl<'a> RemoteEnumerator<'a> {
    pub fn new(shell: &'a dyn RemoteShell) -> Self {
        Self { shell, syntax: OnceLock::new() }
    }

    /// Probe once with a file that exists everywhere, then remember the
    /// dialect for the rest of the session.
    pub fn ensure_stat_syntax(&self) -> Result<StatSyntax> {
        if let Some(syntax) = self.syntax.get() {
            return Ok(*syntax);
        }
        let gnu = self.shell.exec_remote("stat -c '%s %a %Y' /dev/null")?;
        let syntax = if gnu.success() {
            StatSyntax::Gnu
        } else {
            let bsd = self.shell.exec_remote("stat -f '%z %Lp %m' /dev/null")?;
            if bsd.success() {
                StatSyntax::Bsd
            } else {
                return Err(TransferError::Enumeration(
                    "stat probe".to_string(),
                    format!("neither GNU nor BSD stat answered: {}", bsd.stderr.trim()),
                )
                .into());
            }
        };
        let _ = self.syntax.set(syntax);
        tracing::debug!("[get][enum] remote stat syntax: {:?}", syntax);
        Ok(syntax)
    }

    pub fn classify(&self, path: &str) -> Result<Classification> {
        let qp = quote_path(path);
        let cmd = format!(
            "if [ -d {qp} ]; then echo D; elif [ -e {qp} ]; then echo F; else echo N; fi",
            qp = qp
        );
        let out = self.shell.exec_remote(&cmd)?;
        if !out.success() {
            return Err(TransferError::Enumeration(
                path.to_string(),
                out.stderr.trim().to_string(),
            )
            .into());
        }
        match out.stdout.trim() {
            "D" => Ok(Classification { exists: true, is_directory: true }),
            "F" => Ok(Classification { exists: true, is_directory: false }),
            _ => Ok(Classification { exists: false, is_directory: false }),
        }
    }

    /// List the files under `root` with size/mode/mtime. A file root yields
    /// a single-entry list; a directory root recurses through `find`.
    pub fn list_files(&self, root: &str) -> Result<Vec<FileEntry>> {
        let syntax = self.ensure_stat_syntax()?;
        let classification = self.classify(root)?;
        if !classification.exists {
            return Err(TransferError::Enumeration(
                root.to_string(),
                "no such file or directory".to_string(),
            )
            .into());
        }
        let qp = quote_path(root);
        let cmd = if classification.is_directory {
            syntax.find_with_stat(&qp)
        } else {
            syntax.stat_one(&qp)
        };
        let out = self.shell.exec_remote(&cmd)?;
        if !out.success() {
            return Err(TransferError::Enumeration(
                root.to_string(),
                out.stderr.trim().to_string(),
            )
            .into());
        }
        let mut entries = Vec::new();
        for line in out.stdout.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (size, mode, mtime, full_path) =
                parse_stat_line(line).ok_or_else(|| {
                    TransferError::Enumeration(
                        root.to_string(),
                        format!("unparsable stat line: {}", line),
                    )
                })?;
            entries.push(FileEntry {
                relative_path: relative_to_root(&full_path, root),
                full_path,
                size,
                mode,
                mtime,
                matched_root: root.to_string(),
                matched_root_is_dir: classification.is_directory,
            });
        }
        Ok(entries)
    }

    /// Expand a wildcard pattern with the remote shell's own globbing. An
    /// empty result is not an error here; callers decide whether that is
    /// fatal.
    pub fn expand_wildcard(&self, pattern: &str) -> Result<Vec<String>> {
        let cmd = format!(
            "for f in {}; do if [ -e \"$f\" ]; then printf '%s\\n' \"$f\"; fi; done",
            escape_glob(pattern)
        );
        let out = self.shell.exec_remote(&cmd)?;
        if !out.success() {
            return Err(TransferError::Enumeration(
                pattern.to_string(),
                out.stderr.trim().to_string(),
            )
            .into());
        }
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect())
    }
}

/// Parse one `size mode(octal) mtime name` line. The name is everything
/// after the third space, so paths with spaces survive.
pub fn parse_stat_line(line: &str) -> Option<(u64, u16, i64, String)> {
    let mut parts = line.splitn(4, ' ');
    let size: u64 = parts.next()?.parse().ok()?;
    let mode = u16::from_str_radix(parts.next()?, 8).ok()?;
    let mtime: i64 = parts.next()?.parse().ok()?;
    let name = parts.next()?;
    if name.is_empty() {
        return None;
    }
    Some((size, mode & 0o7777, mtime, name.to_string()))
}

/// Relative path of `full` under `root`: the root prefix and any leading
/// slash are stripped; a file root maps to its basename.
fn relative_to_root(full: &str, root: &str) -> String {
    let root_trimmed = root.trim_end_matches('/');
    let rel = match full.strip_prefix(root_trimmed) {
        // Only strip at a path component boundary.
        Some(r) if r.is_empty() || r.starts_with('/') => r.trim_start_matches('/'),
        _ => full.trim_start_matches('/'),
    };
    if rel.is_empty() {
        full.rsplit('/').next().unwrap_or(full).to_string()
    } else {
        rel.to_string()
    }
}

/// Escape a wildcard pattern for the remote shell, keeping `*` and `?`
/// live so the remote glob expansion still happens. Everything else that
/// the shell could interpret gets a backslash.
fn escape_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' | '?' | '/' => out.push(c),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '~' | '+') => {
                out.push(c)
            }
            c => {
                out.push('\\');
                out.push(c);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::session::RemoteOutput;
    use std::sync::Mutex;

    /// Scripted one-shot shell: pattern substring -> canned output.
    struct FakeShell {
        responses: Vec<(&'static str, RemoteOutput)>,
        log: Mutex<Vec<String>>,
    }

    impl FakeShell {
        fn new(responses: Vec<(&'static str, RemoteOutput)>) -> Self {
            Self { responses, log: Mutex::new(Vec::new()) }
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn ok(stdout: &str) -> RemoteOutput {
        RemoteOutput { status: 0, stdout: stdout.to_string(), stderr: String::new() }
    }

    fn fail(stderr: &str) -> RemoteOutput {
        RemoteOutput { status: 1, stdout: String::new(), stderr: stderr.to_string() }
    }

    impl RemoteShell for FakeShell {
        fn exec_remote(&self, cmd: &str) -> Result<RemoteOutput> {
            self.log.lock().unwrap().push(cmd.to_string());
            for (needle, out) in &self.responses {
                if cmd.contains(needle) {
                    return Ok(out.clone());
                }
            }
            panic!("unexpected remote command: {}", cmd);
        }
    }

    #[test]
    fn probe_prefers_gnu() {
        let shell = FakeShell::new(vec![("stat -c '%s %a %Y' /dev/null", ok("0 666 0"))]);
        let e = RemoteEnumerator::new(&shell);
        assert_eq!(e.ensure_stat_syntax().unwrap(), StatSyntax::Gnu);
        // Cached: probing again issues no further commands.
        assert_eq!(e.ensure_stat_syntax().unwrap(), StatSyntax::Gnu);
        assert_eq!(shell.commands().len(), 1);
    }

    #[test]
    fn probe_falls_back_to_bsd() {
        let shell = FakeShell::new(vec![
            ("stat -c", fail("stat: illegal option -- c")),
            ("stat -f", ok("0 666 0")),
        ]);
        let e = RemoteEnumerator::new(&shell);
        assert_eq!(e.ensure_stat_syntax().unwrap(), StatSyntax::Bsd);
    }

    #[test]
    fn stat_line_parsing_keeps_spaces_in_names() {
        let (size, mode, mtime, name) =
            parse_stat_line("1048576 644 1700000000 /srv/dir/with spaces/c.bin").unwrap();
        assert_eq!(size, 1048576);
        assert_eq!(mode, 0o644);
        assert_eq!(mtime, 1700000000);
        assert_eq!(name, "/srv/dir/with spaces/c.bin");
    }

    #[test]
    fn stat_line_rejects_garbage() {
        assert!(parse_stat_line("not a stat line").is_none());
        assert!(parse_stat_line("12 999z 55 /x").is_none());
        assert!(parse_stat_line("").is_none());
    }

    #[test]
    fn list_files_on_directory_recurses() {
        let shell = FakeShell::new(vec![
            ("stat -c '%s %a %Y' /dev/null", ok("0 666 0")),
            ("if [ -d ", ok("D")),
            (
                "find -P ",
                ok("1 644 1700000001 /srv/dir/a.txt\n\
                    2 640 1700000002 /srv/dir/sub/b.txt\n\
                    3145728 755 1700000003 /srv/dir/sub/c.bin\n"),
            ),
        ]);
        let e = RemoteEnumerator::new(&shell);
        let entries = e.list_files("/srv/dir").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].relative_path, "a.txt");
        assert_eq!(entries[1].relative_path, "sub/b.txt");
        assert_eq!(entries[2].relative_path, "sub/c.bin");
        assert_eq!(entries[2].size, 3 * 1024 * 1024);
        assert_eq!(entries[1].mode, 0o640);
        assert!(entries.iter().all(|f| f.matched_root_is_dir));
        assert!(entries.iter().all(|f| f.matched_root == "/srv/dir"));
    }

    #[test]
    fn list_files_on_single_file() {
        let shell = FakeShell::new(vec![
            ("stat -c '%s %a %Y' /dev/null", ok("0 666 0")),
            ("if [ -d ", ok("F")),
            ("stat -c '%s %a %Y %n'", ok("128 600 1690000000 /srv/data/readme.txt\n")),
        ]);
        let e = RemoteEnumerator::new(&shell);
        let entries = e.list_files("/srv/data/readme.txt").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, "readme.txt");
        assert_eq!(entries[0].size, 128);
        assert!(!entries[0].matched_root_is_dir);
    }

    #[test]
    fn missing_root_is_an_enumeration_error() {
        let shell = FakeShell::new(vec![
            ("stat -c '%s %a %Y' /dev/null", ok("0 666 0")),
            ("if [ -d ", ok("N")),
        ]);
        let e = RemoteEnumerator::new(&shell);
        let err = e.list_files("/srv/gone").unwrap_err();
        assert!(err.to_string().contains("/srv/gone"));
    }

    #[test]
    fn enumeration_failure_attaches_stderr() {
        let shell = FakeShell::new(vec![
            ("stat -c '%s %a %Y' /dev/null", ok("0 666 0")),
            ("if [ -d ", ok("D")),
            ("find -P ", fail("find: /srv/dir: Permission denied")),
        ]);
        let e = RemoteEnumerator::new(&shell);
        let err = e.list_files("/srv/dir").unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
    }

    #[test]
    fn wildcard_expansion_trims_and_filters() {
        let shell =
            FakeShell::new(vec![("for f in ", ok("/srv/x.log\n/srv/y.log\n\n  \n"))]);
        let e = RemoteEnumerator::new(&shell);
        let paths = e.expand_wildcard("/srv/*.log").unwrap();
        assert_eq!(paths, vec!["/srv/x.log".to_string(), "/srv/y.log".to_string()]);
    }

    #[test]
    fn wildcard_expansion_empty_is_not_an_error() {
        let shell = FakeShell::new(vec![("for f in ", ok(""))]);
        let e = RemoteEnumerator::new(&shell);
        assert!(e.expand_wildcard("/srv/*.nope").unwrap().is_empty());
    }

    #[test]
    fn glob_escaping_keeps_wildcards_live() {
        assert_eq!(escape_glob("/srv/*.log"), "/srv/*.log");
        assert_eq!(escape_glob("/srv/report-?.csv"), "/srv/report-?.csv");
        assert_eq!(escape_glob("/srv/my logs/*.log"), "/srv/my\\ logs/*.log");
        assert_eq!(escape_glob("/srv/it's/*.log"), "/srv/it\\'s/*.log");
    }

    #[test]
    fn classify_quotes_awkward_paths() {
        let shell = FakeShell::new(vec![
            ("if [ -d ", ok("F")),
        ]);
        let e = RemoteEnumerator::new(&shell);
        e.classify("/srv/it's here/x y.log").unwrap();
        let cmds = shell.commands();
        assert!(cmds[0].contains("'"), "path should be shell-quoted: {}", cmds[0]);
    }
}
