use std::io::{Read, Write};
use std::process::{Child, ChildStdin};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Sender, unbounded};

use super::framing::{FrameReader, STALL_TIMEOUT, STATUS_ERR, STATUS_OK, encode_request};
use super::session::SshSettings;
use crate::TransferError;

/// Retained stderr per agent, tail-bounded so a chatty remote cannot grow
/// memory without limit.
pub const STDERR_TAIL_LIMIT: usize = 5 * 1024;

/// The remote reader process. It is shipped inline over the ssh command line
/// (`exec python3 -c ...`), reads length-prefixed requests on stdin and
/// answers with a status/length header followed by the streamed bytes.
/// Stdin EOF means clean exit; a pre-body failure is reported as a
/// status=1 frame with a message capped at 1000 bytes. Set SSHGET_DEBUG=1
/// remotely for stderr tracing.
pub const AGENT_SOURCE: &str = r#"
import os, struct, sys

CHUNK = 262144
DEBUG = os.environ.get("SSHGET_DEBUG") == "1"

inp = sys.stdin.buffer
out = sys.stdout.buffer

def log(msg):
    if DEBUG:
        sys.stderr.write("agent: %s\n" % msg)
        sys.stderr.flush()

def read_exact(n):
    data = b""
    while len(data) < n:
        piece = inp.read(n - len(data))
        if not piece:
            return None
        data += piece
    return data

def send_error(exc):
    msg = str(exc).encode("utf-8")[:1000]
    out.write(struct.pack(">BQ", 1, len(msg)))
    out.write(msg)
    out.flush()

def serve():
    while True:
        hdr = read_exact(2)
        if hdr is None:
            return
        (path_len,) = struct.unpack(">H", hdr)
        rest = read_exact(path_len + 16)
        if rest is None:
            return
        path = rest[:path_len].decode("utf-8", "surrogateescape")
        offset, length = struct.unpack(">QQ", rest[path_len:])
        log("read %s @%d +%d" % (path, offset, length))
        try:
            size = os.stat(path).st_size
            f = open(path, "rb")
        except Exception as exc:
            send_error(exc)
            continue
        actual = min(length, size - offset) if offset < size else 0
        out.write(struct.pack(">BQ", 0, actual))
        out.flush()
        sent = 0
        with f:
            f.seek(offset)
            while sent < actual:
                piece = f.read(min(CHUNK, actual - sent))
                if not piece:
                    log("short read on %s" % path)
                    sys.exit(1)
                out.write(piece)
                sent += len(piece)
        out.flush()

try:
    serve()
except BrokenPipeError:
    pass
except Exception as exc:
    try:
        send_error(exc)
    except Exception:
        pass
    sys.exit(1)
"#;

/// Client-side handle for one remote agent channel. All I/O on the channel
/// is single-threaded: one outstanding request at a time, enforced by the
/// pool's busy flag.
pub struct Agent {
    pub id: usize,
    child: Option<Child>,
    writer: Box<dyn Write + Send>,
    reader: FrameReader,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    label: String,
}

/// Append to a bounded tail buffer, discarding the oldest bytes first.
fn tail_push(tail: &Mutex<Vec<u8>>, chunk: &[u8]) {
    let mut guard = tail.lock().expect("stderr tail lock");
    guard.extend_from_slice(chunk);
    if guard.len() > STDERR_TAIL_LIMIT {
        let excess = guard.len() - STDERR_TAIL_LIMIT;
        guard.drain(..excess);
    }
}

impl Agent {
    /// Spawn the ssh child for one agent channel and start its stdout and
    /// stderr pumps. Readiness still requires an in-band ping.
    pub fn spawn(settings: &SshSettings, id: usize) -> Result<Self> {
        let mut cmd = settings.agent_command(AGENT_SOURCE)?;
        let mut child = cmd.spawn().map_err(|e| {
            TransferError::AgentSpawn(format!("spawning ssh for tunnel {}: {}", id, e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransferError::AgentSpawn(format!("tunnel {}: no stdout pipe", id)))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransferError::AgentSpawn(format!("tunnel {}: no stderr pipe", id)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransferError::AgentSpawn(format!("tunnel {}: no stdin pipe", id)))?;

        let (data_tx, data_rx) = unbounded::<Vec<u8>>();
        spawn_stdout_pump(id, stdout, data_tx);
        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        spawn_stderr_pump(id, stderr, stderr_tail.clone());

        let label = format!("tunnel {}", id);
        Ok(Self {
            id,
            child: Some(child),
            writer: Box::new(stdin) as Box<dyn Write + Send>,
            reader: FrameReader::new(data_rx, STALL_TIMEOUT, label.clone()),
            stderr_tail,
            label,
        })
    }

    /// Build an agent over in-process channels instead of an ssh child.
    /// Test seam; the framing path is identical to the real one.
    #[cfg(test)]
    pub fn for_test(
        id: usize,
        writer: Box<dyn Write + Send>,
        data_rx: crossbeam_channel::Receiver<Vec<u8>>,
        stall: Duration,
    ) -> Self {
        let label = format!("tunnel {}", id);
        Self {
            id,
            child: None,
            writer,
            reader: FrameReader::new(data_rx, stall, label.clone()),
            stderr_tail: Arc::new(Mutex::new(Vec::new())),
            label,
        }
    }

    fn send_request(&mut self, path: &str, offset: u64, length: u64) -> Result<()> {
        let frame = encode_request(path, offset, length)?;
        self.writer.write_all(&frame).map_err(|e| {
            TransferError::AgentClosed(format!("{}: request write failed: {}", self.label, e))
        })?;
        self.writer.flush().map_err(|e| {
            TransferError::AgentClosed(format!("{}: request flush failed: {}", self.label, e))
        })?;
        Ok(())
    }

    /// Issue one read request and stream the response body into `sink`.
    /// Returns the number of body bytes the agent actually sent, which may
    /// be less than `length` when the request runs past end of file.
    pub fn read_range_streaming(
        &mut self,
        path: &str,
        offset: u64,
        length: u64,
        sink: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<u64> {
        self.send_request(path, offset, length)?;
        let header = self.reader.read_response_header("response header")?;
        match header.status {
            STATUS_OK => {
                self.reader.stream_body(header.data_len, "response body", sink)?;
                Ok(header.data_len)
            }
            STATUS_ERR => {
                let raw = self.reader.read_exact(header.data_len as usize, "error message")?;
                Err(TransferError::RemoteRead(String::from_utf8_lossy(&raw).to_string()).into())
            }
            other => Err(TransferError::AgentClosed(format!(
                "{}: corrupt response status {}",
                self.label, other
            ))
            .into()),
        }
    }

    /// In-band readiness probe: a zero-length read of /dev/null proves the
    /// ssh channel, the remote python, and the framing all work.
    pub fn ping(&mut self, timeout: Duration) -> Result<()> {
        self.send_request("/dev/null", 0, 0)?;
        let header = self.reader.read_response_header_timeout(timeout, "ping")?;
        if header.status != STATUS_OK || header.data_len != 0 {
            return Err(TransferError::AgentSpawn(format!(
                "{}: ping answered status={} len={}",
                self.label, header.status, header.data_len
            ))
            .into());
        }
        Ok(())
    }

    pub fn stderr_tail(&self) -> String {
        let guard = self.stderr_tail.lock().expect("stderr tail lock");
        String::from_utf8_lossy(&guard).to_string()
    }

    pub fn stderr_tail_handle(&self) -> Arc<Mutex<Vec<u8>>> {
        self.stderr_tail.clone()
    }

    /// Tear the channel down: close stdin first so a healthy agent exits on
    /// its own, then SIGTERM, a short grace period, and SIGKILL for
    /// survivors.
    pub fn close(&mut self) {
        // Dropping the writer closes the child's stdin.
        self.writer = Box::new(std::io::sink());
        let Some(mut child) = self.child.take() else { return };
        #[cfg(unix)]
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {
                    if std::time::Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(_) => break,
            }
        }
        let _ = child.kill();
        let _ = child.wait();
        tracing::debug!("[get][agent] tunnel {} killed after grace period", self.id);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_stdout_pump(id: usize, mut stdout: impl Read + Send + 'static, tx: Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; 256 * 1024];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("[get][agent] tunnel {} stdout pump ended: {}", id, e);
                    break;
                }
            }
        }
        // Sender drop disconnects the FrameReader, which reports it as a
        // closed channel to whoever is mid-read.
    });
}

fn spawn_stderr_pump(
    id: usize,
    mut stderr: impl Read + Send + 'static,
    tail: Arc<Mutex<Vec<u8>>>,
) {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; 4096];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => tail_push(&tail, &buf[..n]),
                Err(_) => break,
            }
        }
        let _ = id;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_is_bounded() {
        let tail = Mutex::new(Vec::new());
        for _ in 0..40 {
            tail_push(&tail, &[b'x'; 512]);
        }
        let len = tail.lock().unwrap().len();
        assert_eq!(len, STDERR_TAIL_LIMIT);
    }

    #[test]
    fn stderr_tail_keeps_newest_bytes() {
        let tail = Mutex::new(Vec::new());
        tail_push(&tail, &vec![b'a'; STDERR_TAIL_LIMIT]);
        tail_push(&tail, b"final words");
        let guard = tail.lock().unwrap();
        assert!(guard.ends_with(b"final words"));
        assert_eq!(guard.len(), STDERR_TAIL_LIMIT);
    }

    #[test]
    fn agent_source_avoids_single_quotes() {
        // The source is wrapped in single quotes for the remote shell; any
        // embedded one would need escaping and complicate the command line.
        assert!(!AGENT_SOURCE.contains('\''));
    }

    #[test]
    fn closed_writer_reports_agent_closed() {
        struct ClosedPipe;
        impl Write for ClosedPipe {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let (_tx, rx) = unbounded();
        let mut agent =
            Agent::for_test(4, Box::new(ClosedPipe), rx, Duration::from_millis(50));
        let err = agent.read_range_streaming("/x", 0, 1, &mut |_| Ok(())).unwrap_err();
        assert!(err.to_string().contains("connection closed"));
    }
}
