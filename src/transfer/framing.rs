use std::time::Duration;

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::TransferError;

/// Wire status codes for agent responses.
pub const STATUS_OK: u8 = 0;
pub const STATUS_ERR: u8 = 1;

/// Response header: status byte plus big-endian payload length.
pub const RESPONSE_HEADER_LEN: usize = 1 + 8;

/// Default stall timeout. The timer restarts on every byte arrival, so a
/// slow-but-moving stream never trips it.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Encode one read request: `u16 path_len | path | u64 offset | u64 length`,
/// big-endian throughout. Paths travel as raw length-prefixed bytes; shell
/// quoting never applies on this path.
pub fn encode_request(path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
    let path_bytes = path.as_bytes();
    if path_bytes.len() > u16::MAX as usize {
        return Err(TransferError::RemoteRead(format!(
            "path too long for framing ({} bytes)",
            path_bytes.len()
        ))
        .into());
    }
    let mut frame = Vec::with_capacity(2 + path_bytes.len() + 16);
    frame.write_u16::<BigEndian>(path_bytes.len() as u16).expect("vec write");
    frame.extend_from_slice(path_bytes);
    frame.write_u64::<BigEndian>(offset).expect("vec write");
    frame.write_u64::<BigEndian>(length).expect("vec write");
    Ok(frame)
}

/// Decode one request frame from `bytes`. Returns the parsed request and the
/// number of bytes consumed, or `None` if the buffer does not yet hold a
/// complete frame. The in-process test agent is the main consumer; it also
/// pins down the wire format against drift.
pub fn decode_request(bytes: &[u8]) -> Option<(String, u64, u64, usize)> {
    if bytes.len() < 2 {
        return None;
    }
    let path_len = BigEndian::read_u16(&bytes[..2]) as usize;
    let total = 2 + path_len + 16;
    if bytes.len() < total {
        return None;
    }
    let path = String::from_utf8_lossy(&bytes[2..2 + path_len]).to_string();
    let offset = BigEndian::read_u64(&bytes[2 + path_len..2 + path_len + 8]);
    let length = BigEndian::read_u64(&bytes[2 + path_len + 8..total]);
    Some((path, offset, length, total))
}

/// Parsed response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: u8,
    pub data_len: u64,
}

pub fn encode_response_header(status: u8, data_len: u64) -> [u8; RESPONSE_HEADER_LEN] {
    let mut hdr = [0u8; RESPONSE_HEADER_LEN];
    hdr[0] = status;
    BigEndian::write_u64(&mut hdr[1..], data_len);
    hdr
}

/// Buffered reader over an agent's byte pump. One `FrameReader` exists per
/// agent channel and at most one request is outstanding on it at a time;
/// pipelining would desynchronize the stream since responses carry no
/// request id.
pub struct FrameReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
    stall: Duration,
    label: String,
}

impl FrameReader {
    pub fn new(rx: Receiver<Vec<u8>>, stall: Duration, label: String) -> Self {
        Self { rx, buf: Vec::new(), pos: 0, stall, label }
    }

    fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Drop consumed bytes once the cursor has moved far enough to matter.
    fn compact(&mut self) {
        if self.pos > 0 && (self.pos >= 64 * 1024 || self.pos == self.buf.len()) {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    /// Block until at least one more chunk arrives. Each wait is a fresh
    /// stall window; any arrival resets the clock by construction.
    fn fill(&mut self, timeout: Duration, phase: &str) -> Result<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => {
                self.buf.extend_from_slice(&chunk);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(TransferError::AgentStalled(format!(
                "{}: no bytes for {:.0?} during {}",
                self.label, timeout, phase
            ))
            .into()),
            Err(RecvTimeoutError::Disconnected) => Err(TransferError::AgentClosed(format!(
                "{}: channel EOF during {}",
                self.label, phase
            ))
            .into()),
        }
    }

    /// Read exactly `n` bytes, waiting with the configured stall timeout.
    pub fn read_exact(&mut self, n: usize, phase: &str) -> Result<Vec<u8>> {
        self.read_exact_timeout(n, self.stall, phase)
    }

    pub fn read_exact_timeout(&mut self, n: usize, timeout: Duration, phase: &str) -> Result<Vec<u8>> {
        while self.buffered() < n {
            self.fill(timeout, phase)?;
        }
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        self.compact();
        Ok(out)
    }

    pub fn read_response_header(&mut self, phase: &str) -> Result<ResponseHeader> {
        self.read_response_header_timeout(self.stall, phase)
    }

    pub fn read_response_header_timeout(
        &mut self,
        timeout: Duration,
        phase: &str,
    ) -> Result<ResponseHeader> {
        let hdr = self.read_exact_timeout(RESPONSE_HEADER_LEN, timeout, phase)?;
        Ok(ResponseHeader { status: hdr[0], data_len: BigEndian::read_u64(&hdr[1..]) })
    }

    /// Stream `data_len` body bytes into `sink` as they arrive. Partial
    /// chunks are forwarded immediately; the sink sees every byte exactly
    /// once and in order. Anything buffered beyond the body stays for the
    /// next read.
    pub fn stream_body(
        &mut self,
        data_len: u64,
        phase: &str,
        sink: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut remaining = data_len;
        while remaining > 0 {
            if self.buffered() == 0 {
                self.fill(self.stall, phase)?;
                continue;
            }
            let take = (self.buffered() as u64).min(remaining) as usize;
            let start = self.pos;
            self.pos += take;
            remaining -= take as u64;
            // Borrow the slice after the cursor moves so the sink can't
            // observe a stale cursor through a re-entrant read.
            sink(&self.buf[start..start + take])?;
            self.compact();
        }
        Ok(())
    }
}
