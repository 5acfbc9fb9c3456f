#![allow(dead_code)]
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};

use super::agent::Agent;
use super::framing::{STATUS_ERR, STATUS_OK, decode_request, encode_response_header};

/// Scripted remote-side behavior for one in-process agent. The mock speaks
/// the real frame protocol over channels, so the client path under test is
/// byte-for-byte the production one.
#[derive(Default, Clone)]
pub struct MockBehavior {
    /// Path -> file contents. `/dev/null` is implicitly an empty file.
    pub files: HashMap<String, Vec<u8>>,
    /// Paths answered with a status=1 frame carrying this message.
    pub error_paths: HashMap<String, String>,
    /// Paths whose response header arrives but whose body never does.
    pub stall_paths: HashSet<String>,
    /// Paths that drop the channel after half of the body.
    pub close_paths: HashSet<String>,
    /// Size of the pieces the body is split into, to exercise partial
    /// delivery. Zero means one piece.
    pub piece_size: usize,
}

impl MockBehavior {
    pub fn serving(files: HashMap<String, Vec<u8>>) -> Self {
        Self { files, piece_size: 8 * 1024, ..Self::default() }
    }

    pub fn with_file(mut self, path: &str, data: Vec<u8>) -> Self {
        self.files.insert(path.to_string(), data);
        self
    }

    pub fn with_error(mut self, path: &str, msg: &str) -> Self {
        self.error_paths.insert(path.to_string(), msg.to_string());
        self
    }

    pub fn with_stall(mut self, path: &str) -> Self {
        self.stall_paths.insert(path.to_string());
        self
    }

    pub fn with_close(mut self, path: &str) -> Self {
        self.close_paths.insert(path.to_string());
        self
    }
}

/// Write half of the fake channel: forwards request bytes to the serve loop.
struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock agent gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn body_pieces(data: &[u8], piece: usize) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }
    let piece = if piece == 0 { data.len() } else { piece };
    data.chunks(piece).map(|c| c.to_vec()).collect()
}

/// Build an agent wired to an in-process responder thread with the given
/// behavior and stall timeout.
pub fn mock_agent(id: usize, behavior: MockBehavior, stall: Duration) -> Agent {
    let (req_tx, req_rx) = unbounded::<Vec<u8>>();
    let (data_tx, data_rx) = unbounded::<Vec<u8>>();

    std::thread::spawn(move || {
        let mut pending: Vec<u8> = Vec::new();
        'serve: while let Ok(chunk) = req_rx.recv() {
            pending.extend_from_slice(chunk.as_slice());
            while let Some((path, offset, length, consumed)) = decode_request(&pending) {
                pending.drain(..consumed);

                if let Some(msg) = behavior.error_paths.get(&path) {
                    let bytes = msg.as_bytes();
                    let hdr = encode_response_header(STATUS_ERR, bytes.len() as u64);
                    let _ = data_tx.send(hdr.to_vec());
                    let _ = data_tx.send(bytes.to_vec());
                    continue;
                }

                let empty = Vec::new();
                let data = if path == "/dev/null" {
                    &empty
                } else {
                    match behavior.files.get(&path) {
                        Some(d) => d,
                        None => {
                            let msg = format!("No such file or directory: {}", path);
                            let hdr =
                                encode_response_header(STATUS_ERR, msg.len() as u64);
                            let _ = data_tx.send(hdr.to_vec());
                            let _ = data_tx.send(msg.into_bytes());
                            continue;
                        }
                    }
                };

                let size = data.len() as u64;
                let actual =
                    if offset < size { length.min(size - offset) } else { 0 };
                let hdr = encode_response_header(STATUS_OK, actual);
                let _ = data_tx.send(hdr.to_vec());

                if behavior.stall_paths.contains(&path) {
                    // Header delivered, body never follows; the client's
                    // stall timer has to fire. Keep the channel open.
                    loop {
                        if req_rx.recv().is_err() {
                            break 'serve;
                        }
                    }
                }

                let body: &[u8] = if actual == 0 {
                    &[]
                } else {
                    &data[offset as usize..(offset + actual) as usize]
                };
                let pieces = body_pieces(body, behavior.piece_size);
                if behavior.close_paths.contains(&path) {
                    let keep = pieces.len() / 2;
                    for piece in pieces.into_iter().take(keep) {
                        let _ = data_tx.send(piece);
                    }
                    break 'serve;
                }
                for piece in pieces {
                    let _ = data_tx.send(piece);
                }
            }
        }
        // data_tx drops here: the client sees a closed channel.
    });

    Agent::for_test(id, Box::new(PipeWriter { tx: req_tx }), data_rx, stall)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_stall() -> Duration {
        Duration::from_millis(100)
    }

    #[test]
    fn serves_whole_file() {
        let data: Vec<u8> = (0..=255u8).cycle().take(40_000).collect();
        let mut agent = mock_agent(
            0,
            MockBehavior::serving(HashMap::new()).with_file("/srv/a.bin", data.clone()),
            short_stall(),
        );
        let mut got = Vec::new();
        let n = agent
            .read_range_streaming("/srv/a.bin", 0, data.len() as u64, &mut |c| {
                got.extend_from_slice(c);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(got, data);
    }

    #[test]
    fn serves_interior_range() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut agent = mock_agent(
            0,
            MockBehavior::serving(HashMap::new()).with_file("/srv/r.bin", data.clone()),
            short_stall(),
        );
        let mut got = Vec::new();
        let n = agent
            .read_range_streaming("/srv/r.bin", 10, 20, &mut |c| {
                got.extend_from_slice(c);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 20);
        assert_eq!(got, data[10..30].to_vec());
    }

    #[test]
    fn short_tail_reads_trust_the_header() {
        let data = vec![7u8; 50];
        let mut agent = mock_agent(
            0,
            MockBehavior::serving(HashMap::new()).with_file("/srv/t.bin", data),
            short_stall(),
        );
        let mut got = 0u64;
        let n = agent
            .read_range_streaming("/srv/t.bin", 40, 100, &mut |c| {
                got += c.len() as u64;
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 10);
        assert_eq!(got, 10);
    }

    #[test]
    fn ping_works_against_dev_null() {
        let mut agent =
            mock_agent(0, MockBehavior::serving(HashMap::new()), short_stall());
        agent.ping(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn missing_file_is_a_remote_read_error() {
        let mut agent =
            mock_agent(0, MockBehavior::serving(HashMap::new()), short_stall());
        let err = agent.read_range_streaming("/nope", 0, 4, &mut |_| Ok(())).unwrap_err();
        assert!(err.to_string().contains("No such file"));
        assert!(!crate::error_is_agent_level(&err));
    }

    #[test]
    fn stalling_path_trips_the_stall_timer() {
        let mut agent = mock_agent(
            0,
            MockBehavior::serving(HashMap::new())
                .with_file("/srv/s.bin", vec![1u8; 1024])
                .with_stall("/srv/s.bin"),
            short_stall(),
        );
        let err =
            agent.read_range_streaming("/srv/s.bin", 0, 1024, &mut |_| Ok(())).unwrap_err();
        assert!(err.to_string().contains("stalled"));
        assert!(crate::error_is_agent_level(&err));
    }

    #[test]
    fn closing_path_reports_connection_closed() {
        let mut agent = mock_agent(
            0,
            MockBehavior::serving(HashMap::new())
                .with_file("/srv/c.bin", vec![2u8; 64 * 1024])
                .with_close("/srv/c.bin"),
            short_stall(),
        );
        let err = agent
            .read_range_streaming("/srv/c.bin", 0, 64 * 1024, &mut |_| Ok(()))
            .unwrap_err();
        assert!(err.to_string().contains("connection closed"));
        assert!(crate::error_is_agent_level(&err));
    }
}
