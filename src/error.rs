/// Repository-wide structured errors for transfer-related operations.
///
/// Agent-level errors (stall, channel close) quarantine the agent that
/// produced them; job-level errors consume the job's retry budget. The
/// distinction lives in `is_agent_level`.
#[derive(Debug, Clone)]
pub enum TransferError {
    // source / destination validation
    InvalidSource(String),
    SourceEndpointsDiffer(String, String),
    RemoteLikeTarget(String),
    MissingSource,
    WildcardNoMatches(String),
    // auth / environment
    SshpassMissing,
    AuthFailed(String),
    RuntimeUnsupported(String),
    // agent lifecycle
    AgentSpawn(String),
    AgentStalled(String),
    AgentClosed(String),
    // remote operations
    RemoteRead(String),
    Enumeration(String, String),
    // local filesystem
    LocalIo(String, String),
    // scheduler terminal conditions
    JobFailed(String, String),
    NoHealthyAgents(String),
    Aborted,
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use TransferError::*;
        match self {
            InvalidSource(s) => {
                write!(f, "invalid source '{}': expected [user@]host:path", s)
            }
            SourceEndpointsDiffer(a, b) => {
                write!(f, "all sources must share one user@host: '{}' vs '{}'", a, b)
            }
            RemoteLikeTarget(t) => write!(
                f,
                "destination '{}' looks like a remote path; the destination must be local \
                 (downloads only)",
                t
            ),
            MissingSource => write!(f, "at least one remote source is required"),
            WildcardNoMatches(pat) => write!(f, "wildcard matched nothing on remote: {}", pat),
            SshpassMissing => {
                write!(f, "password auth requested but 'sshpass' was not found in PATH")
            }
            AuthFailed(host) => write!(f, "SSH authentication failed for {}", host),
            RuntimeUnsupported(detail) => {
                write!(f, "remote host lacks a usable python3: {}", detail)
            }
            AgentSpawn(detail) => write!(f, "agent failed to start: {}", detail),
            AgentStalled(ctx) => write!(f, "agent read stalled: {}", ctx),
            AgentClosed(ctx) => write!(f, "agent connection closed: {}", ctx),
            RemoteRead(msg) => write!(f, "remote read failed: {}", msg),
            Enumeration(what, stderr) => {
                write!(f, "remote enumeration failed: {} — {}", what, stderr)
            }
            LocalIo(path, msg) => write!(f, "local I/O error: {} — {}", path, msg),
            JobFailed(label, cause) => write!(f, "giving up on {}: {}", label, cause),
            NoHealthyAgents(label) => {
                write!(f, "no healthy agents remain while {} is outstanding", label)
            }
            Aborted => write!(f, "transfer aborted"),
        }
    }
}

impl std::error::Error for TransferError {}

impl TransferError {
    /// Whether this error indicts the agent/channel rather than the job.
    /// Agent-level failures quarantine the agent and re-queue the job without
    /// touching its retry counter; everything else is charged to the job.
    pub fn is_agent_level(&self) -> bool {
        matches!(self, TransferError::AgentStalled(_) | TransferError::AgentClosed(_))
    }

    /// Classify a foreign (non-TransferError) failure by message, for errors
    /// that crossed an anyhow boundary without a typed variant.
    pub fn message_is_agent_level(msg: &str) -> bool {
        msg.contains("stalled")
            || msg.contains("read timeout")
            || msg.contains("read stalled")
            || msg.contains("connection closed")
            || msg.starts_with("Agent ")
    }

    /// Whether an agent startup failure is worth another spawn attempt.
    /// Transient server-side throttling shows up as connection resets or
    /// aborted key exchanges.
    pub fn spawn_is_retryable(msg: &str) -> bool {
        msg.contains("Connection reset") || msg.contains("kex_exchange")
    }
}

/// Decide agent-level vs job-level for an error that may or may not be a
/// typed `TransferError` (the scheduler sees `anyhow::Error`).
pub fn error_is_agent_level(err: &anyhow::Error) -> bool {
    if let Some(te) = err.downcast_ref::<TransferError>() {
        return te.is_agent_level();
    }
    TransferError::message_is_agent_level(&err.to_string())
}
