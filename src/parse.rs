use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

use crate::TransferError;

/// One parsed `[user@]host:path` source argument. `path` may still contain
/// `*` / `?`; expansion happens remotely before enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub user: String,
    pub host: String,
    pub path: String,
}

impl RemoteSource {
    pub fn endpoint(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn has_wildcard(&self) -> bool {
        self.path.contains('*') || self.path.contains('?')
    }
}

fn source_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:([^@]+)@)?([^:]+):(.+)$").expect("valid source regex"))
}

/// Fallback login name when the source omits `user@`.
fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

pub fn parse_source(input: &str) -> Result<RemoteSource> {
    let caps = source_re()
        .captures(input)
        .ok_or_else(|| TransferError::InvalidSource(input.to_string()))?;
    let user = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_else(default_user);
    Ok(RemoteSource {
        user,
        host: caps[2].to_string(),
        path: caps[3].to_string(),
    })
}

/// Parse every source and require a single shared user@host. Mismatches are
/// fatal before any network activity.
pub fn parse_sources(inputs: &[String]) -> Result<Vec<RemoteSource>> {
    if inputs.is_empty() {
        return Err(TransferError::MissingSource.into());
    }
    let mut sources = Vec::with_capacity(inputs.len());
    for input in inputs {
        sources.push(parse_source(input)?);
    }
    let first = sources[0].endpoint();
    for s in &sources[1..] {
        if s.endpoint() != first {
            return Err(TransferError::SourceEndpointsDiffer(first, s.endpoint()).into());
        }
    }
    Ok(sources)
}

/// Guardrail, not a parse rule: a destination that reads like `host:path`
/// is refused even if a local file with a colon in its name exists.
pub fn looks_remote(dest: &str) -> bool {
    if let Some(pos) = dest.find(':') {
        match dest.find('/') {
            Some(slash) => pos < slash,
            None => true,
        }
    } else {
        false
    }
}

pub fn check_destination(dest: &str) -> Result<()> {
    if dest.contains('@') || looks_remote(dest) {
        return Err(TransferError::RemoteLikeTarget(dest.to_string()).into());
    }
    Ok(())
}
