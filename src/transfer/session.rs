use std::borrow::Cow;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use shell_escape::unix::escape;

use crate::TransferError;

/// Cipher preference tuned for bulk throughput; GCM first where hardware
/// supports it.
const SSH_CIPHERS: &str =
    "aes128-gcm@openssh.com,aes256-gcm@openssh.com,aes128-ctr,aes256-ctr";

/// Everything needed to reach one remote endpoint. A transfer session talks
/// to exactly one host; multiple sources must agree on it beforehand.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub identity: Option<PathBuf>,
    pub password: Option<String>,
    pub compress: bool,
}

/// Captured result of a one-shot remote command.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// One-shot remote command execution. The agent channels stream binary data;
/// everything else (classify, list, glob, probes) goes through here.
pub trait RemoteShell: Send + Sync {
    fn exec_remote(&self, cmd: &str) -> Result<RemoteOutput>;
}

impl SshSettings {
    pub fn endpoint(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Option set shared by agent channels and one-shot commands.
    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            format!("Ciphers={}", SSH_CIPHERS),
            "-o".to_string(),
            "IPQoS=throughput".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=60".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if self.compress {
            args.push("-C".to_string());
        }
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        args
    }

    /// Build the ssh (or sshpass-wrapped ssh) invocation for one remote
    /// command string. `tty_off` adds `-T` so the binary agent protocol is
    /// not corrupted by a PTY.
    fn build_command(&self, remote_cmd: &str, tty_off: bool) -> Result<Command> {
        let mut cmd = if let Some(password) = &self.password {
            let sshpass =
                which::which("sshpass").map_err(|_| TransferError::SshpassMissing)?;
            let mut c = Command::new(sshpass);
            c.arg("-p").arg(password).arg("ssh");
            c
        } else {
            Command::new("ssh")
        };
        if tty_off {
            cmd.arg("-T");
        }
        cmd.args(self.common_args());
        cmd.arg(self.endpoint());
        cmd.arg(remote_cmd);
        Ok(cmd)
    }

    /// Command for one long-lived agent channel. `exec` replaces the remote
    /// shell so that killing the ssh process tears down the agent with it.
    pub fn agent_command(&self, agent_source: &str) -> Result<Command> {
        let remote =
            format!("exec python3 -c {}", escape(Cow::Borrowed(agent_source)));
        let mut cmd = self.build_command(&remote, true)?;
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        Ok(cmd)
    }
}

impl RemoteShell for SshSettings {
    fn exec_remote(&self, remote_cmd: &str) -> Result<RemoteOutput> {
        let mut cmd = self.build_command(remote_cmd, false)?;
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        tracing::debug!("[get][ssh] exec_remote: {}", remote_cmd);
        let out = cmd
            .output()
            .with_context(|| format!("failed to run ssh for {}", self.endpoint()))?;
        let output = RemoteOutput {
            status: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        };
        // 255 is ssh's own failure code, as opposed to the remote command's.
        if output.status == 255 && output.stderr.contains("Permission denied") {
            return Err(TransferError::AuthFailed(self.endpoint()).into());
        }
        if output.status == 5 && self.password.is_some() {
            // sshpass exit 5: invalid password
            return Err(TransferError::AuthFailed(self.endpoint()).into());
        }
        Ok(output)
    }
}

/// Quote a path for embedding into a one-shot shell command. Paths sent to
/// agents are length-prefixed on the wire and must never pass through here.
pub fn quote_path(path: &str) -> String {
    escape(Cow::Borrowed(path)).to_string()
}
