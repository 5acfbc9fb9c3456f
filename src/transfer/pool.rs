use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use super::agent::Agent;
use super::enumeration::RemoteEnumerator;
use super::session::{RemoteShell, SshSettings};
use crate::TransferError;
use crate::events::{EventSender, TransferEvent, TunnelStatus};

/// Agents are launched in small batches to stay under sshd connection-rate
/// limits (MaxStartups defaults to 10).
const SPAWN_BATCH: usize = 6;
const BATCH_DELAY: Duration = Duration::from_millis(300);
// Initial attempt plus up to three retries, backing off 500/1000/1500 ms.
const SPAWN_ATTEMPTS: usize = 4;
const SPAWN_BACKOFF_STEP: Duration = Duration::from_millis(500);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const SPAWN_DEADLINE: Duration = Duration::from_secs(30);

struct AgentSlot {
    agent: Option<Agent>,
    ready: bool,
    busy: bool,
    unhealthy: bool,
    unhealthy_reason: Option<String>,
    job_label: Option<String>,
    stderr_tail: Option<Arc<Mutex<Vec<u8>>>>,
}

impl AgentSlot {
    fn vacant() -> Self {
        Self {
            agent: None,
            ready: false,
            busy: false,
            unhealthy: false,
            unhealthy_reason: None,
            job_label: None,
            stderr_tail: None,
        }
    }

    fn acquirable(&self) -> bool {
        self.ready && !self.busy && !self.unhealthy && self.agent.is_some()
    }
}

/// Pool of remote reader agents, one ssh channel each. The scheduler owns
/// busy transitions via acquire/release; the pool owns ready and unhealthy
/// transitions. An acquired agent is moved out of its slot, so exactly one
/// thread can ever touch its channel.
pub struct AgentPool {
    slots: Mutex<Vec<AgentSlot>>,
    events: EventSender,
}

impl AgentPool {
    pub fn new(events: EventSender) -> Self {
        Self { slots: Mutex::new(Vec::new()), events }
    }

    #[cfg(test)]
    pub fn for_test(agents: Vec<Agent>, events: EventSender) -> Self {
        let slots = agents
            .into_iter()
            .map(|agent| {
                let mut slot = AgentSlot::vacant();
                slot.stderr_tail = Some(agent.stderr_tail_handle());
                slot.agent = Some(agent);
                slot.ready = true;
                slot
            })
            .collect();
        Self { slots: Mutex::new(slots), events }
    }

    /// Bring the pool up: verify the remote runtime, pick the stat syntax
    /// for later enumeration, then launch agents in batches. Succeeds as
    /// long as at least one agent reaches readiness; agents that never make
    /// it are left quarantined with their stderr tails.
    pub fn connect(
        &self,
        settings: &SshSettings,
        count: usize,
        enumerator: &RemoteEnumerator<'_>,
    ) -> Result<()> {
        verify_remote_runtime(settings)?;
        enumerator.ensure_stat_syntax()?;

        {
            let mut slots = self.slots.lock().expect("pool lock");
            slots.clear();
            for _ in 0..count {
                slots.push(AgentSlot::vacant());
            }
        }

        let mut first_error: Option<anyhow::Error> = None;
        let ids: Vec<usize> = (0..count).collect();
        for (batch_index, batch) in ids.chunks(SPAWN_BATCH).enumerate() {
            if batch_index > 0 {
                std::thread::sleep(BATCH_DELAY);
            }
            let handles: Vec<_> = batch
                .iter()
                .map(|&id| {
                    let settings = settings.clone();
                    std::thread::spawn(move || (id, spawn_with_retry(&settings, id)))
                })
                .collect();
            for handle in handles {
                let (id, outcome) = handle.join().expect("spawn thread panicked");
                match outcome {
                    Ok(agent) => {
                        {
                            let mut slots = self.slots.lock().expect("pool lock");
                            let slot = &mut slots[id];
                            slot.stderr_tail = Some(agent.stderr_tail_handle());
                            slot.agent = Some(agent);
                            slot.ready = true;
                        }
                        tracing::debug!("[get][pool] tunnel {} ready", id);
                        self.events.emit(TransferEvent::TunnelReady { id });
                        self.emit_status();
                    }
                    Err(e) => {
                        tracing::warn!("[get][pool] tunnel {} failed to start: {}", id, e);
                        {
                            let mut slots = self.slots.lock().expect("pool lock");
                            let slot = &mut slots[id];
                            slot.unhealthy = true;
                            slot.unhealthy_reason = Some(e.to_string());
                        }
                        self.emit_status();
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
        }

        if self.healthy_count() == 0 {
            return Err(first_error.unwrap_or_else(|| {
                TransferError::AgentSpawn("no agents requested".to_string()).into()
            }));
        }
        Ok(())
    }

    /// First ready, idle, healthy agent, or `None`. Never blocks.
    pub fn acquire(&self) -> Option<(usize, Agent)> {
        let mut slots = self.slots.lock().expect("pool lock");
        for (id, slot) in slots.iter_mut().enumerate() {
            if slot.acquirable() {
                slot.busy = true;
                let agent = slot.agent.take().expect("acquirable slot has agent");
                return Some((id, agent));
            }
        }
        None
    }

    /// Return an agent after a job. If the slot was quarantined while the
    /// agent was checked out, the agent is closed instead of re-seated.
    pub fn release(&self, id: usize, agent: Agent) {
        let mut quarantined_agent = None;
        {
            let mut slots = self.slots.lock().expect("pool lock");
            let slot = &mut slots[id];
            slot.busy = false;
            slot.job_label = None;
            if slot.unhealthy {
                quarantined_agent = Some(agent);
            } else {
                slot.agent = Some(agent);
            }
        }
        if let Some(mut agent) = quarantined_agent {
            agent.close();
        }
        self.emit_status();
    }

    /// Quarantine an agent. Idempotent; the stderr tail is retained on the
    /// slot for diagnostics. The agent handle, when the caller still holds
    /// it, is consumed and closed here.
    pub fn mark_unhealthy(&self, id: usize, reason: &str, agent: Option<Agent>) {
        let mut to_close = agent;
        {
            let mut slots = self.slots.lock().expect("pool lock");
            let slot = &mut slots[id];
            if !slot.unhealthy {
                slot.unhealthy = true;
                slot.unhealthy_reason = Some(reason.to_string());
                tracing::warn!("[get][pool] tunnel {} quarantined: {}", id, reason);
            }
            slot.ready = false;
            slot.busy = false;
            slot.job_label = None;
            if let Some(seated) = slot.agent.take() {
                debug_assert!(to_close.is_none(), "agent both seated and held");
                to_close = Some(seated);
            }
        }
        if let Some(mut agent) = to_close {
            agent.close();
        }
        self.emit_status();
    }

    pub fn healthy_count(&self) -> usize {
        let slots = self.slots.lock().expect("pool lock");
        slots.iter().filter(|s| s.ready && !s.unhealthy).count()
    }

    pub fn set_job_label(&self, id: usize, label: Option<String>) {
        {
            let mut slots = self.slots.lock().expect("pool lock");
            slots[id].job_label = label;
        }
        self.emit_status();
    }

    /// Retained stderr tail for a quarantined agent, if any survived.
    pub fn stderr_tail(&self, id: usize) -> Option<String> {
        let slots = self.slots.lock().expect("pool lock");
        slots.get(id).and_then(|s| s.stderr_tail.as_ref()).map(|tail| {
            let guard = tail.lock().expect("stderr tail lock");
            String::from_utf8_lossy(&guard).to_string()
        })
    }

    pub fn snapshot(&self) -> Vec<TunnelStatus> {
        let slots = self.slots.lock().expect("pool lock");
        slots
            .iter()
            .enumerate()
            .map(|(id, s)| TunnelStatus {
                id,
                ready: s.ready,
                busy: s.busy,
                unhealthy: s.unhealthy,
                reason: s.unhealthy_reason.clone(),
                job: s.job_label.clone(),
            })
            .collect()
    }

    fn emit_status(&self) {
        self.events.emit(TransferEvent::TunnelStatusUpdate { tunnels: self.snapshot() });
    }

    /// Close every channel. Stdin first so healthy agents exit cleanly; the
    /// rest of the escalation lives in `Agent::close`.
    pub fn close(&self) {
        let agents: Vec<Agent> = {
            let mut slots = self.slots.lock().expect("pool lock");
            slots
                .iter_mut()
                .filter_map(|slot| {
                    slot.ready = false;
                    slot.agent.take()
                })
                .collect()
        };
        for mut agent in agents {
            agent.close();
        }
    }
}

/// One execRemote before any agent spawns: the agent source needs a python3.
fn verify_remote_runtime(settings: &SshSettings) -> Result<()> {
    let probe = "python3 -c \"import sys; sys.exit(0 if sys.version_info[0] >= 3 else 1)\"";
    let out = settings
        .exec_remote(probe)
        .map_err(|e| TransferError::RuntimeUnsupported(e.to_string()))?;
    if !out.success() {
        let detail = if out.stderr.trim().is_empty() {
            format!("probe exited {}", out.status)
        } else {
            out.stderr.trim().to_string()
        };
        return Err(TransferError::RuntimeUnsupported(detail).into());
    }
    Ok(())
}

/// Spawn one agent and confirm readiness with the in-band ping. Retries a
/// couple of times when the failure smells like server-side rate limiting,
/// with linear back-off.
fn spawn_with_retry(settings: &SshSettings, id: usize) -> Result<Agent> {
    let started = Instant::now();
    let mut last: Option<anyhow::Error> = None;
    for attempt in 1..=SPAWN_ATTEMPTS {
        match spawn_once(settings, id, started) {
            Ok(agent) => return Ok(agent),
            Err(e) => {
                let msg = e.to_string();
                let retryable =
                    TransferError::spawn_is_retryable(&msg) && attempt < SPAWN_ATTEMPTS;
                tracing::debug!(
                    "[get][pool] tunnel {} spawn attempt {} failed (retryable={}): {}",
                    id,
                    attempt,
                    retryable,
                    msg
                );
                last = Some(e);
                if !retryable {
                    break;
                }
                std::thread::sleep(SPAWN_BACKOFF_STEP * attempt as u32);
            }
        }
    }
    Err(last.expect("at least one attempt ran"))
}

fn spawn_once(settings: &SshSettings, id: usize, started: Instant) -> Result<Agent> {
    if started.elapsed() >= SPAWN_DEADLINE {
        return Err(TransferError::AgentSpawn(format!(
            "tunnel {}: spawn deadline exceeded",
            id
        ))
        .into());
    }
    let mut agent = Agent::spawn(settings, id)?;
    let remaining = SPAWN_DEADLINE.saturating_sub(started.elapsed());
    if let Err(e) = agent.ping(PING_TIMEOUT.min(remaining)) {
        let tail = agent.stderr_tail();
        let tail = tail.trim();
        let msg = if tail.is_empty() {
            e.to_string()
        } else {
            format!("{} ({})", e, tail)
        };
        return Err(TransferError::AgentSpawn(msg).into());
    }
    Ok(agent)
}
