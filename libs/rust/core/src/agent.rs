//! Command agent: one per participant, turns lifecycle commands into supervised processes.
//!
//! States:
//! - Idle: no process owned
//! - Running: the participant's process is alive under the agent's supervisor
//!
//! START while Running restarts, STOP while Idle is a no-op, and a process
//! that exits on its own is noticed on the next poll.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{FlError, TransportError};
use crate::federated_learning::Algorithm;
use crate::params::ParticipantId;
use crate::protocol::{Command, Verb};
use crate::supervisor::{LaunchSpec, StaleProcessWarning, Supervisor, TerminationOutcome};
use crate::telemetry::CONTROL_METRICS;
use crate::transport::{ControlChannel, ControlFabric};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState { Idle, Running }

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    pub identity: ParticipantId,
    pub state: AgentState,
    pub algorithm: Option<Algorithm>,
    pub pid: Option<u32>,
    /// Last process that did not exit after being killed.
    pub stale_pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Upper bound on one wait for a command; also how often exits are reaped.
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub kill_timeout: Duration,
    pub broadcast_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(1), grace_period: Duration::from_secs(2), kill_timeout: Duration::from_secs(5), broadcast_timeout: Duration::from_secs(2) }
    }
}

/// Concurrent fan-out of one command body to many identities.
#[derive(Clone)]
pub struct Broadcaster {
    fabric: Arc<dyn ControlFabric>,
    per_send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(fabric: Arc<dyn ControlFabric>, per_send_timeout: Duration) -> Self { Self { fabric, per_send_timeout } }

    /// Every send is bounded by the timeout and independent of the others.
    /// Failures are logged and returned, never raised.
    pub async fn broadcast(&self, targets: &[ParticipantId], body: &str) -> Vec<(ParticipantId, Result<(), TransportError>)> {
        let sends = targets.iter().map(|target| {
            let fabric = self.fabric.clone();
            let timeout = self.per_send_timeout;
            async move {
                let res = match tokio::time::timeout(timeout, fabric.publish(target, body)).await {
                    Ok(r) => r,
                    Err(_) => Err(TransportError::Timeout(timeout)),
                };
                match &res {
                    Ok(()) => debug!(%target, body, "command_sent"),
                    Err(e) => {
                        CONTROL_METRICS.broadcast_failures_total.inc();
                        warn!(%target, body, error=%e, "command_send_failed");
                    }
                }
                (target.clone(), res)
            }
        });
        let outcomes = join_all(sends).await;
        info!(body, targets = targets.len(), failed = outcomes.iter().filter(|(_, r)| r.is_err()).count(), "broadcast_done");
        outcomes
    }

    pub async fn send(&self, command: &Command) -> Result<(), TransportError> {
        let body = command.body();
        let (_, res) = self.broadcast(std::slice::from_ref(&command.target), &body).await.pop().unwrap_or((command.target.clone(), Err(TransportError::Closed)));
        res
    }
}

pub struct CommandAgent {
    identity: ParticipantId,
    launch: LaunchSpec,
    /// Present only in the aggregator role; appended as `--algorithm` on start.
    algorithm: Option<Algorithm>,
    state: AgentState,
    entered_at: Instant,
    stale_pid: Option<u32>,
    supervisor: Supervisor,
    channel: Box<dyn ControlChannel>,
    broadcaster: Broadcaster,
    config: AgentConfig,
    shutdown: Arc<AtomicBool>,
    status_tx: watch::Sender<AgentStatus>,
}

impl CommandAgent {
    /// Subscribe to `identity`'s control channel. The aggregator identity gets
    /// the aggregator role with `default_algorithm`.
    pub async fn connect(identity: ParticipantId, launch: LaunchSpec, default_algorithm: Algorithm, fabric: Arc<dyn ControlFabric>, config: AgentConfig) -> Result<Self, FlError> {
        let channel = fabric.subscribe(&identity).await?;
        let algorithm = identity.is_aggregator().then_some(default_algorithm);
        let (status_tx, _) = watch::channel(AgentStatus { identity: identity.clone(), state: AgentState::Idle, algorithm, pid: None, stale_pid: None });
        info!(%identity, ?algorithm, "agent_listening");
        Ok(Self {
            broadcaster: Broadcaster::new(fabric, config.broadcast_timeout),
            supervisor: Supervisor::new(config.kill_timeout),
            identity,
            launch,
            algorithm,
            state: AgentState::Idle,
            entered_at: Instant::now(),
            stale_pid: None,
            channel,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            status_tx,
        })
    }

    pub fn identity(&self) -> &ParticipantId { &self.identity }
    pub fn state(&self) -> AgentState { self.state }
    pub fn algorithm(&self) -> Option<Algorithm> { self.algorithm }
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> { self.shutdown.clone() }
    pub fn status(&self) -> watch::Receiver<AgentStatus> { self.status_tx.subscribe() }
    pub fn broadcaster(&self) -> Broadcaster { self.broadcaster.clone() }

    fn launch_spec(&self) -> LaunchSpec {
        match self.algorithm {
            Some(a) => self.launch.clone().arg("--algorithm").arg(a.as_str()),
            None => self.launch.clone(),
        }
    }

    fn transition(&mut self, next: AgentState) {
        if self.state != next {
            info!(identity=%self.identity, from=?self.state, to=?next, in_state_ms = self.entered_at.elapsed().as_millis() as u64, "agent_transition");
            self.state = next;
            self.entered_at = Instant::now();
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = AgentStatus {
            identity: self.identity.clone(),
            state: self.state,
            algorithm: self.algorithm,
            pid: self.supervisor.pid(&self.identity),
            stale_pid: self.stale_pid,
        };
        self.status_tx.send_replace(status);
    }

    fn record_stale(&mut self, warning: Option<&StaleProcessWarning>) {
        if let Some(w) = warning {
            warn!(identity=%self.identity, pid = ?w.pid, waited_ms = w.waited.as_millis() as u64, "process_left_stale");
            self.stale_pid = w.pid;
        }
    }

    async fn stop_process(&mut self) {
        let outcome = self.supervisor.terminate(&self.identity, self.config.grace_period).await;
        if let TerminationOutcome::Stale(w) = outcome {
            self.record_stale(Some(&w));
        }
    }

    pub async fn handle(&mut self, command: Command) -> Result<AgentState, FlError> {
        CONTROL_METRICS.commands_received_total.inc();
        match command.verb {
            Verb::Start => {
                if let (Some(current), Some(requested)) = (self.algorithm, command.algorithm) {
                    if current != requested { info!(identity=%self.identity, from=%current, to=%requested, "algorithm_selected"); }
                    self.algorithm = Some(requested);
                }
                let spec = self.launch_spec();
                let res = if self.state == AgentState::Running {
                    let restarted = self.supervisor.restart(&self.identity, &spec, self.config.grace_period).await;
                    restarted.map(|report| self.record_stale(report.stale_warning()))
                } else {
                    self.supervisor.spawn(&self.identity, &spec).map(|_| ())
                };
                match res {
                    Ok(()) => self.transition(AgentState::Running),
                    Err(e) => {
                        error!(identity=%self.identity, error=%e, "process_start_failed");
                        self.transition(AgentState::Idle);
                        return Err(e);
                    }
                }
            }
            Verb::Stop if self.state == AgentState::Idle => debug!(identity=%self.identity, "stop_ignored_idle"),
            Verb::Stop => {
                self.stop_process().await;
                self.transition(AgentState::Idle);
            }
        }
        Ok(self.state)
    }

    /// Notice a process that exited without being told to.
    pub fn reap(&mut self) {
        if self.state == AgentState::Running && !self.supervisor.is_alive(&self.identity) {
            info!(identity=%self.identity, "process_exited_on_its_own");
            self.transition(AgentState::Idle);
        }
    }

    /// One bounded wait for a command. Undecodable payloads and unparseable
    /// bodies are logged and skipped; only channel-level failures are returned.
    pub async fn poll_once(&mut self) -> Result<(), TransportError> {
        self.reap();
        let body = match self.channel.recv(self.config.poll_interval).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(()),
            Err(TransportError::Malformed(reason)) => {
                warn!(identity=%self.identity, %reason, "command_undecodable");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match Command::parse(&self.identity, &body) {
            Ok(cmd) => {
                info!(identity=%self.identity, command=%body.trim(), "command_received");
                if let Err(e) = self.handle(cmd).await {
                    warn!(identity=%self.identity, error=%e, "command_failed");
                }
            }
            Err(e) => warn!(identity=%self.identity, error=%e, "command_rejected"),
        }
        Ok(())
    }

    /// Listen until the shutdown flag is raised or the channel closes, then stop the owned process.
    pub async fn run(mut self) -> Result<(), FlError> {
        let result = loop {
            if self.shutdown.load(Ordering::SeqCst) { break Ok(()); }
            match self.poll_once().await {
                Ok(()) => {}
                Err(TransportError::Closed) => {
                    warn!(identity=%self.identity, "control_channel_closed");
                    break Ok(());
                }
                Err(e) => break Err(FlError::from(e)),
            }
        };
        if self.state == AgentState::Running {
            self.stop_process().await;
            self.transition(AgentState::Idle);
        }
        info!(identity=%self.identity, "agent_stopped");
        result
    }
}
