//! Hosts the command agents behind the operator API and owns the algorithm selection.
//!
//! All mutable state sits behind one async mutex, so `set_algorithm` is the
//! only way the selection changes and concurrent requests see it consistently.

use futures::future::join_all;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use fl_core::transport::ControlFabric;
use fl_core::{
    AgentState, AgentStatus, Algorithm, Broadcaster, Command, CommandAgent, EvaluationRecord, ExperimentConfig, ExperimentStore, FlError,
    ParticipantId,
};

use crate::error::ApiError;

/// One hosted agent: its status feed, stop flag and run task.
pub struct AgentHandle {
    pub identity: ParticipantId,
    status: watch::Receiver<AgentStatus>,
    shutdown: Arc<AtomicBool>,
    task: JoinHandle<Result<(), FlError>>,
}

impl AgentHandle {
    pub fn status(&self) -> AgentStatus { self.status.borrow().clone() }
    pub fn is_running(&self) -> bool { self.status.borrow().state == AgentState::Running }

    async fn stop(self, limit: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);
        match tokio::time::timeout(limit, self.task).await {
            Ok(Ok(Ok(()))) => info!(identity=%self.identity, "agent_shut_down"),
            Ok(Ok(Err(e))) => warn!(identity=%self.identity, error=%e, "agent_ended_with_error"),
            Ok(Err(e)) => warn!(identity=%self.identity, error=%e, "agent_task_panicked"),
            Err(_) => warn!(identity=%self.identity, waited_ms = limit.as_millis() as u64, "agent_shutdown_timed_out"),
        }
    }
}

struct ManagerState {
    algorithm: Algorithm,
    aggregator: Option<AgentHandle>,
    workers: Vec<AgentHandle>,
}

/// Outcome of a START/STOP fan-out to the hosted workers.
pub struct FederationSignal {
    pub algorithm: Algorithm,
    pub workers_signalled: usize,
    pub failed: Vec<ParticipantId>,
}

pub struct AgentManager {
    cfg: ExperimentConfig,
    fabric: Arc<dyn ControlFabric>,
    broadcaster: Broadcaster,
    store: ExperimentStore,
    state: Mutex<ManagerState>,
}

impl AgentManager {
    pub fn new(cfg: ExperimentConfig, fabric: Arc<dyn ControlFabric>) -> Self {
        let broadcaster = Broadcaster::new(fabric.clone(), cfg.agent().broadcast_timeout);
        let store = cfg.store();
        let state = ManagerState { algorithm: cfg.default_algorithm, aggregator: None, workers: Vec::new() };
        Self { cfg, fabric, broadcaster, store, state: Mutex::new(state) }
    }

    pub fn config(&self) -> &ExperimentConfig { &self.cfg }
    pub fn store(&self) -> &ExperimentStore { &self.store }

    async fn host_agent(&self, identity: ParticipantId, algorithm: Algorithm) -> Result<AgentHandle, FlError> {
        let launch = self.cfg.launch_spec(&identity)?;
        let agent = CommandAgent::connect(identity.clone(), launch, algorithm, self.fabric.clone(), self.cfg.agent()).await?;
        let status = agent.status();
        let shutdown = agent.shutdown_flag();
        let task = tokio::spawn(agent.run());
        Ok(AgentHandle { identity, status, shutdown, task })
    }

    /// Returns false when the aggregator agent was already hosted.
    pub async fn start_infrastructure(&self) -> Result<bool, ApiError> {
        let mut state = self.state.lock().await;
        if state.aggregator.is_some() { return Ok(false); }
        let handle = self.host_agent(ParticipantId::aggregator(), state.algorithm).await?;
        info!(algorithm=%state.algorithm, "aggregator_agent_hosted");
        state.aggregator = Some(handle);
        Ok(true)
    }

    /// Host the agent for the next free worker index.
    pub async fn add_worker(&self) -> Result<ParticipantId, ApiError> {
        let mut state = self.state.lock().await;
        let index = state.workers.len() + 1;
        if index > self.cfg.num_workers {
            return Err(ApiError::WorkersFull(self.cfg.num_workers));
        }
        let handle = self.host_agent(ParticipantId::worker(index), state.algorithm).await?;
        let identity = handle.identity.clone();
        info!(%identity, hosted = index, capacity = self.cfg.num_workers, "worker_agent_hosted");
        state.workers.push(handle);
        Ok(identity)
    }

    pub async fn algorithm(&self) -> Algorithm { self.state.lock().await.algorithm }

    /// Validate and apply a new selection. A running aggregator is restarted
    /// with it; returns whether that happened.
    pub async fn set_algorithm(&self, requested: &str) -> Result<(Algorithm, bool), ApiError> {
        let algorithm: Algorithm = requested.parse()?;
        let mut state = self.state.lock().await;
        if state.algorithm == algorithm { return Ok((algorithm, false)); }
        info!(from=%state.algorithm, to=%algorithm, "algorithm_switched");
        state.algorithm = algorithm;
        let restart = state.aggregator.as_ref().is_some_and(AgentHandle::is_running);
        if restart {
            self.broadcaster.send(&Command::start_server(Some(algorithm))).await.map_err(FlError::from)?;
            info!(%algorithm, "aggregator_restart_requested");
        }
        Ok((algorithm, restart))
    }

    /// START_SERVER, settle, then START_FL to every hosted worker.
    pub async fn start_federation(&self) -> Result<FederationSignal, ApiError> {
        let (algorithm, workers) = {
            let state = self.state.lock().await;
            if state.aggregator.is_none() { return Err(ApiError::NoAggregator); }
            (state.algorithm, state.workers.iter().map(|w| w.identity.clone()).collect::<Vec<_>>())
        };
        self.broadcaster.send(&Command::start_server(Some(algorithm))).await.map_err(FlError::from)?;
        tokio::time::sleep(self.cfg.settle_delay()).await;
        let outcomes = self.broadcaster.broadcast(&workers, "START_FL").await;
        let failed: Vec<ParticipantId> = outcomes.into_iter().filter(|(_, r)| r.is_err()).map(|(id, _)| id).collect();
        info!(%algorithm, workers = workers.len(), failed = failed.len(), "federation_started");
        Ok(FederationSignal { algorithm, workers_signalled: workers.len() - failed.len(), failed })
    }

    pub async fn stop_federation(&self) -> Result<FederationSignal, ApiError> {
        let (algorithm, has_aggregator, workers) = {
            let state = self.state.lock().await;
            (state.algorithm, state.aggregator.is_some(), state.workers.iter().map(|w| w.identity.clone()).collect::<Vec<_>>())
        };
        let outcomes = self.broadcaster.broadcast(&workers, "STOP_FL").await;
        if has_aggregator {
            if let Err(e) = self.broadcaster.send(&Command::stop_server()).await {
                warn!(error=%e, "stop_server_not_delivered");
            }
        }
        let failed: Vec<ParticipantId> = outcomes.into_iter().filter(|(_, r)| r.is_err()).map(|(id, _)| id).collect();
        info!(workers = workers.len(), failed = failed.len(), "federation_stopped");
        Ok(FederationSignal { algorithm, workers_signalled: workers.len() - failed.len(), failed })
    }

    /// Stop every hosted agent; each terminates the process it owns.
    pub async fn stop_all(&self) {
        let (aggregator, workers) = {
            let mut state = self.state.lock().await;
            (state.aggregator.take(), std::mem::take(&mut state.workers))
        };
        let agent = self.cfg.agent();
        let limit = agent.poll_interval + agent.grace_period + agent.kill_timeout + Duration::from_secs(1);
        let stopping = workers.into_iter().chain(aggregator).map(|h| h.stop(limit));
        join_all(stopping).await;
        info!("all_agents_stopped");
    }

    /// Stop everything, then move metrics and checkpoints into a timestamped backup.
    pub async fn reset_system(&self) -> Result<PathBuf, ApiError> {
        info!("system_reset_started");
        self.stop_all().await;
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let target = self.store.archive(&self.cfg.backup_dir, &stamp)?;
        info!(backup=%target.display(), "system_reset_complete");
        Ok(target)
    }

    pub async fn snapshot(&self) -> (Algorithm, Option<AgentStatus>, Vec<AgentStatus>) {
        let state = self.state.lock().await;
        (state.algorithm, state.aggregator.as_ref().map(AgentHandle::status), state.workers.iter().map(AgentHandle::status).collect())
    }

    pub fn metrics(&self, algorithm: &str) -> Result<Vec<EvaluationRecord>, ApiError> {
        let algorithm: Algorithm = algorithm.parse()?;
        Ok(self.store.load_metrics(algorithm)?)
    }
}
