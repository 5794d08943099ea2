//! Spawns, watches, restarts and terminates the aggregator/worker OS processes.
//!
//! Supervised children get a piped stdin and treat EOF on it as a shutdown
//! request, so closing stdin is the graceful signal. After the grace period
//! the child is killed; a kill that does not complete within `kill_timeout`
//! yields a [`StaleProcessWarning`] and the handle is dropped anyway.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::FlError;
use crate::params::ParticipantId;
use crate::telemetry::CONTROL_METRICS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self { Self { program: program.into(), args: Vec::new(), env: Vec::new() } }
    pub fn arg(mut self, a: impl Into<String>) -> Self { self.args.push(a.into()); self }
    pub fn args<I, S>(mut self, args: I) -> Self where I: IntoIterator<Item = S>, S: Into<String> { self.args.extend(args.into_iter().map(Into::into)); self }
    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self { self.env.push((k.into(), v.into())); self }
}

#[derive(Debug)]
pub struct ProcessHandle {
    pub identity: ParticipantId,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    child: Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleProcessWarning {
    pub identity: ParticipantId,
    pub pid: Option<u32>,
    pub waited: Duration,
}

#[derive(Debug)]
pub enum TerminationOutcome {
    NotRunning,
    Exited(ExitStatus),
    Killed,
    Stale(StaleProcessWarning),
}

#[derive(Debug)]
pub struct RestartReport {
    pub previous: TerminationOutcome,
    pub pid: Option<u32>,
}

impl RestartReport {
    pub fn stale_warning(&self) -> Option<&StaleProcessWarning> {
        match &self.previous { TerminationOutcome::Stale(w) => Some(w), _ => None }
    }
}

/// Process-local registry holding at most one live handle per identity.
#[derive(Debug)]
pub struct Supervisor {
    registry: HashMap<ParticipantId, ProcessHandle>,
    kill_timeout: Duration,
}

impl Supervisor {
    pub fn new(kill_timeout: Duration) -> Self { Self { registry: HashMap::new(), kill_timeout } }

    pub fn spawn(&mut self, identity: &ParticipantId, spec: &LaunchSpec) -> Result<&ProcessHandle, FlError> {
        if self.is_alive(identity) {
            return Err(FlError::AlreadyRunning(identity.clone()));
        }
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FlError::Spawn { program: spec.program.display().to_string(), source })?;
        let pid = child.id();
        CONTROL_METRICS.process_spawns_total.inc();
        info!(%identity, ?pid, program=%spec.program.display(), "process_spawned");
        let handle = ProcessHandle { identity: identity.clone(), pid, started_at: Utc::now(), child };
        self.registry.insert(identity.clone(), handle);
        Ok(&self.registry[identity])
    }

    /// Non-blocking. A handle whose process has exited is dropped from the registry.
    pub fn is_alive(&mut self, identity: &ParticipantId) -> bool {
        let Some(handle) = self.registry.get_mut(identity) else { return false };
        match handle.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(%identity, ?status, "process_reaped");
                self.registry.remove(identity);
                false
            }
            Err(e) => {
                warn!(%identity, error=%e, "process_status_unknown");
                true
            }
        }
    }

    pub fn pid(&self, identity: &ParticipantId) -> Option<u32> { self.registry.get(identity).and_then(|h| h.pid) }
    pub fn live_count(&self) -> usize { self.registry.len() }

    /// Graceful stop (stdin EOF), then force kill after `grace`.
    pub async fn terminate(&mut self, identity: &ParticipantId, grace: Duration) -> TerminationOutcome {
        let Some(mut handle) = self.registry.remove(identity) else { return TerminationOutcome::NotRunning };
        match handle.child.try_wait() {
            Ok(Some(status)) => return TerminationOutcome::Exited(status),
            Ok(None) => {}
            Err(e) => warn!(%identity, error=%e, "process_status_unknown"),
        }
        drop(handle.child.stdin.take());
        match tokio::time::timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => {
                info!(%identity, ?status, "process_stopped");
                return TerminationOutcome::Exited(status);
            }
            Ok(Err(e)) => warn!(%identity, error=%e, "process_wait_failed"),
            Err(_) => debug!(%identity, grace_ms = grace.as_millis() as u64, "grace_period_elapsed"),
        }
        if let Err(e) = handle.child.start_kill() {
            warn!(%identity, error=%e, "process_kill_failed");
        }
        match tokio::time::timeout(self.kill_timeout, handle.child.wait()).await {
            Ok(Ok(_)) => {
                info!(%identity, pid = ?handle.pid, "process_killed");
                TerminationOutcome::Killed
            }
            _ => {
                CONTROL_METRICS.stale_terminations_total.inc();
                warn!(%identity, pid = ?handle.pid, waited_ms = self.kill_timeout.as_millis() as u64, "stale_process");
                TerminationOutcome::Stale(StaleProcessWarning { identity: identity.clone(), pid: handle.pid, waited: self.kill_timeout })
            }
        }
    }

    /// Terminate whatever runs under `identity`, then spawn `spec`. The old
    /// handle leaves the registry before the new one enters it.
    pub async fn restart(&mut self, identity: &ParticipantId, spec: &LaunchSpec, grace: Duration) -> Result<RestartReport, FlError> {
        let previous = self.terminate(identity, grace).await;
        if let TerminationOutcome::Stale(w) = &previous {
            warn!(%identity, pid = ?w.pid, "restarting_over_stale_process");
        }
        let pid = self.spawn(identity, spec)?.pid;
        CONTROL_METRICS.process_restarts_total.inc();
        Ok(RestartReport { previous, pid })
    }

    pub async fn shutdown_all(&mut self, grace: Duration) -> Vec<(ParticipantId, TerminationOutcome)> {
        let ids: Vec<ParticipantId> = self.registry.keys().cloned().collect();
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = self.terminate(&id, grace).await;
            outcomes.push((id, outcome));
        }
        outcomes
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn cat() -> LaunchSpec { LaunchSpec::new("cat") }
    fn sleeper() -> LaunchSpec { LaunchSpec::new("sleep").arg("30") }

    #[tokio::test]
    async fn graceful_stop_via_stdin_eof() {
        let mut sup = Supervisor::new(Duration::from_secs(2));
        let id = ParticipantId::worker(1);
        sup.spawn(&id, &cat()).unwrap();
        assert!(sup.is_alive(&id));
        assert!(matches!(sup.spawn(&id, &cat()), Err(FlError::AlreadyRunning(_))));
        let outcome = sup.terminate(&id, Duration::from_secs(5)).await;
        assert!(matches!(outcome, TerminationOutcome::Exited(s) if s.success()));
        assert!(!sup.is_alive(&id));
        assert!(matches!(sup.terminate(&id, Duration::from_millis(10)).await, TerminationOutcome::NotRunning));
    }

    #[tokio::test]
    async fn force_kills_after_grace() {
        let mut sup = Supervisor::new(Duration::from_secs(2));
        let id = ParticipantId::aggregator();
        sup.spawn(&id, &sleeper()).unwrap();
        let outcome = sup.terminate(&id, Duration::from_millis(50)).await;
        assert!(matches!(outcome, TerminationOutcome::Killed));
        assert_eq!(sup.live_count(), 0);
    }

    #[tokio::test]
    async fn restart_never_leaves_two_handles() {
        let mut sup = Supervisor::new(Duration::from_secs(2));
        let id = ParticipantId::worker(2);
        let first = sup.spawn(&id, &sleeper()).unwrap().pid;
        let report = sup.restart(&id, &sleeper(), Duration::from_millis(20)).await.unwrap();
        assert!(matches!(report.previous, TerminationOutcome::Killed));
        assert!(report.stale_warning().is_none());
        assert_ne!(report.pid, first);
        assert_eq!(sup.live_count(), 1);
        assert_eq!(sup.pid(&id), report.pid);

        let fresh = ParticipantId::worker(3);
        let report = sup.restart(&fresh, &cat(), Duration::from_millis(20)).await.unwrap();
        assert!(matches!(report.previous, TerminationOutcome::NotRunning));
        assert_eq!(sup.live_count(), 2);
        let outcomes = sup.shutdown_all(Duration::from_millis(50)).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(sup.live_count(), 0);
    }

    #[tokio::test]
    async fn reaps_processes_that_exit_on_their_own() {
        let mut sup = Supervisor::new(Duration::from_secs(1));
        let id = ParticipantId::worker(4);
        sup.spawn(&id, &LaunchSpec::new("true")).unwrap();
        for _ in 0..50 {
            if !sup.is_alive(&id) { break; }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!sup.is_alive(&id));
        assert_eq!(sup.live_count(), 0);
        // respawn is allowed once the old one is gone
        sup.spawn(&id, &cat()).unwrap();
        sup.shutdown_all(Duration::from_secs(1)).await;
    }

    // A killed child cannot refuse to die, so whether the zero-length wait
    // sees its exit is a race. Either way the handle must be released.
    #[tokio::test]
    async fn expired_kill_wait_still_releases_the_handle() {
        let mut sup = Supervisor::new(Duration::ZERO);
        let id = ParticipantId::worker(6);
        let pid = sup.spawn(&id, &sleeper()).unwrap().pid;
        match sup.terminate(&id, Duration::from_millis(20)).await {
            TerminationOutcome::Stale(w) => {
                assert_eq!(w.identity, id);
                assert_eq!(w.pid, pid);
                assert_eq!(w.waited, Duration::ZERO);
            }
            TerminationOutcome::Killed => {}
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(sup.live_count(), 0);
        let report = sup.restart(&id, &cat(), Duration::from_millis(20)).await.unwrap();
        assert!(matches!(report.previous, TerminationOutcome::NotRunning));
        assert_eq!(sup.live_count(), 1);
        sup.shutdown_all(Duration::from_secs(1)).await;
    }

    #[test]
    fn restart_report_exposes_stale_warning() {
        let warning = StaleProcessWarning { identity: ParticipantId::aggregator(), pid: Some(77), waited: Duration::from_secs(5) };
        let report = RestartReport { previous: TerminationOutcome::Stale(warning.clone()), pid: Some(78) };
        assert_eq!(report.stale_warning(), Some(&warning));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let mut sup = Supervisor::new(Duration::from_secs(1));
        let err = sup.spawn(&ParticipantId::worker(5), &LaunchSpec::new("/nonexistent/fl-worker")).unwrap_err();
        assert!(matches!(err, FlError::Spawn { .. }));
        assert_eq!(sup.live_count(), 0);
    }
}
