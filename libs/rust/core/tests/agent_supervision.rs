//! Command agents on the local fabric supervising real processes.
#![cfg(unix)]

use fl_core::transport::{ControlFabric, LocalFabric};
use fl_core::{AgentConfig, AgentState, AgentStatus, Algorithm, Broadcaster, Command, CommandAgent, LaunchSpec, ParticipantId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn fast() -> AgentConfig {
    AgentConfig { poll_interval: Duration::from_millis(20), grace_period: Duration::from_millis(500), kill_timeout: Duration::from_secs(2), broadcast_timeout: Duration::from_millis(200) }
}

/// Reads stdin until EOF and ignores any extra arguments, like a supervised participant.
fn participant() -> LaunchSpec { LaunchSpec::new("sh").args(["-c", "exec cat", "participant"]) }

async fn wait_for(status: &mut watch::Receiver<AgentStatus>, what: impl FnMut(&AgentStatus) -> bool) -> AgentStatus {
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(what)).await.unwrap().unwrap().clone()
}

#[tokio::test]
async fn broadcast_starts_and_stops_every_worker() {
    let fabric = LocalFabric::new();
    let shared: Arc<dyn ControlFabric> = Arc::new(fabric.clone());
    let ids: Vec<ParticipantId> = (1..=3).map(ParticipantId::worker).collect();
    let mut tasks = Vec::new();
    let mut feeds = Vec::new();
    let mut flags = Vec::new();
    for id in &ids {
        let agent = CommandAgent::connect(id.clone(), participant(), Algorithm::FedProx, shared.clone(), fast()).await.unwrap();
        feeds.push(agent.status());
        flags.push(agent.shutdown_flag());
        tasks.push(tokio::spawn(agent.run()));
    }
    assert!(ids.iter().all(|id| fabric.is_routed(id)));

    let broadcaster = Broadcaster::new(shared.clone(), Duration::from_millis(200));
    let outcomes = broadcaster.broadcast(&ids, "START_FL").await;
    assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
    let mut pids = Vec::new();
    for feed in feeds.iter_mut() {
        let s = wait_for(feed, |s| s.state == AgentState::Running).await;
        assert_eq!(s.algorithm, None);
        pids.push(s.pid.unwrap());
    }
    pids.sort_unstable();
    pids.dedup();
    assert_eq!(pids.len(), 3);

    broadcaster.broadcast(&ids, "STOP_FL").await;
    for feed in feeds.iter_mut() {
        wait_for(feed, |s| s.state == AgentState::Idle).await;
    }
    for flag in &flags { flag.store(true, Ordering::SeqCst); }
    for task in tasks { task.await.unwrap().unwrap(); }
}

#[tokio::test]
async fn start_server_switches_algorithm_with_a_fresh_process() {
    let fabric: Arc<dyn ControlFabric> = Arc::new(LocalFabric::new());
    let agent = CommandAgent::connect(ParticipantId::aggregator(), participant(), Algorithm::FedProx, fabric.clone(), fast()).await.unwrap();
    let mut status = agent.status();
    let flag = agent.shutdown_flag();
    let task = tokio::spawn(agent.run());
    let broadcaster = Broadcaster::new(fabric, Duration::from_millis(200));

    broadcaster.send(&Command::start_server(None)).await.unwrap();
    let first = wait_for(&mut status, |s| s.state == AgentState::Running).await;
    assert_eq!(first.algorithm, Some(Algorithm::FedProx));

    broadcaster.send(&Command::start_server(Some(Algorithm::FedAvg))).await.unwrap();
    let second = wait_for(&mut status, |s| s.algorithm == Some(Algorithm::FedAvg) && s.state == AgentState::Running).await;
    assert!(second.pid.is_some());
    assert_ne!(second.pid, first.pid);

    flag.store(true, Ordering::SeqCst);
    task.await.unwrap().unwrap();
    assert_eq!(status.borrow().state, AgentState::Idle);
}
