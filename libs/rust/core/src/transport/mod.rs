//! Message fabric adapters.
//!
//! - control: per-identity command channels (`fl.control.<identity>`), NATS or in-process
//! - link: the round data plane between the aggregator and its workers

pub mod control;
pub mod link;

pub use control::{ControlChannel, ControlFabric, LocalFabric, NatsFabric};
pub use link::{memory_bus, Link, MemoryHubLink, MemoryPeerLink, MemoryPeers, NatsLink};

pub const CONTROL_SUBJECT_PREFIX: &str = "fl.control";

pub fn control_subject(identity: &crate::params::ParticipantId) -> String {
    format!("{CONTROL_SUBJECT_PREFIX}.{identity}")
}

pub fn downlink_subject(experiment: &str) -> String { format!("fl.data.{experiment}.down") }
pub fn uplink_subject(experiment: &str) -> String { format!("fl.data.{experiment}.up") }

/// `host:port` as accepted by `async_nats::connect`.
pub fn nats_endpoint(host: &str, port: u16) -> String { format!("{host}:{port}") }
