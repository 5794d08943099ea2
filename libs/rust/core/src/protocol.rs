//! Wire vocabulary: lifecycle commands on the control channel and round messages on the data plane.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TransportError;
use crate::federated_learning::{Algorithm, RoundConfig, WorkerResult};
use crate::params::{ModelParameters, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb { Start, Stop }

/// Lifecycle command addressed to one agent. Workers speak `START_FL`/`STOP_FL`,
/// the aggregator `START_SERVER [algorithm]`/`STOP_SERVER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub target: ParticipantId,
    pub verb: Verb,
    pub algorithm: Option<Algorithm>,
}

impl Command {
    pub fn start(target: ParticipantId) -> Self { Self { target, verb: Verb::Start, algorithm: None } }
    pub fn stop(target: ParticipantId) -> Self { Self { target, verb: Verb::Stop, algorithm: None } }
    pub fn start_server(algorithm: Option<Algorithm>) -> Self { Self { target: ParticipantId::aggregator(), verb: Verb::Start, algorithm } }
    pub fn stop_server() -> Self { Self::stop(ParticipantId::aggregator()) }

    /// Parse a plain command body received on `target`'s channel. The verb
    /// must belong to the target's role.
    pub fn parse(target: &ParticipantId, body: &str) -> Result<Self, TransportError> {
        let mut parts = body.split_whitespace();
        let head = parts.next().ok_or_else(|| TransportError::Malformed("empty command".into()))?;
        let (verb, for_aggregator) = match head {
            "START_FL" => (Verb::Start, false),
            "STOP_FL" => (Verb::Stop, false),
            "START_SERVER" => (Verb::Start, true),
            "STOP_SERVER" => (Verb::Stop, true),
            other => return Err(TransportError::Malformed(format!("unknown command '{other}'"))),
        };
        if for_aggregator != target.is_aggregator() {
            return Err(TransportError::Malformed(format!("{head} is not accepted by {target}")));
        }
        let algorithm = match (head, parts.next()) {
            ("START_SERVER", Some(token)) => Some(token.parse::<Algorithm>().map_err(|e| TransportError::Malformed(e.to_string()))?),
            (_, None) => None,
            (_, Some(extra)) => return Err(TransportError::Malformed(format!("unexpected argument '{extra}' for {head}"))),
        };
        if parts.next().is_some() {
            return Err(TransportError::Malformed(format!("trailing tokens in '{body}'")));
        }
        Ok(Self { target: target.clone(), verb, algorithm })
    }

    pub fn body(&self) -> String {
        match (self.target.is_aggregator(), self.verb, self.algorithm) {
            (true, Verb::Start, Some(a)) => format!("START_SERVER {a}"),
            (true, Verb::Start, None) => "START_SERVER".into(),
            (true, Verb::Stop, _) => "STOP_SERVER".into(),
            (false, Verb::Start, _) => "START_FL".into(),
            (false, Verb::Stop, _) => "STOP_FL".into(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} -> {}", self.body(), self.target) }
}

/// Aggregator to workers, published on the experiment's downlink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregatorMessage {
    /// Ask already-running workers to announce themselves again.
    Discover,
    Fit { round: u64, config: RoundConfig, parameters: ModelParameters },
    Evaluate { round: u64, parameters: ModelParameters },
    Finished,
}

/// Workers to aggregator, published on the experiment's uplink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Join { worker: ParticipantId, sample_count: u64 },
    FitResult { worker: ParticipantId, round: u64, result: WorkerResult },
    EvaluateResult { worker: ParticipantId, round: u64, loss: f64, accuracy: f64, sample_count: u64 },
    Failure { worker: ParticipantId, round: u64, reason: String },
}

impl WorkerMessage {
    pub fn worker(&self) -> &ParticipantId {
        match self {
            WorkerMessage::Join { worker, .. }
            | WorkerMessage::FitResult { worker, .. }
            | WorkerMessage::EvaluateResult { worker, .. }
            | WorkerMessage::Failure { worker, .. } => worker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_vocabulary() {
        let w = ParticipantId::worker(2);
        assert_eq!(Command::parse(&w, "START_FL").unwrap(), Command::start(w.clone()));
        assert_eq!(Command::parse(&w, " STOP_FL \n").unwrap().verb, Verb::Stop);
        let agg = ParticipantId::aggregator();
        let cmd = Command::parse(&agg, "START_SERVER fedprox").unwrap();
        assert_eq!(cmd.algorithm, Some(Algorithm::FedProx));
        assert_eq!(cmd.body(), "START_SERVER fedprox");
        assert_eq!(Command::parse(&agg, "START_SERVER").unwrap().algorithm, None);
        assert_eq!(Command::stop_server().body(), "STOP_SERVER");
    }

    #[test]
    fn rejects_malformed_commands() {
        let agg = ParticipantId::aggregator();
        assert!(Command::parse(&agg, "").is_err());
        assert!(Command::parse(&agg, "REBOOT").is_err());
        assert!(Command::parse(&agg, "START_SERVER fednova").is_err());
        assert!(Command::parse(&agg, "STOP_FL now").is_err());
        assert!(Command::parse(&agg, "START_SERVER fedavg extra").is_err());
    }

    #[test]
    fn rejects_verbs_of_the_other_role() {
        let agg = ParticipantId::aggregator();
        let w = ParticipantId::worker(1);
        assert!(matches!(Command::parse(&agg, "START_FL"), Err(TransportError::Malformed(_))));
        assert!(matches!(Command::parse(&agg, "STOP_FL"), Err(TransportError::Malformed(_))));
        assert!(matches!(Command::parse(&w, "START_SERVER"), Err(TransportError::Malformed(_))));
        assert!(matches!(Command::parse(&w, "STOP_SERVER fedavg"), Err(TransportError::Malformed(_))));
    }

    #[test]
    fn worker_messages_are_tagged_json() {
        let msg = WorkerMessage::Join { worker: ParticipantId::worker(1), sample_count: 20 };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "join");
        assert_eq!(json["worker"], "1");
        assert_eq!(msg.worker().as_str(), "1");
    }
}
