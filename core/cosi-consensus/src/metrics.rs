//! Metrics collection for consensus

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram, CounterVec, Histogram};

use crate::messages::Phase;

lazy_static! {
    /// Finished or discarded rounds
    pub static ref CONSENSUS_ROUNDS: CounterVec = register_counter_vec!(
        "cosi_consensus_rounds_total",
        "Total number of consensus rounds",
        &["outcome"]
    ).expect("cosi_consensus_rounds_total registers once");

    /// Inbound messages by phase and what happened to them
    pub static ref CONSENSUS_MESSAGES: CounterVec = register_counter_vec!(
        "cosi_consensus_messages_total",
        "Total number of consensus messages received",
        &["phase", "result"]
    ).expect("cosi_consensus_messages_total registers once");

    /// Time from round start to a verified collective signature
    pub static ref CONSENSUS_ROUND_DURATION: Histogram = register_histogram!(
        "cosi_consensus_round_duration_seconds",
        "Duration of consensus rounds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).expect("cosi_consensus_round_duration_seconds registers once");
}

/// What happened to an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageResult {
    Accepted,
    Duplicate,
    Stale,
    Buffered,
    Ignored,
    Rejected,
}

impl MessageResult {
    fn as_str(&self) -> &'static str {
        match self {
            MessageResult::Accepted => "accepted",
            MessageResult::Duplicate => "duplicate",
            MessageResult::Stale => "stale",
            MessageResult::Buffered => "buffered",
            MessageResult::Ignored => "ignored",
            MessageResult::Rejected => "rejected",
        }
    }
}

pub fn record_message(phase: Phase, result: MessageResult) {
    CONSENSUS_MESSAGES
        .with_label_values(&[phase.as_str(), result.as_str()])
        .inc();
}

pub fn record_round(outcome: &str, duration_secs: Option<f64>) {
    CONSENSUS_ROUNDS.with_label_values(&[outcome]).inc();
    if let Some(secs) = duration_secs {
        CONSENSUS_ROUND_DURATION.observe(secs);
    }
}
