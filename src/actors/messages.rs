//! Message types for session communication
//!
//! Commands go to one session through its mpsc channel; [`MonitorEvent`]s
//! are broadcast by the fleet to every subscriber.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::monitors::critical::CriticalTransition;
use crate::snmp::snapshot::NodeData;

use super::poll::PollError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    /// Reachability changes
    Shutdown,
    /// Threshold crossings
    Critical,
    /// Admission and internal failures
    System,
    /// Outcome of registering a device
    Registration,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventCategory::Shutdown => "shutdown",
            EventCategory::Critical => "critical",
            EventCategory::System => "system",
            EventCategory::Registration => "registration",
        };
        f.write_str(name)
    }
}

/// Event published for the logging and alerting collaborators
///
/// Delivered through a broadcast channel; slow subscribers may lag and lose
/// events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorEvent {
    /// Device address, or the fleet itself for system-wide events
    pub device_id: String,
    pub message: String,
    pub category: EventCategory,
    /// Good news (recovered, registered) as opposed to bad news
    pub is_positive: bool,
    /// Whether the event reports a state flip
    pub is_transition: bool,
    pub timestamp: DateTime<Utc>,
}

impl MonitorEvent {
    pub fn new(
        device_id: impl Into<String>,
        category: EventCategory,
        message: impl Into<String>,
        is_positive: bool,
        is_transition: bool,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            message: message.into(),
            category,
            is_positive,
            is_transition,
            timestamp: Utc::now(),
        }
    }
}

/// How one SNMP request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Success { response_time: Duration },
    /// The agent did not answer in time
    Timeout,
    /// Socket or protocol error; not a reachability signal
    Exception(String),
}

/// Everything a poll listener learns about a finished request
#[derive(Debug, Clone)]
pub struct PollReport {
    pub outcome: PollOutcome,
    /// Snapshot of the poll, present on success
    pub data: Option<NodeData>,
    pub transitions: Vec<CriticalTransition>,
    /// Failed attempts over the trailing window, in percent
    pub failure_rate: u32,
    /// sysName of the latest successful poll
    pub sys_name: Option<String>,
}

/// Commands that can be sent to a poll session
#[derive(Debug)]
pub enum PollCommand {
    /// Issue a request now instead of waiting for the schedule
    ///
    /// Answered once the request completes, or right away with
    /// [`PollError::Busy`] while another request is outstanding.
    PollNow {
        respond_to: oneshot::Sender<Result<PollOutcome, PollError>>,
    },

    /// Latest snapshot, if any poll succeeded yet
    GetData {
        respond_to: oneshot::Sender<Option<NodeData>>,
    },

    FailureRate {
        respond_to: oneshot::Sender<u32>,
    },

    /// Forget the failure history
    ResetResponse,

    /// Replace the per-ifIndex capacity overrides
    SetSpeeds { speeds: BTreeMap<String, u64> },

    /// Stop the session; an outstanding request is abandoned
    Shutdown,
}

/// Commands that can be sent to a ping session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingCommand {
    /// Queue another cycle starting after `delay`
    ///
    /// Only the latest queued request is kept; it runs after the current
    /// cycle ends.
    Cycle { delay: Duration },

    /// Stop the session without finishing the current cycle
    Shutdown,
}
