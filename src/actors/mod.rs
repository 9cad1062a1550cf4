//! Per-device monitoring sessions
//!
//! Every monitored device is driven by one session task. Sessions are
//! controlled through cloneable handles over an mpsc command channel and
//! report back through listener traits implemented by the fleet.
//!
//! ## Architecture Overview
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │      Fleet       │──── broadcast ──▶ MonitorEvent subscribers
//!                 └────────┬─────────┘
//!                          │ spawns
//!             ┌────────────┴────────────┐
//!             │                         │
//!     ┌───────▼───────┐         ┌───────▼───────┐
//!     │  PollSession  │         │  PingSession  │
//!     │ (SNMP device) │         │ (ICMP device) │
//!     └───────┬───────┘         └───────────────┘
//!             │ derive
//!     ┌───────▼──────────────────────────────┐
//!     │ SeriesStore · ThresholdRegistry · Top │
//!     └──────────────────────────────────────┘
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: each session has an mpsc command channel
//! 2. **Listeners**: sessions report outcomes to a listener trait object
//! 3. **Request/Response**: oneshot channels for queries

pub mod messages;
pub mod ping;
pub mod poll;

pub use messages::{EventCategory, MonitorEvent, PingCommand, PollCommand, PollOutcome, PollReport};
pub use ping::{PingHandle, PingListener};
pub use poll::{PollContext, PollError, PollHandle, PollListener, trial_poll};
