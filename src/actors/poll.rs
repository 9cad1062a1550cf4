//! SNMP poll session
//!
//! One session per SNMP device, running as its own task. A request walks
//! the fixed column set; the completed poll is derived into metrics and
//! reported to the [`PollListener`], which answers with the delay before the
//! next request.
//!
//! ## Message Flow
//!
//! ```text
//! Due → walk columns → {success | timeout | exception} → derive → listener → schedule
//!  ↑
//!  └─── Commands (PollNow, GetData, FailureRate, ResetResponse, SetSpeeds, Shutdown)
//! ```
//!
//! At most one request is outstanding. Shutting the session down drops the
//! outstanding request without waiting for it.

use std::collections::{BTreeMap, VecDeque};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, instrument, trace, warn};

use crate::monitors::derivation::Deriver;
use crate::snmp::oid::{Oid, identity_oids, request_oids};
use crate::snmp::snapshot::NodeData;
use crate::snmp::transport::{SnmpTarget, SnmpTransport, TransportError, VarBind};

use super::messages::{PollCommand, PollOutcome, PollReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("a request is already outstanding")]
    Busy,
}

/// Poll attempts over a trailing window
///
/// Timeouts count as failures. Transport exceptions are not recorded at all.
#[derive(Debug, Clone)]
pub struct FailureWindow {
    capacity: usize,
    attempts: VecDeque<bool>,
}

impl FailureWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            attempts: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, success: bool) {
        if self.attempts.len() == self.capacity {
            self.attempts.pop_front();
        }
        self.attempts.push_back(success);
    }

    /// Failed attempts in percent, 0 without history
    pub fn rate(&self) -> u32 {
        if self.attempts.is_empty() {
            return 0;
        }
        let failures = self.attempts.iter().filter(|success| !**success).count();
        (failures * 100 / self.attempts.len()) as u32
    }

    pub fn reset(&mut self) {
        self.attempts.clear();
    }
}

/// Receives the outcome of every request of a session
#[async_trait]
pub trait PollListener: Send + Sync {
    /// Delay before the next request; `None` ends the session
    async fn on_poll(&self, device: &str, report: PollReport) -> Option<Duration>;
}

/// Collaborators of a poll session
pub struct PollContext {
    pub transport: Arc<dyn SnmpTransport>,
    pub deriver: Arc<Deriver>,
    pub listener: Arc<dyn PollListener>,
    /// Per-ifIndex capacity overrides in bits per second
    pub speeds: BTreeMap<String, u64>,
    pub failure_window: usize,
}

type Request = BoxFuture<'static, (Result<Vec<VarBind>, TransportError>, Duration)>;

/// Walk `columns` on `target`, bounded by the target's timeout
async fn walk(
    transport: &dyn SnmpTransport,
    target: &SnmpTarget,
    columns: &[Oid],
) -> (Result<Vec<VarBind>, TransportError>, Duration) {
    let started = Instant::now();
    let result = match timeout(target.timeout, transport.walk(target, columns)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(target.timeout)),
    };
    (result, started.elapsed())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Poll the identity columns once, without touching any fleet state
pub async fn trial_poll(
    transport: &dyn SnmpTransport,
    target: &SnmpTarget,
) -> Result<NodeData, TransportError> {
    let (result, elapsed) = walk(transport, target, &identity_oids()).await;
    let varbinds = result?;
    Ok(NodeData::from_varbinds(varbinds, millis(elapsed), Utc::now()))
}

async fn wait_until(due: Option<Instant>) {
    match due {
        Some(due) => sleep_until(due).await,
        None => pending().await,
    }
}

async fn outstanding(
    request: &mut Option<Request>,
) -> (Result<Vec<VarBind>, TransportError>, Duration) {
    match request {
        Some(request) => request.await,
        None => pending().await,
    }
}

pub struct PollSession {
    device: String,
    target: SnmpTarget,
    transport: Arc<dyn SnmpTransport>,
    deriver: Arc<Deriver>,
    listener: Arc<dyn PollListener>,
    speeds: BTreeMap<String, u64>,
    failures: FailureWindow,
    /// Latest successful snapshot
    data: Option<NodeData>,
}

impl PollSession {
    pub fn new(target: SnmpTarget, context: PollContext) -> Self {
        Self {
            device: target.ip.to_string(),
            target,
            transport: context.transport,
            deriver: context.deriver,
            listener: context.listener,
            speeds: context.speeds,
            failures: FailureWindow::new(context.failure_window),
            data: None,
        }
    }

    /// Run the session until shut down or stopped by the listener
    ///
    /// The first request goes out right away.
    #[instrument(skip_all, fields(device = %self.device))]
    pub async fn run(mut self, mut commands: mpsc::Receiver<PollCommand>) {
        debug!("starting poll session");

        let mut due = Some(Instant::now());
        let mut request: Option<Request> = None;
        let mut waiter: Option<oneshot::Sender<Result<PollOutcome, PollError>>> = None;

        loop {
            tokio::select! {
                _ = wait_until(due), if request.is_none() => {
                    due = None;
                    request = Some(self.request());
                }

                (result, elapsed) = outstanding(&mut request) => {
                    request = None;

                    let report = self.complete(result, elapsed);
                    let outcome = report.outcome.clone();
                    let next = self.listener.on_poll(&self.device, report).await;

                    if let Some(waiter) = waiter.take() {
                        let _ = waiter.send(Ok(outcome));
                    }

                    match next {
                        Some(delay) => {
                            trace!("next request in {delay:?}");
                            due = Some(Instant::now() + delay);
                        }
                        None => {
                            debug!("listener ended the session");
                            break;
                        }
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(PollCommand::PollNow { respond_to }) => {
                            if request.is_some() {
                                let _ = respond_to.send(Err(PollError::Busy));
                            } else {
                                debug!("received PollNow command");
                                due = None;
                                request = Some(self.request());
                                waiter = Some(respond_to);
                            }
                        }

                        Some(PollCommand::GetData { respond_to }) => {
                            let _ = respond_to.send(self.data.clone());
                        }

                        Some(PollCommand::FailureRate { respond_to }) => {
                            let _ = respond_to.send(self.failures.rate());
                        }

                        Some(PollCommand::ResetResponse) => {
                            debug!("resetting failure history");
                            self.failures.reset();
                        }

                        Some(PollCommand::SetSpeeds { speeds }) => {
                            self.speeds = speeds;
                        }

                        Some(PollCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }

                        None => {
                            debug!("command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        debug!("poll session stopped");
    }

    fn request(&self) -> Request {
        trace!("sending request");
        let transport = self.transport.clone();
        let target = self.target.clone();
        let columns = request_oids();

        async move { walk(transport.as_ref(), &target, &columns).await }.boxed()
    }

    fn complete(
        &mut self,
        result: Result<Vec<VarBind>, TransportError>,
        elapsed: Duration,
    ) -> PollReport {
        let mut transitions = Vec::new();

        let (outcome, data) = match result {
            Ok(varbinds) => {
                let mut data = NodeData::from_varbinds(varbinds, millis(elapsed), Utc::now());
                if let Some(previous) = &self.data {
                    data.merge_previous(previous);
                }
                let derivation =
                    self.deriver
                        .derive(&self.device, &mut data, self.data.as_ref(), &self.speeds);
                if derivation.skipped > 0 {
                    debug!("{} rows skipped", derivation.skipped);
                }
                transitions = derivation.transitions;

                self.failures.record(true);
                self.data = Some(data.clone());
                (
                    PollOutcome::Success {
                        response_time: elapsed,
                    },
                    Some(data),
                )
            }
            Err(TransportError::Timeout(after)) => {
                debug!("no response within {after:?}");
                self.failures.record(false);
                (PollOutcome::Timeout, None)
            }
            Err(TransportError::Exception(e)) => {
                warn!("request failed: {e}");
                (PollOutcome::Exception(e), None)
            }
        };

        let failure_rate = self.failures.rate();
        self.deriver.submit_failure_rate(&self.device, failure_rate);

        PollReport {
            outcome,
            data,
            transitions,
            failure_rate,
            sys_name: self
                .data
                .as_ref()
                .and_then(NodeData::sys_name)
                .map(str::to_string),
        }
    }
}

/// Handle for controlling a poll session
#[derive(Clone)]
pub struct PollHandle {
    sender: mpsc::Sender<PollCommand>,

    /// Device address the session polls
    pub device: String,
}

impl PollHandle {
    /// Spawn a session for `target`; its first request goes out right away
    pub fn spawn(target: SnmpTarget, context: PollContext) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let session = PollSession::new(target, context);
        let device = session.device.clone();
        let task = tokio::spawn(session.run(cmd_rx));

        (
            Self {
                sender: cmd_tx,
                device,
            },
            task,
        )
    }

    /// Issue a request now and wait for its outcome
    ///
    /// Fails with [`PollError::Busy`] while another request is outstanding.
    pub async fn poll_now(&self) -> Result<PollOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        Ok(rx.await.context("failed to receive response")??)
    }

    pub async fn data(&self) -> Result<Option<NodeData>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollCommand::GetData { respond_to: tx })
            .await
            .context("failed to send GetData command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn failure_rate(&self) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollCommand::FailureRate { respond_to: tx })
            .await
            .context("failed to send FailureRate command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn reset_response(&self) -> Result<()> {
        self.sender
            .send(PollCommand::ResetResponse)
            .await
            .context("failed to send ResetResponse command")
    }

    pub async fn set_speeds(&self, speeds: BTreeMap<String, u64>) -> Result<()> {
        self.sender
            .send(PollCommand::SetSpeeds { speeds })
            .await
            .context("failed to send SetSpeeds command")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(PollCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")
    }
}
