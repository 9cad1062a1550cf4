//! ICMP ping session
//!
//! One session per ICMP-monitored address. A cycle waits its delay, then
//! probes with an escalating timeout per attempt until one answers or the
//! attempts run out. Success re-arms after a fixed delay, failure re-arms
//! immediately.
//!
//! ## Message Flow
//!
//! ```text
//! delay → probe(t1) → probe(t2) → … → {on_success(rtt) | on_failure} → re-arm
//!   ↑
//!   └─── Commands (Cycle, Shutdown)
//! ```
//!
//! Exactly one cycle runs at a time. A `Cycle` command received meanwhile is
//! kept (latest wins) and replaces the re-arm delay of the running cycle.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, instrument, trace};

use crate::icmp::{ProbeError, Prober};

use super::messages::PingCommand;

const FALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives the end of every ping cycle
#[async_trait]
pub trait PingListener: Send + Sync {
    /// `rtt` is measured from the start of the cycle, across failed attempts
    async fn on_success(&self, ip: IpAddr, rtt: Duration);

    async fn on_failure(&self, ip: IpAddr);
}

pub struct PingSession {
    ip: IpAddr,
    prober: Arc<dyn Prober>,
    listener: Arc<dyn PingListener>,
    /// One entry per attempt
    timeouts: Vec<Duration>,
    success_delay: Duration,
}

impl PingSession {
    pub fn new(
        ip: IpAddr,
        prober: Arc<dyn Prober>,
        listener: Arc<dyn PingListener>,
        mut timeouts: Vec<Duration>,
        success_delay: Duration,
    ) -> Self {
        if timeouts.is_empty() {
            timeouts.push(FALLBACK_TIMEOUT);
        }

        Self {
            ip,
            prober,
            listener,
            timeouts,
            success_delay,
        }
    }

    /// Run cycles until shut down
    ///
    /// The first cycle starts right away. Shutting down abandons the running
    /// cycle, including a probe in flight.
    #[instrument(skip_all, fields(ip = %self.ip))]
    pub async fn run(self, mut commands: mpsc::Receiver<PingCommand>) {
        debug!("starting ping session");

        let mut delay = Duration::ZERO;
        loop {
            let mut queued = None;

            let cycle = self.cycle(delay);
            tokio::pin!(cycle);

            let result = loop {
                tokio::select! {
                    result = &mut cycle => break result,

                    command = commands.recv() => match command {
                        Some(PingCommand::Cycle { delay }) => {
                            trace!("queueing cycle after {delay:?}");
                            queued = Some(delay);
                        }
                        Some(PingCommand::Shutdown) => {
                            debug!("received shutdown command");
                            return;
                        }
                        None => {
                            debug!("command channel closed, shutting down");
                            return;
                        }
                    }
                }
            };

            delay = match result {
                Ok(rtt) => {
                    trace!("echo reply after {rtt:?}");
                    self.listener.on_success(self.ip, rtt).await;
                    self.success_delay
                }
                Err(e) => {
                    trace!("no reply: {e}");
                    self.listener.on_failure(self.ip).await;
                    Duration::ZERO
                }
            };

            if let Some(queued) = queued {
                delay = queued;
            }
        }
    }

    /// One cycle: wait `delay`, then probe until an attempt succeeds
    ///
    /// An attempt that fails early still occupies its full timeout.
    async fn cycle(&self, delay: Duration) -> Result<Duration, ProbeError> {
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let started = Instant::now();
        let mut last_error = ProbeError::Timeout(Duration::ZERO);

        for (attempt, limit) in self.timeouts.iter().copied().enumerate() {
            let deadline = Instant::now() + limit;
            match timeout(limit, self.prober.probe(self.ip, limit)).await {
                Ok(Ok(_)) => return Ok(started.elapsed()),
                Ok(Err(e)) => {
                    trace!("attempt {} failed: {e}", attempt + 1);
                    last_error = e;
                    sleep_until(deadline).await;
                }
                Err(_) => {
                    trace!("attempt {} timed out after {limit:?}", attempt + 1);
                    last_error = ProbeError::Timeout(limit);
                }
            }
        }

        Err(last_error)
    }
}

/// Handle for controlling a ping session
#[derive(Clone)]
pub struct PingHandle {
    sender: mpsc::Sender<PingCommand>,

    pub ip: IpAddr,
}

impl PingHandle {
    pub fn spawn(
        ip: IpAddr,
        prober: Arc<dyn Prober>,
        listener: Arc<dyn PingListener>,
        timeouts: Vec<Duration>,
        success_delay: Duration,
    ) -> (Self, JoinHandle<()>) {
        // the session only ever needs the latest request
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        let session = PingSession::new(ip, prober, listener, timeouts, success_delay);
        let task = tokio::spawn(session.run(cmd_rx));

        (Self { sender: cmd_tx, ip }, task)
    }

    /// Queue a cycle starting `delay` after the current one ends
    pub async fn cycle(&self, delay: Duration) -> Result<()> {
        self.sender
            .send(PingCommand::Cycle { delay })
            .await
            .context("failed to send Cycle command")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(PingCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")
    }
}
