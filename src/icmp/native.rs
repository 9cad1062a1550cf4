//! ICMP echo over socket2 with a `ping` command fallback
//!
//! Socket I/O is blocking and runs under `spawn_blocking`. RAW sockets are
//! tried first (CAP_NET_RAW), then unprivileged DGRAM ICMP sockets. When
//! neither can be opened the system `ping` binary is used instead.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{ProbeError, Prober};

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;
const PACKET_LEN: usize = 64;

static SEQUENCE: AtomicU16 = AtomicU16::new(0);

static RTT_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        // per-reply line: "time=12.3 ms" / "time<1 ms"
        Regex::new(r"time[=<](?P<ms>[0-9.]+)\s*ms").expect("valid regex"),
        // summary line: "rtt min/avg/max/mdev = a/b/c/d" or "round-trip min/avg/max/stddev = ..."
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/\w+\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/")
            .expect("valid regex"),
    ]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Socket,
    Command,
}

/// Native ICMP echo prober
///
/// The probing mode is detected per address family.
#[derive(Debug)]
pub struct IcmpProber {
    v4: Mode,
    v6: Mode,
}

impl IcmpProber {
    /// Detect whether ICMP sockets can be opened by this process
    pub fn new() -> Self {
        Self {
            v4: detect(Domain::IPV4, Protocol::ICMPV4, "IPv4"),
            v6: detect(Domain::IPV6, Protocol::ICMPV6, "IPv6"),
        }
    }

    fn mode(&self, ip: IpAddr) -> Mode {
        match ip {
            IpAddr::V4(_) => self.v4,
            IpAddr::V6(_) => self.v6,
        }
    }
}

fn detect(domain: Domain, protocol: Protocol, family: &str) -> Mode {
    match open_socket(domain, protocol) {
        Ok((_, kind)) => {
            info!("ICMP prober: using {kind:?} sockets for {family}");
            Mode::Socket
        }
        Err(e) => {
            info!("ICMP prober: {family} sockets unavailable ({e}), falling back to ping command");
            Mode::Command
        }
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for IcmpProber {
    #[instrument(skip(self), level = "trace")]
    async fn probe(&self, ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
        if self.mode(ip) == Mode::Command {
            return ping_command(ip, timeout).await;
        }

        let result = tokio::task::spawn_blocking(move || echo(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("probe task failed: {e}")))?;

        match result {
            Err(ProbeError::Network(message)) if message.contains("denied") => {
                warn!("native echo to {ip} not permitted, using ping command: {message}");
                ping_command(ip, timeout).await
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Raw,
    /// Unprivileged ping socket; the kernel owns the echo identifier
    Dgram,
}

fn open_socket(domain: Domain, protocol: Protocol) -> std::io::Result<(Socket, SocketKind)> {
    Socket::new(domain, Type::RAW, Some(protocol))
        .map(|socket| (socket, SocketKind::Raw))
        .or_else(|_| {
            Socket::new(domain, Type::DGRAM, Some(protocol)).map(|socket| (socket, SocketKind::Dgram))
        })
}

fn network(context: &str) -> impl FnOnce(std::io::Error) -> ProbeError + '_ {
    move |e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            ProbeError::Network(format!("{context}: permission denied"))
        }
        _ => ProbeError::Network(format!("{context}: {e}")),
    }
}

/// Send one echo request and wait for the matching reply
fn echo(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request, reply) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ECHO_REQUEST_V4, ECHO_REPLY_V4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ECHO_REQUEST_V6, ECHO_REPLY_V6),
    };

    let (mut socket, kind) = open_socket(domain, protocol).map_err(network("open socket"))?;
    socket
        .set_read_timeout(Some(timeout))
        .map_err(network("set timeout"))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(network("connect"))?;

    let identifier: u16 = rand::random();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = echo_request(request, identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(network("send"))?;

    let mut buf = [0u8; 1500];
    loop {
        let len = socket.read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            _ => network("receive")(e),
        })?;

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        // ping sockets rewrite the identifier and only deliver their own replies
        let expected = (kind == SocketKind::Raw).then_some(identifier);
        if is_reply(&buf[..len], reply, expected, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Echo request with a zeroed payload; the ICMPv6 checksum is left to the kernel
fn echo_request(kind: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_LEN];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    if kind == ECHO_REQUEST_V4 {
        let checksum = checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Match a received datagram against our request
///
/// RAW IPv4 sockets deliver the IP header in front of the ICMP message. The
/// identifier is only compared when given.
fn is_reply(buf: &[u8], reply: u8, identifier: Option<u16>, sequence: u16) -> bool {
    let offset = match buf.first() {
        Some(first) if reply == ECHO_REPLY_V4 && first >> 4 == 4 => usize::from(first & 0x0f) * 4,
        _ => 0,
    };
    let Some(icmp) = buf.get(offset..offset + 8) else {
        return false;
    };

    icmp[0] == reply
        && identifier.is_none_or(|id| u16::from_be_bytes([icmp[4], icmp[5]]) == id)
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// RFC 1071 internet checksum
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

async fn ping_command(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let wait = timeout.as_secs().max(1).to_string();
    let output = Command::new("ping")
        .args(["-c", "1", "-W", &wait, &ip.to_string()])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        debug!("ping {ip} exited with {}", output.status);
        return Err(ProbeError::Timeout(timeout));
    }

    parse_rtt(&stdout)
}

fn parse_rtt(output: &str) -> Result<Duration, ProbeError> {
    RTT_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(output))
        .and_then(|captures| captures.name("ms")?.as_str().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
        .ok_or_else(|| ProbeError::Command(format!("unrecognised ping output: {output}")))
}
