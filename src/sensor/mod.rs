//! Sensor poller
//!
//! Opens the sensor transport, queries it once per sample interval and hands
//! each reading to the inbound channel. A failed exchange is logged and the
//! next tick tries again; a broken transport is reopened.

use crate::config::SensorConfig;
use crate::error::{ProtocolError, SourceError};
use crate::model::Reading;
use crate::observability::spans;
use crate::protocol::read_co2;
use crate::source::{InboundEvent, InboundSender};
use chrono::Local;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Where the sensor is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorTarget {
    /// Serial character device, e.g. `/dev/ttyAMA0`.
    Serial(PathBuf),
    /// Serial-over-TCP bridge given as `tcp://host:port`.
    Tcp(String),
}

impl SensorTarget {
    pub fn parse(transport: &str) -> Self {
        match transport.strip_prefix("tcp://") {
            Some(addr) => SensorTarget::Tcp(addr.to_string()),
            None => SensorTarget::Serial(PathBuf::from(transport)),
        }
    }

    /// Open the transport. Serial devices get their line speed set with
    /// `stty` first; failure to do so is only logged.
    pub async fn open(&self, baud_rate: u32) -> Result<SensorPort, SourceError> {
        match self {
            SensorTarget::Serial(path) => {
                configure_line(path, baud_rate).await;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .await
                    .map_err(|source| SourceError::Open {
                        target: self.to_string(),
                        source,
                    })?;
                Ok(SensorPort::Serial(file))
            }
            SensorTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|source| SourceError::Open {
                        target: self.to_string(),
                        source,
                    })?;
                stream.set_nodelay(true).ok();
                Ok(SensorPort::Tcp(stream))
            }
        }
    }
}

impl std::fmt::Display for SensorTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorTarget::Serial(path) => write!(f, "{}", path.display()),
            SensorTarget::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

async fn configure_line(path: &std::path::Path, baud_rate: u32) {
    let result = tokio::process::Command::new("stty")
        .arg("-F")
        .arg(path)
        .arg(baud_rate.to_string())
        .args(["raw", "-echo"])
        .status()
        .await;

    match result {
        Ok(status) if status.success() => {
            debug!(device = %path.display(), baud_rate, "serial line configured")
        }
        Ok(status) => {
            warn!(device = %path.display(), %status, "stty failed, using current line settings")
        }
        Err(e) => {
            warn!(device = %path.display(), error = %e, "cannot run stty, using current settings")
        }
    }
}

/// An open sensor transport.
pub enum SensorPort {
    Serial(File),
    Tcp(TcpStream),
}

impl AsyncRead for SensorPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SensorPort::Serial(f) => Pin::new(f).poll_read(cx, buf),
            SensorPort::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SensorPort {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SensorPort::Serial(f) => Pin::new(f).poll_write(cx, buf),
            SensorPort::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SensorPort::Serial(f) => Pin::new(f).poll_flush(cx),
            SensorPort::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SensorPort::Serial(f) => Pin::new(f).poll_shutdown(cx),
            SensorPort::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// How a polling session on one open transport ended.
#[derive(Debug)]
pub enum PollExit {
    Shutdown,
    /// The consumer dropped its receiver.
    Closed,
    /// The transport stopped working and should be reopened.
    Broken(ProtocolError),
}

/// Counters for one poller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub readings: u64,
    pub failures: u64,
}

pub struct SensorPoller {
    name: String,
    target: SensorTarget,
    baud_rate: u32,
    stream_id: String,
    sample_interval: Duration,
    read_timeout: Duration,
    stats: PollStats,
}

impl SensorPoller {
    pub fn new(config: &SensorConfig) -> Self {
        let target = SensorTarget::parse(&config.transport);
        SensorPoller {
            name: format!("sensor:{target}"),
            target,
            baud_rate: config.baud_rate,
            stream_id: config.stream_id.clone(),
            sample_interval: config.sample_interval,
            read_timeout: config.read_timeout,
            stats: PollStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// Poll until shutdown or until the consumer goes away.
    ///
    /// Failing to open the transport the first time is fatal; later reopen
    /// failures are retried every sample interval.
    pub async fn run(
        mut self,
        tx: InboundSender,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError> {
        let span = spans::sensor_span(&self.name);
        async move {
            let mut port = self.target.open(self.baud_rate).await?;
            info!(transport = %self.target, interval = ?self.sample_interval, "sensor opened");

            loop {
                match self.poll(&mut port, &tx, &shutdown).await {
                    PollExit::Shutdown | PollExit::Closed => break,
                    PollExit::Broken(e) => warn!(error = %e, "sensor transport broken, reopening"),
                }

                port = loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.sample_interval) => {}
                    }
                    match self.target.open(self.baud_rate).await {
                        Ok(port) => break port,
                        Err(e) => warn!(error = %e, "reopen failed"),
                    }
                };
            }

            info!(
                readings = self.stats.readings,
                failures = self.stats.failures,
                "sensor poller stopped"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Sample `transport` every interval until something ends the session.
    pub async fn poll<T>(
        &mut self,
        transport: &mut T,
        tx: &InboundSender,
        shutdown: &CancellationToken,
    ) -> PollExit
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut tick = interval(self.sample_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return PollExit::Shutdown,
                _ = tick.tick() => {}
            }

            let sampled_at = Local::now().fixed_offset();
            let ppm = match read_co2(transport, self.read_timeout).await {
                Ok(ppm) => ppm,
                Err(e) => {
                    self.stats.failures += 1;
                    match e {
                        ProtocolError::Transport(_) | ProtocolError::NoResponse { .. } => {
                            return PollExit::Broken(e);
                        }
                        _ => {
                            warn!(error = %e, "sensor read failed, retrying next tick");
                            continue;
                        }
                    }
                }
            };

            self.stats.readings += 1;
            debug!(co2_ppm = ppm, "sensor reading");
            let reading = Reading::new(self.stream_id.clone(), sampled_at, ppm);

            tokio::select! {
                _ = shutdown.cancelled() => return PollExit::Shutdown,
                sent = tx.send(InboundEvent::Reading(reading)) => {
                    if sent.is_err() {
                        return PollExit::Closed;
                    }
                }
            }
        }
    }
}
