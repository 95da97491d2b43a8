//! Recorder loop
//!
//! Single consumer of the inbound channel. Readings are routed into
//! per-stream windows; every flush interval each non-empty window becomes one
//! summary row appended to its stream's sheet. The loop owns all window and
//! row-position state, so no locking is needed.

mod retry;

pub use retry::RetryPolicy;

use crate::aggregate::StreamRouter;
use crate::config::{OnDestinationError, RecorderConfig};
use crate::destination::{Destination, RowPositionTracker};
use crate::error::{DestinationError, RecorderError};
use crate::model::{Reading, SummaryRow};
use crate::observability::spans;
use crate::source::{InboundEvent, InboundReceiver};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Input of the recorder state machine.
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    ReadingArrived(InboundEvent),
    FlushTick(DateTime<Utc>),
}

/// Running totals, returned when the loop ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecorderStats {
    pub readings: u64,
    pub malformed: u64,
    pub flushes: u64,
    pub rows_written: u64,
    pub append_failures: u64,
    /// Appends whose reported range could not be parsed.
    pub position_resets: u64,
}

pub struct RecorderLoop {
    router: StreamRouter,
    tracker: RowPositionTracker,
    destination: Arc<dyn Destination>,
    flush_interval: Duration,
    flush_on_shutdown: bool,
    stdout: bool,
    retry: Option<RetryPolicy>,
    stats: RecorderStats,
}

impl RecorderLoop {
    pub fn new(config: &RecorderConfig, destination: Arc<dyn Destination>) -> Self {
        let retry = match config.on_destination_error {
            OnDestinationError::Fail => None,
            OnDestinationError::Retry => Some(RetryPolicy::from(&config.retry)),
        };

        RecorderLoop {
            router: StreamRouter::new(),
            tracker: RowPositionTracker::new(config.sheet_prefix.clone())
                .with_initial_row(config.initial_row),
            destination,
            flush_interval: config.flush_interval,
            flush_on_shutdown: config.flush_on_shutdown,
            stdout: config.stdout,
            retry,
            stats: RecorderStats::default(),
        }
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    pub fn router(&self) -> &StreamRouter {
        &self.router
    }

    pub fn tracker(&self) -> &RowPositionTracker {
        &self.tracker
    }

    /// Process one event to completion.
    pub async fn handle_event(&mut self, event: RecorderEvent) -> Result<(), RecorderError> {
        match event {
            RecorderEvent::ReadingArrived(inbound) => {
                self.accept(inbound);
                Ok(())
            }
            RecorderEvent::FlushTick(at) => self.flush(at).await,
        }
    }

    fn accept(&mut self, inbound: InboundEvent) {
        let reading = match inbound.into_reading() {
            Ok(reading) => reading,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(error = %e, "discarding malformed event");
                return;
            }
        };

        self.stats.readings += 1;
        if self.stdout {
            echo(&reading);
        }
        self.router.route_reading(&reading);
    }

    /// Append one row per non-empty window.
    ///
    /// Every due stream is attempted even if another one fails; the first
    /// failure is returned afterwards.
    pub async fn flush(&mut self, at: DateTime<Utc>) -> Result<(), RecorderError> {
        self.stats.flushes += 1;

        let due: Vec<(String, String, SummaryRow)> = self
            .router
            .flush_due(at)
            .into_iter()
            .map(|(stream_id, row)| {
                let range = self.tracker.target_range(&stream_id);
                (stream_id, range, row)
            })
            .collect();

        if due.is_empty() {
            debug!("nothing to flush");
            return Ok(());
        }

        let span = spans::flush_span(due.len());
        let destination = self.destination.as_ref();
        let retry = self.retry.as_ref();
        let results = join_all(due.iter().map(|(stream_id, range, row)| {
            append(destination, retry, range, row).instrument(spans::append_span(stream_id, range))
        }))
        .instrument(span)
        .await;

        let mut first_failure = None;
        for ((stream_id, range, row), result) in due.into_iter().zip(results) {
            match result {
                Ok(reported) => {
                    self.stats.rows_written += 1;
                    info!(
                        stream = %stream_id,
                        range = %reported,
                        min = row.min,
                        max = row.max,
                        mean = row.mean,
                        median = row.median_like,
                        "row appended"
                    );
                    if self.tracker.record_append_result(&stream_id, &reported).is_err() {
                        self.stats.position_resets += 1;
                    }
                }
                Err(e) => {
                    self.stats.append_failures += 1;
                    error!(stream = %stream_id, range = %range, error = %e, "append failed");
                    if first_failure.is_none() {
                        first_failure = Some(RecorderError::Destination { range, source: e });
                    }
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Consume events until shutdown, until every producer is gone, or until
    /// a fatal destination failure.
    pub async fn run(
        mut self,
        mut rx: InboundReceiver,
        shutdown: CancellationToken,
    ) -> Result<RecorderStats, RecorderError> {
        info!(
            destination = %self.destination.name(),
            flush_interval = ?self.flush_interval,
            "recorder started"
        );

        let mut tick = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                _ = tick.tick() => RecorderEvent::FlushTick(Utc::now()),
                inbound = rx.recv() => match inbound {
                    Some(inbound) => RecorderEvent::ReadingArrived(inbound),
                    None => {
                        info!("all reading sources closed");
                        break;
                    }
                },
            };
            self.handle_event(event).await?;
        }

        if self.flush_on_shutdown {
            rx.close();
            while let Ok(inbound) = rx.try_recv() {
                self.accept(inbound);
            }
            self.flush(Utc::now()).await?;
        }

        info!(
            readings = self.stats.readings,
            malformed = self.stats.malformed,
            rows = self.stats.rows_written,
            "recorder stopped"
        );
        Ok(self.stats)
    }
}

async fn append(
    destination: &dyn Destination,
    retry: Option<&RetryPolicy>,
    range: &str,
    row: &SummaryRow,
) -> Result<String, DestinationError> {
    let attempts = retry.map_or(1, |r| r.max_attempts.max(1));
    let mut attempt = 1;
    loop {
        match destination.append(range, row).await {
            Ok(reported) => return Ok(reported),
            Err(e) => match retry {
                Some(policy) if attempt < attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(attempt, error = %e, delay = ?delay, "append failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => return Err(e),
            },
        }
    }
}

fn echo(reading: &Reading) {
    println!(
        "{} {} {}",
        reading.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        reading.stream_id,
        reading.co2_ppm
    );
}
