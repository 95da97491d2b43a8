//! Sensor-to-feed bridge: poll the sensor and publish every reading retained
//! on its stream id.

use crate::config::Config;
use crate::error::SourceError;
use crate::feed::FeedPublisher;
use crate::model::Reading;
use crate::observability::spans;
use crate::sensor::SensorPoller;
use crate::source::{
    inbound_channel, InboundEvent, InboundReceiver, InboundSender, ReadingSource,
};
use chrono::SecondsFormat;
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + 'a>>;

/// Something that takes sniffed readings.
pub trait ReadingSink {
    fn publish<'a>(&'a self, reading: &'a Reading) -> PublishFuture<'a>;
}

impl ReadingSink for FeedPublisher {
    fn publish<'a>(&'a self, reading: &'a Reading) -> PublishFuture<'a> {
        Box::pin(FeedPublisher::publish(self, reading))
    }
}

/// Run the sniffer until shutdown. Returns the number of published readings.
pub async fn run(config: &Config, shutdown: CancellationToken) -> Result<u64, SourceError> {
    let publisher = FeedPublisher::connect(&config.feed, shutdown.clone())
        .map_err(|e| SourceError::Feed(e.to_string()))?;
    let (tx, rx) = inbound_channel(config.recorder.channel_capacity);

    let poller = SensorPoller::new(&config.sensor);
    let source = ReadingSource::Sensor(poller).spawn(tx, shutdown.clone());
    let published = forward(rx, &publisher, config.sensor.stdout, &shutdown).await;

    publisher.close().await;
    match source.await {
        Ok(result) => result?,
        Err(e) => return Err(SourceError::Feed(format!("sensor task failed: {e}"))),
    }

    info!(published, "sniffer stopped");
    Ok(published)
}

/// Publish everything arriving on `rx` until all senders are gone or
/// shutdown interrupts a pending publish. Publish failures are logged and the
/// reading dropped.
pub async fn forward<S: ReadingSink>(
    mut rx: InboundReceiver,
    sink: &S,
    stdout: bool,
    shutdown: &CancellationToken,
) -> u64 {
    let mut published = 0;
    while let Some(event) = rx.recv().await {
        let reading = match event {
            InboundEvent::Reading(reading) => reading,
            InboundEvent::Payload { stream_id, .. } => {
                warn!(stream = %stream_id, "sniffer ignores raw payloads");
                continue;
            }
        };

        if stdout {
            println!(
                "{} {}",
                reading.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                reading.co2_ppm
            );
        }

        let span = spans::sniff_span(&reading.stream_id);
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = sink.publish(&reading).instrument(span) => result,
        };
        match result {
            Ok(()) => published += 1,
            Err(e) => warn!(error = %e, "publish failed"),
        }
    }
    published
}

/// Publish every reading on `rx` and pass it on to `downstream`.
///
/// A failed publish is logged and the reading still goes downstream. Ends
/// when `rx` is drained or `downstream` is closed. Returns the number of
/// published readings.
pub async fn relay<S: ReadingSink>(
    mut rx: InboundReceiver,
    sink: &S,
    downstream: InboundSender,
    shutdown: &CancellationToken,
) -> u64 {
    let mut published = 0;
    while let Some(event) = rx.recv().await {
        if let InboundEvent::Reading(reading) = &event {
            let span = spans::sniff_span(&reading.stream_id);
            let result = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = sink.publish(reading).instrument(span) => Some(result),
            };
            match result {
                Some(Ok(())) => published += 1,
                Some(Err(e)) => warn!(error = %e, "publish failed"),
                None => {}
            }
        }

        if downstream.send(event).await.is_err() {
            break;
        }
    }
    published
}
