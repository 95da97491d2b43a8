//! Reading sources
//!
//! Every producer (polled sensor or subscribed feed) runs as its own task and
//! pushes [`InboundEvent`]s into one bounded channel. The channel is the only
//! link to the consumer: a full channel makes producers wait in `send`, so a
//! slow consumer slows producers down instead of losing readings.

use crate::error::{MalformedEvent, SourceError};
use crate::feed::FeedSubscriber;
use crate::model::Reading;
use crate::sensor::SensorPoller;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Something that arrived from a producer and may become a reading.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// Already decoded, e.g. from the sensor protocol.
    Reading(Reading),
    /// Raw feed payload, validated by the consumer.
    Payload { stream_id: String, payload: Bytes },
}

impl InboundEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            InboundEvent::Reading(reading) => &reading.stream_id,
            InboundEvent::Payload { stream_id, .. } => stream_id,
        }
    }

    pub fn into_reading(self) -> Result<Reading, MalformedEvent> {
        match self {
            InboundEvent::Reading(reading) => Ok(reading),
            InboundEvent::Payload { stream_id, payload } => {
                Reading::from_payload(&stream_id, &payload)
            }
        }
    }
}

pub type InboundSender = mpsc::Sender<InboundEvent>;
pub type InboundReceiver = mpsc::Receiver<InboundEvent>;

/// Bounded channel shared by all producers of one consumer.
pub fn inbound_channel(capacity: usize) -> (InboundSender, InboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// A producer of readings.
///
/// Enum dispatch keeps the two source kinds behind one type without boxing
/// their futures.
pub enum ReadingSource {
    Sensor(SensorPoller),
    Feed(FeedSubscriber),
}

impl ReadingSource {
    /// Returns the source name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Sensor(s) => s.name(),
            Self::Feed(f) => f.name(),
        }
    }

    /// Produce until shutdown or until the consumer goes away.
    pub async fn run(
        self,
        tx: InboundSender,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError> {
        match self {
            Self::Sensor(s) => s.run(tx, shutdown).await,
            Self::Feed(f) => f.run(tx, shutdown).await,
        }
    }

    pub fn spawn(
        self,
        tx: InboundSender,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<(), SourceError>> {
        tracing::info!(source = %self.name(), "starting reading source");
        tokio::spawn(self.run(tx, shutdown))
    }
}
