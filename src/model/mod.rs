//! Readings and summary rows

use crate::error::MalformedEvent;
use chrono::{DateTime, FixedOffset, Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Column format of the timestamp written to the destination.
pub const ROW_TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// One concentration sample from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub stream_id: String,
    /// Sampling instant, keeping the offset the producer stamped it with.
    pub timestamp: DateTime<FixedOffset>,
    pub co2_ppm: u16,
}

/// Wire shape of a reading on the event feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingPayload {
    #[serde(rename = "t")]
    pub timestamp: String,
    #[serde(rename = "co2ppm")]
    pub co2_ppm: u16,
}

impl Reading {
    pub fn new(
        stream_id: impl Into<String>,
        timestamp: DateTime<FixedOffset>,
        co2_ppm: u16,
    ) -> Self {
        Reading {
            stream_id: stream_id.into(),
            timestamp,
            co2_ppm,
        }
    }

    /// Decode an event feed payload received on `stream_id`.
    pub fn from_payload(stream_id: &str, payload: &[u8]) -> Result<Self, MalformedEvent> {
        let wire: ReadingPayload =
            serde_json::from_slice(payload).map_err(|source| MalformedEvent::Payload {
                stream_id: stream_id.to_string(),
                source,
            })?;

        let timestamp = DateTime::parse_from_rfc3339(&wire.timestamp).map_err(|source| {
            MalformedEvent::Timestamp {
                stream_id: stream_id.to_string(),
                value: wire.timestamp.clone(),
                source,
            }
        })?;

        Ok(Reading::new(stream_id, timestamp, wire.co2_ppm))
    }

    pub fn payload(&self) -> ReadingPayload {
        ReadingPayload {
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            co2_ppm: self.co2_ppm,
        }
    }

    /// Encode for publishing on the event feed.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload())
    }
}

/// Statistics for one stream over one flush interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryRow {
    pub flushed_at: DateTime<Utc>,
    pub min: u16,
    pub max: u16,
    pub mean: u16,
    /// Element at index `count / 2` of the sorted sample (upper middle for
    /// even counts).
    pub median_like: u16,
}

impl SummaryRow {
    /// Ordered cell values: timestamp, min, max, mean, median.
    pub fn values(&self) -> Vec<serde_json::Value> {
        let stamp = self
            .flushed_at
            .with_timezone(&Local)
            .format(ROW_TIMESTAMP_FORMAT)
            .to_string();

        vec![
            serde_json::Value::from(stamp),
            serde_json::Value::from(self.min),
            serde_json::Value::from(self.max),
            serde_json::Value::from(self.mean),
            serde_json::Value::from(self.median_like),
        ]
    }
}
