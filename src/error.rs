//! Error types shared across the recorder.

use thiserror::Error;

/// Failure of a single sensor request/response exchange.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("sensor did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("no response from sensor after {received} of 9 bytes")]
    NoResponse { received: usize },

    #[error("unexpected command byte 0x{found:02x} in response {frame:02x?}")]
    UnexpectedCommandByte { found: u8, frame: [u8; 9] },

    #[error("sensor transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Inbound event payload that could not be turned into a reading.
#[derive(Debug, Error)]
pub enum MalformedEvent {
    #[error("invalid payload on {stream_id}: {source}")]
    Payload {
        stream_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid timestamp {value:?} on {stream_id}: {source}")]
    Timestamp {
        stream_id: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Destination reported a range the tracker cannot interpret.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unparseable range {0:?}")]
pub struct RangeParseError(pub String);

/// Append to the destination failed.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("destination request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("destination returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("destination response missing updated range")]
    MissingRange,

    #[error("destination unavailable: {0}")]
    Unavailable(String),
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure of a reading source that ends its producer task.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("opening sensor transport {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("event feed error: {0}")]
    Feed(String),
}

/// Logging could not be set up.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("installing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Fatal outcome of the recorder loop.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("append to {range} failed: {source}")]
    Destination {
        range: String,
        #[source]
        source: DestinationError,
    },
}
