pub mod aggregate;
pub mod config;
pub mod destination;
pub mod error;
pub mod feed;
pub mod model;
pub mod observability;
pub mod protocol;
pub mod recorder;
pub mod sensor;
pub mod sniffer;
pub mod source;

pub use aggregate::{AggregationWindow, StreamRouter};
pub use config::Config;
pub use destination::{
    Destination, MemoryDestination, RowPosition, RowPositionTracker, SheetsDestination,
};
pub use error::{
    ConfigError, DestinationError, MalformedEvent, ProtocolError, RangeParseError, RecorderError,
    SourceError, TracingError,
};
pub use model::{Reading, SummaryRow};
pub use recorder::{RecorderEvent, RecorderLoop, RecorderStats};
pub use source::{inbound_channel, InboundEvent, ReadingSource};
