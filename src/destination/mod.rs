//! Row-range append destinations
//!
//! A destination accepts one summary row for an A1 range and answers with the
//! range it actually wrote. The recorder feeds that answer back into the
//! [`RowPositionTracker`] so the next row of the same stream lands below it.

mod memory;
mod sheets;
mod tracker;

pub use memory::{AppendCall, MemoryDestination};
pub use sheets::{SheetsConfig, SheetsDestination};
pub use tracker::{parse_end_row, RowPosition, RowPositionTracker};

use crate::error::DestinationError;
use crate::model::SummaryRow;
use std::future::Future;
use std::pin::Pin;

/// Boxed append future, so destinations can be used as trait objects.
pub type AppendFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, DestinationError>> + Send + 'a>>;

/// Append-only sink for summary rows.
pub trait Destination: Send + Sync {
    /// Returns the destination's name for logging.
    fn name(&self) -> &str;

    /// Append `row` at `range`, returning the range the destination reports
    /// as written.
    fn append<'a>(&'a self, range: &'a str, row: &'a SummaryRow) -> AppendFuture<'a>;
}

/// Sheet that receives a stream's rows: `prefix` followed by the last
/// non-empty `/` segment of the stream id.
pub fn sheet_name(prefix: &str, stream_id: &str) -> String {
    let segment = stream_id
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(stream_id);
    format!("{prefix}{segment}")
}
