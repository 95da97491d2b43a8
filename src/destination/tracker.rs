use super::sheet_name;
use crate::error::RangeParseError;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Where the next summary row of a stream should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPosition {
    Unknown,
    Known(u32),
}

impl RowPosition {
    /// Row number used in the target range; unknown positions start at 1.
    pub fn row(self) -> u32 {
        match self {
            RowPosition::Unknown => 1,
            RowPosition::Known(row) => row,
        }
    }
}

/// Advisory per-stream row positions, fed by the destination's append
/// responses.
#[derive(Debug)]
pub struct RowPositionTracker {
    sheet_prefix: String,
    initial: RowPosition,
    positions: HashMap<String, RowPosition>,
}

impl RowPositionTracker {
    pub fn new(sheet_prefix: impl Into<String>) -> Self {
        RowPositionTracker {
            sheet_prefix: sheet_prefix.into(),
            initial: RowPosition::Unknown,
            positions: HashMap::new(),
        }
    }

    /// Seed streams seen for the first time with a known row.
    pub fn with_initial_row(mut self, row: Option<u32>) -> Self {
        self.initial = match row {
            Some(row) if row > 0 => RowPosition::Known(row),
            _ => RowPosition::Unknown,
        };
        self
    }

    pub fn position(&self, stream_id: &str) -> RowPosition {
        self.positions
            .get(stream_id)
            .copied()
            .unwrap_or(self.initial)
    }

    pub fn sheet_name(&self, stream_id: &str) -> String {
        sheet_name(&self.sheet_prefix, stream_id)
    }

    /// Range of the form `<sheet>!A<row>:E<row>` for the stream's next row.
    pub fn target_range(&self, stream_id: &str) -> String {
        let row = self.position(stream_id).row();
        format!("{}!A{row}:E{row}", quote_sheet(&self.sheet_name(stream_id)))
    }

    /// Remember where the destination actually wrote the last row.
    ///
    /// A range that cannot be parsed resets the stream to `Unknown`.
    pub fn record_append_result(
        &mut self,
        stream_id: &str,
        reported_range: &str,
    ) -> Result<u32, RangeParseError> {
        match parse_end_row(reported_range) {
            Ok(row) => {
                debug!(stream = %stream_id, range = %reported_range, row, "row position updated");
                self.positions
                    .insert(stream_id.to_string(), RowPosition::Known(row));
                Ok(row)
            }
            Err(e) => {
                warn!(
                    stream = %stream_id,
                    error = %e,
                    "cannot track row position, falling back to row 1"
                );
                self.positions
                    .insert(stream_id.to_string(), RowPosition::Unknown);
                Err(e)
            }
        }
    }
}

/// Sheet names outside `[A-Za-z0-9_]` must be single-quoted in A1 notation.
fn quote_sheet(name: &str) -> String {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\'', "''"))
    }
}

/// Ending row number of an A1 range such as `Sheet1!A5:E7` (7).
pub fn parse_end_row(range: &str) -> Result<u32, RangeParseError> {
    let invalid = || RangeParseError(range.to_string());

    let cells = match range.rfind('!') {
        Some(bang) => &range[bang + 1..],
        None => range,
    };
    let end_cell = match cells.rsplit_once(':') {
        Some((_, end)) => end,
        None => cells,
    };

    let digits = end_cell.trim_start_matches(|c: char| c.is_ascii_alphabetic() || c == '$');
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    match digits.parse::<u32>() {
        Ok(row) if row > 0 => Ok(row),
        _ => Err(invalid()),
    }
}
