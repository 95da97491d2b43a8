//! In-memory destination for dry runs and tests.

use super::{AppendFuture, Destination};
use crate::error::DestinationError;
use crate::model::SummaryRow;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// One recorded append request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendCall {
    pub range: String,
    pub row: SummaryRow,
}

#[derive(Debug, Default)]
struct Sheets {
    rows: HashMap<String, Vec<SummaryRow>>,
    calls: Vec<AppendCall>,
    failing: HashSet<String>,
}

/// Emulates spreadsheet append semantics: every row goes below the last one
/// of its sheet, whatever row the request asked for.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    sheets: Mutex<Sheets>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append to `sheet` fail until further notice.
    pub fn fail_sheet(&self, sheet: &str) {
        self.sheets.lock().failing.insert(sheet.to_string());
    }

    pub fn heal_sheet(&self, sheet: &str) {
        self.sheets.lock().failing.remove(sheet);
    }

    /// Every append request seen, including failed ones.
    pub fn calls(&self) -> Vec<AppendCall> {
        self.sheets.lock().calls.clone()
    }

    pub fn rows(&self, sheet: &str) -> Vec<SummaryRow> {
        self.sheets
            .lock()
            .rows
            .get(sheet)
            .cloned()
            .unwrap_or_default()
    }

    fn write(&self, range: &str, row: &SummaryRow) -> Result<String, DestinationError> {
        let sheet = sheet_of(range);
        let mut sheets = self.sheets.lock();
        sheets.calls.push(AppendCall {
            range: range.to_string(),
            row: *row,
        });

        if sheets.failing.contains(&sheet) {
            return Err(DestinationError::Unavailable(format!("sheet {sheet} rejected the append")));
        }

        let rows = sheets.rows.entry(sheet.clone()).or_default();
        rows.push(*row);
        let written = rows.len();

        tracing::info!(
            range = %range,
            min = row.min,
            max = row.max,
            mean = row.mean,
            median = row.median_like,
            "dry-run append"
        );

        Ok(format!("{sheet}!A{written}:E{written}"))
    }
}

impl Destination for MemoryDestination {
    fn name(&self) -> &str {
        "memory"
    }

    fn append<'a>(&'a self, range: &'a str, row: &'a SummaryRow) -> AppendFuture<'a> {
        Box::pin(async move { self.write(range, row) })
    }
}

/// Unquoted sheet name of an A1 range.
fn sheet_of(range: &str) -> String {
    let sheet = range.rsplit_once('!').map_or(range, |(sheet, _)| sheet);
    match sheet.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        Some(quoted) => quoted.replace("''", "'"),
        None => sheet.to_string(),
    }
}
