use super::AggregationWindow;
use crate::model::{Reading, SummaryRow};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

/// Owns one aggregation window per stream, created on first sight.
#[derive(Debug, Default)]
pub struct StreamRouter {
    windows: HashMap<String, AggregationWindow>,
}

impl StreamRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_reading(&mut self, reading: &Reading) {
        let window = self
            .windows
            .entry(reading.stream_id.clone())
            .or_insert_with(|| {
                info!(stream = %reading.stream_id, "new stream");
                AggregationWindow::new(reading.stream_id.clone())
            });
        window.append(reading.co2_ppm);
    }

    /// Flush every known window, returning rows for the non-empty ones.
    pub fn flush_due(&mut self, flushed_at: DateTime<Utc>) -> Vec<(String, SummaryRow)> {
        let mut due = Vec::with_capacity(self.windows.len());
        for (stream_id, window) in self.windows.iter_mut() {
            match window.flush_and_reset(flushed_at) {
                Some(row) => due.push((stream_id.clone(), row)),
                None => debug!(stream = %stream_id, "no readings since last flush"),
            }
        }
        due
    }

    pub fn stream_count(&self) -> usize {
        self.windows.len()
    }

    pub fn buffered(&self, stream_id: &str) -> usize {
        self.windows.get(stream_id).map_or(0, AggregationWindow::len)
    }
}
