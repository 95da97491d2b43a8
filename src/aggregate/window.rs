use crate::model::SummaryRow;
use chrono::{DateTime, Utc};

/// Samples collected for one stream since its last flush.
#[derive(Debug, Clone)]
pub struct AggregationWindow {
    stream_id: String,
    samples: Vec<u16>,
}

impl AggregationWindow {
    pub fn new(stream_id: impl Into<String>) -> Self {
        AggregationWindow {
            stream_id: stream_id.into(),
            samples: Vec::new(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn append(&mut self, co2_ppm: u16) {
        self.samples.push(co2_ppm);
    }

    /// Summarize and clear the buffered samples.
    ///
    /// An empty window yields `None` and is left as it was.
    pub fn flush_and_reset(&mut self, flushed_at: DateTime<Utc>) -> Option<SummaryRow> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = std::mem::take(&mut self.samples);
        sorted.sort_unstable();

        let count = sorted.len();
        let sum: u64 = sorted.iter().map(|&ppm| u64::from(ppm)).sum();
        // Mean of u16 samples never exceeds the largest sample.
        let mean = (sum / count as u64) as u16;

        Some(SummaryRow {
            flushed_at,
            min: sorted[0],
            max: sorted[count - 1],
            mean,
            median_like: sorted[count / 2],
        })
    }
}
