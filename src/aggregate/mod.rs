//! Per-stream aggregation of readings into summary rows.

mod router;
mod window;

pub use router::StreamRouter;
pub use window::AggregationWindow;
