//! Span helpers
//!
//! Structured spans for the recorder's unit of work: one flush tick and the
//! appends it issues.

use tracing::{span, Level, Span};

/// Span for a flush tick covering `streams` due windows.
#[inline]
pub fn flush_span(streams: usize) -> Span {
    span!(Level::INFO, "recorder.flush", flush.streams = streams)
}

/// Span for one append.
#[inline]
pub fn append_span(stream_id: &str, range: &str) -> Span {
    span!(
        Level::INFO,
        "destination.append",
        stream.id = %stream_id,
        destination.range = %range
    )
}

/// Span for a sensor polling task.
#[inline]
pub fn sensor_span(source: &str) -> Span {
    span!(Level::INFO, "sensor.poll", source = %source)
}

#[inline]
pub fn sniff_span(stream_id: &str) -> Span {
    span!(Level::DEBUG, "sniffer.publish", stream.id = %stream_id)
}
