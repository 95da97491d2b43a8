//! Recorder scenarios
//!
//! Drive the recorder through its public API with in-memory and scripted
//! destinations:
//! 1. Independent streams produce independent summary rows
//! 2. A failing sheet never blocks another stream's append
//! 3. Empty windows produce no append
//! 4. Row positions follow the ranges the destination reports
//! 5. A failed append ends the run loop unless retrying is configured

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use co2_recorder::config::{OnDestinationError, RecorderConfig};
use co2_recorder::destination::{AppendFuture, Destination, MemoryDestination, RowPosition};
use co2_recorder::{
    inbound_channel, InboundEvent, Reading, RecorderError, RecorderEvent, RecorderLoop, SummaryRow,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

fn reading(stream: &str, ppm: u16) -> RecorderEvent {
    let ts = DateTime::parse_from_rfc3339("2021-01-01T09:00:00+09:00").unwrap();
    RecorderEvent::ReadingArrived(InboundEvent::Reading(Reading::new(stream, ts, ppm)))
}

fn payload(stream: &str, body: &'static str) -> RecorderEvent {
    RecorderEvent::ReadingArrived(InboundEvent::Payload {
        stream_id: stream.to_string(),
        payload: Bytes::from_static(body.as_bytes()),
    })
}

fn tick(minute: u32) -> RecorderEvent {
    RecorderEvent::FlushTick(Utc.with_ymd_and_hms(2021, 1, 1, 0, minute, 0).unwrap())
}

fn summary(row: &SummaryRow) -> (u16, u16, u16, u16) {
    (row.min, row.max, row.mean, row.median_like)
}

fn memory_recorder(config: RecorderConfig) -> (Arc<MemoryDestination>, RecorderLoop) {
    let dest = Arc::new(MemoryDestination::new());
    let recorder = RecorderLoop::new(&config, dest.clone());
    (dest, recorder)
}

/// Answers with scripted ranges, one per call, and records every request.
struct Scripted {
    replies: Mutex<Vec<Result<String, String>>>,
    requests: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(replies: Vec<Result<&str, &str>>) -> Self {
        Scripted {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .rev()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Destination for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn append<'a>(&'a self, range: &'a str, _row: &'a SummaryRow) -> AppendFuture<'a> {
        Box::pin(async move {
            self.requests.lock().push(range.to_string());
            match self.replies.lock().pop() {
                Some(Ok(reported)) => Ok(reported),
                Some(Err(why)) => Err(co2_recorder::DestinationError::Unavailable(why)),
                None => Err(co2_recorder::DestinationError::MissingRange),
            }
        })
    }
}

#[tokio::test]
async fn test_two_streams_summarized_independently() {
    let (dest, mut rec) = memory_recorder(RecorderConfig::default());

    for event in [
        reading("/co2/a", 400),
        reading("/co2/b", 900),
        reading("/co2/a", 420),
        reading("/co2/a", 410),
    ] {
        rec.handle_event(event).await.unwrap();
    }
    rec.handle_event(tick(5)).await.unwrap();

    let a = dest.rows("sheeta");
    let b = dest.rows("sheetb");
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(summary(&a[0]), (400, 420, 410, 410));
    assert_eq!(summary(&b[0]), (900, 900, 900, 900));

    let mut ranges: Vec<String> = dest.calls().into_iter().map(|c| c.range).collect();
    ranges.sort();
    assert_eq!(ranges, vec!["sheeta!A1:E1", "sheetb!A1:E1"]);
}

#[tokio::test]
async fn test_failing_sheet_does_not_block_other_stream() {
    let (dest, mut rec) = memory_recorder(RecorderConfig::default());
    dest.fail_sheet("sheeta");

    rec.handle_event(reading("/co2/a", 400)).await.unwrap();
    rec.handle_event(reading("/co2/b", 900)).await.unwrap();

    let err = rec.handle_event(tick(5)).await.unwrap_err();
    assert!(matches!(err, RecorderError::Destination { ref range, .. } if range == "sheeta!A1:E1"));

    assert!(dest.rows("sheeta").is_empty());
    assert_eq!(summary(&dest.rows("sheetb")[0]), (900, 900, 900, 900));
    assert_eq!(rec.tracker().position("/co2/b"), RowPosition::Known(1));
    assert_eq!(rec.tracker().position("/co2/a"), RowPosition::Unknown);
}

#[tokio::test]
async fn test_empty_window_skipped() {
    let (dest, mut rec) = memory_recorder(RecorderConfig::default());

    rec.handle_event(reading("/co2/a", 400)).await.unwrap();
    rec.handle_event(tick(5)).await.unwrap();
    assert_eq!(dest.calls().len(), 1);

    // Known stream, nothing new since the last flush.
    rec.handle_event(tick(10)).await.unwrap();
    assert_eq!(dest.calls().len(), 1);
    assert_eq!(rec.router().stream_count(), 1);
    assert_eq!(rec.stats().flushes, 2);
}

#[tokio::test]
async fn test_even_count_takes_upper_middle() {
    let (dest, mut rec) = memory_recorder(RecorderConfig::default());

    for ppm in [500, 400, 700, 600] {
        rec.handle_event(reading("/co2/1", ppm)).await.unwrap();
    }
    rec.handle_event(tick(5)).await.unwrap();

    let row = dest.rows("sheet1")[0];
    assert_eq!(summary(&row), (400, 700, 550, 600));
    assert!(row.min <= row.median_like && row.median_like <= row.max);
}

#[tokio::test]
async fn test_malformed_payloads_dropped_valid_kept() {
    let (dest, mut rec) = memory_recorder(RecorderConfig::default());

    for event in [
        payload("/co2/1", r#"{"t":"2021-01-01T00:00:00Z","co2ppm":480}"#),
        payload("/co2/1", r#"{"t":"2021-01-01T00:00:01Z","co2ppm":-3}"#),
        payload("/co2/1", r#"{"t":"2021-01-01T00:00:02Z","co2ppm":70000}"#),
        payload("/co2/1", r#"{"t":"not a time","co2ppm":500}"#),
        payload("/co2/1", "garbage"),
        payload("/co2/1", r#"{"t":"2021-01-01T00:00:03Z","co2ppm":520}"#),
    ] {
        rec.handle_event(event).await.unwrap();
    }
    rec.handle_event(tick(5)).await.unwrap();

    assert_eq!(rec.stats().malformed, 4);
    assert_eq!(rec.stats().readings, 2);
    assert_eq!(summary(&dest.rows("sheet1")[0]), (480, 520, 500, 520));
}

#[tokio::test]
async fn test_targets_follow_reported_ranges() {
    let dest = Arc::new(Scripted::new(vec![
        Ok("Sheet1!A1:E1"),
        Ok("Sheet1!A2:E2"),
        Ok("Sheet1!A3:E3"),
    ]));
    let config = RecorderConfig {
        sheet_prefix: "Sheet".to_string(),
        ..RecorderConfig::default()
    };
    let mut rec = RecorderLoop::new(&config, dest.clone());

    for minute in [5, 10, 15] {
        rec.handle_event(reading("/co2/1", 400)).await.unwrap();
        rec.handle_event(tick(minute)).await.unwrap();
    }

    assert_eq!(
        dest.requests(),
        vec!["Sheet1!A1:E1", "Sheet1!A1:E1", "Sheet1!A2:E2"]
    );
    assert_eq!(rec.tracker().position("/co2/1"), RowPosition::Known(3));
}

#[tokio::test]
async fn test_unparseable_report_falls_back_to_row_one() {
    let dest = Arc::new(Scripted::new(vec![
        Ok("Sheet1!A7:E7"),
        Ok("no range here"),
        Ok("Sheet1!A9:E9"),
    ]));
    let config = RecorderConfig {
        sheet_prefix: "Sheet".to_string(),
        ..RecorderConfig::default()
    };
    let mut rec = RecorderLoop::new(&config, dest.clone());

    for minute in [5, 10, 15] {
        rec.handle_event(reading("/co2/1", 400)).await.unwrap();
        rec.handle_event(tick(minute)).await.unwrap();
    }

    assert_eq!(
        dest.requests(),
        vec!["Sheet1!A1:E1", "Sheet1!A7:E7", "Sheet1!A1:E1"]
    );
    assert_eq!(rec.stats().position_resets, 1);
    assert_eq!(rec.stats().rows_written, 3);
}

#[tokio::test]
async fn test_initial_row_hint_seeds_new_streams() {
    let config = RecorderConfig {
        initial_row: Some(42),
        ..RecorderConfig::default()
    };
    let (dest, mut rec) = memory_recorder(config);

    rec.handle_event(reading("/co2/office", 400)).await.unwrap();
    rec.handle_event(tick(5)).await.unwrap();

    assert_eq!(dest.calls()[0].range, "sheetoffice!A42:E42");
}

#[tokio::test]
async fn test_sheet_names_are_quoted() {
    let config = RecorderConfig {
        sheet_prefix: "room ".to_string(),
        ..RecorderConfig::default()
    };
    let (dest, mut rec) = memory_recorder(config);

    rec.handle_event(reading("home/co2/kitchen", 400)).await.unwrap();
    rec.handle_event(tick(5)).await.unwrap();

    assert_eq!(dest.calls()[0].range, "'room kitchen'!A1:E1");
    assert_eq!(dest.rows("room kitchen").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_policy_survives_outage() {
    let dest = Arc::new(Scripted::new(vec![
        Err("503"),
        Err("503"),
        Ok("sheet1!A1:E1"),
    ]));
    let config = RecorderConfig {
        on_destination_error: OnDestinationError::Retry,
        ..RecorderConfig::default()
    };
    let mut rec = RecorderLoop::new(&config, dest.clone());

    rec.handle_event(reading("/co2/1", 400)).await.unwrap();
    rec.handle_event(tick(5)).await.unwrap();

    assert_eq!(dest.requests().len(), 3);
    assert_eq!(rec.stats().rows_written, 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_flushes_every_interval() {
    let config = RecorderConfig {
        flush_interval: Duration::from_secs(60),
        flush_on_shutdown: false,
        ..RecorderConfig::default()
    };
    let (dest, rec) = memory_recorder(config);
    let (tx, rx) = inbound_channel(8);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(rec.run(rx, shutdown.clone()));

    // One reading per interval, each sent just after a tick.
    let ts = DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z").unwrap();
    for ppm in [400, 800, 600] {
        tx.send(InboundEvent::Reading(Reading::new("/co2/1", ts, ppm)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
    }
    shutdown.cancel();

    let stats = task.await.unwrap().unwrap();
    let rows = dest.rows("sheet1");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows.iter().map(|r| r.max).collect::<Vec<_>>(), vec![400, 800, 600]);
    assert_eq!(stats.rows_written, 3);
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_stops_on_failed_append() {
    let config = RecorderConfig {
        flush_interval: Duration::from_secs(60),
        on_destination_error: OnDestinationError::Fail,
        ..RecorderConfig::default()
    };
    let (dest, rec) = memory_recorder(config);
    dest.fail_sheet("sheeta");

    let (tx, rx) = inbound_channel(8);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(rec.run(rx, shutdown.clone()));

    let ts = DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z").unwrap();
    tx.send(InboundEvent::Reading(Reading::new("/co2/a", ts, 400)))
        .await
        .unwrap();
    tx.send(InboundEvent::Reading(Reading::new("/co2/b", ts, 900)))
        .await
        .unwrap();

    // No shutdown: the first flush failure alone ends the loop.
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, RecorderError::Destination { ref range, .. } if range == "sheeta!A1:E1"));
    assert!(!shutdown.is_cancelled());
    assert_eq!(dest.rows("sheetb").len(), 1);
    drop(tx);
}
