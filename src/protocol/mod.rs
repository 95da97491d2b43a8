//! MH-Z19 CO2 sensor protocol
//!
//! The sensor speaks a fixed 9-byte request/response protocol over a serial
//! line. Only the "read CO2 concentration" command (0x86) is used:
//!
//! ```text
//! request:  FF 01 86 00 00 00 00 00 79
//! response: FF 86 HH LL .. .. .. .. CS    ppm = HH * 256 + LL
//! ```
//!
//! The checksum byte of the response is not verified. A response that does
//! not start with `FF 86` is realigned on the next header found in it, so the
//! tail of a frame that arrived after a timeout cannot shift every later one.

use crate::error::ProtocolError;
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Length of every request and response frame.
pub const FRAME_LEN: usize = 9;

/// Command byte for "read CO2 concentration".
pub const READ_CO2: u8 = 0x86;

/// First byte of every frame.
pub const START: u8 = 0xFF;

/// Complete read request, checksum included.
pub const READ_CO2_COMMAND: [u8; FRAME_LEN] =
    [START, 0x01, READ_CO2, 0x00, 0x00, 0x00, 0x00, 0x00, 0x79];

/// Marker item for encoding a read request.
#[derive(Debug, Clone, Copy)]
pub struct ReadCo2;

/// Frame codec for the sensor protocol.
///
/// Decoding yields the concentration in ppm once a full response frame is
/// buffered; a partial frame leaves the buffer untouched. Bytes ahead of a
/// later response header are dropped and decoding waits for the rest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Co2Codec;

impl Encoder<ReadCo2> for Co2Codec {
    type Error = ProtocolError;

    fn encode(&mut self, _item: ReadCo2, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&READ_CO2_COMMAND);
        Ok(())
    }
}

impl Decoder for Co2Codec {
    type Item = u16;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<u16>, Self::Error> {
        if src.len() < FRAME_LEN {
            return Ok(None);
        }

        if let Some(skip) = resync_offset(&src[..FRAME_LEN]) {
            debug!(skipped = skip, "realigning on response header");
            src.advance(skip);
            return Ok(None);
        }

        let raw = src.split_to(FRAME_LEN);
        let mut frame = [0u8; FRAME_LEN];
        frame.copy_from_slice(&raw);
        parse_response(&frame).map(Some)
    }
}

/// Offset of the next possible response header when `frame` is misaligned.
///
/// A trailing `FF` counts, since its command byte may still be on the way.
/// `None` means the frame is aligned or holds no header at all.
fn resync_offset(frame: &[u8]) -> Option<usize> {
    if frame.starts_with(&[START, READ_CO2]) {
        return None;
    }
    (1..frame.len()).find(|&i| {
        frame[i] == START && frame.get(i + 1).map_or(true, |&b| b == READ_CO2)
    })
}

/// Extract the concentration from a complete response frame.
pub fn parse_response(frame: &[u8; FRAME_LEN]) -> Result<u16, ProtocolError> {
    if frame[1] != READ_CO2 {
        return Err(ProtocolError::UnexpectedCommandByte {
            found: frame[1],
            frame: *frame,
        });
    }
    Ok(u16::from_be_bytes([frame[2], frame[3]]))
}

/// Query the sensor once and return the concentration in ppm.
///
/// The whole exchange (request write plus response accumulation) must finish
/// within `timeout`.
pub async fn read_co2<T>(transport: &mut T, timeout: Duration) -> Result<u16, ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, exchange(transport)).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout(timeout)),
    }
}

async fn exchange<T>(transport: &mut T) -> Result<u16, ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = Co2Codec;

    let mut request = BytesMut::with_capacity(FRAME_LEN);
    codec.encode(ReadCo2, &mut request)?;
    transport.write_all(&request).await?;
    transport.flush().await?;

    let mut buffer = BytesMut::with_capacity(FRAME_LEN);
    let mut read_buf = [0u8; FRAME_LEN];

    loop {
        if let Some(ppm) = codec.decode(&mut buffer)? {
            return Ok(ppm);
        }

        // Never read past the frame so a late byte stays for the next exchange.
        let wanted = FRAME_LEN - buffer.len();
        let n = transport.read(&mut read_buf[..wanted]).await?;
        if n == 0 {
            return Err(ProtocolError::NoResponse {
                received: buffer.len(),
            });
        }
        buffer.extend_from_slice(&read_buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    fn response(high: u8, low: u8) -> [u8; FRAME_LEN] {
        [0xFF, READ_CO2, high, low, 0x00, 0x00, 0x00, 0x00, 0x00]
    }

    /// Plays the sensor side: checks the request, then answers in chunks.
    async fn answer(mut sensor: DuplexStream, chunks: Vec<Vec<u8>>) -> DuplexStream {
        let mut request = [0u8; FRAME_LEN];
        sensor.read_exact(&mut request).await.unwrap();
        assert_eq!(request, READ_CO2_COMMAND);

        for chunk in chunks {
            sensor.write_all(&chunk).await.unwrap();
            sensor.flush().await.unwrap();
            tokio::task::yield_now().await;
        }
        sensor
    }

    #[test]
    fn test_encode_read_command() {
        let mut codec = Co2Codec;
        let mut buf = BytesMut::new();
        codec.encode(ReadCo2, &mut buf).unwrap();
        assert_eq!(&buf[..], &READ_CO2_COMMAND);
    }

    #[test]
    fn test_decode_partial_frame_waits() {
        let mut codec = Co2Codec;
        let mut buf = BytesMut::from(&response(0x01, 0x90)[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(&response(0x01, 0x90)[5..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(400));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_realigns_on_late_tail() {
        let mut codec = Co2Codec;
        // Tail of a frame that arrived after its exchange timed out, then the
        // start of the next response.
        let mut buf = BytesMut::from(&[0, 0, 0, 0, 0xFF, READ_CO2, 0x01, 0xF4, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &[0xFF, READ_CO2, 0x01, 0xF4, 0x00]);

        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(500));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_resync_offset() {
        assert_eq!(resync_offset(&response(0x01, 0x90)), None);
        assert_eq!(resync_offset(&[0xFF, 0x00, 0x01, 0x90, 0, 0, 0, 0, 0]), None);
        assert_eq!(resync_offset(&[0, 0, 0xFF, READ_CO2, 0, 0, 0, 0, 0]), Some(2));
        assert_eq!(resync_offset(&[0, 0, 0, 0, 0, 0, 0, 0, 0xFF]), Some(8));
        assert_eq!(resync_offset(&[0, 0xFF, 0x00, 0, 0, 0, 0, 0, 0]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_tail_does_not_shift_next_exchange() {
        let (mut host, mut sensor) = duplex(64);
        let first = response(0x01, 0xE0);

        let sensor_task = tokio::spawn(async move {
            let mut request = [0u8; FRAME_LEN];
            sensor.read_exact(&mut request).await.unwrap();
            sensor.write_all(&first[..5]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(6)).await;
            sensor.write_all(&first[5..]).await.unwrap();

            for low in 0xF4..=0xF6u8 {
                sensor.read_exact(&mut request).await.unwrap();
                sensor.write_all(&response(0x01, low)).await.unwrap();
            }
            sensor
        });

        assert!(matches!(
            read_co2(&mut host, Duration::from_secs(5)).await,
            Err(ProtocolError::Timeout(_))
        ));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(read_co2(&mut host, Duration::from_secs(5)).await.unwrap());
        }
        assert_eq!(seen, vec![500, 501, 502]);
        let _sensor = sensor_task.await.unwrap();
    }

    #[test]
    fn test_parse_wrong_command_byte() {
        let mut frame = response(0x01, 0x90);
        frame[1] = 0x87;

        match parse_response(&frame) {
            Err(ProtocolError::UnexpectedCommandByte { found, .. }) => assert_eq!(found, 0x87),
            other => panic!("expected UnexpectedCommandByte, got {:?}", other),
        }
    }

    #[test]
    fn test_checksum_not_verified() {
        let mut frame = response(0x02, 0x58);
        frame[8] = 0xAB;
        assert_eq!(parse_response(&frame).unwrap(), 600);
    }

    #[tokio::test]
    async fn test_read_whole_response() {
        let (mut host, sensor) = duplex(64);
        let sensor_task = tokio::spawn(answer(sensor, vec![response(0x03, 0x20).to_vec()]));

        let ppm = read_co2(&mut host, Duration::from_secs(5)).await.unwrap();
        assert_eq!(ppm, 800);
        sensor_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_tolerates_short_reads() {
        let (mut host, sensor) = duplex(64);
        let frame = response(0x01, 0xA4);
        let chunks = vec![frame[..1].to_vec(), frame[1..4].to_vec(), frame[4..].to_vec()];
        let sensor_task = tokio::spawn(answer(sensor, chunks));

        let ppm = read_co2(&mut host, Duration::from_secs(5)).await.unwrap();
        assert_eq!(ppm, 420);
        sensor_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_leaves_extra_bytes_unread() {
        let (mut host, sensor) = duplex(64);
        let mut bytes = response(0x01, 0x90).to_vec();
        bytes.push(0xEE);
        let sensor_task = tokio::spawn(answer(sensor, vec![bytes]));

        assert_eq!(read_co2(&mut host, Duration::from_secs(5)).await.unwrap(), 400);
        let _sensor = sensor_task.await.unwrap();

        let mut rest = [0u8; 1];
        host.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest[0], 0xEE);
    }

    #[tokio::test]
    async fn test_sensor_closes_mid_frame() {
        let (mut host, sensor) = duplex(64);
        let sensor_task = tokio::spawn(async move {
            let sensor = answer(sensor, vec![vec![0xFF, READ_CO2, 0x01]]).await;
            drop(sensor);
        });

        match read_co2(&mut host, Duration::from_secs(5)).await {
            Err(ProtocolError::NoResponse { received }) => assert_eq!(received, 3),
            other => panic!("expected NoResponse, got {:?}", other),
        }
        sensor_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_command_byte_from_sensor() {
        let (mut host, sensor) = duplex(64);
        let mut frame = response(0x01, 0x90);
        frame[1] = 0x00;
        let sensor_task = tokio::spawn(answer(sensor, vec![frame.to_vec()]));

        let result = read_co2(&mut host, Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedCommandByte { found: 0x00, .. })
        ));
        sensor_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_sensor_times_out() {
        let (mut host, _sensor) = duplex(64);

        match read_co2(&mut host, Duration::from_secs(5)).await {
            Err(ProtocolError::Timeout(after)) => assert_eq!(after, Duration::from_secs(5)),
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    struct BrokenLine;

    impl AsyncRead for BrokenLine {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "line down")))
        }
    }

    impl AsyncWrite for BrokenLine {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "line down")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let mut line = BrokenLine;
        let result = read_co2(&mut line, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProtocolError::Transport(_))));
    }
}
