//! Length-prefixed framing for async byte streams.
//!
//! Each frame is postcard-encoded and prefixed with its length as a 4-byte
//! little-endian integer. Works over anything implementing
//! `AsyncRead + AsyncWrite`: TCP sockets, Unix sockets, in-memory duplex
//! pipes.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use skein_session::{FrameSink, FrameSource, FrameTransport};
use skein_types::Frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Frame logging for debugging. Set SKEIN_WIRE_SPY=1 to enable.
static WIRE_SPY: Lazy<AtomicBool> =
    Lazy::new(|| AtomicBool::new(std::env::var_os("SKEIN_WIRE_SPY").is_some()));

fn wire_spy_enabled() -> bool {
    WIRE_SPY.load(Ordering::Relaxed)
}

fn wire_spy_log(direction: &str, frame: &Frame) {
    if wire_spy_enabled() {
        eprintln!("[WIRE] {direction} {frame:?}");
    }
}

const FRAME_LEN_PREFIX_SIZE: usize = 4;
const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;

/// Default upper bound on one encoded frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

fn too_large(len: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds the {max} byte limit"),
    )
}

/// A byte stream carrying length-prefixed frames.
pub struct LengthPrefixed<S> {
    stream: S,
    max_frame_size: usize,
}

impl<S> LengthPrefixed<S> {
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_size(stream, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(stream: S, max_frame_size: usize) -> Self {
        Self {
            stream,
            max_frame_size,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> FrameTransport for LengthPrefixed<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Source = FrameReader<ReadHalf<S>>;
    type Sink = FrameWriter<WriteHalf<S>>;

    fn split(self) -> (Self::Source, Self::Sink) {
        let (reader, writer) = tokio::io::split(self.stream);
        (
            FrameReader::new(reader, self.max_frame_size),
            FrameWriter::new(writer, self.max_frame_size),
        )
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Decodes frames from the read half of a stream.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    unread_start: usize,
    max_frame_size: usize,
}

impl<R> FrameReader<R> {
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            unread_start: 0,
            max_frame_size,
        }
    }

    fn compact(&mut self) {
        if self.unread_start == self.buf.len() {
            self.buf.clear();
            self.unread_start = 0;
            return;
        }
        if self.unread_start >= RECV_BUF_COMPACT_THRESHOLD && self.unread_start >= self.buf.len() / 2
        {
            self.buf.drain(..self.unread_start);
            self.unread_start = 0;
        }
    }

    /// Decode one frame if the buffer holds a complete one.
    fn try_decode(&mut self) -> io::Result<Option<Frame>> {
        let unread = &self.buf[self.unread_start..];
        if unread.len() < FRAME_LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_le_bytes([unread[0], unread[1], unread[2], unread[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(too_large(frame_len, self.max_frame_size));
        }
        let frame_start = self.unread_start + FRAME_LEN_PREFIX_SIZE;
        let frame_end = frame_start + frame_len;
        if frame_end > self.buf.len() {
            return Ok(None);
        }

        let decoded = facet_postcard::from_slice::<Frame>(&self.buf[frame_start..frame_end]);
        self.unread_start = frame_end;
        self.compact();

        let frame = decoded
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("postcard: {e}")))?;
        wire_spy_log("<--", &frame);
        Ok(Some(frame))
    }
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Next frame, `Ok(None)` on a clean end of stream.
    pub async fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.try_decode()? {
                return Ok(Some(frame));
            }

            let mut tmp = [0u8; 4096];
            let n = self.reader.read(&mut tmp).await?;
            if n == 0 {
                let trailing = self.buf.len() - self.unread_start;
                if wire_spy_enabled() {
                    eprintln!("[WIRE] <-- EOF");
                }
                if trailing != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {trailing} trailing bytes and no complete frame"),
                    ));
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }
}

impl<R> FrameSource for FrameReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Frame>>> + Send {
        self.read_frame()
    }
}

// ============================================================================
// Writing
// ============================================================================

/// Encodes frames onto the write half of a stream.
pub struct FrameWriter<W> {
    writer: W,
    max_frame_size: usize,
}

impl<W> FrameWriter<W> {
    pub fn new(writer: W, max_frame_size: usize) -> Self {
        Self {
            writer,
            max_frame_size,
        }
    }
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        wire_spy_log("-->", frame);

        let payload = facet_postcard::to_vec(frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if payload.len() > self.max_frame_size {
            return Err(too_large(payload.len(), self.max_frame_size));
        }
        let header = u32::try_from(payload.len())
            .map_err(|_| too_large(payload.len(), self.max_frame_size))?
            .to_le_bytes();

        self.writer.write_all(&header).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await
    }
}

impl<W> FrameSink for FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn send(&mut self, frame: &Frame) -> impl Future<Output = io::Result<()>> + Send {
        self.write_frame(frame)
    }
}

#[cfg(test)]
mod tests {
    use skein_types::{Data, HalfClose, Metadata, Open};

    use super::*;

    fn open(stream_id: u64) -> Frame {
        Frame::Open(Open {
            stream_id,
            method: "/skein.greeter.Greeter/UnaryHello".into(),
            metadata: Metadata::from_pairs([("type", "unary"), ("from", "client")]),
            timeout: Some("1000000u".into()),
        })
    }

    #[tokio::test]
    async fn frames_survive_a_byte_pipe() {
        let (a, b) = tokio::io::duplex(16);
        let mut writer = FrameWriter::new(a, DEFAULT_MAX_FRAME_SIZE);
        let mut reader = FrameReader::new(b, DEFAULT_MAX_FRAME_SIZE);

        let frames = vec![
            open(1),
            Frame::Data(Data {
                stream_id: 1,
                payload: vec![7; 300],
            }),
            Frame::HalfClose(HalfClose { stream_id: 1 }),
        ];
        let expected = frames.clone();

        // The 16-byte pipe forces partial reads and writes.
        let write = tokio::spawn(async move {
            for frame in &frames {
                writer.write_frame(frame).await.unwrap();
            }
        });
        for frame in expected {
            assert_eq!(reader.read_frame().await.unwrap(), Some(frame));
        }
        write.await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a, 8);
        let err = writer.write_frame(&open(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let (mut raw, b) = tokio::io::duplex(1024);
        raw.write_all(&1_000_000u32.to_le_bytes()).await.unwrap();
        let mut reader = FrameReader::new(b, 1024);
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_frame_is_unexpected_eof() {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(&10u32.to_le_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);

        let mut reader = FrameReader::new(b, DEFAULT_MAX_FRAME_SIZE);
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
