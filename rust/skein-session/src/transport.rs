//! In-process frame transport.
//!
//! Frames move between the two ends as values, without encoding. Used by
//! tests and by callers that host client and server in one process.

use std::future::Future;
use std::io;

use skein_types::Frame;

use crate::driver::{FrameSink, FrameSource, FrameTransport};
use crate::runtime::{self, UnboundedReceiver, UnboundedSender};

/// One end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: UnboundedSender<Frame>,
    rx: UnboundedReceiver<Frame>,
}

impl MemoryTransport {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = runtime::unbounded();
        let (b_tx, b_rx) = runtime::unbounded();
        (Self { tx: a_tx, rx: b_rx }, Self { tx: b_tx, rx: a_rx })
    }
}

#[derive(Debug)]
pub struct MemorySource(UnboundedReceiver<Frame>);

#[derive(Debug)]
pub struct MemorySink(UnboundedSender<Frame>);

impl FrameSource for MemorySource {
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Frame>>> + Send {
        async move { Ok(self.0.recv().await) }
    }
}

impl FrameSink for MemorySink {
    fn send(&mut self, frame: &Frame) -> impl Future<Output = io::Result<()>> + Send {
        let result = self
            .0
            .send(frame.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"));
        async move { result }
    }
}

impl FrameTransport for MemoryTransport {
    type Source = MemorySource;
    type Sink = MemorySink;

    fn split(self) -> (MemorySource, MemorySink) {
        (MemorySource(self.rx), MemorySink(self.tx))
    }
}
