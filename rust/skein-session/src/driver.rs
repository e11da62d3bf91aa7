//! Connection driver: multiplexes calls over one frame transport.
//!
//! The driver owns the transport. One loop reads frames and routes them to
//! the call they belong to, another drains the outbound queue in FIFO order.
//! Calls talk to the driver through a cloneable [`ConnectionHandle`].

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use skein_types::{CallError, Code, Frame, Metadata, Open, Reset, Status, StreamId, Trailer};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::runtime::{self, Receiver, Sender};

// ============================================================================
// Transport traits
// ============================================================================

/// Reading half of a frame transport.
pub trait FrameSource: Send + 'static {
    /// Next frame, or `Ok(None)` once the peer closed the connection.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Frame>>> + Send;
}

/// Writing half of a frame transport.
pub trait FrameSink: Send + 'static {
    fn send(&mut self, frame: &Frame) -> impl Future<Output = io::Result<()>> + Send;
}

/// Anything that moves frames between two peers.
pub trait FrameTransport: Send + 'static {
    type Source: FrameSource;
    type Sink: FrameSink;

    fn split(self) -> (Self::Source, Self::Sink);
}

// ============================================================================
// Configuration and stream ids
// ============================================================================

/// Knobs for one connection.
///
/// There is no window-based flow control. Each call buffers at most
/// `stream_queue` inbound frames; a call whose reader falls further behind is
/// reset with `ResourceExhausted` on both ends, and the connection and its
/// other calls carry on.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the outbound frame queue shared by all calls.
    pub outbound_queue: usize,
    /// Inbound frames buffered per call before the call is reset.
    pub stream_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 1024,
            stream_queue: 1024,
        }
    }
}

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection. Allocates odd stream ids.
    Initiator,
    /// Accepted the connection. Allocates even stream ids.
    Acceptor,
}

/// Allocates stream ids with the parity of our role, so both peers can open
/// calls without colliding.
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: AtomicU64,
}

impl StreamIdAllocator {
    pub fn new(role: Role) -> Self {
        let first = match role {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        };
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> StreamId {
        self.next.fetch_add(2, Ordering::Relaxed)
    }
}

// ============================================================================
// Routing
// ============================================================================

/// What the driver delivers to one call.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Header(Metadata),
    Data(Vec<u8>),
    HalfClose,
    Trailer(Status, Metadata),
    Reset(Status),
    Disconnected(String),
}

impl StreamEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Header(_) => "header",
            Self::Data(_) => "data",
            Self::HalfClose => "half-close",
            Self::Trailer(..) => "trailer",
            Self::Reset(_) => "reset",
            Self::Disconnected(_) => "disconnected",
        }
    }
}

struct StreamEntry {
    events: Sender<StreamEvent>,
    /// Cancelled when the peer resets the stream. Only set for calls we serve.
    cancel_on_reset: Option<CancellationToken>,
}

#[derive(Default)]
struct Registry {
    streams: HashMap<StreamId, StreamEntry>,
    /// Set once the driver stopped. New registrations fail after that.
    closed: Option<String>,
}

/// Removes its stream from the registry when dropped.
pub(crate) struct StreamRegistration {
    stream_id: StreamId,
    shared: Arc<HandleShared>,
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        self.shared.registry.lock().streams.remove(&self.stream_id);
    }
}

/// Outcome of routing one frame to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    UnknownStream,
    /// The call's queue was full. The call has been dropped from the registry.
    Overflowed,
}

fn overflow_status() -> Status {
    Status::new(Code::ResourceExhausted, "inbound stream queue overflowed")
}

struct HandleShared {
    outbound: Sender<Frame>,
    stream_queue: usize,
    stream_ids: StreamIdAllocator,
    registry: Mutex<Registry>,
    shutdown: CancellationToken,
}

impl HandleShared {
    fn register(
        self: &Arc<Self>,
        stream_id: StreamId,
        cancel_on_reset: Option<CancellationToken>,
    ) -> Result<(StreamRegistration, Receiver<StreamEvent>), CallError> {
        let (tx, rx) = runtime::bounded(self.stream_queue);
        let mut registry = self.registry.lock();
        if let Some(reason) = &registry.closed {
            return Err(CallError::Transport(reason.clone()));
        }
        registry.streams.insert(
            stream_id,
            StreamEntry {
                events: tx,
                cancel_on_reset,
            },
        );
        Ok((
            StreamRegistration {
                stream_id,
                shared: Arc::clone(self),
            },
            rx,
        ))
    }

    fn deliver(&self, stream_id: StreamId, event: StreamEvent) -> Delivery {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.streams.get(&stream_id) else {
            return Delivery::UnknownStream;
        };
        if let (StreamEvent::Reset(_), Some(token)) = (&event, &entry.cancel_on_reset) {
            token.cancel();
        }
        match entry.events.try_send(event) {
            // A closed receiver means the call is already going away.
            Ok(()) | Err(TrySendError::Closed(_)) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                // Dropping the sender lets the call drain what it has, then
                // see the stream end.
                if let Some(entry) = registry.streams.remove(&stream_id) {
                    if let Some(token) = entry.cancel_on_reset {
                        token.cancel();
                    }
                }
                Delivery::Overflowed
            }
        }
    }

    fn fail_all(&self, reason: String) {
        let mut registry = self.registry.lock();
        registry.closed = Some(reason.clone());
        for (stream_id, entry) in registry.streams.drain() {
            trace!(stream_id, "failing stream: {reason}");
            if let Some(token) = entry.cancel_on_reset {
                token.cancel();
            }
            let _ = entry.events.try_send(StreamEvent::Disconnected(reason.clone()));
        }
    }
}

// ============================================================================
// Connection handle
// ============================================================================

/// Handle used by calls to reach the driver.
///
/// Cheap to clone. Any number of concurrent calls may share one handle.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<HandleShared>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub(crate) fn next_stream_id(&self) -> StreamId {
        self.shared.stream_ids.next()
    }

    pub(crate) fn register(
        &self,
        stream_id: StreamId,
        cancel_on_reset: Option<CancellationToken>,
    ) -> Result<(StreamRegistration, Receiver<StreamEvent>), CallError> {
        self.shared.register(stream_id, cancel_on_reset)
    }

    /// Error for a call whose event queue ended without a terminal event.
    ///
    /// That happens when the driver stopped, or when it dropped the call
    /// because the call's inbound queue overflowed.
    pub(crate) fn stream_dropped(&self) -> CallError {
        match &self.shared.registry.lock().closed {
            Some(reason) => CallError::Transport(reason.clone()),
            None => CallError::from_status(overflow_status()),
        }
    }

    /// Queue a frame for the writer loop.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), CallError> {
        self.shared
            .outbound
            .send(frame)
            .await
            .map_err(|_| CallError::Transport("connection closed".into()))
    }

    /// Queue a frame without waiting. Used from synchronous paths such as
    /// aborting a call.
    pub(crate) fn send_frame_now(&self, frame: Frame) {
        match self.shared.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                let outbound = self.shared.outbound.clone();
                runtime::spawn(async move {
                    let _ = outbound.send(frame).await;
                });
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Whether the driver has stopped.
    pub fn is_closed(&self) -> bool {
        self.shared.registry.lock().closed.is_some()
    }

    /// Ask the driver to stop. Live calls fail with a transport error.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

// ============================================================================
// Incoming calls
// ============================================================================

/// A call opened by the peer, not yet dispatched.
pub struct IncomingCall {
    pub(crate) open: Open,
    pub(crate) handle: ConnectionHandle,
    pub(crate) registration: StreamRegistration,
    pub(crate) events: Receiver<StreamEvent>,
    pub(crate) token: CancellationToken,
}

impl IncomingCall {
    /// Full method path requested by the peer.
    pub fn method(&self) -> &str {
        &self.open.method
    }

    pub fn metadata(&self) -> &Metadata {
        &self.open.metadata
    }

    /// Refuse the call with `status` without running any handler.
    pub fn reject(self, status: Status) {
        let stream_id = self.open.stream_id;
        debug!(stream_id, method = %self.open.method, %status, "rejecting call");
        self.handle.send_frame_now(Frame::Header(skein_types::Header {
            stream_id,
            metadata: Metadata::new(),
        }));
        self.handle.send_frame_now(Frame::Trailer(Trailer {
            stream_id,
            status,
            metadata: Metadata::new(),
        }));
    }
}

/// Receives calls opened by the peer.
pub trait CallAcceptor: Send + Sync + 'static {
    fn accept(&self, call: IncomingCall);
}

// ============================================================================
// Driver
// ============================================================================

/// Owns the transport and pumps frames until the connection ends.
///
/// Must be spawned (or awaited) for any call on the connection to progress.
pub struct Driver<T> {
    transport: T,
    handle: ConnectionHandle,
    outbound: Receiver<Frame>,
    acceptor: Option<Arc<dyn CallAcceptor>>,
}

/// Set up a connection over `transport`.
///
/// `acceptor` serves calls opened by the peer; without one, such calls are
/// answered with `Unimplemented`.
pub fn establish<T: FrameTransport>(
    transport: T,
    role: Role,
    config: SessionConfig,
    acceptor: Option<Arc<dyn CallAcceptor>>,
) -> (ConnectionHandle, Driver<T>) {
    let (outbound_tx, outbound_rx) = runtime::bounded(config.outbound_queue.max(1));
    let handle = ConnectionHandle {
        shared: Arc::new(HandleShared {
            outbound: outbound_tx,
            stream_queue: config.stream_queue.max(1),
            stream_ids: StreamIdAllocator::new(role),
            registry: Mutex::new(Registry::default()),
            shutdown: CancellationToken::new(),
        }),
    };
    let driver = Driver {
        transport,
        handle: handle.clone(),
        outbound: outbound_rx,
        acceptor,
    };
    (handle, driver)
}

impl<T: FrameTransport> Driver<T> {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Run until the peer disconnects, the transport fails, or
    /// [`ConnectionHandle::shutdown`] is called.
    pub async fn run(self) -> io::Result<()> {
        let Driver {
            transport,
            handle,
            mut outbound,
            acceptor,
        } = self;
        let (mut source, mut sink) = transport.split();
        let shutdown = handle.shared.shutdown.clone();

        let writer = async {
            while let Some(frame) = outbound.recv().await {
                trace!(stream_id = frame.stream_id(), kind = frame.kind(), "-->");
                sink.send(&frame).await?;
            }
            Ok::<_, io::Error>(())
        };

        let reader = async {
            while let Some(frame) = source.recv().await? {
                trace!(stream_id = frame.stream_id(), kind = frame.kind(), "<--");
                route(&handle, acceptor.as_ref(), frame);
            }
            Ok::<_, io::Error>(())
        };

        let (result, reason) = tokio::select! {
            r = reader => match r {
                Ok(()) => (Ok(()), "connection closed by peer".to_string()),
                Err(e) => {
                    let reason = format!("read failed: {e}");
                    (Err(e), reason)
                }
            },
            r = writer => match r {
                Ok(()) => (Ok(()), "connection closed".to_string()),
                Err(e) => {
                    let reason = format!("write failed: {e}");
                    (Err(e), reason)
                }
            },
            _ = shutdown.cancelled() => (Ok(()), "connection shut down".to_string()),
        };

        debug!("driver stopped: {reason}");
        handle.shared.fail_all(reason);
        result
    }
}

fn route(handle: &ConnectionHandle, acceptor: Option<&Arc<dyn CallAcceptor>>, frame: Frame) {
    let shared = &handle.shared;
    match frame {
        Frame::Open(open) => {
            let stream_id = open.stream_id;
            if shared.registry.lock().streams.contains_key(&stream_id) {
                warn!(stream_id, "peer reopened a live stream, ignoring");
                return;
            }
            let token = CancellationToken::new();
            let (registration, events) = match shared.register(stream_id, Some(token.clone())) {
                Ok(r) => r,
                Err(_) => return,
            };
            let call = IncomingCall {
                open,
                handle: handle.clone(),
                registration,
                events,
                token,
            };
            match acceptor {
                Some(acceptor) => acceptor.accept(call),
                None => call.reject(Status::unimplemented("this peer serves no methods")),
            }
        }
        Frame::Header(f) => deliver(handle, f.stream_id, StreamEvent::Header(f.metadata)),
        Frame::Data(f) => deliver(handle, f.stream_id, StreamEvent::Data(f.payload)),
        Frame::HalfClose(f) => deliver(handle, f.stream_id, StreamEvent::HalfClose),
        Frame::Trailer(f) => deliver(
            handle,
            f.stream_id,
            StreamEvent::Trailer(f.status, f.metadata),
        ),
        Frame::Reset(f) => deliver(handle, f.stream_id, StreamEvent::Reset(f.status)),
    }
}

fn deliver(handle: &ConnectionHandle, stream_id: StreamId, event: StreamEvent) {
    let kind = event.kind();
    match handle.shared.deliver(stream_id, event) {
        Delivery::Delivered => {}
        Delivery::UnknownStream => trace!(stream_id, kind, "frame for unknown stream"),
        Delivery::Overflowed => {
            warn!(stream_id, "inbound stream queue full, resetting stream");
            handle.send_frame_now(Frame::Reset(Reset {
                stream_id,
                status: overflow_status(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_follow_role_parity() {
        let initiator = StreamIdAllocator::new(Role::Initiator);
        let acceptor = StreamIdAllocator::new(Role::Acceptor);
        assert_eq!(
            [initiator.next(), initiator.next(), initiator.next()],
            [1, 3, 5]
        );
        assert_eq!([acceptor.next(), acceptor.next()], [2, 4]);
    }
}
