//! Caller side of a call running over a connection.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use skein_types::{
    CallError, Data, Frame, HalfClose, Metadata, Open, ProtocolViolation, Reset, Status, StreamId,
    format_timeout,
};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::call::{CallPhase, CallState};
use crate::driver::{ConnectionHandle, StreamEvent, StreamRegistration};
use crate::runtime::{self, Mutex, Receiver};
use crate::{AnyMessage, CallContext, ClientStream, MessageCodec};

struct Shared {
    stream_id: StreamId,
    state: CallState,
    conn: ConnectionHandle,
}

impl Shared {
    /// Terminate the call locally and tell the peer.
    fn abort(&self, err: CallError) {
        let status = err.status();
        if self.state.complete(Err(err)) {
            debug!(stream_id = self.stream_id, %status, "call aborted");
            self.conn.send_frame_now(Frame::Reset(Reset {
                stream_id: self.stream_id,
                status,
            }));
        }
    }

    /// Error to report once the call token fired.
    fn interrupted(&self) -> CallError {
        self.abort(CallError::Cancelled);
        match self.state.outcome() {
            Some(Err(err)) => err,
            _ => ProtocolViolation::StreamClosed.into(),
        }
    }
}

struct Inbound {
    events: Receiver<StreamEvent>,
    buffered: VecDeque<Vec<u8>>,
}

/// A call opened on a [`ConnectionHandle`].
///
/// Implements [`ClientStream`] for every call shape. Unary calls use the
/// same machinery with exactly one message in each direction.
pub struct ClientCall {
    ctx: CallContext,
    shared: Arc<Shared>,
    codec: Arc<dyn MessageCodec>,
    inbound: Mutex<Inbound>,
    header: OnceLock<Metadata>,
    header_ready: Notify,
    trailer: OnceLock<Metadata>,
    _registration: StreamRegistration,
}

impl ClientCall {
    /// Open a call: send the `Open` frame and arm the deadline.
    ///
    /// Fails with `DeadlineExceeded` without touching the connection if the
    /// deadline already passed.
    pub async fn open(
        conn: &ConnectionHandle,
        ctx: CallContext,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Self, CallError> {
        if ctx.is_expired() {
            return Err(CallError::DeadlineExceeded);
        }
        if ctx.cancellation_token().is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let stream_id = conn.next_stream_id();
        let (registration, events) = conn.register(stream_id, None)?;
        let shared = Arc::new(Shared {
            stream_id,
            state: CallState::new(ctx.cancellation_token().child_token()),
            conn: conn.clone(),
        });

        debug!(stream_id, method = %ctx.method(), "opening call");
        conn.send_frame(Frame::Open(Open {
            stream_id,
            method: ctx.method().path.to_string(),
            metadata: ctx.metadata().clone(),
            timeout: ctx.remaining().map(format_timeout),
        }))
        .await?;

        runtime::spawn(watch(Arc::clone(&shared), ctx.deadline()));

        Ok(Self {
            ctx,
            shared,
            codec,
            inbound: Mutex::new(Inbound {
                events,
                buffered: VecDeque::new(),
            }),
            header: OnceLock::new(),
            header_ready: Notify::new(),
            trailer: OnceLock::new(),
            _registration: registration,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.shared.stream_id
    }

    pub fn phase(&self) -> CallPhase {
        self.shared.state.phase()
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), CallError> {
        let token = self.shared.state.token();
        tokio::select! {
            result = self.shared.conn.send_frame(frame) => {
                if let Err(err) = &result {
                    self.shared.abort(err.clone());
                }
                result
            }
            _ = token.cancelled() => Err(self.shared.interrupted()),
        }
    }

    fn set_header(&self, metadata: Metadata) {
        if self.header.set(metadata).is_err() {
            warn!(stream_id = self.shared.stream_id, "peer sent a second header");
        }
        self.header_ready.notify_waiters();
    }

    /// Handle one event from the driver, or return once the call is
    /// interrupted.
    async fn pump(&self, inbound: &mut Inbound) {
        let token = self.shared.state.token();
        let event = tokio::select! {
            biased;
            event = inbound.events.recv() => event,
            _ = token.cancelled() => {
                self.shared.interrupted();
                self.header_ready.notify_waiters();
                return;
            }
        };

        match event {
            Some(StreamEvent::Header(metadata)) => self.set_header(metadata),
            Some(StreamEvent::Data(payload)) => {
                if self.header.get().is_none() {
                    self.set_header(Metadata::new());
                }
                inbound.buffered.push_back(payload);
            }
            Some(StreamEvent::Trailer(status, metadata)) => {
                self.finish(status, metadata);
            }
            Some(StreamEvent::Reset(status)) => {
                trace!(stream_id = self.shared.stream_id, %status, "peer reset");
                self.shared.state.complete(Err(CallError::from_status(status)));
            }
            Some(StreamEvent::Disconnected(reason)) => {
                self.shared.abort(CallError::Transport(reason));
            }
            Some(StreamEvent::HalfClose) => {
                warn!(stream_id = self.shared.stream_id, "unexpected half-close from callee");
            }
            None => self.shared.abort(self.shared.conn.stream_dropped()),
        }
        self.header_ready.notify_waiters();
    }

    fn finish(&self, status: Status, metadata: Metadata) {
        if self.header.get().is_none() {
            let _ = self.header.set(Metadata::new());
        }
        let _ = self.trailer.set(metadata);
        let outcome = if status.is_ok() {
            Ok(())
        } else {
            Err(CallError::from_status(status))
        };
        self.shared.state.complete(outcome);
    }

    async fn recv_message(&self) -> Result<Option<AnyMessage>, CallError> {
        let mut inbound = self.inbound.lock().await;
        let result = self.next_message(&mut inbound).await;
        drop(inbound);
        // A header waiter may be parked on the queue we just released.
        self.header_ready.notify_waiters();
        result
    }

    async fn next_message(&self, inbound: &mut Inbound) -> Result<Option<AnyMessage>, CallError> {
        loop {
            let outcome = self.shared.state.outcome();
            if let Some(Err(err)) = &outcome {
                return Err(err.clone());
            }
            if let Some(payload) = inbound.buffered.pop_front() {
                self.shared.state.mark_received();
                let message = self.codec.decode_response(&payload)?;
                return Ok(Some(message));
            }
            if outcome.is_some() {
                return Ok(None);
            }
            self.pump(inbound).await;
        }
    }

    async fn send_message(&self, message: AnyMessage) -> Result<(), CallError> {
        self.shared.state.begin_send()?;
        if self.ctx.is_expired() {
            self.shared.abort(CallError::DeadlineExceeded);
            return Err(CallError::DeadlineExceeded);
        }
        let payload = self.codec.encode(&message)?;
        self.send_frame(Frame::Data(Data {
            stream_id: self.shared.stream_id,
            payload,
        }))
        .await
    }

    async fn close(&self) -> Result<(), CallError> {
        if !self.shared.state.close_send() {
            return Ok(());
        }
        self.send_frame(Frame::HalfClose(HalfClose {
            stream_id: self.shared.stream_id,
        }))
        .await
    }

    async fn wait_header(&self) -> Result<Metadata, CallError> {
        loop {
            if let Some(header) = self.header.get() {
                return Ok(header.clone());
            }
            match self.shared.state.outcome() {
                Some(Err(err)) => return Err(err),
                Some(Ok(())) => return Ok(Metadata::new()),
                None => {}
            }

            let notified = self.header_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.header.get().is_some() || self.shared.state.outcome().is_some() {
                continue;
            }

            // Whoever holds the inbound queue pumps it; otherwise we do.
            match self.inbound.try_lock() {
                Ok(mut inbound) => self.pump(&mut inbound).await,
                Err(_) => notified.await,
            }
        }
    }
}

impl ClientStream for ClientCall {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn send(&self, message: AnyMessage) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(self.send_message(message))
    }

    fn recv(&self) -> BoxFuture<'_, Result<Option<AnyMessage>, CallError>> {
        Box::pin(self.recv_message())
    }

    fn close_send(&self) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(self.close())
    }

    fn header(&self) -> BoxFuture<'_, Result<Metadata, CallError>> {
        Box::pin(self.wait_header())
    }

    fn trailer(&self) -> Option<Metadata> {
        if !self.shared.state.is_closed() {
            return None;
        }
        Some(self.trailer.get().cloned().unwrap_or_default())
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        // Dropping an unfinished call cancels it on the peer.
        self.shared.abort(CallError::Cancelled);
    }
}

/// Enforce the deadline and propagate cancellation to the peer.
async fn watch(shared: Arc<Shared>, deadline: Option<runtime::Instant>) {
    let token = shared.state.token().clone();
    tokio::select! {
        _ = runtime::sleep_until(deadline) => {
            shared.abort(CallError::DeadlineExceeded);
        }
        _ = token.cancelled() => {
            shared.abort(CallError::Cancelled);
        }
    }
}
