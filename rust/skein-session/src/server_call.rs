//! Handler side of a call accepted from the peer.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use skein_types::{
    CallError, Data, Frame, Header, Metadata, MethodDescriptor, ProtocolViolation, Status,
    StreamId, Trailer, parse_timeout,
};
use tracing::{debug, trace, warn};

use crate::call::CallState;
use crate::driver::{ConnectionHandle, IncomingCall, StreamEvent, StreamRegistration};
use crate::runtime::{Instant, Mutex, Receiver};
use crate::{AnyMessage, MessageCodec, ServerContext, ServerStream};

/// State shared by the stream given to the handler and the dispatcher that
/// sends the final status.
pub(crate) struct ServerCallShared {
    stream_id: StreamId,
    ctx: ServerContext,
    state: CallState,
    conn: ConnectionHandle,
    /// Keeps header, messages and trailer in order when several tasks send.
    send_lock: Mutex<()>,
    _registration: StreamRegistration,
}

impl ServerCallShared {
    pub(crate) fn context(&self) -> &ServerContext {
        &self.ctx
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), CallError> {
        let result = self.conn.send_frame(frame).await;
        if let Err(err) = &result {
            self.state.complete(Err(err.clone()));
        }
        result
    }

    /// Send the pending header unless it already went out. Caller holds
    /// `send_lock`.
    async fn flush_header(&self) -> Result<(), CallError> {
        if let Some(metadata) = self.ctx.take_header() {
            self.send_frame(Frame::Header(Header {
                stream_id: self.stream_id,
                metadata,
            }))
            .await?;
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), CallError> {
        if self.state.token().is_cancelled() {
            return Err(self
                .state
                .interruption()
                .unwrap_or(ProtocolViolation::StreamClosed.into()));
        }
        Ok(())
    }

    async fn send_message(
        &self,
        codec: &dyn MessageCodec,
        message: AnyMessage,
    ) -> Result<(), CallError> {
        self.check_open()?;
        self.state.begin_send()?;
        let payload = codec.encode(&message)?;
        let _guard = self.send_lock.lock().await;
        self.flush_header().await?;
        self.send_frame(Frame::Data(Data {
            stream_id: self.stream_id,
            payload,
        }))
        .await
    }

    async fn send_header(&self, metadata: Metadata) -> Result<(), CallError> {
        self.check_open()?;
        let _guard = self.send_lock.lock().await;
        self.ctx.set_header(metadata)?;
        self.flush_header().await
    }

    /// The call token fired while the handler ran: the caller went away or
    /// reset the stream. Nothing more is sent.
    pub(crate) fn abandon(&self) {
        if let Some(err) = self.state.interruption() {
            debug!(stream_id = self.stream_id, %err, "call abandoned");
        }
    }

    /// Send the trailer with the handler's final status and close the call.
    ///
    /// Does nothing if the call already ended, e.g. because the peer reset it.
    pub(crate) async fn finish(&self, result: Result<(), Status>) {
        if self.state.is_closed() {
            return;
        }
        if self.state.token().is_cancelled() {
            self.abandon();
            return;
        }
        let status = match result {
            Ok(()) => Status::ok(),
            Err(status) => status,
        };
        debug!(stream_id = self.stream_id, %status, "finishing call");

        let _guard = self.send_lock.lock().await;
        if self.flush_header().await.is_ok() {
            let _ = self
                .send_frame(Frame::Trailer(Trailer {
                    stream_id: self.stream_id,
                    metadata: self.ctx.take_trailer(),
                    status: status.clone(),
                }))
                .await;
        }
        let outcome = if status.is_ok() {
            Ok(())
        } else {
            Err(CallError::Application(status))
        };
        self.state.complete(outcome);
    }
}

/// The stream a handler receives for one accepted call.
pub struct ServerCall {
    shared: Arc<ServerCallShared>,
    codec: Arc<dyn MessageCodec>,
    inbound: Mutex<Receiver<StreamEvent>>,
}

impl ServerCall {
    pub(crate) fn accept(
        incoming: IncomingCall,
        method: &'static MethodDescriptor,
        codec: Arc<dyn MessageCodec>,
    ) -> Self {
        let IncomingCall {
            open,
            handle,
            registration,
            events,
            token,
        } = incoming;

        let deadline = open.timeout.as_deref().and_then(|raw| {
            let parsed = parse_timeout(raw);
            if parsed.is_none() {
                warn!(stream_id = open.stream_id, timeout = raw, "ignoring malformed timeout");
            }
            parsed.map(|d| Instant::now() + d)
        });

        let ctx = ServerContext::new(method, open.metadata, deadline, token.clone());
        let shared = Arc::new(ServerCallShared {
            stream_id: open.stream_id,
            ctx,
            state: CallState::new(token),
            conn: handle,
            send_lock: Mutex::new(()),
            _registration: registration,
        });

        Self {
            shared,
            codec,
            inbound: Mutex::new(events),
        }
    }

    pub(crate) fn shared(&self) -> Arc<ServerCallShared> {
        Arc::clone(&self.shared)
    }

    async fn recv_message(&self) -> Result<Option<AnyMessage>, CallError> {
        let mut inbound = self.inbound.lock().await;
        loop {
            match self.shared.state.outcome() {
                Some(Ok(())) => return Ok(None),
                Some(Err(err)) => return Err(err),
                None => {}
            }
            if self.shared.state.recv_done() {
                return Ok(None);
            }

            let token = self.shared.state.token();
            let event = tokio::select! {
                biased;
                event = inbound.recv() => event,
                _ = token.cancelled() => {
                    return Err(self
                        .shared
                        .state
                        .interruption()
                        .unwrap_or(ProtocolViolation::StreamClosed.into()));
                }
            };

            match event {
                Some(StreamEvent::Data(payload)) => {
                    self.shared.state.mark_received();
                    return Ok(Some(self.codec.decode_request(&payload)?));
                }
                Some(StreamEvent::HalfClose) => {
                    trace!(stream_id = self.shared.stream_id, "caller half-closed");
                    self.shared.state.close_recv();
                }
                Some(StreamEvent::Reset(status)) => {
                    self.shared.state.complete(Err(CallError::from_status(status)));
                }
                Some(StreamEvent::Disconnected(reason)) => {
                    self.shared.state.complete(Err(CallError::Transport(reason)));
                }
                Some(StreamEvent::Header(_) | StreamEvent::Trailer(..)) => {
                    warn!(stream_id = self.shared.stream_id, "caller sent callee-only frame");
                }
                None => {
                    self.shared.state.complete(Err(self.shared.conn.stream_dropped()));
                }
            }
        }
    }
}

impl ServerStream for ServerCall {
    fn context(&self) -> &ServerContext {
        &self.shared.ctx
    }

    fn recv(&self) -> BoxFuture<'_, Result<Option<AnyMessage>, CallError>> {
        Box::pin(self.recv_message())
    }

    fn send(&self, message: AnyMessage) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(self.shared.send_message(self.codec.as_ref(), message))
    }

    fn send_header(&self, metadata: Metadata) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(self.shared.send_header(metadata))
    }

    fn set_header(&self, metadata: Metadata) -> Result<(), CallError> {
        self.shared.ctx.set_header(metadata)
    }

    fn set_trailer(&self, metadata: Metadata) -> Result<(), CallError> {
        self.shared.ctx.set_trailer(metadata)
    }
}
