//! Typed client over a connection.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use skein_types::{CallError, CallShape, Metadata, MethodDescriptor, ProtocolViolation};
use tokio_util::sync::CancellationToken;

use crate::client_call::ClientCall;
use crate::codec::{PostcardCodec, RpcMessage};
use crate::driver::ConnectionHandle;
use crate::interceptor::{
    StreamClientInterceptor, StreamTarget, Streamer, UnaryClientInterceptor, UnaryInvoker,
    UnaryResponse, UnaryTarget,
};
use crate::{AnyMessage, CallContext, ClientStream, MessageCodec};

/// Per-call settings supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub metadata: Metadata,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn into_context(self, method: &'static MethodDescriptor) -> CallContext {
        let mut ctx = CallContext::new(method).with_metadata(self.metadata);
        if let Some(timeout) = self.timeout {
            ctx = ctx.with_timeout(timeout);
        }
        if let Some(token) = &self.cancel {
            ctx = ctx.with_cancellation(token);
        }
        ctx
    }
}

/// A single response with the metadata that came with it.
#[derive(Debug)]
pub struct Response<T> {
    pub message: T,
    pub header: Metadata,
    pub trailer: Metadata,
}

// ============================================================================
// Builder
// ============================================================================

/// Collects client interceptors. Registration order is execution order.
pub struct ClientBuilder {
    conn: ConnectionHandle,
    unary: Vec<Arc<dyn UnaryClientInterceptor>>,
    stream: Vec<Arc<dyn StreamClientInterceptor>>,
}

impl ClientBuilder {
    pub fn new(conn: ConnectionHandle) -> Self {
        Self {
            conn,
            unary: Vec::new(),
            stream: Vec::new(),
        }
    }

    pub fn unary_interceptor(mut self, interceptor: impl UnaryClientInterceptor) -> Self {
        self.unary.push(Arc::new(interceptor));
        self
    }

    pub fn stream_interceptor(mut self, interceptor: impl StreamClientInterceptor) -> Self {
        self.stream.push(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> Client {
        Client {
            conn: self.conn,
            unary: self.unary.into(),
            stream: self.stream.into(),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Makes calls of every shape over one connection.
///
/// Cheap to clone; clones share the connection and the interceptor chains.
#[derive(Clone)]
pub struct Client {
    conn: ConnectionHandle,
    unary: Arc<[Arc<dyn UnaryClientInterceptor>]>,
    stream: Arc<[Arc<dyn StreamClientInterceptor>]>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.conn)
            .field("unary_interceptors", &self.unary.len())
            .field("stream_interceptors", &self.stream.len())
            .finish()
    }
}

impl Client {
    /// Client without interceptors.
    pub fn new(conn: ConnectionHandle) -> Self {
        ClientBuilder::new(conn).build()
    }

    pub fn builder(conn: ConnectionHandle) -> ClientBuilder {
        ClientBuilder::new(conn)
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    pub async fn unary<Req: RpcMessage, Resp: RpcMessage>(
        &self,
        method: &'static MethodDescriptor,
        request: Req,
        options: CallOptions,
    ) -> Result<Response<Resp>, CallError> {
        expect_shape(method, CallShape::Unary)?;
        let target = CallTarget::new::<Req, Resp>(self.conn.clone());
        let response = UnaryInvoker::new(&self.unary, &target)
            .invoke(options.into_context(method), AnyMessage::new(request))
            .await?;
        Ok(Response {
            message: response.message.downcast()?,
            header: response.header,
            trailer: response.trailer,
        })
    }

    /// Send `request` and return the stream of responses.
    pub async fn server_streaming<Req: RpcMessage, Resp: RpcMessage>(
        &self,
        method: &'static MethodDescriptor,
        request: Req,
        options: CallOptions,
    ) -> Result<ServerStreaming<Resp>, CallError> {
        expect_shape(method, CallShape::ServerStreaming)?;
        let stream = self.open::<Req, Resp>(method, options).await?;
        stream.send(AnyMessage::new(request)).await?;
        stream.close_send().await?;
        Ok(ServerStreaming {
            inner: stream,
            _types: PhantomData,
        })
    }

    pub async fn client_streaming<Req: RpcMessage, Resp: RpcMessage>(
        &self,
        method: &'static MethodDescriptor,
        options: CallOptions,
    ) -> Result<ClientStreaming<Req, Resp>, CallError> {
        expect_shape(method, CallShape::ClientStreaming)?;
        let stream = self.open::<Req, Resp>(method, options).await?;
        Ok(ClientStreaming {
            inner: stream,
            _types: PhantomData,
        })
    }

    pub async fn bidi_streaming<Req: RpcMessage, Resp: RpcMessage>(
        &self,
        method: &'static MethodDescriptor,
        options: CallOptions,
    ) -> Result<BidiStreaming<Req, Resp>, CallError> {
        expect_shape(method, CallShape::Bidi)?;
        let stream = self.open::<Req, Resp>(method, options).await?;
        Ok(BidiStreaming {
            inner: stream,
            _types: PhantomData,
        })
    }

    async fn open<Req: RpcMessage, Resp: RpcMessage>(
        &self,
        method: &'static MethodDescriptor,
        options: CallOptions,
    ) -> Result<Box<dyn ClientStream>, CallError> {
        let target = CallTarget::new::<Req, Resp>(self.conn.clone());
        Streamer::new(&self.stream, &target)
            .open(options.into_context(method))
            .await
    }
}

fn expect_shape(method: &'static MethodDescriptor, shape: CallShape) -> Result<(), CallError> {
    if method.shape != shape {
        return Err(ProtocolViolation::WrongShape {
            method: method.path,
            shape: method.shape,
        }
        .into());
    }
    Ok(())
}

/// The real call at the end of both client chains.
struct CallTarget {
    conn: ConnectionHandle,
    codec: Arc<dyn MessageCodec>,
}

impl CallTarget {
    fn new<Req: RpcMessage, Resp: RpcMessage>(conn: ConnectionHandle) -> Self {
        Self {
            conn,
            codec: Arc::new(PostcardCodec::<Req, Resp>::new()),
        }
    }
}

impl UnaryTarget for CallTarget {
    fn call(
        &self,
        ctx: CallContext,
        request: AnyMessage,
    ) -> BoxFuture<'_, Result<UnaryResponse, CallError>> {
        Box::pin(async move {
            let call = ClientCall::open(&self.conn, ctx, Arc::clone(&self.codec)).await?;
            // If the callee already ended the call, its status comes out of
            // recv below.
            match call.send(request).await {
                Err(CallError::Protocol(ProtocolViolation::StreamClosed)) => {}
                other => other?,
            }
            call.close_send().await?;
            let message = call
                .recv()
                .await?
                .ok_or(CallError::Protocol(ProtocolViolation::MissingResponse))?;
            if call.recv().await?.is_some() {
                return Err(ProtocolViolation::UnexpectedResponse.into());
            }
            let header = call.header().await?;
            let trailer = call.trailer().unwrap_or_default();
            Ok(UnaryResponse {
                message,
                header,
                trailer,
            })
        })
    }
}

impl StreamTarget for CallTarget {
    fn open(&self, ctx: CallContext) -> BoxFuture<'_, Result<Box<dyn ClientStream>, CallError>> {
        Box::pin(async move {
            let call = ClientCall::open(&self.conn, ctx, Arc::clone(&self.codec)).await?;
            Ok(Box::new(call) as Box<dyn ClientStream>)
        })
    }
}

// ============================================================================
// Typed streams
// ============================================================================

async fn recv_typed<T: 'static>(stream: &dyn ClientStream) -> Result<Option<T>, CallError> {
    match stream.recv().await? {
        Some(message) => Ok(Some(message.downcast()?)),
        None => Ok(None),
    }
}

/// Responses of a server-streaming call.
pub struct ServerStreaming<Resp> {
    inner: Box<dyn ClientStream>,
    _types: PhantomData<fn() -> Resp>,
}

impl<Resp: RpcMessage> ServerStreaming<Resp> {
    pub fn context(&self) -> &CallContext {
        self.inner.context()
    }

    /// Next response, `None` once the server finished successfully.
    pub async fn recv(&self) -> Result<Option<Resp>, CallError> {
        recv_typed(self.inner.as_ref()).await
    }

    pub async fn header(&self) -> Result<Metadata, CallError> {
        self.inner.header().await
    }

    pub fn trailer(&self) -> Option<Metadata> {
        self.inner.trailer()
    }
}

/// Request side of a client-streaming call.
pub struct ClientStreaming<Req, Resp> {
    inner: Box<dyn ClientStream>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req: RpcMessage, Resp: RpcMessage> ClientStreaming<Req, Resp> {
    pub fn context(&self) -> &CallContext {
        self.inner.context()
    }

    pub async fn send(&self, request: Req) -> Result<(), CallError> {
        self.inner.send(AnyMessage::new(request)).await
    }

    /// Close the request side and wait for the single response.
    pub async fn close_and_recv(&self) -> Result<Response<Resp>, CallError> {
        self.inner.close_send().await?;
        let message = recv_typed(self.inner.as_ref())
            .await?
            .ok_or(CallError::Protocol(ProtocolViolation::MissingResponse))?;
        if self.inner.recv().await?.is_some() {
            return Err(ProtocolViolation::UnexpectedResponse.into());
        }
        Ok(Response {
            message,
            header: self.inner.header().await?,
            trailer: self.inner.trailer().unwrap_or_default(),
        })
    }

    pub async fn header(&self) -> Result<Metadata, CallError> {
        self.inner.header().await
    }

    pub fn trailer(&self) -> Option<Metadata> {
        self.inner.trailer()
    }
}

/// Both sides of a bidi call.
///
/// All methods take `&self`: share it behind an `Arc` to send from one task
/// and receive from another.
pub struct BidiStreaming<Req, Resp> {
    inner: Box<dyn ClientStream>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req: RpcMessage, Resp: RpcMessage> BidiStreaming<Req, Resp> {
    pub fn context(&self) -> &CallContext {
        self.inner.context()
    }

    pub async fn send(&self, request: Req) -> Result<(), CallError> {
        self.inner.send(AnyMessage::new(request)).await
    }

    pub async fn close_send(&self) -> Result<(), CallError> {
        self.inner.close_send().await
    }

    pub async fn recv(&self) -> Result<Option<Resp>, CallError> {
        recv_typed(self.inner.as_ref()).await
    }

    pub async fn header(&self) -> Result<Metadata, CallError> {
        self.inner.header().await
    }

    pub fn trailer(&self) -> Option<Metadata> {
        self.inner.trailer()
    }

    /// Cancel the call. Pending and later operations fail with `Cancelled`.
    pub fn cancel(&self) {
        self.inner.context().cancel();
    }
}
