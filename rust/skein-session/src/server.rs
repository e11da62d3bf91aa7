//! Server: routes, the composition-time capability check and the call
//! dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use skein_types::{CallError, CallShape, Metadata, MethodDescriptor, ServiceDescriptor, Status};
use tracing::{debug, warn};

use crate::codec::{PostcardCodec, RpcMessage};
use crate::driver::{CallAcceptor, IncomingCall};
use crate::interceptor::{
    CallInfo, StreamHandler, StreamNext, StreamServerInterceptor, UnaryHandler, UnaryNext,
    UnaryServerInterceptor,
};
use crate::runtime;
use crate::server_call::ServerCall;
use crate::{AnyMessage, MessageCodec, ServerContext, ServerStream};

/// `Unimplemented` status for `method`.
pub fn unimplemented(method: &MethodDescriptor) -> Status {
    Status::unimplemented(format!("method {} not implemented", method.method_name()))
}

// ============================================================================
// Routes
// ============================================================================

/// Type-erased handler of one method.
#[derive(Clone)]
pub enum RouteHandler {
    Unary(Arc<dyn UnaryHandler>),
    /// Server-streaming, client-streaming and bidi handlers.
    Streaming(Arc<dyn StreamHandler>),
}

/// A handler bound to a method.
///
/// `shape` is what the handler can serve. It must match the method's shape
/// or the service is refused at registration.
#[derive(Clone)]
pub struct Route {
    method: &'static MethodDescriptor,
    shape: CallShape,
    codec: Arc<dyn MessageCodec>,
    handler: RouteHandler,
}

impl Route {
    pub fn new(
        method: &'static MethodDescriptor,
        shape: CallShape,
        codec: Arc<dyn MessageCodec>,
        handler: RouteHandler,
    ) -> Self {
        Self {
            method,
            shape,
            codec,
            handler,
        }
    }

    pub fn method(&self) -> &'static MethodDescriptor {
        self.method
    }

    /// Shape the handler serves.
    pub fn shape(&self) -> CallShape {
        self.shape
    }

    fn capable(&self) -> bool {
        match self.handler {
            RouteHandler::Unary(_) => self.shape.is_unary(),
            RouteHandler::Streaming(_) => !self.shape.is_unary(),
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method.path)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

/// Routes for every method of one service.
#[derive(Debug)]
pub struct ServiceDefinition {
    descriptor: ServiceDescriptor,
    routes: Vec<Route>,
}

impl ServiceDefinition {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            routes: Vec::new(),
        }
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }
}

// ============================================================================
// Route builders
// ============================================================================

struct UnaryFn<F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<F, Fut, Req, Resp> UnaryHandler for UnaryFn<F, Req, Resp>
where
    F: Fn(ServerContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    Req: RpcMessage,
    Resp: RpcMessage,
{
    fn call(
        &self,
        ctx: ServerContext,
        request: AnyMessage,
    ) -> BoxFuture<'static, Result<AnyMessage, Status>> {
        let request = match request.downcast::<Req>() {
            Ok(request) => request,
            Err(err) => {
                let status = Status::from(err);
                return Box::pin(async move { Err(status) });
            }
        };
        let fut = (self.f)(ctx, request);
        Box::pin(async move { fut.await.map(AnyMessage::new) })
    }
}

/// Route for a unary method.
pub fn unary_route<Req, Resp, F, Fut>(method: &'static MethodDescriptor, f: F) -> Route
where
    F: Fn(ServerContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    Req: RpcMessage,
    Resp: RpcMessage,
{
    Route::new(
        method,
        CallShape::Unary,
        Arc::new(PostcardCodec::<Req, Resp>::new()),
        RouteHandler::Unary(Arc::new(UnaryFn {
            f,
            _types: PhantomData,
        })),
    )
}

/// Adapts a typed streaming function. `run` receives the stream shared as
/// an `Arc` and the user function.
struct StreamFn<F, Req, Resp> {
    f: Arc<F>,
    run: fn(Arc<dyn ServerStream>, Arc<F>) -> BoxFuture<'static, Result<(), Status>>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<F, Req, Resp> StreamHandler for StreamFn<F, Req, Resp>
where
    F: Send + Sync + 'static,
    Req: RpcMessage,
    Resp: RpcMessage,
{
    fn call(&self, stream: Box<dyn ServerStream>) -> BoxFuture<'static, Result<(), Status>> {
        (self.run)(Arc::from(stream), Arc::clone(&self.f))
    }
}

fn stream_route<Req: RpcMessage, Resp: RpcMessage, F: Send + Sync + 'static>(
    method: &'static MethodDescriptor,
    shape: CallShape,
    f: F,
    run: fn(Arc<dyn ServerStream>, Arc<F>) -> BoxFuture<'static, Result<(), Status>>,
) -> Route {
    Route::new(
        method,
        shape,
        Arc::new(PostcardCodec::<Req, Resp>::new()),
        RouteHandler::Streaming(Arc::new(StreamFn::<F, Req, Resp> {
            f: Arc::new(f),
            run,
            _types: PhantomData,
        })),
    )
}

/// Route for a server-streaming method. `f` gets the single request and a
/// sink for the responses.
pub fn server_streaming_route<Req, Resp, F, Fut>(method: &'static MethodDescriptor, f: F) -> Route
where
    F: Fn(Req, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
    Req: RpcMessage,
    Resp: RpcMessage,
{
    stream_route::<Req, Resp, F>(method, CallShape::ServerStreaming, f, |stream, f| {
        Box::pin(async move {
            let request = match stream.recv().await? {
                Some(message) => message.downcast::<Req>()?,
                None => return Err(Status::internal("missing request message")),
            };
            (*f)(request, ResponseSink::new(stream)).await
        })
    })
}

/// Route for a client-streaming method. `f` reads the requests and returns
/// the single response.
pub fn client_streaming_route<Req, Resp, F, Fut>(method: &'static MethodDescriptor, f: F) -> Route
where
    F: Fn(RequestStream<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    Req: RpcMessage,
    Resp: RpcMessage,
{
    stream_route::<Req, Resp, F>(method, CallShape::ClientStreaming, f, |stream, f| {
        Box::pin(async move {
            let response = (*f)(RequestStream::new(Arc::clone(&stream))).await?;
            stream.send(AnyMessage::new(response)).await?;
            Ok(())
        })
    })
}

/// Route for a bidi method.
pub fn bidi_route<Req, Resp, F, Fut>(method: &'static MethodDescriptor, f: F) -> Route
where
    F: Fn(BidiStream<Req, Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
    Req: RpcMessage,
    Resp: RpcMessage,
{
    stream_route::<Req, Resp, F>(method, CallShape::Bidi, f, |stream, f| {
        Box::pin(async move { (*f)(BidiStream::new(stream)).await })
    })
}

// ============================================================================
// Typed handler streams
// ============================================================================

async fn recv_typed<T: 'static>(stream: &dyn ServerStream) -> Result<Option<T>, CallError> {
    match stream.recv().await? {
        Some(message) => Ok(Some(message.downcast()?)),
        None => Ok(None),
    }
}

/// Requests of a client-streaming call.
pub struct RequestStream<Req> {
    inner: Arc<dyn ServerStream>,
    _types: PhantomData<fn() -> Req>,
}

impl<Req: RpcMessage> RequestStream<Req> {
    fn new(inner: Arc<dyn ServerStream>) -> Self {
        Self {
            inner,
            _types: PhantomData,
        }
    }

    pub fn context(&self) -> &ServerContext {
        self.inner.context()
    }

    /// Next request, `None` once the caller half-closed.
    pub async fn recv(&self) -> Result<Option<Req>, CallError> {
        recv_typed(self.inner.as_ref()).await
    }

    pub fn set_header(&self, metadata: Metadata) -> Result<(), CallError> {
        self.inner.set_header(metadata)
    }

    pub fn set_trailer(&self, metadata: Metadata) -> Result<(), CallError> {
        self.inner.set_trailer(metadata)
    }
}

/// Responses of a server-streaming call.
pub struct ResponseSink<Resp> {
    inner: Arc<dyn ServerStream>,
    _types: PhantomData<fn(Resp)>,
}

impl<Resp: RpcMessage> ResponseSink<Resp> {
    fn new(inner: Arc<dyn ServerStream>) -> Self {
        Self {
            inner,
            _types: PhantomData,
        }
    }

    pub fn context(&self) -> &ServerContext {
        self.inner.context()
    }

    pub async fn send(&self, response: Resp) -> Result<(), CallError> {
        self.inner.send(AnyMessage::new(response)).await
    }

    pub async fn send_header(&self, metadata: Metadata) -> Result<(), CallError> {
        self.inner.send_header(metadata).await
    }

    pub fn set_header(&self, metadata: Metadata) -> Result<(), CallError> {
        self.inner.set_header(metadata)
    }

    pub fn set_trailer(&self, metadata: Metadata) -> Result<(), CallError> {
        self.inner.set_trailer(metadata)
    }
}

/// Both directions of a bidi call. Clones share the stream, so one task can
/// receive while another sends.
pub struct BidiStream<Req, Resp> {
    inner: Arc<dyn ServerStream>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for BidiStream<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _types: PhantomData,
        }
    }
}

impl<Req: RpcMessage, Resp: RpcMessage> BidiStream<Req, Resp> {
    fn new(inner: Arc<dyn ServerStream>) -> Self {
        Self {
            inner,
            _types: PhantomData,
        }
    }

    pub fn context(&self) -> &ServerContext {
        self.inner.context()
    }

    pub async fn recv(&self) -> Result<Option<Req>, CallError> {
        recv_typed(self.inner.as_ref()).await
    }

    pub async fn send(&self, response: Resp) -> Result<(), CallError> {
        self.inner.send(AnyMessage::new(response)).await
    }

    pub async fn send_header(&self, metadata: Metadata) -> Result<(), CallError> {
        self.inner.send_header(metadata).await
    }

    pub fn set_header(&self, metadata: Metadata) -> Result<(), CallError> {
        self.inner.set_header(metadata)
    }

    pub fn set_trailer(&self, metadata: Metadata) -> Result<(), CallError> {
        self.inner.set_trailer(metadata)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// A service that cannot be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The handler does not serve the method's shape.
    ShapeMismatch {
        method: &'static str,
        expected: CallShape,
        found: CallShape,
    },
    /// Two routes for the same method path.
    DuplicateRoute(&'static str),
    /// A route for a method the service does not declare.
    UnknownMethod {
        service: &'static str,
        method: &'static str,
    },
    /// A declared method without a route.
    MissingRoute(&'static str),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch {
                method,
                expected,
                found,
            } => write!(f, "{method} is {expected} but its handler is {found}"),
            Self::DuplicateRoute(method) => write!(f, "{method} registered twice"),
            Self::UnknownMethod { service, method } => {
                write!(f, "{method} is not a method of {service}")
            }
            Self::MissingRoute(method) => write!(f, "no handler for {method}"),
        }
    }
}

impl std::error::Error for BuildError {}

/// Collects services and server interceptors.
#[derive(Default)]
pub struct ServerBuilder {
    routes: HashMap<&'static str, Route>,
    unary: Vec<Arc<dyn UnaryServerInterceptor>>,
    stream: Vec<Arc<dyn StreamServerInterceptor>>,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.routes.keys().collect();
        methods.sort();
        f.debug_struct("ServerBuilder")
            .field("methods", &methods)
            .field("unary_interceptors", &self.unary.len())
            .field("stream_interceptors", &self.stream.len())
            .finish()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unary_interceptor(mut self, interceptor: impl UnaryServerInterceptor) -> Self {
        self.unary.push(Arc::new(interceptor));
        self
    }

    pub fn stream_interceptor(mut self, interceptor: impl StreamServerInterceptor) -> Self {
        self.stream.push(Arc::new(interceptor));
        self
    }

    /// Register every route of `service`, checking each handler against its
    /// method's shape.
    pub fn add_service(mut self, service: ServiceDefinition) -> Result<Self, BuildError> {
        let ServiceDefinition { descriptor, routes } = service;
        let mut added: HashMap<&'static str, Route> = HashMap::new();

        for route in routes {
            let path = route.method.path;
            let declared = descriptor
                .method(path)
                .ok_or(BuildError::UnknownMethod {
                    service: descriptor.name,
                    method: path,
                })?;
            if declared.shape != route.shape || !route.capable() {
                return Err(BuildError::ShapeMismatch {
                    method: path,
                    expected: declared.shape,
                    found: route.shape,
                });
            }
            if self.routes.contains_key(path) || added.contains_key(path) {
                return Err(BuildError::DuplicateRoute(path));
            }
            added.insert(path, route);
        }

        if let Some(missing) = descriptor
            .methods
            .iter()
            .find(|m| !added.contains_key(m.path))
        {
            return Err(BuildError::MissingRoute(missing.path));
        }

        debug!(service = descriptor.name, methods = added.len(), "service registered");
        self.routes.extend(added);
        Ok(self)
    }

    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                routes: self.routes,
                unary: self.unary.into(),
                stream: self.stream.into(),
            }),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

struct ServerInner {
    routes: HashMap<&'static str, Route>,
    unary: Arc<[Arc<dyn UnaryServerInterceptor>]>,
    stream: Arc<[Arc<dyn StreamServerInterceptor>]>,
}

/// Dispatches calls opened by peers to registered handlers.
///
/// Cheap to clone. Pass it to a connection as its [`CallAcceptor`].
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.inner.routes.keys().collect();
        methods.sort();
        f.debug_struct("Server").field("methods", &methods).finish()
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn has_method(&self, path: &str) -> bool {
        self.inner.routes.contains_key(path)
    }

    pub fn into_acceptor(self) -> Arc<dyn CallAcceptor> {
        Arc::new(self)
    }
}

impl CallAcceptor for Server {
    fn accept(&self, call: IncomingCall) {
        let Some(route) = self.inner.routes.get(call.method()).cloned() else {
            warn!(method = call.method(), "call to unknown method");
            let status = Status::unimplemented(format!("unknown method {}", call.method()));
            call.reject(status);
            return;
        };
        runtime::spawn(dispatch(Arc::clone(&self.inner), route, call));
    }
}

/// Run one accepted call to completion and send its final status.
///
/// The handler races the call deadline and the call token.
async fn dispatch(inner: Arc<ServerInner>, route: Route, incoming: IncomingCall) {
    let call = ServerCall::accept(incoming, route.method, Arc::clone(&route.codec));
    let shared = call.shared();
    let ctx = shared.context().clone();
    let info = CallInfo::new(route.method);

    let result = tokio::select! {
        result = inner.run(&route, &info, call) => result,
        _ = runtime::sleep_until(ctx.deadline()) => {
            debug!(method = %info, "deadline exceeded");
            Err(Status::deadline_exceeded("deadline exceeded"))
        }
        _ = ctx.cancellation_token().cancelled() => {
            shared.abandon();
            return;
        }
    };
    shared.finish(result).await;
}

impl ServerInner {
    async fn run(&self, route: &Route, info: &CallInfo, call: ServerCall) -> Result<(), Status> {
        match &route.handler {
            RouteHandler::Unary(handler) => {
                let request = call
                    .recv()
                    .await?
                    .ok_or_else(|| Status::internal("missing request message"))?;
                let ctx = call.context().clone();
                let response = UnaryNext::new(&self.unary, info, handler.as_ref())
                    .run(ctx, request)
                    .await?;
                call.send(response).await?;
                Ok(())
            }
            RouteHandler::Streaming(handler) => {
                StreamNext::new(&self.stream, info, handler.as_ref())
                    .run(Box::new(call))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static METHODS: [MethodDescriptor; 2] = [
        MethodDescriptor::new("/test.Echo/Say", CallShape::Unary),
        MethodDescriptor::new("/test.Echo/Chat", CallShape::Bidi),
    ];

    static SERVICE: ServiceDescriptor = ServiceDescriptor {
        name: "test.Echo",
        methods: &METHODS,
    };

    fn say() -> Route {
        unary_route(&METHODS[0], |_ctx, req: String| async move { Ok::<_, Status>(req) })
    }

    fn chat() -> Route {
        bidi_route(&METHODS[1], |stream: BidiStream<String, String>| async move {
            while let Some(msg) = stream.recv().await? {
                stream.send(msg).await?;
            }
            Ok::<_, Status>(())
        })
    }

    #[test]
    fn well_formed_service_registers() {
        let server = ServerBuilder::new()
            .add_service(ServiceDefinition::new(SERVICE).route(say()).route(chat()))
            .unwrap()
            .build();
        assert!(server.has_method("/test.Echo/Say"));
        assert!(server.has_method("/test.Echo/Chat"));
    }

    #[test]
    fn handler_shape_must_match_method() {
        let wrong = unary_route(&METHODS[1], |_ctx, req: String| async move { Ok::<_, Status>(req) });
        let err = ServerBuilder::new()
            .add_service(ServiceDefinition::new(SERVICE).route(say()).route(wrong))
            .unwrap_err();
        assert_eq!(
            err,
            BuildError::ShapeMismatch {
                method: "/test.Echo/Chat",
                expected: CallShape::Bidi,
                found: CallShape::Unary,
            }
        );
    }

    #[test]
    fn duplicate_and_missing_routes_are_refused() {
        let err = ServerBuilder::new()
            .add_service(ServiceDefinition::new(SERVICE).route(say()).route(say()))
            .unwrap_err();
        assert_eq!(err, BuildError::DuplicateRoute("/test.Echo/Say"));

        let err = ServerBuilder::new()
            .add_service(ServiceDefinition::new(SERVICE).route(say()))
            .unwrap_err();
        assert_eq!(err, BuildError::MissingRoute("/test.Echo/Chat"));
    }

    #[test]
    fn unimplemented_names_the_method() {
        let status = unimplemented(&METHODS[0]);
        assert_eq!(status.code, skein_types::Code::Unimplemented);
        assert_eq!(status.message, "method Say not implemented");
    }
}
