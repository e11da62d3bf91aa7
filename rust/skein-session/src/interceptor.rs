//! Interceptor chains for both sides of a call.
//!
//! Interceptors run in the order they were registered. Each one receives a
//! `next` value standing for the rest of the chain; the last `next` is the
//! real call (client side) or the handler (server side). A chain is frozen
//! when the client or server is built and never reordered afterwards.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use skein_types::{CallError, Metadata, MethodDescriptor, Status};

use crate::{AnyMessage, CallContext, ClientStream, ServerContext, ServerStream};

// ============================================================================
// Client side
// ============================================================================

/// Result of a unary call before it is downcast to the typed response.
#[derive(Debug)]
pub struct UnaryResponse {
    pub message: AnyMessage,
    pub header: Metadata,
    pub trailer: Metadata,
}

/// Innermost link of a client unary chain.
pub trait UnaryTarget: Send + Sync {
    fn call(
        &self,
        ctx: CallContext,
        request: AnyMessage,
    ) -> BoxFuture<'_, Result<UnaryResponse, CallError>>;
}

/// Innermost link of a client streaming chain: opens the stream.
pub trait StreamTarget: Send + Sync {
    fn open(&self, ctx: CallContext) -> BoxFuture<'_, Result<Box<dyn ClientStream>, CallError>>;
}

/// Wraps unary calls made by a client.
pub trait UnaryClientInterceptor: Send + Sync + 'static {
    /// Run the call by invoking `next`. The error returned by `next` should
    /// be passed back unchanged unless the interceptor means to translate it.
    fn intercept<'a>(
        &'a self,
        ctx: CallContext,
        request: AnyMessage,
        next: UnaryInvoker<'a>,
    ) -> BoxFuture<'a, Result<UnaryResponse, CallError>>;
}

/// Wraps streaming calls made by a client.
pub trait StreamClientInterceptor: Send + Sync + 'static {
    /// Open the stream by invoking `next`. The returned stream may be
    /// replaced with a wrapper around it.
    fn intercept<'a>(
        &'a self,
        ctx: CallContext,
        method: &'static MethodDescriptor,
        next: Streamer<'a>,
    ) -> BoxFuture<'a, Result<Box<dyn ClientStream>, CallError>>;
}

/// The remainder of a client unary chain.
pub struct UnaryInvoker<'a> {
    rest: &'a [Arc<dyn UnaryClientInterceptor>],
    target: &'a dyn UnaryTarget,
}

impl<'a> UnaryInvoker<'a> {
    pub fn new(chain: &'a [Arc<dyn UnaryClientInterceptor>], target: &'a dyn UnaryTarget) -> Self {
        Self {
            rest: chain,
            target,
        }
    }

    pub fn invoke(
        self,
        ctx: CallContext,
        request: AnyMessage,
    ) -> BoxFuture<'a, Result<UnaryResponse, CallError>> {
        match self.rest.split_first() {
            Some((first, rest)) => first.intercept(
                ctx,
                request,
                UnaryInvoker {
                    rest,
                    target: self.target,
                },
            ),
            None => self.target.call(ctx, request),
        }
    }
}

/// The remainder of a client streaming chain.
pub struct Streamer<'a> {
    rest: &'a [Arc<dyn StreamClientInterceptor>],
    target: &'a dyn StreamTarget,
}

impl<'a> Streamer<'a> {
    pub fn new(chain: &'a [Arc<dyn StreamClientInterceptor>], target: &'a dyn StreamTarget) -> Self {
        Self {
            rest: chain,
            target,
        }
    }

    pub fn open(self, ctx: CallContext) -> BoxFuture<'a, Result<Box<dyn ClientStream>, CallError>> {
        match self.rest.split_first() {
            Some((first, rest)) => {
                let method = ctx.method();
                first.intercept(
                    ctx,
                    method,
                    Streamer {
                        rest,
                        target: self.target,
                    },
                )
            }
            None => self.target.open(ctx),
        }
    }
}

// ============================================================================
// Server side
// ============================================================================

/// What a server interceptor knows about the call it wraps.
#[derive(Debug, Clone, Copy)]
pub struct CallInfo {
    pub method: &'static MethodDescriptor,
}

impl CallInfo {
    pub fn new(method: &'static MethodDescriptor) -> Self {
        Self { method }
    }

    /// Full method path, e.g. `/skein.greeter.Greeter/UnaryHello`.
    pub fn full_method(&self) -> &'static str {
        self.method.path
    }

    pub fn service(&self) -> &'static str {
        self.method.service_name()
    }

    pub fn is_client_stream(&self) -> bool {
        self.method.shape.is_client_streaming()
    }

    pub fn is_server_stream(&self) -> bool {
        self.method.shape.is_server_streaming()
    }
}

impl fmt::Display for CallInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method.path)
    }
}

/// Type-erased unary handler, the innermost link of a server unary chain.
pub trait UnaryHandler: Send + Sync + 'static {
    fn call(
        &self,
        ctx: ServerContext,
        request: AnyMessage,
    ) -> BoxFuture<'static, Result<AnyMessage, Status>>;
}

/// Type-erased streaming handler, the innermost link of a server streaming
/// chain. Used for server-streaming, client-streaming and bidi methods.
pub trait StreamHandler: Send + Sync + 'static {
    fn call(&self, stream: Box<dyn ServerStream>) -> BoxFuture<'static, Result<(), Status>>;
}

/// Wraps unary calls served by a server.
pub trait UnaryServerInterceptor: Send + Sync + 'static {
    fn intercept<'a>(
        &'a self,
        ctx: ServerContext,
        request: AnyMessage,
        info: &'a CallInfo,
        next: UnaryNext<'a>,
    ) -> BoxFuture<'a, Result<AnyMessage, Status>>;
}

/// Wraps streaming calls served by a server.
pub trait StreamServerInterceptor: Send + Sync + 'static {
    /// Run the handler by invoking `next`, optionally with `stream` wrapped.
    fn intercept<'a>(
        &'a self,
        stream: Box<dyn ServerStream>,
        info: &'a CallInfo,
        next: StreamNext<'a>,
    ) -> BoxFuture<'a, Result<(), Status>>;
}

/// The remainder of a server unary chain.
pub struct UnaryNext<'a> {
    rest: &'a [Arc<dyn UnaryServerInterceptor>],
    info: &'a CallInfo,
    handler: &'a dyn UnaryHandler,
}

impl<'a> UnaryNext<'a> {
    pub fn new(
        chain: &'a [Arc<dyn UnaryServerInterceptor>],
        info: &'a CallInfo,
        handler: &'a dyn UnaryHandler,
    ) -> Self {
        Self {
            rest: chain,
            info,
            handler,
        }
    }

    pub fn run(
        self,
        ctx: ServerContext,
        request: AnyMessage,
    ) -> BoxFuture<'a, Result<AnyMessage, Status>> {
        match self.rest.split_first() {
            Some((first, rest)) => first.intercept(
                ctx,
                request,
                self.info,
                UnaryNext {
                    rest,
                    info: self.info,
                    handler: self.handler,
                },
            ),
            None => self.handler.call(ctx, request),
        }
    }
}

/// The remainder of a server streaming chain.
pub struct StreamNext<'a> {
    rest: &'a [Arc<dyn StreamServerInterceptor>],
    info: &'a CallInfo,
    handler: &'a dyn StreamHandler,
}

impl<'a> StreamNext<'a> {
    pub fn new(
        chain: &'a [Arc<dyn StreamServerInterceptor>],
        info: &'a CallInfo,
        handler: &'a dyn StreamHandler,
    ) -> Self {
        Self {
            rest: chain,
            info,
            handler,
        }
    }

    pub fn run(self, stream: Box<dyn ServerStream>) -> BoxFuture<'a, Result<(), Status>> {
        match self.rest.split_first() {
            Some((first, rest)) => first.intercept(
                stream,
                self.info,
                StreamNext {
                    rest,
                    info: self.info,
                    handler: self.handler,
                },
            ),
            None => self.handler.call(stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use skein_types::CallShape;

    use super::*;

    static METHOD: MethodDescriptor = MethodDescriptor::new("/test.Svc/Echo", CallShape::Unary);

    struct Echo;

    impl UnaryTarget for Echo {
        fn call(
            &self,
            ctx: CallContext,
            request: AnyMessage,
        ) -> BoxFuture<'_, Result<UnaryResponse, CallError>> {
            Box::pin(async move {
                let header = ctx.metadata().clone();
                Ok(UnaryResponse {
                    message: request,
                    header,
                    trailer: Metadata::new(),
                })
            })
        }
    }

    struct Failing;

    impl UnaryTarget for Failing {
        fn call(
            &self,
            _ctx: CallContext,
            _request: AnyMessage,
        ) -> BoxFuture<'_, Result<UnaryResponse, CallError>> {
            Box::pin(async { Err(CallError::Application(Status::invalid_argument("name is none"))) })
        }
    }

    struct Traced {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl UnaryClientInterceptor for Traced {
        fn intercept<'a>(
            &'a self,
            mut ctx: CallContext,
            request: AnyMessage,
            next: UnaryInvoker<'a>,
        ) -> BoxFuture<'a, Result<UnaryResponse, CallError>> {
            Box::pin(async move {
                self.log.lock().push(format!("pre {}", self.name));
                ctx.metadata_mut().append("seen-by", self.name.clone());
                let result = next.invoke(ctx, request).await;
                self.log.lock().push(format!("post {}", self.name));
                result
            })
        }
    }

    fn chain(n: usize, log: &Arc<Mutex<Vec<String>>>) -> Vec<Arc<dyn UnaryClientInterceptor>> {
        (0..n)
            .map(|i| {
                Arc::new(Traced {
                    name: i.to_string(),
                    log: log.clone(),
                }) as Arc<dyn UnaryClientInterceptor>
            })
            .collect()
    }

    #[tokio::test]
    async fn pre_in_order_post_in_reverse() {
        for n in [0usize, 1, 2, 5] {
            let log = Arc::new(Mutex::new(Vec::new()));
            let chain = chain(n, &log);
            let response = UnaryInvoker::new(&chain, &Echo)
                .invoke(CallContext::new(&METHOD), AnyMessage::new(1u8))
                .await
                .unwrap();

            let mut expected: Vec<String> = (0..n).map(|i| format!("pre {i}")).collect();
            expected.extend((0..n).rev().map(|i| format!("post {i}")));
            assert_eq!(*log.lock(), expected);

            let seen: Vec<String> = (0..n).map(|i| i.to_string()).collect();
            assert_eq!(response.header.get_all("seen-by"), seen.as_slice());
        }
    }

    #[tokio::test]
    async fn errors_pass_through_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(3, &log);
        let err = UnaryInvoker::new(&chain, &Failing)
            .invoke(CallContext::new(&METHOD), AnyMessage::new(()))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Application(Status::invalid_argument("name is none")));
        assert_eq!(log.lock().len(), 6);
    }
}
