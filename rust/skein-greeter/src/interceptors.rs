//! Logging interceptors used by the demo binaries.
//!
//! They only observe: every request, response, error and end-of-stream is
//! passed along untouched.

use futures_util::future::BoxFuture;
use skein_session::{
    AnyMessage, CallContext, CallInfo, ClientStream, ServerContext, ServerStream,
    StreamClientInterceptor, StreamHooks, StreamNext, StreamServerInterceptor, Streamer,
    UnaryClientInterceptor, UnaryInvoker, UnaryNext, UnaryResponse, UnaryServerInterceptor,
    WrappedClientStream, WrappedServerStream,
};
use skein_types::{CallError, MethodDescriptor, Status};
use tracing::info;

// ============================================================================
// Client side
// ============================================================================

/// Logs each unary call before and after it runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnaryClientLogger;

impl UnaryClientInterceptor for UnaryClientLogger {
    fn intercept<'a>(
        &'a self,
        ctx: CallContext,
        request: AnyMessage,
        next: UnaryInvoker<'a>,
    ) -> BoxFuture<'a, Result<UnaryResponse, CallError>> {
        Box::pin(async move {
            let method = ctx.method();
            info!(%method, ?request, "[pre] unary client interceptor");
            let result = next.invoke(ctx, request).await;
            match &result {
                Ok(response) => {
                    info!(%method, reply = ?response.message, "[post] unary client interceptor")
                }
                Err(err) => info!(%method, %err, "[post] unary client interceptor"),
            }
            result
        })
    }
}

/// Logs stream opens and wraps the stream in [`ClientMessageLogger`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamClientLogger;

impl StreamClientInterceptor for StreamClientLogger {
    fn intercept<'a>(
        &'a self,
        ctx: CallContext,
        method: &'static MethodDescriptor,
        next: Streamer<'a>,
    ) -> BoxFuture<'a, Result<Box<dyn ClientStream>, CallError>> {
        Box::pin(async move {
            info!(%method, "[pre] stream client interceptor");
            let stream = next.open(ctx).await?;
            let hooks = ClientMessageLogger { method };
            Ok(Box::new(WrappedClientStream::new(stream, hooks)) as Box<dyn ClientStream>)
        })
    }
}

/// Per-message logging on the calling side.
#[derive(Debug, Clone, Copy)]
pub struct ClientMessageLogger {
    method: &'static MethodDescriptor,
}

impl StreamHooks for ClientMessageLogger {
    fn before_send(&self, message: &AnyMessage) {
        info!(method = %self.method, ?message, "[pre message] send");
    }

    fn after_recv(&self, result: &Result<Option<AnyMessage>, CallError>) {
        if let Ok(Some(message)) = result {
            info!(method = %self.method, ?message, "[post message] recv");
        }
    }

    fn after_close_send(&self, result: &Result<(), CallError>) {
        match result {
            Ok(()) => info!(method = %self.method, "[post] close send"),
            Err(err) => info!(method = %self.method, %err, "[post] close send"),
        }
    }
}

// ============================================================================
// Server side
// ============================================================================

/// Logs each unary call served, with its outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnaryServerLogger;

impl UnaryServerInterceptor for UnaryServerLogger {
    fn intercept<'a>(
        &'a self,
        ctx: ServerContext,
        request: AnyMessage,
        info: &'a CallInfo,
        next: UnaryNext<'a>,
    ) -> BoxFuture<'a, Result<AnyMessage, Status>> {
        Box::pin(async move {
            info!(method = %info, ?request, "[pre] unary server interceptor");
            let result = next.run(ctx, request).await;
            match &result {
                Ok(reply) => info!(method = %info, ?reply, "[post] unary server interceptor"),
                Err(status) => info!(method = %info, %status, "[post] unary server interceptor"),
            }
            result
        })
    }
}

/// Logs around the handler and wraps the stream in [`ServerMessageLogger`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamServerLogger;

impl StreamServerInterceptor for StreamServerLogger {
    fn intercept<'a>(
        &'a self,
        stream: Box<dyn ServerStream>,
        info: &'a CallInfo,
        next: StreamNext<'a>,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            info!(method = %info, "[pre stream] stream server interceptor");
            let hooks = ServerMessageLogger {
                method: info.method,
            };
            let result = next.run(Box::new(WrappedServerStream::new(stream, hooks))).await;
            info!(method = %info, "[post stream] stream server interceptor");
            result
        })
    }
}

/// Per-message logging on the serving side.
#[derive(Debug, Clone, Copy)]
pub struct ServerMessageLogger {
    method: &'static MethodDescriptor,
}

impl StreamHooks for ServerMessageLogger {
    fn after_recv(&self, result: &Result<Option<AnyMessage>, CallError>) {
        if let Ok(Some(message)) = result {
            info!(method = %self.method, ?message, "[pre message] recv");
        }
    }

    fn before_send(&self, message: &AnyMessage) {
        info!(method = %self.method, ?message, "[post message] send");
    }
}
