//! The greeter service: its trait, the stock implementations and the adapter
//! that turns an implementation into routes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use skein_session::{
    BidiStream, RequestStream, ResponseSink, ServerContext, ServiceDefinition, bidi_route,
    client_streaming_route, server_streaming_route, unary_route, unimplemented,
};
use skein_types::{Metadata, Status};
use tracing::{debug, info};

use crate::proto::{
    GREETER, HELLO_BI_STREAMS, HELLO_CLIENT_STREAM, HELLO_SERVER_STREAM, HelloReply, HelloRequest,
    UNARY_HELLO,
};

/// Number of replies sent by `HelloServerStream`.
pub const SERVER_STREAM_REPLIES: usize = 5;

/// Longest name `UnaryHello` accepts, in characters.
pub const MAX_NAME_LEN: usize = 5;

/// Handlers for the four greeter methods.
///
/// There are no default bodies. Implementations that only serve some methods
/// forward the rest to [`UnimplementedGreeter`].
pub trait Greeter: Send + Sync + 'static {
    fn unary_hello(
        &self,
        ctx: ServerContext,
        request: HelloRequest,
    ) -> impl Future<Output = Result<HelloReply, Status>> + Send;

    fn hello_server_stream(
        &self,
        request: HelloRequest,
        replies: ResponseSink<HelloReply>,
    ) -> impl Future<Output = Result<(), Status>> + Send;

    fn hello_client_stream(
        &self,
        requests: RequestStream<HelloRequest>,
    ) -> impl Future<Output = Result<HelloReply, Status>> + Send;

    fn hello_bi_streams(
        &self,
        stream: BidiStream<HelloRequest, HelloReply>,
    ) -> impl Future<Output = Result<(), Status>> + Send;
}

/// Answers every method with `Unimplemented`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnimplementedGreeter;

impl Greeter for UnimplementedGreeter {
    async fn unary_hello(
        &self,
        _ctx: ServerContext,
        _request: HelloRequest,
    ) -> Result<HelloReply, Status> {
        Err(unimplemented(UNARY_HELLO))
    }

    async fn hello_server_stream(
        &self,
        _request: HelloRequest,
        _replies: ResponseSink<HelloReply>,
    ) -> Result<(), Status> {
        Err(unimplemented(HELLO_SERVER_STREAM))
    }

    async fn hello_client_stream(
        &self,
        _requests: RequestStream<HelloRequest>,
    ) -> Result<HelloReply, Status> {
        Err(unimplemented(HELLO_CLIENT_STREAM))
    }

    async fn hello_bi_streams(
        &self,
        _stream: BidiStream<HelloRequest, HelloReply>,
    ) -> Result<(), Status> {
        Err(unimplemented(HELLO_BI_STREAMS))
    }
}

fn greeting(name: &str) -> String {
    format!("Hello, {name}!")
}

fn check_name(name: &str) -> Result<(), Status> {
    if name.is_empty() {
        return Err(Status::invalid_argument("name is none"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Status::invalid_argument("name is long"));
    }
    Ok(())
}

/// The demo greeter.
#[derive(Debug, Clone)]
pub struct DefaultGreeter {
    stream_delay: Duration,
}

impl Default for DefaultGreeter {
    fn default() -> Self {
        Self {
            stream_delay: Duration::from_secs(1),
        }
    }
}

impl DefaultGreeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause after each `HelloServerStream` reply.
    pub fn with_stream_delay(mut self, delay: Duration) -> Self {
        self.stream_delay = delay;
        self
    }
}

impl Greeter for DefaultGreeter {
    async fn unary_hello(
        &self,
        ctx: ServerContext,
        request: HelloRequest,
    ) -> Result<HelloReply, Status> {
        info!(metadata = %ctx.metadata(), "unary hello");
        check_name(&request.name)?;

        ctx.set_header(Metadata::from_pairs([
            ("type", "unary"),
            ("from", "server"),
            ("in", "header"),
        ]))?;
        ctx.set_trailer(Metadata::from_pairs([
            ("type", "unary"),
            ("from", "server"),
            ("in", "trailer"),
        ]))?;
        Ok(HelloReply::new(greeting(&request.name)))
    }

    async fn hello_server_stream(
        &self,
        request: HelloRequest,
        replies: ResponseSink<HelloReply>,
    ) -> Result<(), Status> {
        for i in 0..SERVER_STREAM_REPLIES {
            let message = format!("[{i}] {}", greeting(&request.name));
            replies.send(HelloReply::new(message)).await?;
            if !self.stream_delay.is_zero() {
                tokio::time::sleep(self.stream_delay).await;
            }
        }
        Ok(())
    }

    async fn hello_client_stream(
        &self,
        requests: RequestStream<HelloRequest>,
    ) -> Result<HelloReply, Status> {
        let mut names = Vec::new();
        while let Some(request) = requests.recv().await? {
            debug!(name = %request.name, "client stream request");
            names.push(request.name);
        }
        Ok(HelloReply::new(format!("Hello, [{}]!", names.join(" "))))
    }

    async fn hello_bi_streams(
        &self,
        stream: BidiStream<HelloRequest, HelloReply>,
    ) -> Result<(), Status> {
        info!(metadata = %stream.context().metadata(), "bidi hello");
        stream
            .send_header(Metadata::from_pairs([
                ("type", "stream"),
                ("from", "server"),
                ("in", "header"),
            ]))
            .await?;
        stream.set_trailer(Metadata::from_pairs([
            ("type", "stream"),
            ("from", "server"),
            ("in", "trailer"),
        ]))?;

        while let Some(request) = stream.recv().await? {
            stream.send(HelloReply::new(greeting(&request.name))).await?;
        }
        Ok(())
    }
}

/// Serves a [`Greeter`] implementation.
#[derive(Debug)]
pub struct GreeterServer<G> {
    inner: Arc<G>,
}

impl<G> Clone for GreeterServer<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: Greeter> GreeterServer<G> {
    pub fn new(greeter: G) -> Self {
        Self::from_arc(Arc::new(greeter))
    }

    pub fn from_arc(inner: Arc<G>) -> Self {
        Self { inner }
    }

    /// Routes for all four methods, ready for `ServerBuilder::add_service`.
    pub fn into_service(self) -> ServiceDefinition {
        let unary = Arc::clone(&self.inner);
        let server_stream = Arc::clone(&self.inner);
        let client_stream = Arc::clone(&self.inner);
        let bidi = self.inner;

        ServiceDefinition::new(GREETER)
            .route(unary_route(UNARY_HELLO, move |ctx, request: HelloRequest| {
                let greeter = Arc::clone(&unary);
                async move { greeter.unary_hello(ctx, request).await }
            }))
            .route(server_streaming_route(
                HELLO_SERVER_STREAM,
                move |request: HelloRequest, replies: ResponseSink<HelloReply>| {
                    let greeter = Arc::clone(&server_stream);
                    async move { greeter.hello_server_stream(request, replies).await }
                },
            ))
            .route(client_streaming_route(
                HELLO_CLIENT_STREAM,
                move |requests: RequestStream<HelloRequest>| {
                    let greeter = Arc::clone(&client_stream);
                    async move { greeter.hello_client_stream(requests).await }
                },
            ))
            .route(bidi_route(
                HELLO_BI_STREAMS,
                move |stream: BidiStream<HelloRequest, HelloReply>| {
                    let greeter = Arc::clone(&bidi);
                    async move { greeter.hello_bi_streams(stream).await }
                },
            ))
    }
}
