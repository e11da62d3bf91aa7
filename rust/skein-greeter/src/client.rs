//! Typed client for the greeter service.

use skein_session::{
    BidiStreaming, CallOptions, Client, ClientStreaming, ConnectionHandle, Response,
    ServerStreaming,
};
use skein_types::CallError;

use crate::proto::{
    HELLO_BI_STREAMS, HELLO_CLIENT_STREAM, HELLO_SERVER_STREAM, HelloReply, HelloRequest,
    UNARY_HELLO,
};

#[derive(Debug, Clone)]
pub struct GreeterClient {
    inner: Client,
}

impl GreeterClient {
    /// Wrap a client that may carry interceptors.
    pub fn new(inner: Client) -> Self {
        Self { inner }
    }

    /// Client without interceptors over `conn`.
    pub fn from_connection(conn: ConnectionHandle) -> Self {
        Self::new(Client::new(conn))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub async fn unary_hello(
        &self,
        request: HelloRequest,
        options: CallOptions,
    ) -> Result<Response<HelloReply>, CallError> {
        self.inner.unary(UNARY_HELLO, request, options).await
    }

    pub async fn hello_server_stream(
        &self,
        request: HelloRequest,
        options: CallOptions,
    ) -> Result<ServerStreaming<HelloReply>, CallError> {
        self.inner
            .server_streaming(HELLO_SERVER_STREAM, request, options)
            .await
    }

    pub async fn hello_client_stream(
        &self,
        options: CallOptions,
    ) -> Result<ClientStreaming<HelloRequest, HelloReply>, CallError> {
        self.inner
            .client_streaming(HELLO_CLIENT_STREAM, options)
            .await
    }

    pub async fn hello_bi_streams(
        &self,
        options: CallOptions,
    ) -> Result<BidiStreaming<HelloRequest, HelloReply>, CallError> {
        self.inner.bidi_streaming(HELLO_BI_STREAMS, options).await
    }
}
