//! The message channel contract seen by interceptors and wrappers.
//!
//! All methods take `&self` so one stream can be shared between a send task
//! and a receive task. `recv` reports end-of-stream as `Ok(None)`, which is
//! never an error and keeps being returned on repeated calls.

use futures_util::future::BoxFuture;
use skein_types::{CallError, Metadata};

use crate::{AnyMessage, CallContext, ServerContext};

/// Caller side of a streaming call.
pub trait ClientStream: Send + Sync {
    fn context(&self) -> &CallContext;

    fn send(&self, message: AnyMessage) -> BoxFuture<'_, Result<(), CallError>>;

    fn recv(&self) -> BoxFuture<'_, Result<Option<AnyMessage>, CallError>>;

    /// Signal that no more requests follow.
    fn close_send(&self) -> BoxFuture<'_, Result<(), CallError>>;

    /// Header metadata from the peer. Waits until it arrives or the call
    /// fails, then keeps returning the same value.
    fn header(&self) -> BoxFuture<'_, Result<Metadata, CallError>>;

    /// Trailer metadata, `None` until the call is closed.
    fn trailer(&self) -> Option<Metadata>;
}

/// Handler side of a streaming call.
pub trait ServerStream: Send + Sync {
    fn context(&self) -> &ServerContext;

    fn recv(&self) -> BoxFuture<'_, Result<Option<AnyMessage>, CallError>>;

    /// Send a response. Flushes the header first if it has not gone out yet.
    fn send(&self, message: AnyMessage) -> BoxFuture<'_, Result<(), CallError>>;

    /// Merge `metadata` into the header and send it now.
    fn send_header(&self, metadata: Metadata) -> BoxFuture<'_, Result<(), CallError>>;

    /// Merge `metadata` into the header sent with the first response.
    fn set_header(&self, metadata: Metadata) -> Result<(), CallError>;

    /// Merge `metadata` into the trailer sent when the handler returns.
    fn set_trailer(&self, metadata: Metadata) -> Result<(), CallError>;
}
