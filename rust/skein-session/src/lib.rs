#![deny(unsafe_code)]

//! Calls, interceptor chains and stream wrappers on top of a multiplexed
//! frame connection.
//!
//! A connection is set up with [`establish`], which returns a
//! [`ConnectionHandle`] and a [`Driver`] that must be spawned. Calls are made
//! through a [`Client`] and served by a [`Server`]; both carry interceptor
//! chains that are fixed when they are built.

mod call;
mod client;
mod client_call;
mod codec;
mod context;
mod driver;
mod interceptor;
pub mod runtime;
mod server;
mod server_call;
mod stream;
mod transport;
mod wrapper;

pub use call::CallPhase;
pub use client::*;
pub use client_call::ClientCall;
pub use codec::*;
pub use context::*;
pub use driver::{
    CallAcceptor, ConnectionHandle, Driver, FrameSink, FrameSource, FrameTransport,
    IncomingCall, Role, SessionConfig, StreamIdAllocator, establish,
};
pub use interceptor::*;
pub use server::*;
pub use server_call::ServerCall;
pub use stream::*;
pub use transport::*;
pub use wrapper::*;
