#![deny(unsafe_code)]

//! Greeter demo for skein.
//!
//! One service with a method of each call shape, the logging interceptors
//! used by the `greeter-server` and `greeter-client` binaries, and a typed
//! client.
//!
//! ```ignore
//! use skein_greeter::{DefaultGreeter, GreeterServer};
//!
//! let server = skein_session::ServerBuilder::new()
//!     .add_service(GreeterServer::new(DefaultGreeter::new()).into_service())?
//!     .build();
//! ```

mod client;
pub mod interceptors;
pub mod proto;
mod service;

pub use client::GreeterClient;
pub use proto::{HelloReply, HelloRequest};
pub use service::*;

/// Install a `tracing` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
