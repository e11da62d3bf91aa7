#![deny(unsafe_code)]

//! Wire-level types shared by every skein crate.
//!
//! Nothing in here does I/O. The session crate builds calls, interceptors and
//! the connection driver on top of these types, and the stream crate moves
//! [`Frame`]s over byte streams.

mod error;
mod frame;
mod metadata;
mod shape;
mod status;
mod timeout;

pub use error::*;
pub use frame::*;
pub use metadata::*;
pub use shape::*;
pub use status::*;
pub use timeout::*;
