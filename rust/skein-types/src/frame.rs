//! Frames exchanged between two connected peers.
//!
//! Every frame names the stream it belongs to. A stream starts with `Open`,
//! the callee answers with `Header`, `Data` frames flow in both directions,
//! the caller ends its direction with `HalfClose`, and the callee ends the
//! stream with `Trailer`. Either side may abort with `Reset`.

use facet::Facet;

use crate::{Metadata, Status};

/// Identifies one call on a connection.
pub type StreamId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Open {
    pub stream_id: StreamId,
    /// Full method path, e.g. `/skein.greeter.Greeter/UnaryHello`.
    pub method: String,
    /// Outgoing metadata of the caller.
    pub metadata: Metadata,
    /// Remaining time budget, encoded with [`crate::format_timeout`].
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Header {
    pub stream_id: StreamId,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Data {
    pub stream_id: StreamId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct HalfClose {
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Trailer {
    pub stream_id: StreamId,
    pub status: Status,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Reset {
    pub stream_id: StreamId,
    pub status: Status,
}

#[repr(u8)]
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub enum Frame {
    Open(Open) = 0,
    Header(Header) = 1,
    Data(Data) = 2,
    HalfClose(HalfClose) = 3,
    Trailer(Trailer) = 4,
    Reset(Reset) = 5,
}

impl Frame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Open(f) => f.stream_id,
            Frame::Header(f) => f.stream_id,
            Frame::Data(f) => f.stream_id,
            Frame::HalfClose(f) => f.stream_id,
            Frame::Trailer(f) => f.stream_id,
            Frame::Reset(f) => f.stream_id,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Open(_) => "open",
            Frame::Header(_) => "header",
            Frame::Data(_) => "data",
            Frame::HalfClose(_) => "half-close",
            Frame::Trailer(_) => "trailer",
            Frame::Reset(_) => "reset",
        }
    }
}
