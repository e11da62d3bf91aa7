use std::fmt;

use crate::{CallShape, Code, Status};

/// Broad classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The connection carrying the call is gone.
    Transport,
    /// The call deadline passed.
    DeadlineExceeded,
    /// The call was cancelled by the caller or the peer.
    Cancelled,
    /// The handler returned an error status.
    Application,
    /// The API was misused, or the peer broke the framing rules.
    Protocol,
}

/// Misuse of a call, detected locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The call already reached its terminal status.
    StreamClosed,
    /// `send` after `close_send`.
    SendAfterHalfClose,
    /// Header metadata changed after it was already sent.
    HeaderAlreadySent,
    /// A unary or client-streaming call ended without a response.
    MissingResponse,
    /// A single-response call received a second response.
    UnexpectedResponse,
    /// A message of the wrong type was handed to a typed stream.
    UnexpectedMessageType {
        expected: &'static str,
        got: &'static str,
    },
    /// A typed entry point was used with a method of another shape.
    WrongShape {
        method: &'static str,
        shape: CallShape,
    },
    /// A payload could not be encoded or decoded.
    Codec(String),
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamClosed => write!(f, "stream closed"),
            Self::SendAfterHalfClose => write!(f, "send after close_send"),
            Self::HeaderAlreadySent => write!(f, "header already sent"),
            Self::MissingResponse => write!(f, "stream ended without a response"),
            Self::UnexpectedResponse => write!(f, "more than one response on a single-response call"),
            Self::UnexpectedMessageType { expected, got } => {
                write!(f, "unexpected message type: expected {expected}, got {got}")
            }
            Self::WrongShape { method, shape } => write!(f, "{method} is a {shape} method"),
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
        }
    }
}

/// Error from any operation on a call.
///
/// End-of-stream is not an error: `recv` reports it as `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The underlying connection failed.
    Transport(String),
    /// The deadline fired before the call finished.
    DeadlineExceeded,
    /// The call was cancelled.
    Cancelled,
    /// The peer's handler finished with a non-OK status.
    Application(Status),
    /// Local misuse or a malformed exchange.
    Protocol(ProtocolViolation),
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Application(_) => ErrorKind::Application,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Status equivalent of this error, as reported to the peer.
    pub fn status(&self) -> Status {
        match self {
            Self::Transport(msg) => Status::unavailable(msg.clone()),
            Self::DeadlineExceeded => Status::deadline_exceeded("deadline exceeded"),
            Self::Cancelled => Status::cancelled("call cancelled"),
            Self::Application(status) => status.clone(),
            Self::Protocol(v) => Status::internal(v.to_string()),
        }
    }

    /// Map a terminal status received from the peer.
    ///
    /// `Cancelled` and `DeadlineExceeded` keep their dedicated variants so a
    /// caller can tell them apart from handler failures.
    pub fn from_status(status: Status) -> Self {
        match status.code {
            Code::Cancelled => Self::Cancelled,
            Code::DeadlineExceeded => Self::DeadlineExceeded,
            _ => Self::Application(status),
        }
    }

    pub fn code(&self) -> Code {
        self.status().code
    }

    /// Application status if the handler failed, `None` otherwise.
    pub fn as_status(&self) -> Option<&Status> {
        match self {
            Self::Application(status) => Some(status),
            _ => None,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Cancelled => write!(f, "call cancelled"),
            Self::Application(status) => write!(f, "{status}"),
            Self::Protocol(v) => write!(f, "protocol violation: {v}"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<Status> for CallError {
    fn from(status: Status) -> Self {
        Self::from_status(status)
    }
}

impl From<ProtocolViolation> for CallError {
    fn from(v: ProtocolViolation) -> Self {
        Self::Protocol(v)
    }
}

impl From<CallError> for Status {
    fn from(err: CallError) -> Self {
        err.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let errors = [
            CallError::Transport("reset by peer".into()),
            CallError::DeadlineExceeded,
            CallError::Cancelled,
            CallError::Application(Status::invalid_argument("name is none")),
            CallError::Protocol(ProtocolViolation::StreamClosed),
        ];
        let mut kinds: Vec<_> = errors.iter().map(CallError::kind).collect();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            CallError::from_status(Status::deadline_exceeded("late")),
            CallError::DeadlineExceeded
        );
        let app = CallError::from_status(Status::invalid_argument("name is long"));
        assert_eq!(app.kind(), ErrorKind::Application);
        assert_eq!(app.as_status().map(|s| s.message.as_str()), Some("name is long"));
        assert_eq!(
            CallError::Protocol(ProtocolViolation::StreamClosed).code(),
            Code::Internal
        );
    }
}
