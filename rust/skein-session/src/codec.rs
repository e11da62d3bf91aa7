//! Type-erased messages and the payload codec.
//!
//! Interceptors and stream wrappers work on [`AnyMessage`] so they can sit in
//! front of any method. Typed client and handler APIs downcast at the edges.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use facet::Facet;
use skein_types::{CallError, ProtocolViolation};

/// Bound satisfied by every request and response type.
pub trait RpcMessage: Facet<'static> + fmt::Debug + Send + Sync + 'static {}

impl<T> RpcMessage for T where T: Facet<'static> + fmt::Debug + Send + Sync + 'static {}

trait Erased: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
    fn type_name(&self) -> &'static str;
}

struct Holder<T>(T);

impl<T: fmt::Debug> fmt::Debug for Holder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl<T> Erased for Holder<T>
where
    T: fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        &self.0
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        Box::new(self.0)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A message of any type.
///
/// `Debug` prints the wrapped value, which is what logging interceptors show.
pub struct AnyMessage(Box<dyn Erased>);

impl AnyMessage {
    pub fn new<T>(value: T) -> Self
    where
        T: fmt::Debug + Send + Sync + 'static,
    {
        Self(Box::new(Holder(value)))
    }

    /// Name of the wrapped type.
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.0.as_any().is::<T>()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// Take the wrapped value out as `T`.
    pub fn downcast<T: 'static>(self) -> Result<T, CallError> {
        let got = self.type_name();
        self.0.into_any().downcast::<T>().map(|b| *b).map_err(|_| {
            CallError::Protocol(ProtocolViolation::UnexpectedMessageType {
                expected: std::any::type_name::<T>(),
                got,
            })
        })
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// Payload encoding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecError(pub String);

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for CallError {
    fn from(err: CodecError) -> Self {
        CallError::Protocol(ProtocolViolation::Codec(err.0))
    }
}

/// Turns messages of one method into bytes and back.
pub trait MessageCodec: Send + Sync + 'static {
    /// Encode a request or a response.
    fn encode(&self, message: &AnyMessage) -> Result<Vec<u8>, CodecError>;

    fn decode_request(&self, payload: &[u8]) -> Result<AnyMessage, CodecError>;

    fn decode_response(&self, payload: &[u8]) -> Result<AnyMessage, CodecError>;
}

/// postcard codec for a method with request `Req` and response `Resp`.
pub struct PostcardCodec<Req, Resp> {
    _types: PhantomData<fn() -> (Req, Resp)>,
}

impl<Req, Resp> PostcardCodec<Req, Resp> {
    pub fn new() -> Self {
        Self {
            _types: PhantomData,
        }
    }
}

impl<Req, Resp> Default for PostcardCodec<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_typed<T: RpcMessage>(value: &T) -> Result<Vec<u8>, CodecError> {
    facet_postcard::to_vec(value).map_err(|e| CodecError(format!("encode: {e}")))
}

fn decode_typed<T: RpcMessage>(payload: &[u8]) -> Result<AnyMessage, CodecError> {
    let value: T =
        facet_postcard::from_slice(payload).map_err(|e| CodecError(format!("decode: {e}")))?;
    Ok(AnyMessage::new(value))
}

impl<Req: RpcMessage, Resp: RpcMessage> MessageCodec for PostcardCodec<Req, Resp> {
    fn encode(&self, message: &AnyMessage) -> Result<Vec<u8>, CodecError> {
        if let Some(req) = message.downcast_ref::<Req>() {
            encode_typed(req)
        } else if let Some(resp) = message.downcast_ref::<Resp>() {
            encode_typed(resp)
        } else {
            Err(CodecError(format!(
                "cannot encode {}: expected {} or {}",
                message.type_name(),
                std::any::type_name::<Req>(),
                std::any::type_name::<Resp>()
            )))
        }
    }

    fn decode_request(&self, payload: &[u8]) -> Result<AnyMessage, CodecError> {
        decode_typed::<Req>(payload)
    }

    fn decode_response(&self, payload: &[u8]) -> Result<AnyMessage, CodecError> {
        decode_typed::<Resp>(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Facet)]
    struct Ping {
        n: u32,
    }

    #[derive(Debug, PartialEq, Facet)]
    struct Pong {
        text: String,
    }

    #[test]
    fn downcast_checks_type() {
        let msg = AnyMessage::new(Ping { n: 3 });
        assert!(msg.is::<Ping>());
        assert_eq!(format!("{msg:?}"), "Ping { n: 3 }");
        let err = msg.downcast::<Pong>().unwrap_err();
        assert!(err.to_string().contains("unexpected message type"));
    }

    #[test]
    fn codec_handles_both_directions() {
        let codec = PostcardCodec::<Ping, Pong>::new();
        let bytes = codec.encode(&AnyMessage::new(Pong { text: "hi".into() })).unwrap();
        let back = codec.decode_response(&bytes).unwrap();
        assert_eq!(back.downcast::<Pong>().unwrap(), Pong { text: "hi".into() });

        let bytes = codec.encode(&AnyMessage::new(Ping { n: 7 })).unwrap();
        let back = codec.decode_request(&bytes).unwrap();
        assert_eq!(back.downcast_ref::<Ping>(), Some(&Ping { n: 7 }));

        assert!(codec.encode(&AnyMessage::new(42u8)).is_err());
    }
}
