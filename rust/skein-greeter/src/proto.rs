//! Messages and method table of the greeter service.

use facet::Facet;
use skein_types::{CallShape, MethodDescriptor, ServiceDescriptor};

pub const SERVICE_NAME: &str = "skein.greeter.Greeter";

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct HelloRequest {
    pub name: String,
}

impl HelloRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct HelloReply {
    pub message: String,
}

impl HelloReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub static METHODS: [MethodDescriptor; 4] = [
    MethodDescriptor::new("/skein.greeter.Greeter/UnaryHello", CallShape::Unary),
    MethodDescriptor::new(
        "/skein.greeter.Greeter/HelloServerStream",
        CallShape::ServerStreaming,
    ),
    MethodDescriptor::new(
        "/skein.greeter.Greeter/HelloClientStream",
        CallShape::ClientStreaming,
    ),
    MethodDescriptor::new("/skein.greeter.Greeter/HelloBiStreams", CallShape::Bidi),
];

pub static UNARY_HELLO: &MethodDescriptor = &METHODS[0];
pub static HELLO_SERVER_STREAM: &MethodDescriptor = &METHODS[1];
pub static HELLO_CLIENT_STREAM: &MethodDescriptor = &METHODS[2];
pub static HELLO_BI_STREAMS: &MethodDescriptor = &METHODS[3];

pub static GREETER: ServiceDescriptor = ServiceDescriptor {
    name: SERVICE_NAME,
    methods: &METHODS,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_method_belongs_to_the_service() {
        for method in GREETER.methods {
            assert_eq!(method.service_name(), SERVICE_NAME);
        }
        assert_eq!(UNARY_HELLO.method_name(), "UnaryHello");
        assert_eq!(HELLO_BI_STREAMS.shape, CallShape::Bidi);
        assert_eq!(
            GREETER.method("/skein.greeter.Greeter/HelloClientStream"),
            Some(HELLO_CLIENT_STREAM)
        );
    }
}
