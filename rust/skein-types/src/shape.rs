use std::fmt;

use facet::Facet;

/// The four call shapes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
pub enum CallShape {
    /// One request, one response.
    Unary = 0,
    /// One request, many responses.
    ServerStreaming = 1,
    /// Many requests, one response.
    ClientStreaming = 2,
    /// Independent request and response sequences.
    Bidi = 3,
}

impl CallShape {
    pub fn is_client_streaming(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::Bidi)
    }

    pub fn is_server_streaming(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::Bidi)
    }

    pub fn is_unary(self) -> bool {
        self == Self::Unary
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server-streaming",
            Self::ClientStreaming => "client-streaming",
            Self::Bidi => "bidi",
        })
    }
}

/// Static description of one method: its full path and its shape.
///
/// Paths look like `/package.Service/Method`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub path: &'static str,
    pub shape: CallShape,
}

impl MethodDescriptor {
    pub const fn new(path: &'static str, shape: CallShape) -> Self {
        Self { path, shape }
    }

    /// `package.Service` part of the path.
    pub fn service_name(&self) -> &'static str {
        let trimmed = self.path.strip_prefix('/').unwrap_or(self.path);
        trimmed.split('/').next().unwrap_or("")
    }

    /// `Method` part of the path.
    pub fn method_name(&self) -> &'static str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path)
    }
}

/// A named group of methods.
#[derive(Debug, Clone, Copy)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub methods: &'static [MethodDescriptor],
}

impl ServiceDescriptor {
    pub fn method(&self, path: &str) -> Option<&'static MethodDescriptor> {
        self.methods.iter().find(|m| m.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: MethodDescriptor =
        MethodDescriptor::new("/demo.Greeter/HelloBiStreams", CallShape::Bidi);

    #[test]
    fn path_parts() {
        assert_eq!(HELLO.service_name(), "demo.Greeter");
        assert_eq!(HELLO.method_name(), "HelloBiStreams");
    }

    #[test]
    fn streaming_flags() {
        assert!(CallShape::Bidi.is_client_streaming());
        assert!(CallShape::Bidi.is_server_streaming());
        assert!(!CallShape::ServerStreaming.is_client_streaming());
        assert!(!CallShape::ClientStreaming.is_server_streaming());
        assert!(CallShape::Unary.is_unary());
    }
}
