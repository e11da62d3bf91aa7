//! Stream wrappers: decorators that observe every stream operation.
//!
//! A wrapper owns the stream it wraps and forwards every operation to it,
//! calling a hook before and after. Hooks only get shared references, so
//! they cannot change messages, errors or end-of-stream. Wrapping a wrapped
//! stream nests: the outer wrapper's `before_*` hook runs first and its
//! `after_*` hook runs last.

use futures_util::future::BoxFuture;
use skein_types::{CallError, Metadata};

use crate::{AnyMessage, CallContext, ClientStream, ServerContext, ServerStream};

/// Observation points around stream operations. Every hook defaults to a
/// no-op.
#[allow(unused_variables)]
pub trait StreamHooks: Send + Sync + 'static {
    fn before_send(&self, message: &AnyMessage) {}

    fn after_send(&self, result: &Result<(), CallError>) {}

    fn before_recv(&self) {}

    fn after_recv(&self, result: &Result<Option<AnyMessage>, CallError>) {}

    fn before_close_send(&self) {}

    fn after_close_send(&self, result: &Result<(), CallError>) {}

    fn before_header(&self) {}

    fn after_header(&self, result: &Result<Metadata, CallError>) {}

    /// Server side only: header sent explicitly by the handler.
    fn before_send_header(&self, metadata: &Metadata) {}

    fn after_send_header(&self, result: &Result<(), CallError>) {}
}

/// A [`ClientStream`] decorated with `H`.
pub struct WrappedClientStream<H> {
    inner: Box<dyn ClientStream>,
    hooks: H,
}

impl<H: StreamHooks> WrappedClientStream<H> {
    pub fn new(inner: Box<dyn ClientStream>, hooks: H) -> Self {
        Self { inner, hooks }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn into_inner(self) -> Box<dyn ClientStream> {
        self.inner
    }
}

impl<H: StreamHooks> ClientStream for WrappedClientStream<H> {
    fn context(&self) -> &CallContext {
        self.inner.context()
    }

    fn send(&self, message: AnyMessage) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(async move {
            self.hooks.before_send(&message);
            let result = self.inner.send(message).await;
            self.hooks.after_send(&result);
            result
        })
    }

    fn recv(&self) -> BoxFuture<'_, Result<Option<AnyMessage>, CallError>> {
        Box::pin(async move {
            self.hooks.before_recv();
            let result = self.inner.recv().await;
            self.hooks.after_recv(&result);
            result
        })
    }

    fn close_send(&self) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(async move {
            self.hooks.before_close_send();
            let result = self.inner.close_send().await;
            self.hooks.after_close_send(&result);
            result
        })
    }

    fn header(&self) -> BoxFuture<'_, Result<Metadata, CallError>> {
        Box::pin(async move {
            self.hooks.before_header();
            let result = self.inner.header().await;
            self.hooks.after_header(&result);
            result
        })
    }

    fn trailer(&self) -> Option<Metadata> {
        self.inner.trailer()
    }
}

/// A [`ServerStream`] decorated with `H`.
pub struct WrappedServerStream<H> {
    inner: Box<dyn ServerStream>,
    hooks: H,
}

impl<H: StreamHooks> WrappedServerStream<H> {
    pub fn new(inner: Box<dyn ServerStream>, hooks: H) -> Self {
        Self { inner, hooks }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn into_inner(self) -> Box<dyn ServerStream> {
        self.inner
    }
}

impl<H: StreamHooks> ServerStream for WrappedServerStream<H> {
    fn context(&self) -> &ServerContext {
        self.inner.context()
    }

    fn recv(&self) -> BoxFuture<'_, Result<Option<AnyMessage>, CallError>> {
        Box::pin(async move {
            self.hooks.before_recv();
            let result = self.inner.recv().await;
            self.hooks.after_recv(&result);
            result
        })
    }

    fn send(&self, message: AnyMessage) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(async move {
            self.hooks.before_send(&message);
            let result = self.inner.send(message).await;
            self.hooks.after_send(&result);
            result
        })
    }

    fn send_header(&self, metadata: Metadata) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(async move {
            self.hooks.before_send_header(&metadata);
            let result = self.inner.send_header(metadata).await;
            self.hooks.after_send_header(&result);
            result
        })
    }

    fn set_header(&self, metadata: Metadata) -> Result<(), CallError> {
        self.inner.set_header(metadata)
    }

    fn set_trailer(&self, metadata: Metadata) -> Result<(), CallError> {
        self.inner.set_trailer(metadata)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use skein_types::{CallShape, MethodDescriptor};

    use super::*;

    static METHOD: MethodDescriptor = MethodDescriptor::new("/test.Svc/Chat", CallShape::Bidi);

    /// In-memory stream that replays queued responses.
    struct Scripted {
        ctx: CallContext,
        responses: Mutex<VecDeque<u32>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ClientStream for Scripted {
        fn context(&self) -> &CallContext {
            &self.ctx
        }

        fn send(&self, message: AnyMessage) -> BoxFuture<'_, Result<(), CallError>> {
            self.sent.lock().push(format!("{message:?}"));
            Box::pin(async { Ok(()) })
        }

        fn recv(&self) -> BoxFuture<'_, Result<Option<AnyMessage>, CallError>> {
            let next = self.responses.lock().pop_front().map(AnyMessage::new);
            Box::pin(async move { Ok(next) })
        }

        fn close_send(&self) -> BoxFuture<'_, Result<(), CallError>> {
            Box::pin(async { Err(CallError::Cancelled) })
        }

        fn header(&self) -> BoxFuture<'_, Result<Metadata, CallError>> {
            Box::pin(async { Ok(Metadata::from_pairs([("in", "header")])) })
        }

        fn trailer(&self) -> Option<Metadata> {
            None
        }
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl StreamHooks for Recorder {
        fn before_send(&self, message: &AnyMessage) {
            self.log.lock().push(format!("{} pre send {message:?}", self.name));
        }

        fn after_send(&self, _result: &Result<(), CallError>) {
            self.log.lock().push(format!("{} post send", self.name));
        }

        fn after_recv(&self, result: &Result<Option<AnyMessage>, CallError>) {
            let seen = match result {
                Ok(Some(m)) => format!("{m:?}"),
                Ok(None) => "eof".to_string(),
                Err(e) => e.to_string(),
            };
            self.log.lock().push(format!("{} post recv {seen}", self.name));
        }
    }

    fn scripted(sent: Arc<Mutex<Vec<String>>>) -> Box<dyn ClientStream> {
        Box::new(Scripted {
            ctx: CallContext::new(&METHOD),
            responses: Mutex::new(VecDeque::from([7])),
            sent,
        })
    }

    #[tokio::test]
    async fn nested_wrappers_run_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let inner = WrappedClientStream::new(
            scripted(sent.clone()),
            Recorder {
                name: "inner",
                log: log.clone(),
            },
        );
        let outer = WrappedClientStream::new(
            Box::new(inner),
            Recorder {
                name: "outer",
                log: log.clone(),
            },
        );

        outer.send(AnyMessage::new("bob")).await.unwrap();
        assert_eq!(
            *log.lock(),
            [
                "outer pre send \"bob\"",
                "inner pre send \"bob\"",
                "inner post send",
                "outer post send",
            ]
        );
        assert_eq!(*sent.lock(), ["\"bob\""]);
    }

    #[tokio::test]
    async fn hooks_do_not_alter_results() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let wrapped = WrappedClientStream::new(
            scripted(Arc::new(Mutex::new(Vec::new()))),
            Recorder {
                name: "w",
                log: log.clone(),
            },
        );

        let first = wrapped.recv().await.unwrap().unwrap();
        assert_eq!(first.downcast::<u32>().unwrap(), 7);
        assert!(wrapped.recv().await.unwrap().is_none());
        assert_eq!(wrapped.close_send().await, Err(CallError::Cancelled));
        assert_eq!(wrapped.header().await.unwrap().get("in"), Some("header"));
        assert_eq!(*log.lock(), ["w post recv 7", "w post recv eof"]);
    }
}
