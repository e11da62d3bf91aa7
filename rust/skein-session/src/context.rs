//! Per-call context on both sides of a call.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use skein_types::{CallError, Metadata, MethodDescriptor, ProtocolViolation};
use tokio_util::sync::CancellationToken;

use crate::runtime::Instant;

/// Caller-side context of one call.
///
/// The context is passed by value down the client interceptor chain, so an
/// interceptor may still add outgoing metadata. Once the call is opened the
/// stream owns it and only hands out shared references.
#[derive(Debug, Clone)]
pub struct CallContext {
    method: &'static MethodDescriptor,
    deadline: Option<Instant>,
    metadata: Metadata,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(method: &'static MethodDescriptor) -> Self {
        Self {
            method,
            deadline: None,
            metadata: Metadata::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the deadline to `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Tie the call to an external cancellation token.
    ///
    /// Cancelling `token` cancels the call. Completing the call does not
    /// cancel `token`.
    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancel = token.child_token();
        self
    }

    pub fn method(&self) -> &'static MethodDescriptor {
        self.method
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Outgoing metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the call. Every pending operation on it fails with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Default)]
struct ResponseMetadata {
    header: Metadata,
    header_sent: bool,
    trailer: Metadata,
    finished: bool,
}

#[derive(Debug)]
struct ServerContextInner {
    method: &'static MethodDescriptor,
    deadline: Option<Instant>,
    metadata: Metadata,
    cancel: CancellationToken,
    response: Mutex<ResponseMetadata>,
}

/// Handler-side context of one call.
///
/// Carries the caller's metadata and deadline, and collects the header and
/// trailer metadata the handler wants to send back. Clones share state.
#[derive(Debug, Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

impl ServerContext {
    pub(crate) fn new(
        method: &'static MethodDescriptor,
        metadata: Metadata,
        deadline: Option<Instant>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ServerContextInner {
                method,
                deadline,
                metadata,
                cancel,
                response: Mutex::new(ResponseMetadata::default()),
            }),
        }
    }

    pub fn method(&self) -> &'static MethodDescriptor {
        self.inner.method
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Metadata sent by the caller.
    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    /// Fires when the call ends, is cancelled by the caller, or times out.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Merge `metadata` into the header. Fails once the header went out.
    pub fn set_header(&self, metadata: Metadata) -> Result<(), CallError> {
        let mut response = self.inner.response.lock();
        if response.header_sent {
            return Err(ProtocolViolation::HeaderAlreadySent.into());
        }
        response.header.merge(metadata);
        Ok(())
    }

    /// Merge `metadata` into the trailer. Fails once the call finished.
    pub fn set_trailer(&self, metadata: Metadata) -> Result<(), CallError> {
        let mut response = self.inner.response.lock();
        if response.finished {
            return Err(ProtocolViolation::StreamClosed.into());
        }
        response.trailer.merge(metadata);
        Ok(())
    }

    /// The pending header, exactly once.
    pub(crate) fn take_header(&self) -> Option<Metadata> {
        let mut response = self.inner.response.lock();
        if response.header_sent {
            return None;
        }
        response.header_sent = true;
        Some(std::mem::take(&mut response.header))
    }

    pub(crate) fn take_trailer(&self) -> Metadata {
        let mut response = self.inner.response.lock();
        response.finished = true;
        std::mem::take(&mut response.trailer)
    }
}
