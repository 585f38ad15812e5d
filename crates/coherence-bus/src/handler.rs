//! # Subscriber Handlers
//!
//! Callbacks invoked by a channel's consumer loop, once per delivered entry.
//! A handler's error or panic is contained to that handler: siblings still
//! run and the entry is still acknowledged.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::envelope::MessageEnvelope;
use crate::error::{HandlerError, HandlerResult};
use crate::payload::{MessageType, Payload};

/// A subscriber callback.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: MessageEnvelope) -> HandlerResult;
}

/// Handler receiving the whole envelope, built from a closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure taking the envelope.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope) -> HandlerResult {
        (self.f)(envelope).await
    }
}

/// Handler receiving one decoded payload kind.
///
/// Envelopes carrying a different kind are answered with
/// [`HandlerError::UnexpectedPayload`].
pub struct TypedHandler<T, F> {
    expected: MessageType,
    extract: fn(Payload) -> Option<T>,
    f: F,
    _payload: PhantomData<fn(T)>,
}

impl<T, F, Fut> TypedHandler<T, F>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(expected: MessageType, extract: fn(Payload) -> Option<T>, f: F) -> Self {
        Self {
            expected,
            extract,
            f,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> MessageHandler for TypedHandler<T, F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope) -> HandlerResult {
        let actual = envelope.message_type();
        match (self.extract)(envelope.into_payload()) {
            Some(payload) => (self.f)(payload).await,
            None => Err(HandlerError::UnexpectedPayload {
                expected: self.expected.as_str(),
                actual: actual.as_str(),
            }),
        }
    }
}

/// Handlers registered on one channel, shared with its consumer loop.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Handlers at this instant, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers.read().clone()
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet").field("len", &self.len()).finish()
    }
}

/// Run one handler, turning a panic into [`HandlerError::Panicked`].
pub async fn invoke_isolated(handler: &dyn MessageHandler, envelope: MessageEnvelope) -> HandlerResult {
    match AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
