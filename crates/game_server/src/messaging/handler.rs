//! Message handler abstractions.
//!
//! Handlers receive the sending session and the frame payload. Most code
//! registers closures through [`DispatchRegistry::register_typed`] or
//! [`DispatchRegistry::register_raw`], which wrap them in the adapters
//! below; implementing [`MessageHandler`] directly is only needed for
//! handlers that carry their own state.
//!
//! [`DispatchRegistry::register_typed`]: super::DispatchRegistry::register_typed
//! [`DispatchRegistry::register_raw`]: super::DispatchRegistry::register_raw

use crate::error::HandlerError;
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Object-safe handler for one message id.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static + Debug {
    /// Handles one frame payload sent by `session`.
    ///
    /// # Returns
    ///
    /// `Ok(())` on success. Any error is turned into an error response for
    /// the client by the dispatch registry; the connection stays open.
    async fn handle(&self, session: Arc<Session>, payload: Bytes) -> Result<(), HandlerError>;

    /// Human-readable name for logs.
    fn handler_name(&self) -> &str;
}

/// Handler that decodes the payload into a protobuf message first.
///
/// # Type Parameters
///
/// * `M` - The protobuf message type expected in the payload
/// * `F` - The async function handling the decoded message
pub struct TypedMessageHandler<M, F> {
    handler: F,
    name: String,
    _message: PhantomData<fn() -> M>,
}

impl<M, F> TypedMessageHandler<M, F> {
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            handler,
            name: name.into(),
            _message: PhantomData,
        }
    }
}

impl<M, F> Debug for TypedMessageHandler<M, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedMessageHandler")
            .field("name", &self.name)
            .field("message", &std::any::type_name::<M>())
            .finish()
    }
}

#[async_trait]
impl<M, F, Fut> MessageHandler for TypedMessageHandler<M, F>
where
    M: prost::Message + Default + 'static,
    F: Fn(Arc<Session>, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, session: Arc<Session>, payload: Bytes) -> Result<(), HandlerError> {
        let message = M::decode(payload)?;
        (self.handler)(session, message).await
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// Handler that receives the payload bytes untouched.
pub struct RawMessageHandler<F> {
    handler: F,
    name: String,
}

impl<F> RawMessageHandler<F> {
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            handler,
            name: name.into(),
        }
    }
}

impl<F> Debug for RawMessageHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMessageHandler")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for RawMessageHandler<F>
where
    F: Fn(Arc<Session>, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, session: Arc<Session>, payload: Bytes) -> Result<(), HandlerError> {
        (self.handler)(session, payload).await
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}
