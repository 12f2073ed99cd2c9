//! Routing table from message id to handler.
//!
//! Nothing a handler does can close the connection it was called for:
//! errors and panics are caught here, logged with the message id and
//! session id, and answered with an [`ErrorResponse`].

use super::handler::{MessageHandler, RawMessageHandler, TypedMessageHandler};
use crate::error::HandlerError;
use crate::health::ServerStats;
use crate::protocol::{error_codes, ids, ErrorResponse, Frame, MessageId};
use crate::session::Session;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
struct Registration {
    handler: Arc<dyn MessageHandler>,
    requires_auth: bool,
}

/// What happened to a dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran and returned `Ok`
    Handled,
    /// No handler is registered for the id; the frame was dropped
    Unhandled,
    /// The handler requires an authenticated session
    Unauthorized,
    /// The handler failed or panicked
    Failed,
    /// The registry is shutting down
    Rejected,
}

/// Maps message ids to handlers and their authentication requirement.
pub struct DispatchRegistry {
    handlers: DashMap<MessageId, Registration>,
    closed: AtomicBool,
    stats: Arc<ServerStats>,
}

impl std::fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("handlers", &self.handlers.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl DispatchRegistry {
    pub fn new(stats: Arc<ServerStats>) -> Self {
        Self {
            handlers: DashMap::new(),
            closed: AtomicBool::new(false),
            stats,
        }
    }

    /// Registers `handler` for `message_id`, replacing any previous one.
    pub fn register(
        &self,
        message_id: MessageId,
        handler: Arc<dyn MessageHandler>,
        requires_auth: bool,
    ) {
        let name = handler.handler_name().to_string();
        let previous = self.handlers.insert(
            message_id,
            Registration {
                handler,
                requires_auth,
            },
        );
        match previous {
            Some(old) => warn!(
                "🔁 Handler for message {} replaced: '{}' -> '{}'",
                message_id,
                old.handler.handler_name(),
                name
            ),
            None => debug!(
                "📝 Registered handler '{}' for message {} (auth: {})",
                name, message_id, requires_auth
            ),
        }
    }

    /// Registers an async closure receiving the decoded protobuf message.
    /// A payload that does not decode is answered with a 400 error response.
    pub fn register_typed<M, F, Fut>(&self, message_id: MessageId, requires_auth: bool, handler: F)
    where
        M: prost::Message + Default + 'static,
        F: Fn(Arc<Session>, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let name = format!("{}#{}", std::any::type_name::<M>(), message_id);
        self.register(
            message_id,
            Arc::new(TypedMessageHandler::new(name, handler)),
            requires_auth,
        );
    }

    /// Registers an async closure receiving the raw payload.
    pub fn register_raw<F, Fut>(&self, message_id: MessageId, requires_auth: bool, handler: F)
    where
        F: Fn(Arc<Session>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(
            message_id,
            Arc::new(RawMessageHandler::new(format!("raw#{message_id}"), handler)),
            requires_auth,
        );
    }

    pub fn unregister(&self, message_id: MessageId) -> bool {
        self.handlers.remove(&message_id).is_some()
    }

    pub fn is_registered(&self, message_id: MessageId) -> bool {
        self.handlers.contains_key(&message_id)
    }

    /// Whether the handler for `message_id` requires authentication.
    pub fn requires_auth(&self, message_id: MessageId) -> Option<bool> {
        self.handlers.get(&message_id).map(|r| r.requires_auth)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Stops accepting work. Later dispatches are answered with a 503.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("🛑 Dispatch registry closed");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn reply_error(&self, session: &Session, code: i32, message: &str, message_id: MessageId) {
        let response = ErrorResponse::new(code, message, message_id);
        if let Err(e) = session.send_message(ids::ERROR_RESPONSE, &response) {
            debug!("Could not send error response to session {}: {}", session.id(), e);
        }
    }

    /// Routes `frame` to its handler on behalf of `session`.
    pub async fn dispatch(&self, session: &Arc<Session>, frame: Frame) -> DispatchOutcome {
        let message_id = frame.message_id;

        if self.is_shut_down() {
            self.reply_error(session, error_codes::SHUTTING_DOWN, "server shutting down", message_id);
            return DispatchOutcome::Rejected;
        }

        let Some(registration) = self.handlers.get(&message_id).map(|r| r.value().clone()) else {
            self.stats.message_unhandled();
            debug!(
                "📭 No handler for message {} from session {}; dropped",
                message_id,
                session.id()
            );
            return DispatchOutcome::Unhandled;
        };

        if registration.requires_auth && !session.is_authenticated() {
            self.stats.message_unauthorized();
            debug!(
                "🚫 Message {} from unauthenticated session {} refused",
                message_id,
                session.id()
            );
            self.reply_error(session, error_codes::AUTH_REQUIRED, "authentication required", message_id);
            return DispatchOutcome::Unauthorized;
        }

        let handler = registration.handler;
        let result = AssertUnwindSafe(handler.handle(session.clone(), frame.payload))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {
                self.stats.frame_dispatched();
                trace!("✅ Message {} handled for session {}", message_id, session.id());
                DispatchOutcome::Handled
            }
            Ok(Err(HandlerError::Decode(e))) => {
                self.stats.handler_failed();
                warn!(
                    "Handler '{}' could not decode message {} from session {}: {}",
                    handler.handler_name(),
                    message_id,
                    session.id(),
                    e
                );
                self.reply_error(session, error_codes::BAD_REQUEST, "malformed payload", message_id);
                DispatchOutcome::Failed
            }
            Ok(Err(HandlerError::Rejected(reason))) => {
                self.stats.handler_failed();
                debug!(
                    "Handler '{}' rejected message {} from session {}: {}",
                    handler.handler_name(),
                    message_id,
                    session.id(),
                    reason
                );
                self.reply_error(session, error_codes::BAD_REQUEST, &reason, message_id);
                DispatchOutcome::Failed
            }
            Ok(Err(e)) => {
                self.stats.handler_failed();
                error!(
                    "❌ Handler '{}' failed on message {} for session {}: {}",
                    handler.handler_name(),
                    message_id,
                    session.id(),
                    e
                );
                self.reply_error(session, error_codes::HANDLER_FAILED, "internal error", message_id);
                DispatchOutcome::Failed
            }
            Err(panic) => {
                self.stats.handler_failed();
                error!(
                    "💥 Handler '{}' panicked on message {} for session {}: {}",
                    handler.handler_name(),
                    message_id,
                    session.id(),
                    panic_message(panic.as_ref())
                );
                self.reply_error(session, error_codes::HANDLER_FAILED, "internal error", message_id);
                DispatchOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingConnection;
    use crate::connection::Connection;
    use crate::protocol::{HeartbeatRequest, LoginRequest};
    use crate::session::SessionId;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn session() -> (Arc<Session>, Arc<RecordingConnection>) {
        let conn = RecordingConnection::new();
        (
            Arc::new(Session::new(SessionId(1), Uuid::new_v4(), conn.clone())),
            conn,
        )
    }

    fn registry() -> DispatchRegistry {
        DispatchRegistry::new(Arc::new(ServerStats::new()))
    }

    fn last_error(conn: &RecordingConnection) -> ErrorResponse {
        let frame = conn.sent().pop().unwrap();
        assert_eq!(frame.message_id, ids::ERROR_RESPONSE);
        frame.decode_payload().unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_invokes_typed_handler() {
        let registry = registry();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        registry.register_typed(10, false, move |_session, req: HeartbeatRequest| {
            let counter = counter.clone();
            async move {
                counter.store(req.client_time as usize, Ordering::SeqCst);
                Ok(())
            }
        });

        let (session, _) = session();
        let frame = Frame::from_message(10, &HeartbeatRequest { client_time: 42 });
        assert_eq!(registry.dispatch(&session, frame).await, DispatchOutcome::Handled);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    async fn test_unhandled_message_is_dropped_silently() {
        let registry = registry();
        let (session, conn) = session();
        let outcome = registry.dispatch(&session, Frame::new(12345, vec![1])).await;
        assert_eq!(outcome, DispatchOutcome::Unhandled);
        assert!(conn.sent().is_empty());
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_protected_handler_requires_authentication() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register_raw(20, true, move |_session, _payload| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (session, conn) = session();
        let outcome = registry.dispatch(&session, Frame::new(20, vec![])).await;
        assert_eq!(outcome, DispatchOutcome::Unauthorized);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let error = last_error(&conn);
        assert_eq!(error.code, error_codes::AUTH_REQUIRED);
        assert_eq!(error.request_message_id, 20);
        assert!(conn.is_active());

        session.bind("alice");
        assert_eq!(
            registry.dispatch(&session, Frame::new(20, vec![])).await,
            DispatchOutcome::Handled
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let registry = registry();
        registry.register_raw(30, false, |_session, _payload| async {
            Err(HandlerError::Internal("database exploded".into()))
        });

        let (session, conn) = session();
        assert_eq!(
            registry.dispatch(&session, Frame::new(30, vec![])).await,
            DispatchOutcome::Failed
        );
        assert_eq!(last_error(&conn).code, error_codes::HANDLER_FAILED);
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let registry = registry();
        registry.register_raw(31, false, |_session, _payload| async {
            if true {
                panic!("handler bug");
            }
            Ok(())
        });

        let (session, conn) = session();
        assert_eq!(
            registry.dispatch(&session, Frame::new(31, vec![])).await,
            DispatchOutcome::Failed
        );
        assert_eq!(last_error(&conn).code, error_codes::HANDLER_FAILED);
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_bad_request() {
        let registry = registry();
        registry.register_typed(40, false, |_session, _req: LoginRequest| async { Ok(()) });

        let (session, conn) = session();
        let garbage = Frame::new(40, vec![0xFF, 0xFF, 0xFF]);
        assert_eq!(registry.dispatch(&session, garbage).await, DispatchOutcome::Failed);
        assert_eq!(last_error(&conn).code, error_codes::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rejection_reason_reaches_client() {
        let registry = registry();
        registry.register_raw(41, false, |_session, _payload| async {
            Err(HandlerError::Rejected("inventory full".into()))
        });

        let (session, conn) = session();
        registry.dispatch(&session, Frame::new(41, vec![])).await;
        let error = last_error(&conn);
        assert_eq!(error.code, error_codes::BAD_REQUEST);
        assert_eq!(error.message, "inventory full");
    }

    #[tokio::test]
    async fn test_register_replaces_previous_handler() {
        let registry = registry();
        registry.register_raw(50, true, |_s, _p| async { Err(HandlerError::Internal("old".into())) });
        registry.register_raw(50, false, |_s, _p| async { Ok(()) });

        assert_eq!(registry.handler_count(), 1);
        assert_eq!(registry.requires_auth(50), Some(false));
        let (session, _) = session();
        assert_eq!(
            registry.dispatch(&session, Frame::new(50, vec![])).await,
            DispatchOutcome::Handled
        );
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let registry = registry();
        registry.register_raw(60, false, |_s, _p| async { Ok(()) });
        registry.shutdown();

        let (session, conn) = session();
        assert_eq!(
            registry.dispatch(&session, Frame::new(60, vec![])).await,
            DispatchOutcome::Rejected
        );
        assert_eq!(last_error(&conn).code, error_codes::SHUTTING_DOWN);
    }
}
