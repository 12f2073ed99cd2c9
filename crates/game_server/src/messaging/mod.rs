//! Message handling and routing for client-server communication.
//!
//! This module provides the dispatch registry that routes decoded frames to
//! business handlers, the handler abstractions those handlers implement and
//! the few handlers the server registers for itself.

pub mod builtin;
pub mod dispatch;
pub mod handler;

pub use builtin::register_builtin_handlers;
pub use dispatch::{DispatchOutcome, DispatchRegistry};
pub use handler::{MessageHandler, RawMessageHandler, TypedMessageHandler};
