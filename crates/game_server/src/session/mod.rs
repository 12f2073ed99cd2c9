//! Sessions: per-connection server state and the registry that tracks them.

pub mod registry;
pub mod types;

pub use registry::SessionRegistry;
pub use types::{Session, SessionData, SessionId, SessionIdGenerator};
