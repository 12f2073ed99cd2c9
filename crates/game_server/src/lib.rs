//! # Game Server - Connection, Session and Protocol Engine
//!
//! A production-ready engine for long-lived binary game connections. The
//! server accepts TCP clients, frames their byte streams, tracks one session
//! per connection and routes every frame to the business handler registered
//! for its message id. It contains **no game logic**: login, matchmaking and
//! gameplay live in handlers supplied by the embedding application.
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **Frame Codec** ([`protocol`]) - `[u32 length][u32 message id][i32 payload length][payload]`
//! * **Dispatch Registry** ([`messaging`]) - message id to handler, with an
//!   authentication gate and an error boundary
//! * **Session Store** ([`store`]) - bounded local cache in front of an
//!   optional distributed backend (in-memory or Redis)
//! * **Session Registry** ([`session`]) - live sessions by id, connection and
//!   user; at most one session per user
//! * **Server** ([`server`]) - listeners, per-connection pipelines, idle
//!   timeouts and graceful shutdown
//!
//! ### Message Flow
//!
//! 1. Bytes arrive and the codec yields a frame
//! 2. The session's activity time is refreshed
//! 3. The dispatch registry checks authentication and runs the handler
//! 4. The handler replies through its session; failures become error responses
//!
//! ### Handler Registration
//!
//! ```rust,no_run
//! use game_server::{GameServer, ServerConfig};
//! use game_server::protocol::{ids, LoginRequest, LoginResponse};
//! use game_server::error::HandlerError;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = GameServer::new(ServerConfig::default())?;
//! let registry = server.registry();
//!
//! server.dispatcher().register_typed(ids::LOGIN_REQUEST, false, move |session, req: LoginRequest| {
//!     let registry = registry.clone();
//!     async move {
//!         if req.user_id.is_empty() {
//!             return Err(HandlerError::Rejected("user_id is required".into()));
//!         }
//!         registry.bind_user(session.id(), &req.user_id).await;
//!         let _ = session.send_message(ids::LOGIN_RESPONSE, &LoginResponse {
//!             success: true,
//!             user_id: req.user_id,
//!             session_id: session.id().0,
//!             message: String::new(),
//!         });
//!         Ok(())
//!     }
//! });
//!
//! server.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure Handling
//!
//! * **Protocol violations** close the offending connection
//! * **Handler errors and panics** are answered with an
//!   [`ErrorResponse`](protocol::ErrorResponse); the connection stays open
//! * **Distributed store outages** degrade to local-only sessions behind a
//!   circuit breaker and are never surfaced to callers
//!
//! ## Performance Considerations
//!
//! * **Multi-threaded accept loops** - Configure `use_reuse_port` for CPU core scaling
//! * **Lock-free hot path** - Sharded maps for sessions, atomics for counters
//! * **Non-blocking sends** - Bounded per-connection queues drained by a writer task

// Re-export core types and functions for easy access
pub use config::ServerConfig;
pub use error::ServerError;
pub use server::GameServer;
pub use utils::{create_server, create_server_with_config, current_timestamp_ms};

// Public module declarations
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod messaging;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;
pub mod utils;
