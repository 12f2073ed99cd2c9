//! Core server implementation and connection handling.
//!
//! This module contains the main game server structure, the listening
//! sockets with their accept loops, and the logic for handling individual
//! client connections.

pub mod core;
pub(crate) mod handlers;
pub(crate) mod listener;

pub use core::{GameServer, SHUTDOWN_REASON};
