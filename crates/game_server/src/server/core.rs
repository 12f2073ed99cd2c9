//! Core game server implementation.
//!
//! This module contains the main `GameServer` struct, which wires the
//! session store, the session registry and the dispatch registry to the
//! TCP listeners and owns the server's start/shutdown lifecycle.

use super::handlers::ConnectionContext;
use super::listener::{accept_loop, bind_listeners};
use crate::{
    config::ServerConfig,
    error::ServerError,
    health::{HealthReport, ServerStats},
    messaging::{register_builtin_handlers, DispatchRegistry},
    session::SessionRegistry,
    store::{build_store, SessionStore},
};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Upper bound on waiting for connection tasks during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Reason sent in the [`KickNotice`](crate::protocol::KickNotice) every
/// session receives at shutdown.
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// The core game server structure.
///
/// `GameServer` owns one session registry and one dispatch registry per
/// process; business code registers its handlers on
/// [`GameServer::dispatcher`] before calling [`GameServer::start`].
///
/// # Architecture
///
/// * **Listeners**: one or more accept loops, optionally sharing the port
///   through SO_REUSEPORT
/// * **Connections**: one task per connection, decoding and dispatching its
///   frames strictly in order
/// * **Sessions**: the [`SessionRegistry`] in front of a two-tier
///   [`SessionStore`]
/// * **Sweeper**: a background task evicting idle sessions
pub struct GameServer {
    /// Server configuration settings
    config: ServerConfig,

    /// Counters shared with the registry, dispatcher and store
    stats: Arc<ServerStats>,

    /// Session persistence
    store: Arc<dyn SessionStore>,

    /// Live sessions of this instance
    registry: Arc<SessionRegistry>,

    /// Message id to handler routing
    dispatcher: Arc<DispatchRegistry>,

    /// Source of connection ids, shared by all accept loops
    next_connection_id: Arc<AtomicU64>,

    /// Present while the server is started
    running: Mutex<Option<Running>>,
}

/// Handles to everything `start` spawned.
struct Running {
    local_addr: SocketAddr,
    accept_token: CancellationToken,
    connections_token: CancellationToken,
    acceptors: TaskTracker,
    connections: TaskTracker,
}

impl std::fmt::Debug for GameServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameServer")
            .field("bind_address", &self.config.bind_address)
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl GameServer {
    /// Creates a server with the store described by `config.store`.
    ///
    /// Fails when the configuration is invalid. No socket is opened and no
    /// backend connection is made until [`GameServer::start`].
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let stats = Arc::new(ServerStats::new());
        let store = Arc::new(build_store(&config.store, stats.clone())?);
        Ok(Self::assemble(config, store, stats))
    }

    /// Creates a server on top of an existing store, e.g. one sharing its
    /// backend with another server.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SessionStore>) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self::assemble(config, store, Arc::new(ServerStats::new())))
    }

    fn assemble(config: ServerConfig, store: Arc<dyn SessionStore>, stats: Arc<ServerStats>) -> Self {
        let registry = Arc::new(SessionRegistry::new(store.clone(), stats.clone()));
        let dispatcher = Arc::new(DispatchRegistry::new(stats.clone()));
        register_builtin_handlers(&dispatcher);

        Self {
            config,
            stats,
            store,
            registry,
            dispatcher,
            next_connection_id: Arc::new(AtomicU64::new(1)),
            running: Mutex::new(None),
        }
    }

    /// Binds the listeners and starts accepting connections.
    ///
    /// Returns once the server is listening, with the address actually
    /// bound (useful with port 0). Starting a running server logs a warning
    /// and returns the existing address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            warn!("⚠️ Server already running on {}; start ignored", current.local_addr);
            return Ok(current.local_addr);
        }

        info!("🚀 Starting game server on {}", self.config.bind_address);
        info!("🌍 Node ID: {}", self.registry.node_id());

        let acceptors = self.config.acceptors();
        if self.config.use_reuse_port {
            info!("🧠 Detected {} CPU cores, using {} acceptor(s)", num_cpus::get(), acceptors);
        }

        let listeners = bind_listeners(
            self.config.bind_address,
            &self.config.socket,
            self.config.use_reuse_port,
            acceptors,
        )
        .map_err(|e| {
            ServerError::Network(format!("Failed to bind {}: {e}", self.config.bind_address))
        })?;
        let local_addr = listeners[0]
            .local_addr()
            .map_err(|e| ServerError::Network(format!("Failed to read bound address: {e}")))?;

        let ctx = ConnectionContext {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            stats: self.stats.clone(),
            next_connection_id: self.next_connection_id.clone(),
            idle_timeout: self.config.idle_timeout(),
            max_frame_bytes: self.config.frame_limit(),
            outbound_queue_size: self.config.outbound_queue_size,
            nodelay: self.config.socket.nodelay,
        };
        let limiter = Arc::new(Semaphore::new(self.config.max_connections));
        let accept_token = CancellationToken::new();
        let connections_token = CancellationToken::new();
        let acceptor_tasks = TaskTracker::new();
        let connection_tasks = TaskTracker::new();

        let listener_count = listeners.len();
        for listener in listeners {
            acceptor_tasks.spawn(accept_loop(
                listener,
                ctx.clone(),
                limiter.clone(),
                accept_token.clone(),
                connections_token.clone(),
                connection_tasks.clone(),
            ));
        }

        connection_tasks.spawn(sweep_sessions(
            self.registry.clone(),
            self.config.session.sweep_interval(),
            self.config.session.session_timeout(),
            connections_token.clone(),
        ));

        info!(
            "✅ Listening on {} with {} accept loop(s), max {} connections",
            local_addr, listener_count, self.config.max_connections
        );

        *running = Some(Running {
            local_addr,
            accept_token,
            connections_token,
            acceptors: acceptor_tasks,
            connections: connection_tasks,
        });
        Ok(local_addr)
    }

    /// Stops the server gracefully.
    ///
    /// # Shutdown Order
    ///
    /// 1. Stop accepting and close the listening sockets
    /// 2. Notify and evict every session
    /// 3. Shut the dispatch registry so no frame reaches a torn-down handler
    /// 4. Cancel remaining connection tasks and the sweeper, then wait for them
    ///
    /// Shutting down a server that is not running logs a warning and does
    /// nothing.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            warn!("⚠️ Shutdown requested but the server is not running");
            return;
        };

        info!("🛑 Shutting down game server on {}", running.local_addr);

        running.accept_token.cancel();
        running.acceptors.close();
        running.acceptors.wait().await;
        debug!("Listeners closed");

        let evicted = self.registry.evict_all(SHUTDOWN_REASON).await;
        info!("👋 Evicted {} session(s)", evicted);

        self.dispatcher.shutdown();

        running.connections_token.cancel();
        running.connections.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, running.connections.wait())
            .await
            .is_err()
        {
            warn!(
                "⏰ {} connection task(s) still running after {:?}",
                running.connections.len(),
                SHUTDOWN_TIMEOUT
            );
        }

        info!("✅ Game server shutdown complete");
    }

    /// Whether [`GameServer::start`] has succeeded and no shutdown followed.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// The bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Gets the session registry. Handlers use it to bind users and
    /// broadcast.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Gets the dispatch registry for handler registration.
    pub fn dispatcher(&self) -> Arc<DispatchRegistry> {
        self.dispatcher.clone()
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current health, for the gateway's periodic report.
    pub async fn health(&self) -> HealthReport {
        HealthReport::evaluate(
            self.is_running().await,
            self.registry.session_count(),
            self.store.circuit_state().await,
            self.stats.snapshot(),
        )
    }
}

/// Evicts idle sessions every `interval` until `token` is cancelled.
async fn sweep_sessions(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    session_timeout: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = registry.remove_inactive_sessions(session_timeout).await;
                debug!("🧹 Session sweep evicted {}", evicted);
            }
        }
    }
}
