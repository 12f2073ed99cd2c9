//! Listening sockets and accept loops.

use super::handlers::{handle_connection, ConnectionContext};
use crate::config::SocketConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept, e.g. when the process is out of file
/// descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Creates one listening socket with the configured options.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    options: &SocketConfig,
    reuse_port: bool,
) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    if reuse_port {
        socket.set_reuseport(true)?;
    }
    #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
    if reuse_port {
        warn!("SO_REUSEPORT is not supported on this platform; ignoring");
    }
    if options.recv_buffer_size > 0 {
        socket.set_recv_buffer_size(options.recv_buffer_size)?;
    }
    if options.send_buffer_size > 0 {
        socket.set_send_buffer_size(options.send_buffer_size)?;
    }
    socket.bind(addr)?;
    socket.listen(options.backlog)
}

/// Binds `count` listeners on `addr`.
///
/// Extra listeners share the port through SO_REUSEPORT and bind to the
/// address the first one actually got, so port 0 works. If an extra
/// listener cannot be created the server continues with those it has.
pub(crate) fn bind_listeners(
    addr: SocketAddr,
    options: &SocketConfig,
    reuse_port: bool,
    count: usize,
) -> io::Result<Vec<TcpListener>> {
    let first = bind_listener(addr, options, reuse_port)?;
    let bound = first.local_addr()?;
    let mut listeners = vec![first];

    for i in 1..count {
        match bind_listener(bound, options, reuse_port) {
            Ok(listener) => listeners.push(listener),
            Err(e) => {
                warn!(
                    "Listener {} on {} failed: {}. Continuing with {} listener(s).",
                    i,
                    bound,
                    e,
                    listeners.len()
                );
                break;
            }
        }
    }
    Ok(listeners)
}

/// Accepts connections until `accept_token` is cancelled.
///
/// Connections beyond the `limiter` capacity are refused by closing them
/// straight away. Accepted connections are spawned on `tracker` and watch
/// `connections_token` for server shutdown.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    limiter: Arc<Semaphore>,
    accept_token: CancellationToken,
    connections_token: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = accept_token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let Ok(permit) = limiter.clone().try_acquire_owned() else {
            ctx.stats.connection_rejected();
            warn!("🚧 Connection limit reached, refusing {}", addr);
            drop(stream);
            continue;
        };

        let ctx = ctx.clone();
        let token = connections_token.child_token();
        tracker.spawn(async move {
            handle_connection(stream, addr, ctx, token).await;
            drop(permit);
        });
    }

    match listener.local_addr() {
        Ok(addr) => info!("🛑 Accept loop on {} stopped", addr),
        Err(_) => debug!("Accept loop stopped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_listener_on_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &SocketConfig::default(), false).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_reuse_port_listeners_share_the_port() {
        let listeners =
            bind_listeners("127.0.0.1:0".parse().unwrap(), &SocketConfig::default(), true, 3).unwrap();
        assert_eq!(listeners.len(), 3);
        let port = listeners[0].local_addr().unwrap().port();
        assert!(listeners.iter().all(|l| l.local_addr().unwrap().port() == port));
    }

    #[tokio::test]
    async fn test_second_listener_without_reuse_port_is_dropped() {
        let listeners =
            bind_listeners("127.0.0.1:0".parse().unwrap(), &SocketConfig::default(), false, 2).unwrap();
        assert_eq!(listeners.len(), 1);
    }
}
