//! Connection handling logic for framed TCP clients.
//!
//! This module contains the per-connection pipeline: a reader that decodes
//! frames and dispatches them in arrival order, and a writer task that
//! drains the connection's outbound queue onto the socket.

use crate::{
    connection::{ClientConnection, Connection, ConnectionId, DisconnectReason},
    error::CodecError,
    health::ServerStats,
    messaging::DispatchRegistry,
    protocol::{Frame, FrameCodec},
    session::{Session, SessionRegistry},
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How long queued frames may take to flush once a connection closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Read half that remembers when bytes last arrived, so a frame trickling
/// in slowly still counts as activity.
#[derive(Debug)]
struct ActivityReader<R> {
    inner: R,
    last_read: Instant,
}

impl<R> ActivityReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            last_read: Instant::now(),
        }
    }

    fn last_read(&self) -> Instant {
        self.last_read
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ActivityReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(polled, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.last_read = Instant::now();
        }
        polled
    }
}

type FrameReader = FramedRead<ActivityReader<OwnedReadHalf>, FrameCodec>;

/// Everything a connection task needs from the server.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionContext {
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<DispatchRegistry>,
    pub stats: Arc<ServerStats>,
    pub next_connection_id: Arc<AtomicU64>,
    pub idle_timeout: Duration,
    pub max_frame_bytes: usize,
    pub outbound_queue_size: usize,
    pub nodelay: bool,
}

/// Handles a single client connection from accept to cleanup.
///
/// # Connection Flow
///
/// 1. Split the socket and start the writer task
/// 2. Create the session and mark the connection active
/// 3. Read frames until the peer leaves, the idle window lapses, a frame
///    breaks the protocol or `token` is cancelled
/// 4. Tear down exactly once: close, drop the session, flush the writer
///
/// Frames from one connection are dispatched one at a time, so a
/// connection's handlers always observe its messages in arrival order.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ConnectionContext,
    token: CancellationToken,
) {
    let connection_id = ctx.next_connection_id.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = stream.set_nodelay(ctx.nodelay) {
        debug!("Connection {}: failed to set TCP_NODELAY: {}", connection_id, e);
    }
    ctx.stats.connection_opened();

    let (read_half, write_half) = stream.into_split();
    let codec = FrameCodec::new(ctx.max_frame_bytes);
    let mut reader = FramedRead::new(ActivityReader::new(read_half), codec.clone());
    let writer = FramedWrite::new(write_half, codec);

    let (outbound, queue) = mpsc::channel(ctx.outbound_queue_size.max(1));
    let connection = Arc::new(ClientConnection::new(
        connection_id,
        addr,
        outbound,
        token.clone(),
    ));
    let writer_task = tokio::spawn(write_loop(writer, queue, token.clone(), connection_id));

    let session = ctx.registry.create_session(connection.clone()).await;
    connection.mark_active();
    info!(
        "🔗 Connection {} from {} (session {})",
        connection_id,
        addr,
        session.id()
    );

    let reason = read_loop(&mut reader, &session, &ctx, &token).await;

    connection.close();
    ctx.registry.remove_by_connection(connection_id).await;
    if let Err(e) = writer_task.await {
        warn!("Connection {}: writer task failed: {}", connection_id, e);
    }
    ctx.stats.connection_closed();
    info!("🔌 Connection {} closed: {}", connection_id, reason);
}

/// The idle window restarts whenever any bytes arrive, not only when a
/// whole frame has been decoded.
async fn read_loop(
    reader: &mut FrameReader,
    session: &Arc<Session>,
    ctx: &ConnectionContext,
    token: &CancellationToken,
) -> DisconnectReason {
    loop {
        let deadline = reader.get_ref().last_read() + ctx.idle_timeout;
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return DisconnectReason::ServerClosed,
            _ = tokio::time::sleep_until(deadline) => {
                if reader.get_ref().last_read() + ctx.idle_timeout > Instant::now() {
                    continue;
                }
                ctx.stats.idle_timeout();
                return DisconnectReason::IdleTimeout;
            }
            next = reader.next() => next,
        };

        let frame = match next {
            None => return DisconnectReason::PeerClosed,
            Some(Err(e)) => return read_failure(e, session, ctx),
            Some(Ok(frame)) => frame,
        };

        ctx.stats.frame_received();
        trace!(
            "📨 Session {}: message {} ({} bytes)",
            session.id(),
            frame.message_id,
            frame.payload.len()
        );
        ctx.registry.touch(session).await;
        ctx.dispatcher.dispatch(session, frame).await;
    }
}

fn read_failure(error: CodecError, session: &Session, ctx: &ConnectionContext) -> DisconnectReason {
    if error.is_protocol_violation() {
        ctx.stats.protocol_violation();
        warn!("🚫 Session {} from {}: {}", session.id(), session.remote_address(), error);
        DisconnectReason::ProtocolViolation(error.to_string())
    } else {
        debug!("Session {} read failed: {}", session.id(), error);
        DisconnectReason::IoError(error.to_string())
    }
}

/// Writes queued frames until the connection closes, then flushes what is
/// still queued. A failed write closes the connection.
async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut queue: mpsc::Receiver<Frame>,
    token: CancellationToken,
    connection_id: ConnectionId,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = queue.recv() => frame,
            _ = token.cancelled() => break,
        };
        let Some(frame) = frame else { break };

        let written = if queue.is_empty() {
            writer.send(frame).await
        } else {
            writer.feed(frame).await
        };
        if let Err(e) = written {
            debug!("Connection {}: write failed: {}", connection_id, e);
            token.cancel();
            return;
        }
    }

    queue.close();
    let drain = async {
        while let Some(frame) = queue.recv().await {
            writer.feed(frame).await?;
        }
        writer.flush().await?;
        writer.get_mut().shutdown().await?;
        Ok::<_, CodecError>(())
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Connection {}: final flush failed: {}", connection_id, e),
        Err(_) => debug!("Connection {}: final flush timed out", connection_id),
    }
}
