//! # Player Simulation Client
//!
//! Opens one TCP connection per simulated player against a running gateway,
//! logs in, then sends heartbeats at a fixed rate until the simulation ends.
//! Every reply is decoded with the server's own frame codec, so this binary
//! doubles as a smoke test for the wire protocol.

use clap::Parser;
use futures::{SinkExt, StreamExt};
use game_server::current_timestamp_ms;
use game_server::protocol::{
    ids, ErrorResponse, Frame, FrameCodec, HeartbeatRequest, HeartbeatResponse, KickNotice,
    LoginRequest, LoginResponse, MAX_FRAME_BYTES,
};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{interval, sleep};
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug, Clone)]
#[command(name = "simulate")]
#[command(about = "Simulates players against a game gateway")]
struct Args {
    /// Gateway address
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    addr: String,

    /// Number of simultaneous players to simulate
    #[arg(short, long, default_value = "5")]
    players: u32,

    /// Simulation duration in seconds
    #[arg(short, long, default_value = "60")]
    duration: u64,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,
}

/// Per-player counters reported when the player finishes.
#[derive(Debug, Default)]
struct PlayerStats {
    heartbeats_sent: u64,
    heartbeats_acked: u64,
    errors: u64,
    total_rtt_ms: i64,
}

impl PlayerStats {
    fn average_rtt_ms(&self) -> i64 {
        if self.heartbeats_acked == 0 {
            0
        } else {
            self.total_rtt_ms / self.heartbeats_acked as i64
        }
    }
}

enum Outcome {
    Continue,
    Kicked(String),
}

/// Run a single player simulation
async fn simulate_player(index: u32, args: Args) -> Result<PlayerStats, BoxError> {
    let user_id = format!("player-{index}");
    let stream = TcpStream::connect(&args.addr).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, FrameCodec::new(MAX_FRAME_BYTES));

    framed
        .send(Frame::from_message(
            ids::LOGIN_REQUEST,
            &LoginRequest {
                user_id: user_id.clone(),
                token: String::new(),
            },
        ))
        .await?;

    let mut stats = PlayerStats::default();
    let mut heartbeat_timer = interval(Duration::from_millis(args.heartbeat_ms.max(1)));
    let deadline = sleep(Duration::from_secs(args.duration));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = heartbeat_timer.tick() => {
                let request = HeartbeatRequest { client_time: current_timestamp_ms() as i64 };
                framed.send(Frame::from_message(ids::HEARTBEAT_REQUEST, &request)).await?;
                stats.heartbeats_sent += 1;
            }
            incoming = framed.next() => {
                let Some(frame) = incoming else {
                    warn!("🔌 Player {} disconnected by server", user_id);
                    break;
                };
                match handle_frame(&user_id, &frame?, &mut stats)? {
                    Outcome::Continue => {}
                    Outcome::Kicked(reason) => {
                        warn!("👢 Player {} kicked: {}", user_id, reason);
                        break;
                    }
                }
            }
        }
    }

    Ok(stats)
}

fn handle_frame(user_id: &str, frame: &Frame, stats: &mut PlayerStats) -> Result<Outcome, BoxError> {
    match frame.message_id {
        ids::LOGIN_RESPONSE => {
            let response: LoginResponse = frame.decode_payload()?;
            if response.success {
                info!("✅ Player {} logged in (session {})", user_id, response.session_id);
            } else {
                warn!("❌ Player {} login refused: {}", user_id, response.message);
            }
        }
        ids::HEARTBEAT_RESPONSE => {
            let response: HeartbeatResponse = frame.decode_payload()?;
            stats.heartbeats_acked += 1;
            stats.total_rtt_ms += current_timestamp_ms() as i64 - response.client_time;
        }
        ids::ERROR_RESPONSE => {
            let response: ErrorResponse = frame.decode_payload()?;
            stats.errors += 1;
            warn!(
                "⚠️ Player {} got error {} for message {}: {}",
                user_id, response.code, response.request_message_id, response.message
            );
        }
        ids::KICK_NOTICE => {
            let notice: KickNotice = frame.decode_payload()?;
            return Ok(Outcome::Kicked(notice.reason));
        }
        other => {
            info!("📨 Player {} received message {} ({} bytes)", user_id, other, frame.payload.len());
        }
    }
    Ok(Outcome::Continue)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    info!("🚀 Starting player simulation");
    info!("   • Players: {}", args.players);
    info!("   • Duration: {} seconds", args.duration);
    info!("   • Heartbeat: every {}ms", args.heartbeat_ms);
    info!("   • Gateway: {}", args.addr);

    let started = Instant::now();
    let mut handles = Vec::new();

    for index in 0..args.players {
        let args = args.clone();
        handles.push(tokio::spawn(async move {
            match simulate_player(index, args).await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    error!("❌ Player {} simulation failed: {}", index, e);
                    None
                }
            }
        }));

        // Stagger connections to avoid overwhelming server
        sleep(Duration::from_millis(20)).await;
    }

    let mut completed = 0u32;
    let mut totals = PlayerStats::default();
    for handle in handles {
        if let Ok(Some(stats)) = handle.await {
            completed += 1;
            totals.heartbeats_sent += stats.heartbeats_sent;
            totals.heartbeats_acked += stats.heartbeats_acked;
            totals.errors += stats.errors;
            totals.total_rtt_ms += stats.total_rtt_ms;
        }
    }

    info!("✅ Simulation complete in {:.1}s", started.elapsed().as_secs_f64());
    info!("📊 Summary:");
    info!("   • Players completed: {}/{}", completed, args.players);
    info!(
        "   • Heartbeats: {} sent, {} acknowledged",
        totals.heartbeats_sent, totals.heartbeats_acked
    );
    info!("   • Average round trip: {}ms", totals.average_rtt_ms());
    info!("   • Error responses: {}", totals.errors);

    Ok(())
}
