//! DKG Coordination Service
//!
//! WebSocket service hosting the session coordinator. Each participant
//! holds one duplex connection; frames are JSON-tagged protocol messages.

use anyhow::Result;
use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use dkg_core::coordinator::{ConnId, Coordinator, CoordinatorHandle};
use dkg_core::{PhaseTimeouts, SessionStore};
use dkg_wire::{decode_client, encode, ServerMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};

/// Coordinator service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "dkg-coordinator")]
#[command(about = "Coordination service for threshold DKG sessions")]
struct Args {
    /// Listen address
    #[arg(short, long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Joining phase deadline in seconds
    #[arg(long, default_value = "300")]
    joining_timeout: u64,

    /// Round1 phase deadline in seconds
    #[arg(long, default_value = "180")]
    round1_timeout: u64,

    /// Round2 phase deadline in seconds (share encryption is the slow step)
    #[arg(long, default_value = "300")]
    round2_timeout: u64,

    /// Finalizing phase deadline in seconds
    #[arg(long, default_value = "120")]
    finalizing_timeout: u64,
}

impl Args {
    fn timeouts(&self) -> PhaseTimeouts {
        PhaseTimeouts {
            joining: Duration::from_secs(self.joining_timeout),
            round1: Duration::from_secs(self.round1_timeout),
            round2: Duration::from_secs(self.round2_timeout),
            finalizing: Duration::from_secs(self.finalizing_timeout),
        }
    }
}

/// Application state
struct AppState {
    coordinator: CoordinatorHandle,
    next_conn: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    info!(
        listen = %args.listen,
        joining = args.joining_timeout,
        round1 = args.round1_timeout,
        round2 = args.round2_timeout,
        finalizing = args.finalizing_timeout,
        "Starting DKG coordination service"
    );

    let coordinator = Coordinator::spawn(SessionStore::new(), args.timeouts());
    let state = Arc::new(AppState {
        coordinator,
        next_conn: AtomicU64::new(1),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "dkg-coordinator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Upgrade one participant connection
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    ws.on_upgrade(move |socket| handle_connection(socket, state, conn))
}

async fn handle_connection(
    socket: axum::extract::ws::WebSocket,
    state: Arc<AppState>,
    conn: ConnId,
) {
    use axum::extract::ws::Message;
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();

    // Single writer: replies and coordinator pushes share one channel so
    // frame order matches coordinator processing order.
    let (outbound, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<ServerMessage>();
    state.coordinator.attach(conn, outbound.clone());
    info!(conn, "Participant connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(Message::Text(encode(&message))).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let reply = match decode_client(&text) {
                    Ok(message) => state.coordinator.request(conn, message).await,
                    // Protocol violations get an explanation, not a hangup
                    Err(e) => ServerMessage::error(e),
                };
                if outbound.send(reply).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(conn, error = %e, "Connection error");
                break;
            }
        }
    }

    state.coordinator.detach(conn);
    writer.abort();
    info!(conn, "Participant disconnected");
}
