//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point for a player's live-update WebSocket.
//!
//! The connection is read-only from the client's point of view: the server pushes a
//! full snapshot first and then every update published for the player's session.
//! Anything the client sends is ignored, except that a close frame or a read error
//! ends the connection.

use crate::web::{
    delivery_task::delivery_process,
    rest::port_error_response,
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::Response,
};
use chrono::Utc;
use futures::stream::StreamExt;
use std::sync::Arc;
use tinyquiz_core::domain::PlayerContext;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// The handler for upgrading HTTP requests to WebSocket connections.
///
/// The player is resolved before upgrading so that unknown ids get a plain 404.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Path(player_id): Path<Uuid>,
) -> Result<Response, (StatusCode, String)> {
    let ctx = app_state
        .service
        .player(player_id)
        .await
        .map_err(port_error_response)?;
    let span = info_span!("ws", %player_id, session_id = %ctx.session.id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, app_state, ctx).instrument(span)))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, ctx: PlayerContext) {
    info!("New WebSocket connection established.");

    let subscription = match app_state
        .service
        .subscribe(ctx.session.id, Utc::now())
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            error!("Failed to subscribe to session updates: {:?}", e);
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    // --- 1. Reader: only watches for the peer going away ---
    let token = app_state.shutdown.child_token();
    let reader = {
        let token = token.clone();
        tokio::spawn(
            async move {
                loop {
                    match receiver.next().await {
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Client disconnected.");
                            break;
                        }
                        Some(Err(e)) => {
                            info!("WebSocket read failed: {}", e);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                token.cancel();
            }
            .in_current_span(),
        )
    };

    // --- 2. Writer: drains the subscription into the socket ---
    let end = delivery_process(
        &mut sender,
        Box::pin(subscription.into_stream()),
        app_state.config.write_deadline,
        token.clone(),
    )
    .await;

    // --- 3. Cleanup ---
    token.cancel();
    reader.abort();
    info!(?end, "WebSocket connection closed.");
}

