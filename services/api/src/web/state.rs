//! services/api/src/web/state.rs
//!
//! Defines the application state shared by every handler.

use crate::config::Config;
use crate::service::QuizService;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: QuizService,
    pub config: Arc<Config>,
    /// Cancelled on server shutdown so that open WebSocket connections wind down.
    pub shutdown: CancellationToken,
}
