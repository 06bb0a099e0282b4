pub mod delivery_task;
pub mod rest;
pub mod state;
pub mod ws_handler;

// Re-export the handlers that the binary wires into the router.
pub use rest::{
    advance_handler, create_game_handler, create_session_handler, get_game_handler,
    join_handler, player_handler, results_handler, stats_handler, submit_answer_handler,
};
pub use ws_handler::ws_handler;
