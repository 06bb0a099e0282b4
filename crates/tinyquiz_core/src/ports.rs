//! crates/tinyquiz_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the quiz engine.
//! The repository trait is the boundary between the core and the storage engine,
//! so the scheduling and answering rules stay independent of any database.

use crate::domain::{
    Answer, AskedQuestion, CurrentQuestion, Game, GameOverview, NewGame, Player, PlayerContext,
    Results, Session, Stats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

//=========================================================================================
// Error taxonomy
//=========================================================================================

/// The closed set of outcomes a quiz operation can fail with.
///
/// Every variant is recoverable for the caller. `SerializationConflict` is the only
/// one that should lead to retrying the whole operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("No such entity: {0}")]
    NoSuchEntity(String),
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("There is no next question")]
    NoNextQuestion,
    #[error("The deadline for answers to this question has passed")]
    QuestionClosed,
    #[error("The player has already answered the question")]
    AlreadyAnswered,
    #[error("The transaction could not be serialized")]
    SerializationConflict,
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

impl PortError {
    /// Whether the failed operation may succeed when run again from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PortError::SerializationConflict)
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Repository port
//=========================================================================================

/// Transactional access to games, sessions, players, asked questions and answers.
///
/// `advance_question` and `save_answer` must each run as one serializable
/// transaction. Implementations report write skew as
/// `PortError::SerializationConflict` and leave the retry to the caller.
#[async_trait]
pub trait QuizRepository: Send + Sync {
    // --- Statistics ---
    async fn get_stats(&self) -> PortResult<Stats>;

    // --- Authoring ---
    /// Creates the game, its questions and choices atomically.
    async fn create_game(
        &self,
        game: NewGame,
        name: &str,
        author: &str,
        now: DateTime<Utc>,
    ) -> PortResult<Game>;

    async fn get_game(&self, game_id: Uuid) -> PortResult<GameOverview>;

    // --- Sessions and players ---
    /// Creates a session of the game with the given code and its organiser.
    async fn create_session(
        &self,
        organiser_name: &str,
        game_code: &str,
        now: DateTime<Utc>,
    ) -> PortResult<(Session, Player)>;

    /// Adds a player to the session with the given code.
    async fn register_player(
        &self,
        player_name: &str,
        session_code: &str,
        now: DateTime<Utc>,
    ) -> PortResult<Player>;

    async fn get_player(&self, player_id: Uuid) -> PortResult<PlayerContext>;

    // --- State queries ---
    /// Players of the session ordered by join time.
    async fn get_roster(&self, session_id: Uuid) -> PortResult<Vec<Player>>;

    /// The most recently asked question of the session, open or not.
    async fn get_current_question(&self, session_id: Uuid)
        -> PortResult<Option<CurrentQuestion>>;

    // --- Play ---
    /// Closes the open question, if any, and opens the next one.
    ///
    /// Fails with `NoNextQuestion` once the game is exhausted; the close is still
    /// committed in that case.
    async fn advance_question(&self, session_id: Uuid, now: DateTime<Utc>)
        -> PortResult<AskedQuestion>;

    async fn save_answer(
        &self,
        player_id: Uuid,
        choice_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<Answer>;

    async fn get_results(&self, player_id: Uuid) -> PortResult<Results>;
}
