//! crates/tinyquiz_core/src/domain.rs
//!
//! Defines the pure, core data structures for the quiz engine.
//! These structs are independent of any database or serialization format.

use crate::ports::{PortError, PortResult};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// Longest accepted player name, in characters.
pub const MAX_PLAYER_NAME_LEN: usize = 64;

/// Longest accepted answer window: one day.
pub const MAX_QUESTION_LENGTH_MS: u64 = 24 * 60 * 60 * 1000;

//=========================================================================================
// Authored content
//=========================================================================================

/// A quiz as uploaded by its author. Immutable once created.
#[derive(Debug, Clone)]
pub struct Game {
    pub id: Uuid,
    pub name: String,
    pub author: String,
    pub created: DateTime<Utc>,
    pub code: String,
}

#[derive(Debug, Clone)]
pub struct Question {
    pub id: Uuid,
    pub game_id: Uuid,
    pub title: String,
    /// Play sequence position, unique per game.
    pub order: i32,
    /// Answer window in milliseconds.
    pub default_length_ms: u64,
}

impl Question {
    pub fn default_length(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.default_length_ms).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone)]
pub struct Choice {
    pub id: Uuid,
    pub question_id: Uuid,
    pub title: String,
    pub correct: bool,
}

/// A game batch submitted for creation. Questions are played in the given order
/// and choices keep their insertion order.
#[derive(Debug, Clone)]
pub struct NewGame {
    pub questions: Vec<NewQuestion>,
}

#[derive(Debug, Clone)]
pub struct NewQuestion {
    pub title: String,
    pub length_ms: u64,
    pub choices: Vec<NewChoice>,
}

#[derive(Debug, Clone)]
pub struct NewChoice {
    pub title: String,
    pub correct: bool,
}

impl NewGame {
    /// Rejects batches that could never be played.
    pub fn validate(&self) -> PortResult<()> {
        if self.questions.is_empty() {
            return Err(PortError::ConstraintViolation(
                "a game needs at least one question".to_string(),
            ));
        }
        for (i, q) in self.questions.iter().enumerate() {
            if q.title.trim().is_empty() {
                return Err(PortError::ConstraintViolation(format!(
                    "question {} has an empty title",
                    i + 1
                )));
            }
            if q.length_ms == 0 || q.length_ms > MAX_QUESTION_LENGTH_MS {
                return Err(PortError::ConstraintViolation(format!(
                    "question {} has an answer window outside 1..={} ms",
                    i + 1,
                    MAX_QUESTION_LENGTH_MS
                )));
            }
            if q.choices.is_empty() {
                return Err(PortError::ConstraintViolation(format!(
                    "question {} has no choices",
                    i + 1
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QuestionWithChoices {
    pub question: Question,
    pub choices: Vec<Choice>,
}

/// The author's view of a game: every question in play order with its choices.
#[derive(Debug, Clone)]
pub struct GameOverview {
    pub game: Game,
    pub questions: Vec<QuestionWithChoices>,
}

//=========================================================================================
// Live play
//=========================================================================================

/// One playthrough of a game.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub game_id: Uuid,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub code: String,
}

/// Records when a question was presented to a session and when its window closes.
///
/// `ended` is fixed to `asked + default_length` when the question is opened and is
/// only ever moved earlier, when the organiser advances before the deadline.
#[derive(Debug, Clone)]
pub struct AskedQuestion {
    pub id: Uuid,
    pub session_id: Uuid,
    pub question_id: Uuid,
    pub asked: DateTime<Utc>,
    pub ended: DateTime<Utc>,
}

impl AskedQuestion {
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.ended > now
    }
}

#[derive(Debug, Clone)]
pub struct Player {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Denormalized from the session so choice ownership checks need no join.
    pub game_id: Uuid,
    pub name: String,
    pub joined: DateTime<Utc>,
    pub organiser: bool,
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub id: Uuid,
    pub player_id: Uuid,
    pub choice_id: Uuid,
    /// Denormalized from the choice; one answer per (player, question).
    pub question_id: Uuid,
    pub answered: DateTime<Utc>,
}

/// A player resolved together with its session and game.
#[derive(Debug, Clone)]
pub struct PlayerContext {
    pub player: Player,
    pub session: Session,
    pub game: Game,
}

/// The most recently asked question of a session with the data needed to show it.
#[derive(Debug, Clone)]
pub struct CurrentQuestion {
    pub asked: AskedQuestion,
    pub question: Question,
    pub choices: Vec<Choice>,
}

//=========================================================================================
// Read models
//=========================================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub games: u64,
    pub players: u64,
    pub sessions: u64,
}

#[derive(Debug, Clone)]
pub struct PlayerResult {
    pub player: Player,
    pub correct: u64,
    pub place: u64,
}

#[derive(Debug, Clone)]
pub struct Results {
    pub ranking: Vec<PlayerResult>,
    pub session: Session,
    pub player: Player,
}

//=========================================================================================
// Validation helpers
//=========================================================================================

fn player_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[\p{L}\p{N}_\-.,]+$").expect("player name pattern is valid")
    })
}

/// Trims and lowercases a player name and checks it against the allowed alphabet.
pub fn normalize_player_name(raw: &str) -> PortResult<String> {
    let name = raw.trim().to_lowercase();
    let len = name.chars().count();
    if len == 0 || len > MAX_PLAYER_NAME_LEN {
        return Err(PortError::ConstraintViolation(format!(
            "player name must be 1 to {} characters long",
            MAX_PLAYER_NAME_LEN
        )));
    }
    if !player_name_pattern().is_match(&name) {
        return Err(PortError::ConstraintViolation(
            "player name may only contain letters, digits and _-.,".to_string(),
        ));
    }
    Ok(name)
}
