//! crates/tinyquiz_core/src/ledger.rs
//!
//! Validation of a player's answer against the session's current question.

use crate::domain::{Answer, AskedQuestion, Choice, Player};
use crate::ports::{PortError, PortResult};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A choice together with the game its question belongs to.
#[derive(Debug, Clone)]
pub struct OwnedChoice {
    pub choice: Choice,
    pub game_id: Uuid,
}

/// Everything the ledger needs, loaded inside the answering transaction.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub player: &'a Player,
    /// The submitted choice, `None` if the id is unknown.
    pub choice: Option<&'a OwnedChoice>,
    /// The most recently asked question of the player's session.
    pub current: Option<&'a AskedQuestion>,
    /// Whether the player already answered the choice's question.
    pub already_answered: bool,
    pub now: DateTime<Utc>,
}

/// Checks a submission and builds the answer to record.
///
/// The checks run in a fixed order: the choice must be part of the player's game,
/// the session must have a current question, that question must still be open and
/// be the one the choice belongs to, and the player must not have answered it yet.
pub fn check_submission(s: Submission<'_>) -> PortResult<Answer> {
    let owned = s
        .choice
        .filter(|c| c.game_id == s.player.game_id)
        .ok_or_else(|| {
            PortError::NoSuchEntity(format!("choice for player {}", s.player.id))
        })?;

    let current = s.current.ok_or_else(|| {
        PortError::NoSuchEntity(format!("current question of session {}", s.player.session_id))
    })?;

    if !current.is_open_at(s.now) || current.question_id != owned.choice.question_id {
        return Err(PortError::QuestionClosed);
    }

    if s.already_answered {
        return Err(PortError::AlreadyAnswered);
    }

    Ok(Answer {
        id: Uuid::new_v4(),
        player_id: s.player.id,
        choice_id: owned.choice.id,
        question_id: owned.choice.question_id,
        answered: s.now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    struct Fixture {
        player: Player,
        choice: OwnedChoice,
        current: AskedQuestion,
        now: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let game_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let question_id = Uuid::new_v4();
        let now = Utc::now();
        Fixture {
            player: Player {
                id: Uuid::new_v4(),
                session_id,
                game_id,
                name: "bob".to_string(),
                joined: now,
                organiser: false,
            },
            choice: OwnedChoice {
                choice: Choice {
                    id: Uuid::new_v4(),
                    question_id,
                    title: "1945".to_string(),
                    correct: true,
                },
                game_id,
            },
            current: AskedQuestion {
                id: Uuid::new_v4(),
                session_id,
                question_id,
                asked: now,
                ended: now + Duration::seconds(30),
            },
            now: now + Duration::seconds(1),
        }
    }

    fn submit(f: &Fixture) -> Submission<'_> {
        Submission {
            player: &f.player,
            choice: Some(&f.choice),
            current: Some(&f.current),
            already_answered: false,
            now: f.now,
        }
    }

    #[test]
    fn accepts_first_answer_to_open_question() {
        let f = fixture();
        let answer = check_submission(submit(&f)).unwrap();
        assert_eq!(answer.player_id, f.player.id);
        assert_eq!(answer.choice_id, f.choice.choice.id);
        assert_eq!(answer.question_id, f.current.question_id);
        assert_eq!(answer.answered, f.now);
    }

    #[test]
    fn choice_from_another_game_is_unknown() {
        let mut f = fixture();
        f.choice.game_id = Uuid::new_v4();
        assert!(matches!(
            check_submission(submit(&f)),
            Err(PortError::NoSuchEntity(_))
        ));
        let s = Submission { choice: None, ..submit(&f) };
        assert!(matches!(check_submission(s), Err(PortError::NoSuchEntity(_))));
    }

    #[test]
    fn nothing_asked_yet_is_unknown() {
        let f = fixture();
        let s = Submission { current: None, ..submit(&f) };
        assert!(matches!(check_submission(s), Err(PortError::NoSuchEntity(_))));
    }

    #[test]
    fn passive_expiry_closes_the_window() {
        let mut f = fixture();
        f.now = f.current.ended;
        assert_eq!(check_submission(submit(&f)).unwrap_err(), PortError::QuestionClosed);
    }

    #[test]
    fn choice_of_a_past_question_is_closed() {
        let mut f = fixture();
        f.choice.choice.question_id = Uuid::new_v4();
        assert_eq!(check_submission(submit(&f)).unwrap_err(), PortError::QuestionClosed);
    }

    #[test]
    fn second_answer_is_rejected() {
        let f = fixture();
        let s = Submission { already_answered: true, ..submit(&f) };
        assert_eq!(check_submission(s).unwrap_err(), PortError::AlreadyAnswered);
    }

    #[test]
    fn closed_window_wins_over_already_answered() {
        let mut f = fixture();
        f.now = f.current.ended + Duration::seconds(1);
        let s = Submission { already_answered: true, ..submit(&f) };
        assert_eq!(check_submission(s).unwrap_err(), PortError::QuestionClosed);
    }
}
