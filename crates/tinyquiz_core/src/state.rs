//! crates/tinyquiz_core/src/state.rs
//!
//! The snapshot pushed to every live subscriber of a session.
//!
//! Each section is optional. A subscriber replaces its view with every snapshot it
//! receives, so losing an intermediate one is harmless.

use crate::domain::{CurrentQuestion, Player};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<Vec<PlayerEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<QuestionUpdate>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub results: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PlayerEntry {
    pub organiser: bool,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionUpdate {
    pub title: String,
    /// Milliseconds left to answer.
    pub remaining_time: u64,
    pub answers: Vec<AnswerOption>,
}

/// A choice as shown to players. Never carries the correct flag.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AnswerOption {
    pub id: String,
    pub title: String,
}

impl StateUpdate {
    /// The roster section. `players` must already be ordered by join time.
    pub fn roster(players: &[Player]) -> Self {
        Self {
            players: Some(
                players
                    .iter()
                    .map(|p| PlayerEntry {
                        organiser: p.organiser,
                        name: p.name.clone(),
                    })
                    .collect(),
            ),
            ..Self::default()
        }
    }

    /// The question section, present only while the current question is open at `now`.
    pub fn question(current: Option<&CurrentQuestion>, now: DateTime<Utc>) -> Self {
        let question = current
            .filter(|c| c.asked.is_open_at(now))
            .map(|c| QuestionUpdate {
                title: c.question.title.clone(),
                remaining_time: remaining_ms(c.asked.ended, now),
                answers: c
                    .choices
                    .iter()
                    .map(|choice| AnswerOption {
                        id: choice.id.to_string(),
                        title: choice.title.clone(),
                    })
                    .collect(),
            });
        Self {
            question,
            ..Self::default()
        }
    }

    /// Tells every subscriber the game is over and results can be fetched.
    pub fn results_ready() -> Self {
        Self {
            results: true,
            ..Self::default()
        }
    }

    /// Combines independently computed sections into one snapshot.
    pub fn merge(self, other: StateUpdate) -> Self {
        Self {
            players: other.players.or(self.players),
            question: other.question.or(self.question),
            results: self.results || other.results,
        }
    }
}

/// Time left until `ended`, rounded to the nearest millisecond.
pub fn remaining_ms(ended: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let left = ended - now;
    match left.num_microseconds() {
        Some(us) if us > 0 => (us.saturating_add(500) / 1000) as u64,
        Some(_) => 0,
        None if left > chrono::Duration::zero() => left.num_milliseconds() as u64,
        None => 0,
    }
}
