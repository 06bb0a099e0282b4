//! crates/tinyquiz_core/src/results.rs
//!
//! Scoreboard ranking.

use crate::domain::{Player, PlayerResult};

/// Ranks players by their number of correct answers.
///
/// Organisers are left out. Equal scores are ordered by name and share a place,
/// and the place after a tie skips ahead ("1, 2, 2, 4").
pub fn rank<I>(scores: I) -> Vec<PlayerResult>
where
    I: IntoIterator<Item = (Player, u64)>,
{
    let mut results: Vec<PlayerResult> = scores
        .into_iter()
        .filter(|(player, _)| !player.organiser)
        .map(|(player, correct)| PlayerResult {
            player,
            correct,
            place: 0,
        })
        .collect();

    results.sort_by(|a, b| {
        b.correct
            .cmp(&a.correct)
            .then_with(|| a.player.name.cmp(&b.player.name))
    });

    let mut previous: Option<(u64, u64)> = None;
    for (i, result) in results.iter_mut().enumerate() {
        result.place = match previous {
            Some((correct, place)) if correct == result.correct => place,
            _ => i as u64 + 1,
        };
        previous = Some((result.correct, result.place));
    }
    results
}
