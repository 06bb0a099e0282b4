//! crates/tinyquiz_core/src/scheduler.rs
//!
//! Decides what advancing a session does.
//!
//! Storage adapters load the latest asked question and the candidate next question
//! inside their serializable transaction, ask `plan_advance` what to do, and apply
//! the resulting plan before committing.

use crate::domain::{AskedQuestion, Question};
use crate::ports::{PortError, PortResult};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The most recently asked question of a session together with its play order.
#[derive(Debug, Clone)]
pub struct LatestAsked {
    pub asked: AskedQuestion,
    pub order: i32,
}

/// What an advance call must write.
#[derive(Debug, Clone)]
pub struct AdvancePlan {
    /// Asked question whose `ended` must be set to `close_at`.
    pub close: Option<Uuid>,
    pub close_at: DateTime<Utc>,
    /// Newly opened question, `None` when the game is exhausted.
    pub open: Option<AskedQuestion>,
}

impl AdvancePlan {
    /// The outcome reported to the caller once the plan is committed.
    pub fn into_outcome(self) -> PortResult<AskedQuestion> {
        self.open.ok_or(PortError::NoNextQuestion)
    }
}

/// Order strictly above which the next question must be looked up.
/// `None` means no question was asked yet and the first one is next.
pub fn next_order_after(latest: Option<&LatestAsked>) -> Option<i32> {
    latest.map(|l| l.order)
}

/// Plans one advance of `session_id` at `now`.
///
/// `next` must be the lowest-order question above `next_order_after(latest)`.
pub fn plan_advance(
    session_id: Uuid,
    latest: Option<&LatestAsked>,
    next: Option<&Question>,
    now: DateTime<Utc>,
) -> PortResult<AdvancePlan> {
    let close = latest
        .filter(|l| l.asked.is_open_at(now))
        .map(|l| l.asked.id);

    if let (Some(latest), Some(next)) = (latest, next) {
        if next.order <= latest.order {
            return Err(PortError::Unexpected(format!(
                "question order {} does not follow {}",
                next.order, latest.order
            )));
        }
    }

    let open = match next {
        Some(q) => {
            let ended = now.checked_add_signed(q.default_length()).ok_or_else(|| {
                PortError::ConstraintViolation(format!(
                    "answer window of question {} does not fit the calendar",
                    q.order
                ))
            })?;
            Some(AskedQuestion {
                id: Uuid::new_v4(),
                session_id,
                question_id: q.id,
                asked: now,
                ended,
            })
        }
        None => None,
    };

    Ok(AdvancePlan {
        close,
        close_at: now,
        open,
    })
}
