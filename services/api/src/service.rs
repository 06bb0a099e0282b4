//! services/api/src/service.rs
//!
//! Orchestrates the repository and the broadcast hub.
//!
//! Every mutating operation runs its repository transaction first, retrying the whole
//! transaction on serialization conflicts, and only publishes the resulting snapshot
//! to the session's subscribers once the transaction has committed.
//!
//! Reading a snapshot and handing it to the hub happen under a per-session publish
//! lock. Subscribers therefore see snapshots in the order they were read, and a new
//! subscriber's full snapshot always precedes every later update.

use crate::hub::{Delivery, Hub, Subscription};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tinyquiz_core::domain::{
    Answer, AskedQuestion, Game, GameOverview, NewGame, Player, PlayerContext, Results, Session,
    Stats,
};
use tinyquiz_core::ports::{PortError, PortResult, QuizRepository};
use tinyquiz_core::state::StateUpdate;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// How often a transaction hitting a serialization conflict is attempted.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(5),
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the attempts
/// are used up. Waits a short randomized, growing delay between attempts.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> PortResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PortResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                let factor = 1u32 << (attempt - 1).min(6);
                let jitter = rand::thread_rng().gen_range(0..=policy.base_delay.as_millis() as u64);
                let delay = policy.base_delay * factor + Duration::from_millis(jitter);
                warn!(operation, attempt, ?delay, "serialization conflict, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

//=========================================================================================
// The Service
//=========================================================================================

/// Number of publish locks sessions are spread over.
const PUBLISH_LOCK_STRIPES: usize = 64;

#[derive(Clone)]
pub struct QuizService {
    repo: Arc<dyn QuizRepository>,
    hub: Hub,
    retry: RetryPolicy,
    publish_locks: Arc<[Mutex<()>]>,
}

impl QuizService {
    pub fn new(repo: Arc<dyn QuizRepository>, hub: Hub, retry: RetryPolicy) -> Self {
        Self {
            repo,
            hub,
            retry,
            publish_locks: (0..PUBLISH_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn publish_lock(&self, session_id: Uuid) -> &Mutex<()> {
        &self.publish_locks[(session_id.as_u128() % PUBLISH_LOCK_STRIPES as u128) as usize]
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub async fn stats(&self) -> PortResult<Stats> {
        self.repo.get_stats().await
    }

    #[instrument(skip(self, game), fields(questions = game.questions.len()))]
    pub async fn create_game(
        &self,
        game: NewGame,
        name: &str,
        author: &str,
        now: DateTime<Utc>,
    ) -> PortResult<Game> {
        let game = self.repo.create_game(game, name, author, now).await?;
        info!(game_id = %game.id, code = %game.code, "game created");
        Ok(game)
    }

    pub async fn game(&self, game_id: Uuid) -> PortResult<GameOverview> {
        self.repo.get_game(game_id).await
    }

    #[instrument(skip(self))]
    pub async fn create_session(
        &self,
        organiser_name: &str,
        game_code: &str,
        now: DateTime<Utc>,
    ) -> PortResult<(Session, Player)> {
        let (session, organiser) = self
            .repo
            .create_session(organiser_name, game_code, now)
            .await?;
        info!(session_id = %session.id, code = %session.code, "session created");
        self.publish_roster(session.id).await;
        Ok((session, organiser))
    }

    #[instrument(skip(self))]
    pub async fn register_player(
        &self,
        player_name: &str,
        session_code: &str,
        now: DateTime<Utc>,
    ) -> PortResult<Player> {
        let player = self
            .repo
            .register_player(player_name, session_code, now)
            .await?;
        info!(player_id = %player.id, session_id = %player.session_id, "player joined");
        self.publish_roster(player.session_id).await;
        Ok(player)
    }

    pub async fn player(&self, player_id: Uuid) -> PortResult<PlayerContext> {
        self.repo.get_player(player_id).await
    }

    /// Advances the session and tells its subscribers what is shown now.
    ///
    /// When the game is exhausted the subscribers are told that results are ready
    /// and `NoNextQuestion` is returned.
    #[instrument(skip(self))]
    pub async fn advance_question(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<AskedQuestion> {
        let outcome = with_retry(self.retry, "advance_question", || {
            self.repo.advance_question(session_id, now)
        })
        .await;

        match outcome {
            Ok(asked) => {
                info!(question_id = %asked.question_id, "question opened");
                self.publish_question(session_id, now).await;
                Ok(asked)
            }
            Err(PortError::NoNextQuestion) => {
                info!("no next question, results are ready");
                let _guard = self.publish_lock(session_id).lock().await;
                self.hub
                    .publish(session_id, StateUpdate::results_ready())
                    .await;
                Err(PortError::NoNextQuestion)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    pub async fn submit_answer(
        &self,
        player_id: Uuid,
        choice_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<Answer> {
        with_retry(self.retry, "submit_answer", || {
            self.repo.save_answer(player_id, choice_id, now)
        })
        .await
    }

    pub async fn results(&self, player_id: Uuid) -> PortResult<Results> {
        self.repo.get_results(player_id).await
    }

    //=====================================================================================
    // Snapshots
    //=====================================================================================

    pub async fn roster_update(&self, session_id: Uuid) -> PortResult<StateUpdate> {
        let players = self.repo.get_roster(session_id).await?;
        Ok(StateUpdate::roster(&players))
    }

    pub async fn question_update(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<StateUpdate> {
        let current = self.repo.get_current_question(session_id).await?;
        Ok(StateUpdate::question(current.as_ref(), now))
    }

    pub async fn full_update(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<StateUpdate> {
        let roster = self.roster_update(session_id).await?;
        Ok(roster.merge(self.question_update(session_id, now).await?))
    }

    /// Subscribes to the session and queues a full snapshot as the first message.
    ///
    /// Registration, the snapshot read and queueing it all happen under the
    /// session's publish lock, so nothing is published to the new subscriber before
    /// its snapshot and every later update was read after it.
    #[instrument(skip(self))]
    pub async fn subscribe(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<Subscription> {
        let _guard = self.publish_lock(session_id).lock().await;
        let subscription = self
            .hub
            .subscribe(session_id)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        let snapshot = self.full_update(session_id, now).await?;
        if !subscription.offer(snapshot) {
            warn!(subscriber_id = subscription.id(), "could not queue the initial snapshot");
        }
        Ok(subscription)
    }

    // The change is committed by the time these run, so a failed read only costs
    // the subscribers one update and is never reported to the caller.

    async fn publish_question(&self, session_id: Uuid, now: DateTime<Utc>) -> Delivery {
        let _guard = self.publish_lock(session_id).lock().await;
        match self.question_update(session_id, now).await {
            Ok(update) => self.hub.publish(session_id, update).await,
            Err(e) => {
                warn!(%session_id, error = %e, "failed to build the question update");
                Delivery::default()
            }
        }
    }

    async fn publish_roster(&self, session_id: Uuid) -> Delivery {
        let _guard = self.publish_lock(session_id).lock().await;
        match self.roster_update(session_id).await {
            Ok(update) => self.hub.publish(session_id, update).await,
            Err(e) => {
                warn!(%session_id, error = %e, "failed to build the roster update");
                Delivery::default()
            }
        }
    }
}
