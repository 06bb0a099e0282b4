//! services/api/src/adapters/memory.rs
//!
//! An in-process implementation of the `QuizRepository` port.
//!
//! All tables live behind one async mutex that every operation holds from its first
//! read to its last write, so operations are trivially serializable. Used for local
//! development (`STORAGE=memory`) and by the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tinyquiz_core::codes::{generate_random_code, CODE_RANDOM_BYTES};
use tinyquiz_core::domain::{
    normalize_player_name, Answer, AskedQuestion, Choice, CurrentQuestion, Game, GameOverview,
    NewGame, Player, PlayerContext, Question, QuestionWithChoices, Results, Session, Stats,
};
use tinyquiz_core::ledger::{check_submission, OwnedChoice, Submission};
use tinyquiz_core::ports::{PortError, PortResult, QuizRepository};
use tinyquiz_core::results::rank;
use tinyquiz_core::scheduler::{next_order_after, plan_advance, LatestAsked};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

#[derive(Default)]
pub struct MemoryAdapter {
    tables: Mutex<Tables>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct Tables {
    games: Vec<Game>,
    questions: Vec<Question>,
    /// Kept in insertion order, which is the display order within a question.
    choices: Vec<Choice>,
    sessions: Vec<Session>,
    /// Kept in join order.
    players: Vec<Player>,
    asked: Vec<AskedQuestion>,
    answers: Vec<Answer>,
    code_sequence: u64,
}

impl Tables {
    fn next_code(&mut self) -> PortResult<String> {
        self.code_sequence += 1;
        generate_random_code(self.code_sequence, CODE_RANDOM_BYTES)
    }

    fn game(&self, id: Uuid) -> PortResult<&Game> {
        self.games
            .iter()
            .find(|g| g.id == id)
            .ok_or_else(|| PortError::NoSuchEntity(format!("game {}", id)))
    }

    fn session(&self, id: Uuid) -> PortResult<&Session> {
        self.sessions
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| PortError::NoSuchEntity(format!("session {}", id)))
    }

    fn player(&self, id: Uuid) -> PortResult<&Player> {
        self.players
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| PortError::NoSuchEntity(format!("player {}", id)))
    }

    fn question(&self, id: Uuid) -> PortResult<&Question> {
        self.questions
            .iter()
            .find(|q| q.id == id)
            .ok_or_else(|| PortError::NoSuchEntity(format!("question {}", id)))
    }

    fn choices_of(&self, question_id: Uuid) -> Vec<Choice> {
        self.choices
            .iter()
            .filter(|c| c.question_id == question_id)
            .cloned()
            .collect()
    }

    /// The asked question with the highest play order in the session.
    fn latest_asked(&self, session_id: Uuid) -> PortResult<Option<LatestAsked>> {
        let mut latest: Option<LatestAsked> = None;
        for asked in self.asked.iter().filter(|a| a.session_id == session_id) {
            let order = self.question(asked.question_id)?.order;
            if latest.as_ref().map_or(true, |l| order > l.order) {
                latest = Some(LatestAsked {
                    asked: asked.clone(),
                    order,
                });
            }
        }
        Ok(latest)
    }

    fn next_question(&self, game_id: Uuid, after: Option<i32>) -> Option<&Question> {
        self.questions
            .iter()
            .filter(|q| q.game_id == game_id && after.map_or(true, |o| q.order > o))
            .min_by_key(|q| q.order)
    }

    fn add_player(
        &mut self,
        session: &Session,
        name: String,
        organiser: bool,
        now: DateTime<Utc>,
    ) -> PortResult<Player> {
        if self
            .players
            .iter()
            .any(|p| p.session_id == session.id && p.name.to_lowercase() == name)
        {
            return Err(PortError::ConstraintViolation(format!(
                "player {} already exists in the session",
                name
            )));
        }
        let player = Player {
            id: Uuid::new_v4(),
            session_id: session.id,
            game_id: session.game_id,
            name,
            joined: now,
            organiser,
        };
        self.players.push(player.clone());
        Ok(player)
    }
}

//=========================================================================================
// `QuizRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl QuizRepository for MemoryAdapter {
    async fn get_stats(&self) -> PortResult<Stats> {
        let t = self.tables.lock().await;
        Ok(Stats {
            games: t.games.len() as u64,
            players: t.players.len() as u64,
            sessions: t.sessions.len() as u64,
        })
    }

    async fn create_game(
        &self,
        game: NewGame,
        name: &str,
        author: &str,
        now: DateTime<Utc>,
    ) -> PortResult<Game> {
        game.validate()?;
        let mut t = self.tables.lock().await;
        let created = Game {
            id: Uuid::new_v4(),
            name: name.to_string(),
            author: author.to_string(),
            created: now,
            code: t.next_code()?,
        };
        for (i, q) in game.questions.into_iter().enumerate() {
            let question = Question {
                id: Uuid::new_v4(),
                game_id: created.id,
                title: q.title,
                order: i as i32 + 1,
                default_length_ms: q.length_ms,
            };
            for c in q.choices {
                t.choices.push(Choice {
                    id: Uuid::new_v4(),
                    question_id: question.id,
                    title: c.title,
                    correct: c.correct,
                });
            }
            t.questions.push(question);
        }
        t.games.push(created.clone());
        debug!(game_id = %created.id, code = %created.code, "game created");
        Ok(created)
    }

    async fn get_game(&self, game_id: Uuid) -> PortResult<GameOverview> {
        let t = self.tables.lock().await;
        let game = t.game(game_id)?.clone();
        let mut questions: Vec<&Question> =
            t.questions.iter().filter(|q| q.game_id == game_id).collect();
        questions.sort_by_key(|q| q.order);
        let questions = questions
            .into_iter()
            .map(|q| QuestionWithChoices {
                question: q.clone(),
                choices: t.choices_of(q.id),
            })
            .collect();
        Ok(GameOverview { game, questions })
    }

    async fn create_session(
        &self,
        organiser_name: &str,
        game_code: &str,
        now: DateTime<Utc>,
    ) -> PortResult<(Session, Player)> {
        let name = normalize_player_name(organiser_name)?;
        let mut t = self.tables.lock().await;
        let game_id = t
            .games
            .iter()
            .find(|g| g.code.eq_ignore_ascii_case(game_code.trim()))
            .map(|g| g.id)
            .ok_or_else(|| PortError::NoSuchEntity(format!("game with code {}", game_code)))?;
        let session = Session {
            id: Uuid::new_v4(),
            game_id,
            created: now,
            started: None,
            code: t.next_code()?,
        };
        t.sessions.push(session.clone());
        let organiser = t.add_player(&session, name, true, now)?;
        Ok((session, organiser))
    }

    async fn register_player(
        &self,
        player_name: &str,
        session_code: &str,
        now: DateTime<Utc>,
    ) -> PortResult<Player> {
        let name = normalize_player_name(player_name)?;
        let mut t = self.tables.lock().await;
        let session = t
            .sessions
            .iter()
            .find(|s| s.code.eq_ignore_ascii_case(session_code.trim()))
            .cloned()
            .ok_or_else(|| {
                PortError::NoSuchEntity(format!("session with code {}", session_code))
            })?;
        t.add_player(&session, name, false, now)
    }

    async fn get_player(&self, player_id: Uuid) -> PortResult<PlayerContext> {
        let t = self.tables.lock().await;
        let player = t.player(player_id)?.clone();
        let session = t.session(player.session_id)?.clone();
        let game = t.game(session.game_id)?.clone();
        Ok(PlayerContext {
            player,
            session,
            game,
        })
    }

    async fn get_roster(&self, session_id: Uuid) -> PortResult<Vec<Player>> {
        let t = self.tables.lock().await;
        let mut players: Vec<Player> = t
            .players
            .iter()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        players.sort_by_key(|p| p.joined);
        Ok(players)
    }

    async fn get_current_question(
        &self,
        session_id: Uuid,
    ) -> PortResult<Option<CurrentQuestion>> {
        let t = self.tables.lock().await;
        match t.latest_asked(session_id)? {
            Some(latest) => {
                let question = t.question(latest.asked.question_id)?.clone();
                let choices = t.choices_of(question.id);
                Ok(Some(CurrentQuestion {
                    asked: latest.asked,
                    question,
                    choices,
                }))
            }
            None => Ok(None),
        }
    }

    async fn advance_question(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<AskedQuestion> {
        let mut t = self.tables.lock().await;
        let game_id = t.session(session_id)?.game_id;

        let latest = t.latest_asked(session_id)?;
        let next = t
            .next_question(game_id, next_order_after(latest.as_ref()))
            .cloned();
        let plan = plan_advance(session_id, latest.as_ref(), next.as_ref(), now)?;

        if let Some(session) = t.sessions.iter_mut().find(|s| s.id == session_id) {
            session.started.get_or_insert(now);
        }
        if let Some(close) = plan.close {
            if let Some(asked) = t.asked.iter_mut().find(|a| a.id == close) {
                asked.ended = plan.close_at;
            }
        }
        if let Some(open) = &plan.open {
            t.asked.push(open.clone());
        }
        plan.into_outcome()
    }

    async fn save_answer(
        &self,
        player_id: Uuid,
        choice_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<Answer> {
        let mut t = self.tables.lock().await;
        let player = t.player(player_id)?.clone();

        let choice = match t.choices.iter().find(|c| c.id == choice_id) {
            Some(c) => Some(OwnedChoice {
                choice: c.clone(),
                game_id: t.question(c.question_id)?.game_id,
            }),
            None => None,
        };
        let current = t.latest_asked(player.session_id)?.map(|l| l.asked);
        let already_answered = choice.as_ref().map_or(false, |c| {
            t.answers
                .iter()
                .any(|a| a.player_id == player_id && a.question_id == c.choice.question_id)
        });

        let answer = check_submission(Submission {
            player: &player,
            choice: choice.as_ref(),
            current: current.as_ref(),
            already_answered,
            now,
        })?;
        t.answers.push(answer.clone());
        Ok(answer)
    }

    async fn get_results(&self, player_id: Uuid) -> PortResult<Results> {
        let t = self.tables.lock().await;
        let player = t.player(player_id)?.clone();
        let session = t.session(player.session_id)?.clone();

        let scores = t
            .players
            .iter()
            .filter(|p| p.session_id == session.id)
            .map(|p| {
                let correct = t
                    .answers
                    .iter()
                    .filter(|a| a.player_id == p.id)
                    .filter(|a| {
                        t.choices
                            .iter()
                            .any(|c| c.id == a.choice_id && c.correct)
                    })
                    .count() as u64;
                (p.clone(), correct)
            })
            .collect::<Vec<_>>();

        Ok(Results {
            ranking: rank(scores),
            session,
            player,
        })
    }
}
