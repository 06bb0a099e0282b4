//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `QuizRepository` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! Advancing and answering run at SERIALIZABLE isolation. Serialization failures are
//! reported as `PortError::SerializationConflict` so the service layer can retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tinyquiz_core::codes::{generate_random_code, CODE_RANDOM_BYTES};
use tinyquiz_core::domain::{
    normalize_player_name, Answer, AskedQuestion, Choice, CurrentQuestion, Game, GameOverview,
    NewGame, Player, PlayerContext, Question, QuestionWithChoices, Results, Session, Stats,
};
use tinyquiz_core::ledger::{check_submission, OwnedChoice, Submission};
use tinyquiz_core::ports::{PortError, PortResult, QuizRepository};
use tinyquiz_core::results::rank;
use tinyquiz_core::scheduler::{next_order_after, plan_advance, LatestAsked};
use tracing::debug;
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `QuizRepository` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    async fn begin(&self) -> PortResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(map_db_error)
    }

    async fn begin_serializable(&self) -> PortResult<Transaction<'static, Postgres>> {
        let mut tx = self.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        Ok(tx)
    }

    async fn next_code(tx: &mut Transaction<'static, Postgres>) -> PortResult<String> {
        let (incremental,): (i64,) = sqlx::query_as("SELECT nextval('codes_seq')")
            .fetch_one(&mut **tx)
            .await
            .map_err(map_db_error)?;
        generate_random_code(incremental as u64, CODE_RANDOM_BYTES)
    }
}

/// Translates driver errors into the port's error taxonomy.
fn map_db_error(e: sqlx::Error) -> PortError {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some("40001") | Some("40P01") => return PortError::SerializationConflict,
            Some("23505") => return PortError::ConstraintViolation(db.message().to_string()),
            _ => {}
        }
    }
    match e {
        sqlx::Error::RowNotFound => PortError::NoSuchEntity("row not found".to_string()),
        other => PortError::Unexpected(other.to_string()),
    }
}

fn not_found(what: String) -> impl FnOnce(sqlx::Error) -> PortError {
    move |e| match e {
        sqlx::Error::RowNotFound => PortError::NoSuchEntity(what),
        other => map_db_error(other),
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct GameRecord {
    id: Uuid,
    name: String,
    author: String,
    created: DateTime<Utc>,
    code: String,
}
impl GameRecord {
    fn to_domain(self) -> Game {
        Game {
            id: self.id,
            name: self.name,
            author: self.author,
            created: self.created,
            code: self.code,
        }
    }
}

#[derive(FromRow)]
struct QuestionRecord {
    id: Uuid,
    game_id: Uuid,
    title: String,
    ord: i32,
    default_length: i64,
}
impl QuestionRecord {
    fn to_domain(self) -> Question {
        Question {
            id: self.id,
            game_id: self.game_id,
            title: self.title,
            order: self.ord,
            default_length_ms: self.default_length.max(0) as u64,
        }
    }
}

#[derive(FromRow)]
struct ChoiceRecord {
    id: Uuid,
    question_id: Uuid,
    title: String,
    correct: bool,
}
impl ChoiceRecord {
    fn to_domain(self) -> Choice {
        Choice {
            id: self.id,
            question_id: self.question_id,
            title: self.title,
            correct: self.correct,
        }
    }
}

#[derive(FromRow)]
struct OwnedChoiceRecord {
    id: Uuid,
    question_id: Uuid,
    title: String,
    correct: bool,
    game_id: Uuid,
}
impl OwnedChoiceRecord {
    fn to_domain(self) -> OwnedChoice {
        OwnedChoice {
            choice: Choice {
                id: self.id,
                question_id: self.question_id,
                title: self.title,
                correct: self.correct,
            },
            game_id: self.game_id,
        }
    }
}

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    game_id: Uuid,
    created: DateTime<Utc>,
    started: Option<DateTime<Utc>>,
    code: String,
}
impl SessionRecord {
    fn to_domain(self) -> Session {
        Session {
            id: self.id,
            game_id: self.game_id,
            created: self.created,
            started: self.started,
            code: self.code,
        }
    }
}

#[derive(FromRow)]
struct PlayerRecord {
    id: Uuid,
    session_id: Uuid,
    game_id: Uuid,
    name: String,
    joined: DateTime<Utc>,
    organiser: bool,
}
impl PlayerRecord {
    fn to_domain(self) -> Player {
        Player {
            id: self.id,
            session_id: self.session_id,
            game_id: self.game_id,
            name: self.name,
            joined: self.joined,
            organiser: self.organiser,
        }
    }
}

#[derive(FromRow)]
struct ScoreRecord {
    #[sqlx(flatten)]
    player: PlayerRecord,
    correct: i64,
}

#[derive(FromRow)]
struct AskedRecord {
    id: Uuid,
    session_id: Uuid,
    question_id: Uuid,
    asked: DateTime<Utc>,
    ended: DateTime<Utc>,
}
impl AskedRecord {
    fn to_domain(self) -> AskedQuestion {
        AskedQuestion {
            id: self.id,
            session_id: self.session_id,
            question_id: self.question_id,
            asked: self.asked,
            ended: self.ended,
        }
    }
}

#[derive(FromRow)]
struct LatestAskedRecord {
    #[sqlx(flatten)]
    asked: AskedRecord,
    ord: i32,
}
impl LatestAskedRecord {
    fn to_domain(self) -> LatestAsked {
        LatestAsked {
            asked: self.asked.to_domain(),
            order: self.ord,
        }
    }
}

//=========================================================================================
// Shared Queries
//=========================================================================================

const PLAYER_COLUMNS: &str = "id, session_id, game_id, name, joined, organiser";

const LATEST_ASKED_SQL: &str = "SELECT aq.id, aq.session_id, aq.question_id, aq.asked, aq.ended, q.ord \
     FROM asked_questions aq JOIN questions q ON q.id = aq.question_id \
     WHERE aq.session_id = $1 ORDER BY q.ord DESC LIMIT 1";

async fn latest_asked(
    tx: &mut Transaction<'static, Postgres>,
    session_id: Uuid,
) -> PortResult<Option<LatestAsked>> {
    let record = sqlx::query_as::<_, LatestAskedRecord>(LATEST_ASKED_SQL)
        .bind(session_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_error)?;
    Ok(record.map(LatestAskedRecord::to_domain))
}

async fn fetch_player(
    tx: &mut Transaction<'static, Postgres>,
    player_id: Uuid,
) -> PortResult<Player> {
    let record = sqlx::query_as::<_, PlayerRecord>(&format!(
        "SELECT {} FROM players WHERE id = $1",
        PLAYER_COLUMNS
    ))
    .bind(player_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(not_found(format!("player {}", player_id)))?;
    Ok(record.to_domain())
}

async fn insert_player(
    tx: &mut Transaction<'static, Postgres>,
    session: &Session,
    name: &str,
    organiser: bool,
    now: DateTime<Utc>,
) -> PortResult<Player> {
    let record = sqlx::query_as::<_, PlayerRecord>(&format!(
        "INSERT INTO players (id, session_id, game_id, name, joined, organiser) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
        PLAYER_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(session.id)
    .bind(session.game_id)
    .bind(name)
    .bind(now)
    .bind(organiser)
    .fetch_one(&mut **tx)
    .await
    .map_err(map_db_error)?;
    Ok(record.to_domain())
}

async fn commit(tx: Transaction<'static, Postgres>) -> PortResult<()> {
    tx.commit().await.map_err(map_db_error)
}

//=========================================================================================
// `QuizRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl QuizRepository for DbAdapter {
    async fn get_stats(&self) -> PortResult<Stats> {
        let (games, players, sessions): (i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM games), (SELECT COUNT(*) FROM players), \
             (SELECT COUNT(*) FROM sessions)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(Stats {
            games: games as u64,
            players: players as u64,
            sessions: sessions as u64,
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
        let mut tx = self.begin().await?;
        let code = Self::next_code(&mut tx).await?;

        let record = sqlx::query_as::<_, GameRecord>(
            "INSERT INTO games (id, name, author, created, code) VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, name, author, created, code",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(author)
        .bind(now)
        .bind(&code)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;

        for (i, q) in game.questions.iter().enumerate() {
            let question_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO questions (id, game_id, title, ord, default_length) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(question_id)
            .bind(record.id)
            .bind(&q.title)
            .bind(i as i32 + 1)
            .bind(q.length_ms as i64)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;

            for (position, c) in q.choices.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO choices (id, question_id, position, title, correct) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(Uuid::new_v4())
                .bind(question_id)
                .bind(position as i32)
                .bind(&c.title)
                .bind(c.correct)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;
            }
        }

        commit(tx).await?;
        debug!(game_id = %record.id, code = %record.code, "game created");
        Ok(record.to_domain())
    }

    async fn get_game(&self, game_id: Uuid) -> PortResult<GameOverview> {
        let game = sqlx::query_as::<_, GameRecord>(
            "SELECT id, name, author, created, code FROM games WHERE id = $1",
        )
        .bind(game_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found(format!("game {}", game_id)))?
        .to_domain();

        let questions = sqlx::query_as::<_, QuestionRecord>(
            "SELECT id, game_id, title, ord, default_length FROM questions \
             WHERE game_id = $1 ORDER BY ord ASC",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        let mut choices = sqlx::query_as::<_, ChoiceRecord>(
            "SELECT c.id, c.question_id, c.title, c.correct FROM choices c \
             JOIN questions q ON q.id = c.question_id \
             WHERE q.game_id = $1 ORDER BY q.ord ASC, c.position ASC",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?
        .into_iter()
        .map(ChoiceRecord::to_domain)
        .peekable();

        let mut overview = Vec::with_capacity(questions.len());
        for q in questions {
            let question = q.to_domain();
            let mut own = Vec::new();
            while let Some(c) = choices.next_if(|c| c.question_id == question.id) {
                own.push(c);
            }
            overview.push(QuestionWithChoices {
                question,
                choices: own,
            });
        }
        Ok(GameOverview {
            game,
            questions: overview,
        })
    }

    async fn create_session(
        &self,
        organiser_name: &str,
        game_code: &str,
        now: DateTime<Utc>,
    ) -> PortResult<(Session, Player)> {
        let name = normalize_player_name(organiser_name)?;
        let mut tx = self.begin().await?;

        let (game_id,): (Uuid,) =
            sqlx::query_as("SELECT id FROM games WHERE upper(code) = upper($1)")
                .bind(game_code.trim())
                .fetch_one(&mut *tx)
                .await
                .map_err(not_found(format!("game with code {}", game_code)))?;

        let code = Self::next_code(&mut tx).await?;
        let session = sqlx::query_as::<_, SessionRecord>(
            "INSERT INTO sessions (id, game_id, created, code) VALUES ($1, $2, $3, $4) \
             RETURNING id, game_id, created, started, code",
        )
        .bind(Uuid::new_v4())
        .bind(game_id)
        .bind(now)
        .bind(&code)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?
        .to_domain();

        let organiser = insert_player(&mut tx, &session, &name, true, now).await?;
        commit(tx).await?;
        Ok((session, organiser))
    }

    async fn register_player(
        &self,
        player_name: &str,
        session_code: &str,
        now: DateTime<Utc>,
    ) -> PortResult<Player> {
        let name = normalize_player_name(player_name)?;
        let mut tx = self.begin().await?;

        let session = sqlx::query_as::<_, SessionRecord>(
            "SELECT id, game_id, created, started, code FROM sessions \
             WHERE upper(code) = upper($1)",
        )
        .bind(session_code.trim())
        .fetch_one(&mut *tx)
        .await
        .map_err(not_found(format!("session with code {}", session_code)))?
        .to_domain();

        let player = insert_player(&mut tx, &session, &name, false, now).await?;
        commit(tx).await?;
        Ok(player)
    }

    async fn get_player(&self, player_id: Uuid) -> PortResult<PlayerContext> {
        let mut tx = self.begin().await?;
        let player = fetch_player(&mut tx, player_id).await?;
        let session = sqlx::query_as::<_, SessionRecord>(
            "SELECT id, game_id, created, started, code FROM sessions WHERE id = $1",
        )
        .bind(player.session_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(not_found(format!("session {}", player.session_id)))?
        .to_domain();
        let game = sqlx::query_as::<_, GameRecord>(
            "SELECT id, name, author, created, code FROM games WHERE id = $1",
        )
        .bind(session.game_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(not_found(format!("game {}", session.game_id)))?
        .to_domain();
        commit(tx).await?;
        Ok(PlayerContext {
            player,
            session,
            game,
        })
    }

    async fn get_roster(&self, session_id: Uuid) -> PortResult<Vec<Player>> {
        let records = sqlx::query_as::<_, PlayerRecord>(&format!(
            "SELECT {} FROM players WHERE session_id = $1 ORDER BY joined ASC",
            PLAYER_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(records.into_iter().map(PlayerRecord::to_domain).collect())
    }

    async fn get_current_question(
        &self,
        session_id: Uuid,
    ) -> PortResult<Option<CurrentQuestion>> {
        let mut tx = self.begin().await?;
        let latest = match latest_asked(&mut tx, session_id).await? {
            Some(latest) => latest,
            None => return Ok(None),
        };
        let question = sqlx::query_as::<_, QuestionRecord>(
            "SELECT id, game_id, title, ord, default_length FROM questions WHERE id = $1",
        )
        .bind(latest.asked.question_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?
        .to_domain();
        let choices = sqlx::query_as::<_, ChoiceRecord>(
            "SELECT id, question_id, title, correct FROM choices \
             WHERE question_id = $1 ORDER BY position ASC",
        )
        .bind(question.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_error)?
        .into_iter()
        .map(ChoiceRecord::to_domain)
        .collect();
        commit(tx).await?;
        Ok(Some(CurrentQuestion {
            asked: latest.asked,
            question,
            choices,
        }))
    }

    async fn advance_question(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<AskedQuestion> {
        let mut tx = self.begin_serializable().await?;

        let (game_id,): (Uuid,) = sqlx::query_as("SELECT game_id FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(not_found(format!("session {}", session_id)))?;

        sqlx::query("UPDATE sessions SET started = $1 WHERE id = $2 AND started IS NULL")
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;

        let latest = latest_asked(&mut tx, session_id).await?;
        let next = sqlx::query_as::<_, QuestionRecord>(
            "SELECT id, game_id, title, ord, default_length FROM questions \
             WHERE game_id = $1 AND ($2::INTEGER IS NULL OR ord > $2) \
             ORDER BY ord ASC LIMIT 1",
        )
        .bind(game_id)
        .bind(next_order_after(latest.as_ref()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?
        .map(QuestionRecord::to_domain);

        let plan = plan_advance(session_id, latest.as_ref(), next.as_ref(), now)?;

        if let Some(close) = plan.close {
            sqlx::query("UPDATE asked_questions SET ended = $1 WHERE id = $2")
                .bind(plan.close_at)
                .bind(close)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;
        }
        if let Some(open) = &plan.open {
            sqlx::query(
                "INSERT INTO asked_questions (id, session_id, question_id, asked, ended) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(open.id)
            .bind(open.session_id)
            .bind(open.question_id)
            .bind(open.asked)
            .bind(open.ended)
            .execute(&mut *tx)
            .await
            .map_err(|e| match map_db_error(e) {
                // Another advance asked the same question first.
                PortError::ConstraintViolation(_) => PortError::SerializationConflict,
                other => other,
            })?;
        }

        commit(tx).await?;
        plan.into_outcome()
    }

    async fn save_answer(
        &self,
        player_id: Uuid,
        choice_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<Answer> {
        let mut tx = self.begin_serializable().await?;
        let player = fetch_player(&mut tx, player_id).await?;

        let choice = sqlx::query_as::<_, OwnedChoiceRecord>(
            "SELECT c.id, c.question_id, c.title, c.correct, q.game_id FROM choices c \
             JOIN questions q ON q.id = c.question_id WHERE c.id = $1",
        )
        .bind(choice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?
        .map(OwnedChoiceRecord::to_domain);

        let current = latest_asked(&mut tx, player.session_id)
            .await?
            .map(|l| l.asked);

        let already_answered = match &choice {
            Some(c) => {
                let (exists,): (bool,) = sqlx::query_as(
                    "SELECT EXISTS (SELECT 1 FROM answers WHERE player_id = $1 AND question_id = $2)",
                )
                .bind(player_id)
                .bind(c.choice.question_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_db_error)?;
                exists
            }
            None => false,
        };

        let answer = check_submission(Submission {
            player: &player,
            choice: choice.as_ref(),
            current: current.as_ref(),
            already_answered,
            now,
        })?;

        sqlx::query(
            "INSERT INTO answers (id, player_id, choice_id, question_id, answered) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(answer.id)
        .bind(answer.player_id)
        .bind(answer.choice_id)
        .bind(answer.question_id)
        .bind(answer.answered)
        .execute(&mut *tx)
        .await
        .map_err(|e| match map_db_error(e) {
            PortError::ConstraintViolation(_) => PortError::AlreadyAnswered,
            other => other,
        })?;

        commit(tx).await?;
        Ok(answer)
    }

    async fn get_results(&self, player_id: Uuid) -> PortResult<Results> {
        let mut tx = self.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;

        let player = fetch_player(&mut tx, player_id).await?;
        let session = sqlx::query_as::<_, SessionRecord>(
            "SELECT id, game_id, created, started, code FROM sessions WHERE id = $1",
        )
        .bind(player.session_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(not_found(format!("session {}", player.session_id)))?
        .to_domain();

        let scores = sqlx::query_as::<_, ScoreRecord>(
            "SELECT p.id, p.session_id, p.game_id, p.name, p.joined, p.organiser, \
             COUNT(c.id) FILTER (WHERE c.correct) AS correct \
             FROM players p \
             LEFT JOIN answers a ON a.player_id = p.id \
             LEFT JOIN choices c ON c.id = a.choice_id \
             WHERE p.session_id = $1 AND NOT p.organiser \
             GROUP BY p.id",
        )
        .bind(session.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_error)?;
        commit(tx).await?;

        let ranking = rank(
            scores
                .into_iter()
                .map(|s| (s.player.to_domain(), s.correct.max(0) as u64)),
        );
        Ok(Results {
            ranking,
            session,
            player,
        })
    }
}
