//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.
//!
//! Every per-player endpoint is addressed by the player's id, which doubles as the
//! player's capability: whoever knows it acts as that player.

use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tinyquiz_core::domain::{GameOverview, NewChoice, NewGame, NewQuestion, PlayerContext, Results};
use tinyquiz_core::ports::PortError;
use tracing::{error, warn};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        stats_handler,
        create_game_handler,
        get_game_handler,
        create_session_handler,
        join_handler,
        player_handler,
        advance_handler,
        submit_answer_handler,
        results_handler,
    ),
    components(
        schemas(
            StatsResponse,
            CreateGameRequest,
            QuestionPayload,
            ChoicePayload,
            GameResponse,
            GameOverviewResponse,
            QuestionOverview,
            ChoiceOverview,
            CreateSessionRequest,
            CreateSessionResponse,
            JoinRequest,
            JoinResponse,
            PlayerResponse,
            AnswerResponse,
            ResultsResponse,
            RankingEntry,
        )
    ),
    tags(
        (name = "Tinyquiz API", description = "Live multi-player quiz sessions.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct StatsResponse {
    games: u64,
    players: u64,
    sessions: u64,
}

/// A game as uploaded by its author. Questions are asked in the given order.
#[derive(Deserialize, ToSchema)]
pub struct CreateGameRequest {
    name: String,
    author: String,
    questions: Vec<QuestionPayload>,
}

#[derive(Deserialize, ToSchema)]
pub struct QuestionPayload {
    title: String,
    /// How long the question stays open, in milliseconds.
    length_ms: u64,
    choices: Vec<ChoicePayload>,
}

#[derive(Deserialize, ToSchema)]
pub struct ChoicePayload {
    title: String,
    #[serde(default)]
    correct: bool,
}

impl CreateGameRequest {
    fn into_new_game(self) -> (NewGame, String, String) {
        let questions = self
            .questions
            .into_iter()
            .map(|q| NewQuestion {
                title: q.title,
                length_ms: q.length_ms,
                choices: q
                    .choices
                    .into_iter()
                    .map(|c| NewChoice {
                        title: c.title,
                        correct: c.correct,
                    })
                    .collect(),
            })
            .collect();
        (NewGame { questions }, self.name, self.author)
    }
}

#[derive(Serialize, ToSchema)]
pub struct GameResponse {
    game_id: Uuid,
    name: String,
    code: String,
}

#[derive(Serialize, ToSchema)]
pub struct GameOverviewResponse {
    game_id: Uuid,
    name: String,
    author: String,
    code: String,
    created: DateTime<Utc>,
    questions: Vec<QuestionOverview>,
}

#[derive(Serialize, ToSchema)]
pub struct QuestionOverview {
    question_id: Uuid,
    order: i32,
    title: String,
    length_ms: u64,
    choices: Vec<ChoiceOverview>,
}

#[derive(Serialize, ToSchema)]
pub struct ChoiceOverview {
    choice_id: Uuid,
    title: String,
    correct: bool,
}

impl From<GameOverview> for GameOverviewResponse {
    fn from(overview: GameOverview) -> Self {
        Self {
            game_id: overview.game.id,
            name: overview.game.name,
            author: overview.game.author,
            code: overview.game.code,
            created: overview.game.created,
            questions: overview
                .questions
                .into_iter()
                .map(|q| QuestionOverview {
                    question_id: q.question.id,
                    order: q.question.order,
                    title: q.question.title,
                    length_ms: q.question.default_length_ms,
                    choices: q
                        .choices
                        .into_iter()
                        .map(|c| ChoiceOverview {
                            choice_id: c.id,
                            title: c.title,
                            correct: c.correct,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    game_code: String,
    organiser: String,
}

/// The organiser's player id is the capability for running the session.
#[derive(Serialize, ToSchema)]
pub struct CreateSessionResponse {
    player_id: Uuid,
    session_id: Uuid,
    session_code: String,
}

#[derive(Deserialize, ToSchema)]
pub struct JoinRequest {
    player: String,
}

#[derive(Serialize, ToSchema)]
pub struct JoinResponse {
    player_id: Uuid,
    session_id: Uuid,
}

#[derive(Serialize, ToSchema)]
pub struct PlayerResponse {
    player_id: Uuid,
    name: String,
    organiser: bool,
    session_id: Uuid,
    session_code: String,
    started: Option<DateTime<Utc>>,
    game_name: String,
}

impl From<PlayerContext> for PlayerResponse {
    fn from(ctx: PlayerContext) -> Self {
        Self {
            player_id: ctx.player.id,
            name: ctx.player.name,
            organiser: ctx.player.organiser,
            session_id: ctx.session.id,
            session_code: ctx.session.code,
            started: ctx.session.started,
            game_name: ctx.game.name,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct AnswerResponse {
    answer_id: Uuid,
    question_id: Uuid,
    answered: DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
pub struct ResultsResponse {
    session_code: String,
    player: String,
    ranking: Vec<RankingEntry>,
}

#[derive(Serialize, ToSchema)]
pub struct RankingEntry {
    place: u64,
    name: String,
    correct: u64,
}

impl From<Results> for ResultsResponse {
    fn from(results: Results) -> Self {
        Self {
            session_code: results.session.code,
            player: results.player.name,
            ranking: results
                .ranking
                .into_iter()
                .map(|r| RankingEntry {
                    place: r.place,
                    name: r.player.name,
                    correct: r.correct,
                })
                .collect(),
        }
    }
}

//=========================================================================================
// Error Mapping
//=========================================================================================

/// Translates a port error into the HTTP status and message returned to the client.
pub fn port_error_response(e: PortError) -> (StatusCode, String) {
    let status = match &e {
        PortError::NoSuchEntity(_) => StatusCode::NOT_FOUND,
        PortError::ConstraintViolation(_) | PortError::AlreadyAnswered => StatusCode::CONFLICT,
        PortError::QuestionClosed => StatusCode::GONE,
        PortError::NoNextQuestion => StatusCode::NO_CONTENT,
        PortError::SerializationConflict => StatusCode::SERVICE_UNAVAILABLE,
        PortError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {:?}", e);
        (status, "Internal server error".to_string())
    } else {
        (status, e.to_string())
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Counts of games, players and sessions.
#[utoipa::path(
    get,
    path = "/stats",
    responses((status = 200, description = "Current totals", body = StatsResponse))
)]
pub async fn stats_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let stats = app_state
        .service
        .stats()
        .await
        .map_err(port_error_response)?;
    Ok(Json(StatsResponse {
        games: stats.games,
        players: stats.players,
        sessions: stats.sessions,
    }))
}

/// Upload a new game.
#[utoipa::path(
    post,
    path = "/games",
    request_body = CreateGameRequest,
    responses(
        (status = 201, description = "Game created", body = GameResponse),
        (status = 409, description = "The game is malformed")
    )
)]
pub async fn create_game_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateGameRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let (new_game, name, author) = payload.into_new_game();
    let game = app_state
        .service
        .create_game(new_game, &name, &author, Utc::now())
        .await
        .map_err(port_error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(GameResponse {
            game_id: game.id,
            name: game.name,
            code: game.code,
        }),
    ))
}

/// A game with all of its questions and choices, correct answers included.
#[utoipa::path(
    get,
    path = "/games/{game_id}",
    params(("game_id" = Uuid, Path, description = "The game's id.")),
    responses(
        (status = 200, description = "The game", body = GameOverviewResponse),
        (status = 404, description = "No such game")
    )
)]
pub async fn get_game_handler(
    State(app_state): State<Arc<AppState>>,
    Path(game_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let overview = app_state
        .service
        .game(game_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(GameOverviewResponse::from(overview)))
}

/// Start a session of a game. The caller becomes its organiser.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created successfully", body = CreateSessionResponse),
        (status = 404, description = "No game with this code"),
        (status = 409, description = "Invalid organiser name")
    )
)]
pub async fn create_session_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let (session, organiser) = app_state
        .service
        .create_session(&payload.organiser, &payload.game_code, Utc::now())
        .await
        .map_err(port_error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            player_id: organiser.id,
            session_id: session.id,
            session_code: session.code,
        }),
    ))
}

/// Join a session by its code.
#[utoipa::path(
    post,
    path = "/play/{session_code}",
    request_body = JoinRequest,
    params(("session_code" = String, Path, description = "The session's join code.")),
    responses(
        (status = 201, description = "Joined", body = JoinResponse),
        (status = 404, description = "No session with this code"),
        (status = 409, description = "Name invalid or already taken")
    )
)]
pub async fn join_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_code): Path<String>,
    Json(payload): Json<JoinRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let player = app_state
        .service
        .register_player(&payload.player, &session_code, Utc::now())
        .await
        .map_err(port_error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(JoinResponse {
            player_id: player.id,
            session_id: player.session_id,
        }),
    ))
}

/// The player, their session and the game being played.
#[utoipa::path(
    get,
    path = "/game/{player_id}",
    params(("player_id" = Uuid, Path, description = "The player's id.")),
    responses(
        (status = 200, description = "The player's view", body = PlayerResponse),
        (status = 404, description = "No such player")
    )
)]
pub async fn player_handler(
    State(app_state): State<Arc<AppState>>,
    Path(player_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let ctx = app_state
        .service
        .player(player_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(PlayerResponse::from(ctx)))
}

/// Close the open question and ask the next one. Organisers only.
///
/// Also answers 204 once the game has run out of questions; the subscribers are
/// then told that the results are ready.
#[utoipa::path(
    post,
    path = "/game/{player_id}/rpc/next",
    params(("player_id" = Uuid, Path, description = "The organiser's player id.")),
    responses(
        (status = 204, description = "Advanced, or no questions left"),
        (status = 403, description = "The player is not the organiser"),
        (status = 404, description = "No such player"),
        (status = 503, description = "Too much contention, try again")
    )
)]
pub async fn advance_handler(
    State(app_state): State<Arc<AppState>>,
    Path(player_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let ctx = app_state
        .service
        .player(player_id)
        .await
        .map_err(port_error_response)?;
    if !ctx.player.organiser {
        warn!(%player_id, "non-organiser tried to advance the session");
        return Err((
            StatusCode::FORBIDDEN,
            "Only the organiser can advance the session".to_string(),
        ));
    }

    match app_state
        .service
        .advance_question(ctx.session.id, Utc::now())
        .await
    {
        Ok(_) | Err(PortError::NoNextQuestion) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(port_error_response(e)),
    }
}

/// Answer the currently open question.
#[utoipa::path(
    post,
    path = "/game/{player_id}/answers/{choice_id}",
    params(
        ("player_id" = Uuid, Path, description = "The answering player's id."),
        ("choice_id" = Uuid, Path, description = "The chosen choice."),
    ),
    responses(
        (status = 201, description = "Answer recorded", body = AnswerResponse),
        (status = 404, description = "No such player or choice, or nothing asked yet"),
        (status = 409, description = "Already answered"),
        (status = 410, description = "The question is closed")
    )
)]
pub async fn submit_answer_handler(
    State(app_state): State<Arc<AppState>>,
    Path((player_id, choice_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let answer = app_state
        .service
        .submit_answer(player_id, choice_id, Utc::now())
        .await
        .map_err(port_error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(AnswerResponse {
            answer_id: answer.id,
            question_id: answer.question_id,
            answered: answer.answered,
        }),
    ))
}

/// The ranking of the player's session.
#[utoipa::path(
    get,
    path = "/results/{player_id}",
    params(("player_id" = Uuid, Path, description = "The player's id.")),
    responses(
        (status = 200, description = "The ranking", body = ResultsResponse),
        (status = 404, description = "No such player")
    )
)]
pub async fn results_handler(
    State(app_state): State<Arc<AppState>>,
    Path(player_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let results = app_state
        .service
        .results(player_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(ResultsResponse::from(results)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_errors_map_to_statuses() {
        let cases = [
            (PortError::NoSuchEntity("player".into()), StatusCode::NOT_FOUND),
            (PortError::ConstraintViolation("name".into()), StatusCode::CONFLICT),
            (PortError::AlreadyAnswered, StatusCode::CONFLICT),
            (PortError::QuestionClosed, StatusCode::GONE),
            (PortError::NoNextQuestion, StatusCode::NO_CONTENT),
            (PortError::SerializationConflict, StatusCode::SERVICE_UNAVAILABLE),
            (PortError::Unexpected("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(port_error_response(error).0, status);
        }
    }

    #[test]
    fn server_errors_hide_their_details() {
        let (_, message) = port_error_response(PortError::Unexpected("password=hunter2".into()));
        assert!(!message.contains("hunter2"));
    }
}
