//! services/api/tests/session_flow.rs
//!
//! Drives a whole session through the service layer: in-memory repository, a real
//! hub actor and a subscriber watching the pushes.

use api_lib::adapters::MemoryAdapter;
use api_lib::hub::{Hub, Subscription};
use api_lib::service::{QuizService, RetryPolicy};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tinyquiz_core::domain::{GameOverview, NewChoice, NewGame, NewQuestion};
use tinyquiz_core::ports::PortError;
use tinyquiz_core::state::{PlayerEntry, StateUpdate};
use uuid::Uuid;

fn quiz() -> NewGame {
    let question = |title: &str, right: &str, wrong: &str| NewQuestion {
        title: title.to_string(),
        length_ms: 30_000,
        choices: vec![
            NewChoice {
                title: right.to_string(),
                correct: true,
            },
            NewChoice {
                title: wrong.to_string(),
                correct: false,
            },
        ],
    };
    NewGame {
        questions: vec![
            question("Capital of France?", "Paris", "Lyon"),
            question("Largest planet?", "Jupiter", "Mars"),
        ],
    }
}

fn service() -> QuizService {
    QuizService::new(
        Arc::new(MemoryAdapter::new()),
        Hub::spawn(16),
        RetryPolicy::default(),
    )
}

/// (correct, wrong) choice ids of the question with the given order.
fn choices(overview: &GameOverview, order: i32) -> (Uuid, Uuid) {
    let question = overview
        .questions
        .iter()
        .find(|q| q.question.order == order)
        .expect("question exists");
    let correct = question.choices.iter().find(|c| c.correct).unwrap().id;
    let wrong = question.choices.iter().find(|c| !c.correct).unwrap().id;
    (correct, wrong)
}

async fn next_update(subscription: &mut Subscription) -> StateUpdate {
    let update = tokio::time::timeout(std::time::Duration::from_secs(1), subscription.recv())
        .await
        .expect("an update arrives")
        .expect("subscription is open");
    (*update).clone()
}

fn names(update: &StateUpdate) -> Vec<String> {
    update
        .players
        .as_ref()
        .expect("roster present")
        .iter()
        .map(|p| p.name.clone())
        .collect()
}

#[tokio::test]
async fn full_session_from_lobby_to_results() {
    let service = service();
    let t0: DateTime<Utc> = Utc::now();

    // --- Lobby ---
    let game = service
        .create_game(quiz(), "Trivia", "quizmaster", t0)
        .await
        .unwrap();
    let overview = service.game(game.id).await.unwrap();
    let (q1_right, q1_wrong) = choices(&overview, 1);
    let (q2_right, q2_wrong) = choices(&overview, 2);

    let (session, host) = service
        .create_session("Host", &game.code.to_lowercase(), t0)
        .await
        .unwrap();
    assert!(host.organiser);
    assert!(session.started.is_none());

    let mut watcher = service.subscribe(session.id, t0).await.unwrap();
    let snapshot = next_update(&mut watcher).await;
    assert_eq!(
        snapshot.players,
        Some(vec![PlayerEntry {
            organiser: true,
            name: "host".to_string(),
        }])
    );
    assert!(snapshot.question.is_none());
    assert!(!snapshot.results);

    let alice = service
        .register_player("  Alice ", &session.code, t0)
        .await
        .unwrap();
    assert_eq!(alice.name, "alice");
    assert_eq!(names(&next_update(&mut watcher).await), ["host", "alice"]);

    let bob = service.register_player("bob", &session.code, t0).await.unwrap();
    assert_eq!(names(&next_update(&mut watcher).await), ["host", "alice", "bob"]);

    assert!(matches!(
        service.register_player("BOB", &session.code, t0).await,
        Err(PortError::ConstraintViolation(_))
    ));

    // --- First question ---
    let t1 = t0 + Duration::seconds(1);
    let asked = service.advance_question(session.id, t1).await.unwrap();
    assert_eq!(asked.ended, t1 + Duration::seconds(30));

    let pushed = next_update(&mut watcher).await;
    assert!(pushed.players.is_none());
    let question = pushed.question.expect("question is open");
    assert_eq!(question.title, "Capital of France?");
    assert_eq!(question.remaining_time, 30_000);
    assert_eq!(question.answers.len(), 2);
    assert_eq!(question.answers[0].id, q1_right.to_string());

    service
        .submit_answer(alice.id, q1_right, t1 + Duration::seconds(5))
        .await
        .unwrap();
    service
        .submit_answer(bob.id, q1_wrong, t1 + Duration::seconds(6))
        .await
        .unwrap();
    assert_eq!(
        service
            .submit_answer(alice.id, q1_wrong, t1 + Duration::seconds(7))
            .await
            .unwrap_err(),
        PortError::AlreadyAnswered
    );

    // A late watcher gets roster and question in one snapshot.
    let mut late = service
        .subscribe(session.id, t1 + Duration::seconds(10))
        .await
        .unwrap();
    let snapshot = next_update(&mut late).await;
    assert_eq!(names(&snapshot), ["host", "alice", "bob"]);
    assert_eq!(snapshot.question.unwrap().remaining_time, 20_000);
    drop(late);

    // --- Second question ---
    let t2 = t1 + Duration::seconds(12);
    service.advance_question(session.id, t2).await.unwrap();
    let pushed = next_update(&mut watcher).await;
    assert_eq!(pushed.question.unwrap().title, "Largest planet?");

    // The first question closed when the second opened.
    assert_eq!(
        service.submit_answer(bob.id, q1_right, t2).await.unwrap_err(),
        PortError::QuestionClosed
    );

    service
        .submit_answer(bob.id, q2_wrong, t2 + Duration::seconds(3))
        .await
        .unwrap();
    // Expired without anyone advancing.
    assert_eq!(
        service
            .submit_answer(alice.id, q2_right, t2 + Duration::seconds(31))
            .await
            .unwrap_err(),
        PortError::QuestionClosed
    );
    let idle = service
        .question_update(session.id, t2 + Duration::seconds(31))
        .await
        .unwrap();
    assert!(idle.question.is_none());

    // --- Results ---
    let t3 = t2 + Duration::seconds(40);
    assert_eq!(
        service.advance_question(session.id, t3).await.unwrap_err(),
        PortError::NoNextQuestion
    );
    assert_eq!(next_update(&mut watcher).await, StateUpdate::results_ready());

    let results = service.results(bob.id).await.unwrap();
    assert_eq!(results.player.id, bob.id);
    let ranking: Vec<(String, u64, u64)> = results
        .ranking
        .iter()
        .map(|r| (r.player.name.clone(), r.correct, r.place))
        .collect();
    assert_eq!(
        ranking,
        vec![("alice".to_string(), 1, 1), ("bob".to_string(), 0, 2)]
    );

    let ctx = service.player(host.id).await.unwrap();
    assert_eq!(ctx.session.started, Some(t1));

    let stats = service.stats().await.unwrap();
    assert_eq!((stats.games, stats.sessions, stats.players), (1, 1, 3));
}

#[tokio::test]
async fn advancing_past_the_end_keeps_reporting_no_next_question() {
    let service = service();
    let now = Utc::now();
    let game = service.create_game(quiz(), "Trivia", "qm", now).await.unwrap();
    let (session, _) = service.create_session("host", &game.code, now).await.unwrap();

    let mut outcomes = Vec::new();
    for step in 0..4 {
        let at = now + Duration::seconds(step);
        outcomes.push(service.advance_question(session.id, at).await.map(|_| ()));
    }
    assert_eq!(
        outcomes,
        vec![
            Ok(()),
            Ok(()),
            Err(PortError::NoNextQuestion),
            Err(PortError::NoNextQuestion),
        ]
    );

    // Advancing closed the last question immediately.
    let state = service
        .question_update(session.id, now + Duration::seconds(3))
        .await
        .unwrap();
    assert!(state.question.is_none());
}

#[tokio::test]
async fn sessions_do_not_see_each_others_updates() {
    let service = service();
    let now = Utc::now();
    let game = service.create_game(quiz(), "Trivia", "qm", now).await.unwrap();
    let (first, _) = service.create_session("one", &game.code, now).await.unwrap();
    let (second, _) = service.create_session("two", &game.code, now).await.unwrap();

    let mut watcher = service.subscribe(first.id, now).await.unwrap();
    next_update(&mut watcher).await;
    let _other = service.subscribe(second.id, now).await.unwrap();
    assert_eq!(service.hub().count().await.unwrap(), (2, 2));

    service.advance_question(second.id, now).await.unwrap();
    service.register_player("carol", &first.code, now).await.unwrap();
    assert_eq!(names(&next_update(&mut watcher).await), ["one", "carol"]);

    drop(watcher);
    let (sessions, subscribers) = tokio::time::timeout(std::time::Duration::from_secs(1), async {
        loop {
            let counts = service.hub().count().await.unwrap();
            if counts.1 == 1 {
                return counts;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!((sessions, subscribers), (1, 1));
}

#[tokio::test]
async fn unknown_codes_and_players_are_reported() {
    let service = service();
    let now = Utc::now();
    assert!(matches!(
        service.create_session("host", "NOPE", now).await,
        Err(PortError::NoSuchEntity(_))
    ));
    assert!(matches!(
        service.register_player("alice", "NOPE", now).await,
        Err(PortError::NoSuchEntity(_))
    ));
    assert!(matches!(
        service.submit_answer(Uuid::new_v4(), Uuid::new_v4(), now).await,
        Err(PortError::NoSuchEntity(_))
    ));
    assert!(matches!(
        service.results(Uuid::new_v4()).await,
        Err(PortError::NoSuchEntity(_))
    ));
}

//=========================================================================================
// Concurrent play
//=========================================================================================

fn numbered_quiz(questions: usize) -> NewGame {
    NewGame {
        questions: (1..=questions)
            .map(|n| NewQuestion {
                title: format!("Q{}", n),
                length_ms: 30_000,
                choices: vec![
                    NewChoice {
                        title: "right".to_string(),
                        correct: true,
                    },
                    NewChoice {
                        title: "wrong".to_string(),
                        correct: false,
                    },
                ],
            })
            .collect(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_advances_ask_every_question_once_in_order() {
    let service = service();
    let now = Utc::now();
    let game = service
        .create_game(numbered_quiz(10), "Numbers", "qm", now)
        .await
        .unwrap();
    let overview = service.game(game.id).await.unwrap();
    let (session, _) = service.create_session("host", &game.code, now).await.unwrap();
    let alice = service.register_player("alice", &session.code, now).await.unwrap();

    let mut advances = tokio::task::JoinSet::new();
    for _ in 0..5 {
        let service = service.clone();
        let session_id = session.id;
        advances.spawn(async move { service.advance_question(session_id, now).await });
    }
    let mut asked = Vec::new();
    while let Some(outcome) = advances.join_next().await {
        asked.push(outcome.unwrap().unwrap().question_id);
    }

    let mut orders: Vec<i32> = asked
        .iter()
        .map(|id| {
            overview
                .questions
                .iter()
                .find(|q| q.question.id == *id)
                .unwrap()
                .question
                .order
        })
        .collect();
    orders.sort();
    assert_eq!(orders, [1, 2, 3, 4, 5]);

    let state = service.question_update(session.id, now).await.unwrap();
    assert_eq!(state.question.unwrap().title, "Q5");

    // Only the fifth question takes answers.
    for order in 1..=4 {
        let (right, _) = choices(&overview, order);
        assert_eq!(
            service.submit_answer(alice.id, right, now).await.unwrap_err(),
            PortError::QuestionClosed
        );
    }
    let (right, _) = choices(&overview, 5);
    service.submit_answer(alice.id, right, now).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_keep_one_answer() {
    let service = service();
    let now = Utc::now();
    let game = service.create_game(quiz(), "Trivia", "qm", now).await.unwrap();
    let overview = service.game(game.id).await.unwrap();
    let (session, _) = service.create_session("host", &game.code, now).await.unwrap();
    let alice = service.register_player("alice", &session.code, now).await.unwrap();
    service.advance_question(session.id, now).await.unwrap();
    let (right, wrong) = choices(&overview, 1);

    let mut submissions = tokio::task::JoinSet::new();
    for i in 0..8 {
        let service = service.clone();
        let alice_id = alice.id;
        let choice_id = if i % 2 == 0 { right } else { wrong };
        submissions.spawn(async move { service.submit_answer(alice_id, choice_id, now).await });
    }
    let mut accepted = Vec::new();
    while let Some(outcome) = submissions.join_next().await {
        match outcome.unwrap() {
            Ok(answer) => accepted.push(answer.choice_id),
            Err(e) => assert_eq!(e, PortError::AlreadyAnswered),
        }
    }
    assert_eq!(accepted.len(), 1);

    let results = service.results(alice.id).await.unwrap();
    let expected = u64::from(accepted[0] == right);
    assert_eq!(results.ranking[0].correct, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn answers_racing_an_advance_are_never_taken_after_the_close() {
    let service = service();
    let now = Utc::now();
    let game = service.create_game(quiz(), "Trivia", "qm", now).await.unwrap();
    let overview = service.game(game.id).await.unwrap();
    let (right, _) = choices(&overview, 1);

    for round in 0..20 {
        let (session, _) = service.create_session("host", &game.code, now).await.unwrap();
        let alice = service.register_player("alice", &session.code, now).await.unwrap();
        service.advance_question(session.id, now).await.unwrap();

        // Both happen at the same instant, so an answer seen after the close is late.
        let at = now + Duration::seconds(1);
        let (advanced, answered) = tokio::join!(
            tokio::spawn({
                let service = service.clone();
                let session_id = session.id;
                async move { service.advance_question(session_id, at).await }
            }),
            tokio::spawn({
                let service = service.clone();
                let alice_id = alice.id;
                async move { service.submit_answer(alice_id, right, at).await }
            }),
        );
        advanced.unwrap().unwrap();

        let scored = service.results(alice.id).await.unwrap().ranking[0].correct;
        match answered.unwrap() {
            Ok(_) => assert_eq!(scored, 1, "round {round}"),
            Err(e) => {
                assert_eq!(e, PortError::QuestionClosed, "round {round}");
                assert_eq!(scored, 0, "round {round}");
            }
        }
        assert_eq!(
            service.submit_answer(alice.id, right, at).await.unwrap_err(),
            PortError::QuestionClosed
        );
    }
}
