pub mod codes;
pub mod domain;
pub mod ledger;
pub mod ports;
pub mod results;
pub mod scheduler;
pub mod state;

pub use domain::{
    Answer, AskedQuestion, Choice, CurrentQuestion, Game, GameOverview, NewChoice, NewGame,
    NewQuestion, Player, PlayerContext, PlayerResult, Question, QuestionWithChoices, Results,
    Session, Stats,
};
pub use ports::{PortError, PortResult, QuizRepository};
pub use state::{AnswerOption, PlayerEntry, QuestionUpdate, StateUpdate};
