//! Error types for chess-assist-core

use thiserror::Error;

use crate::engine::{EngineError, ParseError};
use crate::session::SessionState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Engine bootstrap failed: {0}")]
    BootstrapFailure(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Relay failure: {0}")]
    RelayFailure(String),

    #[error("Command rejected: engine session is {0}")]
    CommandRejected(SessionState),

    #[error("Invalid analysis request: {0}")]
    InvalidRequest(String),

    #[error("Invalid strength {0}: expected a value within [0, 1]")]
    InvalidStrength(f64),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Engine output parsing error: {0}")]
    Parse(#[from] ParseError),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
