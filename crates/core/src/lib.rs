//! Chess Assist Core Library
//!
//! Supervises a UCI engine process and turns its multipv output into a
//! single, strength-calibrated move recommendation.

pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod relay;
pub mod selector;
pub mod session;
pub mod supervisor;

pub use config::EngineConfig;
pub use engine::{AnalyzeRequest, Candidate, ProcessLauncher, Score, SearchId, Side};
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use relay::{Ack, Envelope, Message, SearchSummary, SelectedMove, Target};
pub use selector::{select, Strength};
pub use session::SessionState;
pub use supervisor::{Supervisor, SupervisorHandle};
