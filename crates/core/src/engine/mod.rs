//! Chess engine integration
//!
//! Process adapter, UCI protocol and streaming output parsing for
//! UCI-compatible engines like Stockfish.

pub mod analysis;
pub mod parser;
pub mod process;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use analysis::{
    AnalysisRequest, AnalysisResult, AnalyzeRequest, Candidate, Score, SearchId, Side, MATE_VALUE,
};
pub use parser::{parse_line, Aggregator, Completion, EngineLine, Feed, InfoLine, ParseError};
pub use process::{EngineError, EngineEvent, EngineLauncher, EngineProcess, ProcessLauncher};
pub use protocol::{Handshake, HandshakeStep, UciCommand};
