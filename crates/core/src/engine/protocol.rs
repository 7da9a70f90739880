//! UCI command rendering and the bootstrap handshake

use std::fmt;

/// Commands written to the engine's stdin, one per line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UciCommand {
    Uci,
    IsReady,
    SetOption { name: String, value: String },
    /// `None` means the starting position
    Position { fen: Option<String>, moves: Vec<String> },
    GoDepth(u32),
    Stop,
    Quit,
    /// Forwarded verbatim
    Raw(String),
}

impl UciCommand {
    pub fn multi_pv(lines: u32) -> Self {
        UciCommand::SetOption {
            name: "MultiPV".to_string(),
            value: lines.to_string(),
        }
    }

    pub fn position(fen: impl Into<String>) -> Self {
        UciCommand::Position {
            fen: Some(fen.into()),
            moves: Vec::new(),
        }
    }
}

impl fmt::Display for UciCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UciCommand::Uci => f.write_str("uci"),
            UciCommand::IsReady => f.write_str("isready"),
            UciCommand::SetOption { name, value } => {
                write!(f, "setoption name {} value {}", name, value)
            }
            UciCommand::Position { fen, moves } => {
                match fen {
                    Some(fen) => write!(f, "position fen {}", fen)?,
                    None => f.write_str("position startpos")?,
                }
                if !moves.is_empty() {
                    write!(f, " moves {}", moves.join(" "))?;
                }
                Ok(())
            }
            UciCommand::GoDepth(depth) => write!(f, "go depth {}", depth),
            UciCommand::Stop => f.write_str("stop"),
            UciCommand::Quit => f.write_str("quit"),
            UciCommand::Raw(line) => f.write_str(line),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingUciOk,
    AwaitingReadyOk,
    Complete,
}

/// What the driver of a handshake should do after an engine line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Write this command to the engine
    Send(UciCommand),
    /// `readyok` arrived; the engine accepts commands now
    Ready,
    /// Expected chatter (`id`, `option`, blank lines)
    Pending,
    /// A line that has no business appearing before the handshake completes
    Unexpected(String),
}

/// The fixed `uci` → `uciok` → `isready` → `readyok` exchange.
///
/// Driven one line at a time so it can share an event loop with other
/// traffic.
#[derive(Debug)]
pub struct Handshake {
    phase: Phase,
}

impl Handshake {
    /// Starts a handshake, returning the first command to send
    pub fn begin() -> (Self, UciCommand) {
        (
            Handshake {
                phase: Phase::AwaitingUciOk,
            },
            UciCommand::Uci,
        )
    }

    pub fn on_line(&mut self, line: &str) -> HandshakeStep {
        let line = line.trim();
        match self.phase {
            Phase::AwaitingUciOk => {
                if line.starts_with("uciok") {
                    self.phase = Phase::AwaitingReadyOk;
                    HandshakeStep::Send(UciCommand::IsReady)
                } else if is_identification(line) {
                    HandshakeStep::Pending
                } else {
                    HandshakeStep::Unexpected(line.to_string())
                }
            }
            Phase::AwaitingReadyOk => {
                if line == "readyok" {
                    self.phase = Phase::Complete;
                    HandshakeStep::Ready
                } else if line.is_empty() {
                    HandshakeStep::Pending
                } else {
                    HandshakeStep::Unexpected(line.to_string())
                }
            }
            Phase::Complete => HandshakeStep::Pending,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    pub fn awaiting_ready(&self) -> bool {
        self.phase == Phase::AwaitingReadyOk
    }
}

fn is_identification(line: &str) -> bool {
    line.is_empty() || line.starts_with("id ") || line.starts_with("option ")
}
