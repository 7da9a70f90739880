//! Engine session state owned by the supervisor

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::SearchId;
use crate::error::{Error, Result};

/// Lifecycle of the single engine process behind a supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Uninitialized,
    /// Process launched, `uci` sent, waiting for `uciok`
    Bootstrapping,
    /// `isready` sent, waiting for `readyok`
    AwaitingReady,
    Ready,
    /// A search is outstanding
    Busy,
    Failed,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Bootstrapping => "bootstrapping",
            SessionState::AwaitingReady => "awaitingReady",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Failed => "failed",
            SessionState::Terminated => "terminated",
        }
    }

    /// Commands go straight to the engine only in these states
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Busy)
    }

    /// A handshake is in flight
    pub fn is_bootstrapping(&self) -> bool {
        matches!(self, SessionState::Bootstrapping | SessionState::AwaitingReady)
    }

    /// Commands submitted in these states are rejected instead of queued
    pub fn rejects_commands(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Terminated)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Failed, Failed) => false,
            (_, Failed) => true,
            (Uninitialized | Failed, Bootstrapping) => true,
            (Bootstrapping, AwaitingReady) => true,
            (AwaitingReady, Ready) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command held back until the handshake completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub line: String,
    /// Set when the command starts a search (`go`)
    pub search: Option<SearchId>,
}

impl PendingCommand {
    pub fn plain(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            search: None,
        }
    }

    /// A command passed through verbatim.
    ///
    /// A raw `go` still occupies the engine, so it is tagged as an
    /// untracked search and its output is never taken for someone else's.
    pub fn raw(line: impl Into<String>) -> Self {
        let line = line.into();
        let starts_search = line.split_whitespace().next() == Some("go");
        Self {
            search: starts_search.then_some(SearchId::UNTRACKED),
            line,
        }
    }

    pub fn search(line: impl Into<String>, id: SearchId) -> Self {
        Self {
            line: line.into(),
            search: Some(id),
        }
    }
}

/// Session state plus the FIFO of commands awaiting readiness
#[derive(Debug)]
pub struct EngineSession {
    state: SessionState,
    pending: VecDeque<PendingCommand>,
}

impl EngineSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) -> Result<SessionState> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    pub fn enqueue(&mut self, command: PendingCommand) {
        self.pending.push_back(command);
    }

    /// Removes and returns every queued command in issuance order
    pub fn drain_pending(&mut self) -> Vec<PendingCommand> {
        self.pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingCommand> {
        self.pending.iter()
    }
}

impl Default for EngineSession {
    fn default() -> Self {
        Self::new()
    }
}
