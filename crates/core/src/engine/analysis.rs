//! Types for representing requests, candidates and aggregated results

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use shakmaty::fen::Fen;
use shakmaty::{Color, Square};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Magnitude a mate score is scaled from; outranks any centipawn score
pub const MATE_VALUE: f64 = 1_000_000.0;

/// A raw engine score as reported on an `info` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    /// Centipawn score from the side to move's point of view
    Centipawns(i32),
    /// Moves to mate (positive = side to move mates)
    Mate(i32),
}

impl Score {
    /// Collapses the score onto one comparable axis.
    ///
    /// Mate in `n` maps to `MATE_VALUE / n`, so shorter mates rank higher.
    /// `mate 0` means the side to move is already mated.
    pub fn ranking_value(&self) -> f64 {
        match *self {
            Score::Centipawns(cp) => f64::from(cp),
            Score::Mate(moves) if moves > 0 => MATE_VALUE / f64::from(moves),
            Score::Mate(moves) if moves < 0 => -MATE_VALUE / f64::from(moves.unsigned_abs()),
            Score::Mate(_) => -MATE_VALUE,
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Centipawns(cp) => {
                let score = *cp as f32 / 100.0;
                if score >= 0.0 {
                    write!(f, "+{:.2}", score)
                } else {
                    write!(f, "{:.2}", score)
                }
            }
            Score::Mate(moves) => write!(f, "M{}", moves),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl From<Color> for Side {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }
}

/// Monotonically increasing id the supervisor assigns to every search
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchId(pub u64);

impl SearchId {
    /// Owner of searches started by raw `go` commands; never active
    pub const UNTRACKED: SearchId = SearchId(0);
}

impl fmt::Display for SearchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Analysis request as sent by a position source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub fen: String,
    #[serde(rename = "multiPV", default, skip_serializing_if = "Option::is_none")]
    pub multi_pv: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    /// Opaque correlation label echoed back on the selected move
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Whose point of view evaluations are ranked from; defaults to the side to move
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<Side>,
}

impl AnalyzeRequest {
    pub fn new(fen: impl Into<String>) -> Self {
        Self {
            fen: fen.into(),
            multi_pv: None,
            depth: None,
            request_id: None,
            player: None,
        }
    }

    pub fn multi_pv(mut self, multi_pv: u32) -> Self {
        self.multi_pv = Some(multi_pv);
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn player(mut self, side: Side) -> Self {
        self.player = Some(side);
        self
    }
}

/// A validated, immutable search issued to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub id: SearchId,
    pub fen: String,
    pub multi_pv: u32,
    pub depth: u32,
    pub side_to_move: Side,
    pub player: Side,
    pub request_id: Option<String>,
}

impl AnalysisRequest {
    /// Validates a wire request, filling gaps from the configured defaults
    pub fn from_wire(id: SearchId, request: AnalyzeRequest, config: &EngineConfig) -> Result<Self> {
        let fen = request.fen.trim().to_string();
        let parsed: Fen = fen
            .parse()
            .map_err(|e| Error::InvalidRequest(format!("bad FEN '{}': {}", fen, e)))?;
        let side_to_move = Side::from(parsed.as_setup().turn);

        let multi_pv = request.multi_pv.unwrap_or(config.multi_pv);
        if multi_pv == 0 {
            return Err(Error::InvalidRequest("multiPV must be at least 1".into()));
        }
        let depth = request.depth.unwrap_or(config.depth);
        if depth == 0 {
            return Err(Error::InvalidRequest("depth must be at least 1".into()));
        }

        Ok(Self {
            id,
            fen,
            multi_pv,
            depth,
            side_to_move,
            player: request.player.unwrap_or(side_to_move),
            request_id: request.request_id,
        })
    }

    /// Engine scores are relative to the side to move
    pub fn inverts_scores(&self) -> bool {
        self.player != self.side_to_move
    }
}

/// One of the engine's top lines, reduced to its first move
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub multipv: u32,
    pub score: Score,
    /// Ranking value from the requesting player's perspective
    pub eval: f64,
    pub from: Square,
    pub to: Square,
    /// First move of the principal variation in UCI notation (e.g., "e7e8q")
    pub uci: String,
}

/// Candidates accumulated for one search
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    search: SearchId,
    candidates: BTreeMap<u32, Candidate>,
    terminal: bool,
}

impl AnalysisResult {
    pub fn new(search: SearchId) -> Self {
        Self {
            search,
            candidates: BTreeMap::new(),
            terminal: false,
        }
    }

    pub fn search(&self) -> SearchId {
        self.search
    }

    /// Stores a candidate, replacing any earlier update for the same slot.
    ///
    /// Returns `false` once the result is terminal.
    pub fn record(&mut self, candidate: Candidate) -> bool {
        if self.terminal {
            return false;
        }
        self.candidates.insert(candidate.multipv, candidate);
        true
    }

    pub fn mark_terminal(&mut self) {
        self.terminal = true;
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidates in multipv order
    pub fn candidates(&self) -> Vec<Candidate> {
        self.candidates.values().cloned().collect()
    }
}
