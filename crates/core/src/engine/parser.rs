//! Streaming parser for engine output and per-search aggregation

use std::collections::VecDeque;

use shakmaty::Square;
use thiserror::Error;

use super::analysis::{AnalysisRequest, AnalysisResult, Candidate, Score, SearchId};

/// A malformed analysis line. Never fatal; the line is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing '{0}' token")]
    MissingToken(&'static str),

    #[error("invalid value for '{token}': {value}")]
    InvalidValue { token: &'static str, value: String },

    #[error("unknown score kind '{0}'")]
    UnknownScoreKind(String),

    #[error("invalid move '{0}'")]
    InvalidMove(String),
}

/// The fields of an `info ... multipv ...` line we rank on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoLine {
    pub multipv: u32,
    pub depth: Option<u32>,
    pub score: Score,
    /// Head of the principal variation
    pub first_move: String,
}

impl InfoLine {
    /// Converts to a candidate, flipping the score for the non-mover's view
    pub fn to_candidate(&self, invert: bool) -> Result<Candidate, ParseError> {
        let (from, to) = move_squares(&self.first_move)?;
        let eval = self.score.ranking_value();
        Ok(Candidate {
            multipv: self.multipv,
            score: self.score,
            eval: if invert { -eval } else { eval },
            from,
            to,
            uci: self.first_move.clone(),
        })
    }
}

/// One classified line of engine output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLine {
    UciOk,
    ReadyOk,
    Info(InfoLine),
    /// Search finished; the move is absent when the engine had nothing to play
    BestMove { mv: Option<String>, ponder: Option<String> },
    /// Anything irrelevant to analysis (`info string`, `info depth` without multipv, ...)
    Other,
}

/// Classifies a single line of engine output
pub fn parse_line(line: &str) -> Result<EngineLine, ParseError> {
    let line = line.trim();
    if line.starts_with("uciok") {
        return Ok(EngineLine::UciOk);
    }
    if line == "readyok" {
        return Ok(EngineLine::ReadyOk);
    }
    if line.starts_with("bestmove") {
        // Parse: "bestmove e2e4 ponder e7e5"
        let parts: Vec<&str> = line.split_whitespace().collect();
        let mv = parts
            .get(1)
            .filter(|m| **m != "(none)")
            .map(|m| m.to_string());
        let ponder = match parts.get(2) {
            Some(&"ponder") => parts.get(3).map(|m| m.to_string()),
            _ => None,
        };
        return Ok(EngineLine::BestMove { mv, ponder });
    }
    if line.starts_with("info") && line.split_whitespace().any(|t| t == "multipv") {
        return parse_info_line(line).map(EngineLine::Info);
    }
    Ok(EngineLine::Other)
}

fn parse_info_line(line: &str) -> Result<InfoLine, ParseError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let mut multipv = None;
    let mut depth = None;
    let mut score = None;
    let mut first_move = None;
    let mut i = 1;

    while i < parts.len() {
        match parts[i] {
            "multipv" => {
                multipv = Some(parse_number("multipv", parts.get(i + 1))?);
                i += 2;
            }
            "depth" => {
                depth = parts.get(i + 1).and_then(|d| d.parse().ok());
                i += 2;
            }
            "score" => {
                let kind = parts.get(i + 1).ok_or(ParseError::MissingToken("score"))?;
                let value: i32 = parse_number("score", parts.get(i + 2))?;
                score = Some(match *kind {
                    "cp" => Score::Centipawns(value),
                    "mate" => Score::Mate(value),
                    other => return Err(ParseError::UnknownScoreKind(other.to_string())),
                });
                // Skip a trailing bound marker ("lowerbound"/"upperbound")
                i += 3;
            }
            "pv" => {
                // Everything after "pv" is the principal variation; only the head matters
                first_move = parts.get(i + 1).map(|m| m.to_string());
                break;
            }
            _ => {
                i += 1;
            }
        }
    }

    Ok(InfoLine {
        multipv: multipv.ok_or(ParseError::MissingToken("multipv"))?,
        depth,
        score: score.ok_or(ParseError::MissingToken("score"))?,
        first_move: first_move.ok_or(ParseError::MissingToken("pv"))?,
    })
}

fn parse_number<T: std::str::FromStr>(token: &'static str, value: Option<&&str>) -> Result<T, ParseError> {
    let value = value.ok_or(ParseError::MissingToken(token))?;
    value.parse().map_err(|_| ParseError::InvalidValue {
        token,
        value: value.to_string(),
    })
}

fn move_squares(uci: &str) -> Result<(Square, Square), ParseError> {
    let invalid = || ParseError::InvalidMove(uci.to_string());
    let from = uci.get(0..2).ok_or_else(invalid)?;
    let to = uci.get(2..4).ok_or_else(invalid)?;
    Ok((
        from.parse().map_err(|_| invalid())?,
        to.parse().map_err(|_| invalid())?,
    ))
}

/// A search whose `bestmove` arrived while it was still the active one
#[derive(Debug, Clone)]
pub struct Completion {
    pub request: AnalysisRequest,
    pub result: AnalysisResult,
}

/// Outcome of feeding one engine line to the aggregator
#[derive(Debug, Clone)]
pub enum Feed {
    /// A candidate was stored (or replaced) for the active search
    Recorded,
    /// Not an analysis line
    Ignored,
    /// Analysis output with no search in flight
    Unattributed,
    /// Output of a search that has been superseded
    Stale(SearchId),
    /// The superseded search finished; nothing to select
    StaleCompleted(SearchId),
    Malformed(ParseError),
    Completed(Completion),
}

/// Attributes engine output to searches and accumulates the active one.
///
/// UCI output carries no request id, so every written `go` is recorded in
/// order and output is charged to the oldest search that has not yet
/// produced its `bestmove`.
#[derive(Debug, Default)]
pub struct Aggregator {
    in_flight: VecDeque<SearchId>,
    active: Option<(AnalysisRequest, AnalysisResult)>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `request` the active search, returning the one it supersedes
    pub fn activate(&mut self, request: AnalysisRequest) -> Option<SearchId> {
        let result = AnalysisResult::new(request.id);
        self.active
            .replace((request, result))
            .map(|(previous, _)| previous.id)
    }

    /// Records that the `go` for `id` has been written to the engine
    pub fn search_started(&mut self, id: SearchId) {
        self.in_flight.push_back(id);
    }

    pub fn active(&self) -> Option<SearchId> {
        self.active.as_ref().map(|(request, _)| request.id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Drops every search, e.g. after the engine went away
    pub fn reset(&mut self) {
        self.in_flight.clear();
        self.active = None;
    }

    pub fn feed(&mut self, line: &str) -> Feed {
        match parse_line(line) {
            Ok(EngineLine::Info(info)) => self.record(info),
            Ok(EngineLine::BestMove { .. }) => self.finish(),
            Ok(_) => Feed::Ignored,
            Err(e) => Feed::Malformed(e),
        }
    }

    fn record(&mut self, info: InfoLine) -> Feed {
        let Some(&owner) = self.in_flight.front() else {
            return Feed::Unattributed;
        };
        match self.active.as_mut() {
            Some((request, result)) if request.id == owner => {
                match info.to_candidate(request.inverts_scores()) {
                    Ok(candidate) => {
                        result.record(candidate);
                        Feed::Recorded
                    }
                    Err(e) => Feed::Malformed(e),
                }
            }
            _ => Feed::Stale(owner),
        }
    }

    fn finish(&mut self) -> Feed {
        let Some(owner) = self.in_flight.pop_front() else {
            return Feed::Unattributed;
        };
        match self.active.take() {
            Some((request, mut result)) if request.id == owner => {
                result.mark_terminal();
                Feed::Completed(Completion { request, result })
            }
            other => {
                self.active = other;
                Feed::StaleCompleted(owner)
            }
        }
    }
}
