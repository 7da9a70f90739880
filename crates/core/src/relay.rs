//! Typed message bus between the requesting side and the engine host
//!
//! Envelopes travel through a chain of hops. Each hop runs in its own task,
//! checks the envelope's target, and either hands it to its local endpoint or
//! forwards it unchanged to the next hop.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{AnalyzeRequest, Candidate, SearchId};
use crate::error::{Error, Result};
use crate::session::SessionState;

/// Which side of the bus an envelope is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Target {
    Supervisor,
    Requester,
}

impl Target {
    /// Whether `message` may travel to this side at all
    pub fn admits(&self, message: &Message) -> bool {
        message.destination() == *self
    }
}

/// Coarse category of a message, used for logging and validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Start,
    SendCommand,
    Analysis,
    Control,
    Lifecycle,
    Error,
}

/// The move pushed to the presentation side once a search completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedMove {
    pub from: String,
    pub to: String,
    pub uci: String,
    pub eval: f64,
    pub multipv: u32,
    pub search_id: SearchId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl SelectedMove {
    pub fn new(candidate: &Candidate, search_id: SearchId, request_id: Option<String>) -> Self {
        Self {
            from: candidate.from.to_string(),
            to: candidate.to.to_string(),
            uci: candidate.uci.clone(),
            eval: candidate.eval,
            multipv: candidate.multipv,
            search_id,
            request_id,
        }
    }
}

/// Sent once per completed search, after its selection if there was one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSummary {
    pub search_id: SearchId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// False when the engine produced no candidate lines
    pub selected: bool,
}

/// Every message that may cross a boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    // Requester -> supervisor
    Start,
    SendCommand { command: String },
    Analyze(AnalyzeRequest),
    UpdateStrength { strength: f64 },
    Ping,
    Shutdown,
    // Supervisor -> requester
    Ready,
    Terminated,
    SelectedMove(SelectedMove),
    SearchFinished(SearchSummary),
    Error { message: String },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Start => MessageKind::Start,
            Message::SendCommand { .. } => MessageKind::SendCommand,
            Message::Analyze(_) | Message::SelectedMove(_) => MessageKind::Analysis,
            Message::UpdateStrength { .. } | Message::Ping | Message::Shutdown => MessageKind::Control,
            Message::Ready | Message::Terminated | Message::SearchFinished(_) => MessageKind::Lifecycle,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    /// The only side this message is meaningful to
    pub fn destination(&self) -> Target {
        match self {
            Message::Start
            | Message::SendCommand { .. }
            | Message::Analyze(_)
            | Message::UpdateStrength { .. }
            | Message::Ping
            | Message::Shutdown => Target::Supervisor,
            Message::Ready
            | Message::Terminated
            | Message::SelectedMove(_)
            | Message::SearchFinished(_)
            | Message::Error { .. } => Target::Requester,
        }
    }
}

/// Why an acknowledged request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    BootstrapFailure,
    RelayFailure,
    CommandRejected,
    InvalidRequest,
    InvalidStrength,
    Protocol,
}

/// Synchronous-style answer to a request envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_id: Option<SearchId>,
    /// The rejected value of a failed strength update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: &Error) -> Self {
        let (kind, state) = match error {
            Error::BootstrapFailure(_) => (FailureKind::BootstrapFailure, None),
            // A failed write takes the session down with it
            Error::Engine(_) => (FailureKind::CommandRejected, Some(SessionState::Failed)),
            Error::RelayFailure(_) => (FailureKind::RelayFailure, None),
            Error::CommandRejected(state) => (FailureKind::CommandRejected, Some(*state)),
            Error::InvalidRequest(_) => (FailureKind::InvalidRequest, None),
            Error::InvalidStrength(_) => (FailureKind::InvalidStrength, None),
            _ => (FailureKind::Protocol, None),
        };
        let strength = match error {
            Error::InvalidStrength(value) => Some(*value),
            _ => None,
        };
        Self {
            success: false,
            error: Some(error.to_string()),
            kind: Some(kind),
            state,
            strength,
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = Some(state);
        self.engine_ready = Some(state.is_ready());
        self
    }

    pub fn with_search(mut self, id: SearchId) -> Self {
        self.search_id = Some(id);
        self
    }

    /// Turns a failed ack back into the typed error it was built from
    pub fn into_result(self) -> Result<Ack> {
        if self.success {
            return Ok(self);
        }
        let message = self.error.clone().unwrap_or_else(|| "request failed".to_string());
        Err(match self.kind {
            Some(FailureKind::BootstrapFailure) => Error::BootstrapFailure(message),
            Some(FailureKind::RelayFailure) => Error::RelayFailure(message),
            Some(FailureKind::CommandRejected) => {
                Error::CommandRejected(self.state.unwrap_or(SessionState::Failed))
            }
            Some(FailureKind::InvalidRequest) => Error::InvalidRequest(message),
            Some(FailureKind::InvalidStrength) => Error::InvalidStrength(self.strength.unwrap_or(f64::NAN)),
            Some(FailureKind::Protocol) | None => Error::Protocol(message),
        })
    }
}

/// A message plus its address and, for requests, the reply slot
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub target: Target,
    #[serde(flatten)]
    pub message: Message,
    #[serde(skip)]
    pub reply: Option<oneshot::Sender<Ack>>,
}

impl Envelope {
    /// Addresses `message` to the only side that accepts it
    pub fn new(message: Message) -> Self {
        Self {
            target: message.destination(),
            message,
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: oneshot::Sender<Ack>) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Parses and validates an envelope received as JSON.
    ///
    /// Unknown message types and messages addressed to the wrong side are
    /// rejected.
    pub fn decode(json: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(json)
            .map_err(|e| Error::RelayFailure(format!("rejected envelope: {}", e)))?;
        if !envelope.target.admits(&envelope.message) {
            return Err(Error::RelayFailure(format!(
                "{:?} message cannot be addressed to {:?}",
                envelope.message.kind(),
                envelope.target
            )));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Answers the sender, if it is waiting for one
    pub fn acknowledge(&mut self, ack: Ack) {
        if let Some(reply) = self.reply.take() {
            if reply.send(ack).is_err() {
                debug!("requester stopped waiting for acknowledgement");
            }
        }
    }
}

/// What a hop decided to do with an envelope
#[derive(Debug)]
pub enum Routing {
    /// Pass it to the next hop unchanged
    Forward(Envelope),
    /// Deliver it to this hop's local endpoint
    Handle(Envelope),
    Reject(Envelope, String),
}

/// One message-passing boundary
pub trait Hop: Send + 'static {
    fn name(&self) -> &str;
    fn receive(&mut self, envelope: Envelope) -> Routing;
}

/// A boundary that handles envelopes for one target and forwards the rest
#[derive(Debug, Clone)]
pub struct Boundary {
    name: String,
    handles: Option<Target>,
}

impl Boundary {
    pub fn passthrough(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handles: None,
        }
    }

    pub fn endpoint(name: impl Into<String>, target: Target) -> Self {
        Self {
            name: name.into(),
            handles: Some(target),
        }
    }
}

impl Hop for Boundary {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&mut self, envelope: Envelope) -> Routing {
        if !envelope.target.admits(&envelope.message) {
            let reason = format!(
                "{:?} message cannot travel to {:?}",
                envelope.message.kind(),
                envelope.target
            );
            return Routing::Reject(envelope, reason);
        }
        match self.handles {
            Some(target) if target == envelope.target => Routing::Handle(envelope),
            _ => Routing::Forward(envelope),
        }
    }
}

struct Stage {
    hop: Box<dyn Hop>,
    local: Option<mpsc::Sender<Envelope>>,
}

pub struct RelayChainBuilder {
    stages: Vec<Stage>,
    capacity: usize,
}

impl RelayChainBuilder {
    /// Adds a hop with no local endpoint
    pub fn hop(mut self, hop: impl Hop) -> Self {
        self.stages.push(Stage {
            hop: Box::new(hop),
            local: None,
        });
        self
    }

    /// Adds a hop that delivers the envelopes it handles to `local`
    pub fn endpoint(mut self, hop: impl Hop, local: mpsc::Sender<Envelope>) -> Self {
        self.stages.push(Stage {
            hop: Box::new(hop),
            local: Some(local),
        });
        self
    }

    /// Starts one task per hop, wired in the order they were added
    pub fn spawn(self) -> RelayChain {
        let capacity = self.capacity.max(1);
        let mut next: Option<mpsc::Sender<Envelope>> = None;
        let mut tasks = Vec::with_capacity(self.stages.len());

        for stage in self.stages.into_iter().rev() {
            let (tx, rx) = mpsc::channel(capacity);
            tasks.push(tokio::spawn(run_hop(stage.hop, rx, next.take(), stage.local)));
            next = Some(tx);
        }

        let entry = next.unwrap_or_else(|| mpsc::channel(1).0);
        tasks.reverse();
        RelayChain { entry, tasks }
    }
}

/// A running sequence of hops; dropping every entry sender winds it down
pub struct RelayChain {
    entry: mpsc::Sender<Envelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayChain {
    pub fn builder(capacity: usize) -> RelayChainBuilder {
        RelayChainBuilder {
            stages: Vec::new(),
            capacity,
        }
    }

    /// Sender feeding the first hop
    pub fn entry(&self) -> mpsc::Sender<Envelope> {
        self.entry.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Closes the entry and waits for queued envelopes to drain through
    pub async fn shutdown(self) {
        drop(self.entry);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn run_hop(
    mut hop: Box<dyn Hop>,
    mut inbound: mpsc::Receiver<Envelope>,
    next: Option<mpsc::Sender<Envelope>>,
    local: Option<mpsc::Sender<Envelope>>,
) {
    let name = hop.name().to_string();
    while let Some(envelope) = inbound.recv().await {
        debug!(
            hop = %name,
            target = ?envelope.target,
            kind = ?envelope.message.kind(),
            "relaying envelope"
        );
        match hop.receive(envelope) {
            Routing::Forward(envelope) => deliver(&name, next.as_ref(), envelope).await,
            Routing::Handle(envelope) => deliver(&name, local.as_ref(), envelope).await,
            Routing::Reject(envelope, reason) => relay_failure(&name, envelope, &reason),
        }
    }
}

async fn deliver(hop: &str, to: Option<&mpsc::Sender<Envelope>>, envelope: Envelope) {
    let Some(to) = to else {
        relay_failure(hop, envelope, "no receiving endpoint");
        return;
    };
    if let Err(mpsc::error::SendError(envelope)) = to.send(envelope).await {
        relay_failure(hop, envelope, "receiving endpoint closed");
    }
}

/// Logs and swallows; a waiting requester gets a failed ack
fn relay_failure(hop: &str, mut envelope: Envelope, reason: &str) {
    let error = Error::RelayFailure(format!("{}: {}", hop, reason));
    warn!(hop, kind = ?envelope.message.kind(), error = %error, "dropping envelope");
    envelope.acknowledge(Ack::failure(&error));
}
