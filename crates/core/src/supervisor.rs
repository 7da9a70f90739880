//! Engine supervisor
//!
//! A single task owns the engine process, its session state and the queue of
//! commands waiting for readiness. Requesters talk to it only through
//! envelopes; pushes go back out through the outbox.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::engine::{
    AnalysisRequest, AnalyzeRequest, Aggregator, Completion, EngineError, EngineEvent, EngineLauncher,
    EngineProcess, Feed, Handshake, HandshakeStep, SearchId, UciCommand,
};
use crate::error::{Error, Result};
use crate::relay::{Ack, Envelope, Message, SearchSummary, SelectedMove, Target};
use crate::selector::{self, Strength};
use crate::session::{EngineSession, PendingCommand, SessionState};

pub struct Supervisor {
    config: EngineConfig,
    launcher: Arc<dyn EngineLauncher>,
    session: EngineSession,
    engine: Option<EngineProcess>,
    handshake: Option<Handshake>,
    /// When the in-flight handshake gives up
    deadline: Option<Instant>,
    /// `start` callers waiting on the in-flight handshake
    start_waiters: Vec<oneshot::Sender<Ack>>,
    aggregator: Aggregator,
    last_search: u64,
    strength: Strength,
    outbox: mpsc::Sender<Envelope>,
}

impl Supervisor {
    pub fn new(
        config: EngineConfig,
        launcher: Arc<dyn EngineLauncher>,
        outbox: mpsc::Sender<Envelope>,
    ) -> Result<Self> {
        config.validate()?;
        let strength = Strength::new(config.strength)?;
        Ok(Self {
            config,
            launcher,
            session: EngineSession::new(),
            engine: None,
            handshake: None,
            deadline: None,
            start_waiters: Vec::new(),
            aggregator: Aggregator::new(),
            last_search: 0,
            strength,
            outbox,
        })
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Runs the supervisor on its own task.
    ///
    /// The task ends once every sender for its inbox has been dropped.
    pub fn spawn(self) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let task = tokio::spawn(self.run(rx));
        (SupervisorHandle::new(tx), task)
    }

    /// Inbox of a supervisor spawned behind a relay chain
    pub fn spawn_with_inbox(self, inbox: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbox))
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<Envelope>) {
        loop {
            tokio::select! {
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.handle(envelope).await,
                    None => break,
                },
                Some(event) = next_event(&mut self.engine) => self.on_engine_event(event).await,
                _ = expire(self.deadline) => self.on_handshake_timeout().await,
            }
        }
        debug!("supervisor inbox closed");
        self.teardown().await;
    }

    async fn handle(&mut self, envelope: Envelope) {
        let Envelope {
            target,
            message,
            reply,
        } = envelope;

        if target != Target::Supervisor || !target.admits(&message) {
            let error = Error::RelayFailure(format!("{:?} message is not for the supervisor", message.kind()));
            warn!(error = %error, "rejecting envelope");
            answer(reply, Ack::failure(&error));
            return;
        }

        match message {
            Message::Start => self.start(reply).await,
            Message::SendCommand { command } => {
                let outcome = self.submit(PendingCommand::raw(command)).await;
                answer(reply, self.ack(outcome.map(|_| Ack::ok())));
            }
            Message::Analyze(request) => {
                let outcome = self.submit_request(request).await;
                answer(reply, self.ack(outcome.map(|id| Ack::ok().with_search(id))));
            }
            Message::UpdateStrength { strength } => {
                let outcome = Strength::new(strength).map(|strength| {
                    info!(%strength, "selection strength updated");
                    self.strength = strength;
                    Ack::ok()
                });
                answer(reply, self.ack(outcome));
            }
            Message::Ping => answer(reply, Ack::ok().with_state(self.session.state())),
            Message::Shutdown => {
                self.teardown().await;
                answer(reply, Ack::ok().with_state(self.session.state()));
            }
            other => {
                let error = Error::RelayFailure(format!("unhandled {:?} message", other.kind()));
                answer(reply, Ack::failure(&error));
            }
        }
    }

    fn ack(&self, outcome: Result<Ack>) -> Ack {
        match outcome {
            Ok(ack) => ack.with_state(self.session.state()),
            Err(e) => {
                debug!(error = %e, "request failed");
                Ack::failure(&e)
            }
        }
    }

    async fn start(&mut self, reply: Option<oneshot::Sender<Ack>>) {
        match self.session.state() {
            state if state.is_ready() => {
                trace!("start while ready; nothing to do");
                answer(reply, Ack::ok().with_state(state));
            }
            state if state.is_bootstrapping() => {
                debug!("joining in-flight handshake");
                self.start_waiters.extend(reply);
            }
            SessionState::Terminated => {
                answer(reply, Ack::failure(&Error::CommandRejected(SessionState::Terminated)));
            }
            _ => {
                self.start_waiters.extend(reply);
                self.bootstrap().await;
            }
        }
    }

    async fn bootstrap(&mut self) {
        if !self.set_state(SessionState::Bootstrapping) {
            return;
        }
        info!(path = %self.config.path.display(), "starting engine");

        let mut engine = match self.launcher.launch(&self.config) {
            Ok(engine) => engine,
            Err(e) => {
                self.fail(Error::BootstrapFailure(e.to_string())).await;
                return;
            }
        };
        let (handshake, first) = Handshake::begin();
        if let Err(e) = engine.send(&first.to_string()).await {
            self.fail(Error::BootstrapFailure(e.to_string())).await;
            return;
        }

        self.engine = Some(engine);
        self.handshake = Some(handshake);
        self.deadline = Some(Instant::now() + self.config.handshake_timeout());
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Line(line) if self.handshake.is_some() => self.advance_handshake(&line).await,
            EngineEvent::Line(line) => self.on_analysis_line(&line).await,
            EngineEvent::Exited => {
                let error = if self.handshake.is_some() {
                    Error::BootstrapFailure("engine exited during handshake".into())
                } else {
                    Error::Engine(EngineError::Closed)
                };
                self.fail(error).await;
            }
        }
    }

    async fn advance_handshake(&mut self, line: &str) {
        let Some(handshake) = self.handshake.as_mut() else {
            return;
        };
        match handshake.on_line(line) {
            HandshakeStep::Send(command) => {
                if let Err(e) = self.write(&command.to_string()).await {
                    self.fail(Error::BootstrapFailure(e.to_string())).await;
                    return;
                }
                self.set_state(SessionState::AwaitingReady);
            }
            HandshakeStep::Ready => self.on_ready().await,
            HandshakeStep::Pending => trace!(line, "handshake chatter"),
            HandshakeStep::Unexpected(line) => {
                let error = Error::Protocol(format!("unexpected '{}' during handshake", line));
                warn!(error = %error, "ignoring line");
            }
        }
    }

    async fn on_ready(&mut self) {
        self.handshake = None;
        self.deadline = None;
        if !self.set_state(SessionState::Ready) {
            return;
        }

        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Ack::ok().with_state(SessionState::Ready));
        }
        self.emit(Message::Ready);

        let pending = self.session.drain_pending();
        if !pending.is_empty() {
            debug!(count = pending.len(), "flushing queued commands");
        }
        for command in pending {
            if let Err(e) = self.dispatch(command).await {
                self.fail(Error::Engine(e)).await;
                return;
            }
        }
        if self.aggregator.active().is_some() {
            self.set_state(SessionState::Busy);
        }
    }

    /// Forwards to the engine when ready, queues otherwise
    async fn submit(&mut self, command: PendingCommand) -> Result<()> {
        let state = self.session.state();
        if state.rejects_commands() {
            return Err(Error::CommandRejected(state));
        }
        if !state.is_ready() {
            debug!(command = %command.line, %state, "queueing until engine is ready");
            self.session.enqueue(command);
            return Ok(());
        }
        if let Err(e) = self.dispatch(command).await {
            let error = Error::Engine(e);
            warn!(error = %error, "engine write failed");
            self.fail(Error::Engine(EngineError::Closed)).await;
            return Err(error);
        }
        Ok(())
    }

    async fn submit_request(&mut self, wire: AnalyzeRequest) -> Result<SearchId> {
        let state = self.session.state();
        if state.rejects_commands() {
            return Err(Error::CommandRejected(state));
        }
        let id = SearchId(self.last_search + 1);
        let request = AnalysisRequest::from_wire(id, wire, &self.config)?;
        self.last_search = id.0;

        let multi_pv = UciCommand::multi_pv(request.multi_pv).to_string();
        let position = UciCommand::position(request.fen.clone()).to_string();
        let go = UciCommand::GoDepth(request.depth).to_string();
        info!(search = %id, fen = %request.fen, multi_pv = request.multi_pv, depth = request.depth, "analysis requested");

        let outstanding = self.aggregator.in_flight() > 0 || self.session.pending().any(|c| c.search.is_some());
        let superseded = self.aggregator.activate(request);
        if superseded.is_some() || outstanding {
            debug!(superseded = ?superseded, search = %id, "stopping outstanding search");
            self.submit(PendingCommand::plain(UciCommand::Stop.to_string())).await?;
        }
        self.submit(PendingCommand::plain(multi_pv)).await?;
        self.submit(PendingCommand::plain(position)).await?;
        self.submit(PendingCommand::search(go, id)).await?;

        if self.session.state() == SessionState::Ready {
            self.set_state(SessionState::Busy);
        }
        Ok(id)
    }

    async fn dispatch(&mut self, command: PendingCommand) -> std::result::Result<(), EngineError> {
        self.write(&command.line).await?;
        if let Some(id) = command.search {
            self.aggregator.search_started(id);
        }
        Ok(())
    }

    async fn write(&mut self, line: &str) -> std::result::Result<(), EngineError> {
        match self.engine.as_mut() {
            Some(engine) => engine.send(line).await,
            None => Err(EngineError::Closed),
        }
    }

    async fn on_analysis_line(&mut self, line: &str) {
        match self.aggregator.feed(line) {
            Feed::Recorded => {}
            Feed::Ignored => trace!(line, "ignoring engine line"),
            Feed::Unattributed => debug!(line, "engine output with no search in flight"),
            Feed::Stale(search) => debug!(%search, "discarding output of superseded search"),
            Feed::StaleCompleted(search) => debug!(%search, "superseded search finished"),
            Feed::Malformed(e) => {
                let error = Error::Parse(e);
                debug!(error = %error, line, "dropping malformed engine line");
            }
            Feed::Completed(done) => self.on_search_complete(done).await,
        }
    }

    async fn on_search_complete(&mut self, done: Completion) {
        if self.session.state() == SessionState::Busy {
            self.set_state(SessionState::Ready);
        }
        let Completion { request, result } = done;
        let candidates = result.candidates();

        let selection = selector::select(&candidates, self.strength);
        match selection {
            Some(chosen) => {
                info!(
                    search = %request.id,
                    mv = %chosen.uci,
                    score = %chosen.score,
                    candidates = candidates.len(),
                    strength = %self.strength,
                    "selected move"
                );
                let selected = SelectedMove::new(chosen, request.id, request.request_id.clone());
                self.emit(Message::SelectedMove(selected));
            }
            None => debug!(search = %request.id, "search finished without candidates"),
        }
        self.emit(Message::SearchFinished(SearchSummary {
            search_id: request.id,
            request_id: request.request_id,
            selected: selection.is_some(),
        }));
    }

    async fn on_handshake_timeout(&mut self) {
        self.deadline = None;
        let error = Error::BootstrapFailure(format!(
            "no readyok within {}ms",
            self.config.handshake_timeout_ms
        ));
        self.fail(error).await;
    }

    async fn fail(&mut self, error: Error) {
        let state = self.session.state();
        if matches!(state, SessionState::Failed | SessionState::Terminated) {
            return;
        }
        error!(error = %error, %state, "engine session failed");
        self.set_state(SessionState::Failed);

        self.handshake = None;
        self.deadline = None;
        self.engine = None;
        let dropped = self.session.drain_pending();
        if !dropped.is_empty() {
            warn!(count = dropped.len(), "discarding queued commands");
        }
        self.aggregator.reset();

        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Ack::failure(&error).with_state(SessionState::Failed));
        }
        self.emit(Message::Error {
            message: error.to_string(),
        });
    }

    async fn teardown(&mut self) {
        if self.session.state() == SessionState::Terminated {
            return;
        }
        self.handshake = None;
        self.deadline = None;
        if let Some(engine) = self.engine.take() {
            engine.quit().await;
        }
        self.session.drain_pending();
        self.aggregator.reset();
        self.set_state(SessionState::Terminated);

        let rejected = Error::CommandRejected(SessionState::Terminated);
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Ack::failure(&rejected));
        }
        self.emit(Message::Terminated);
    }

    fn set_state(&mut self, next: SessionState) -> bool {
        match self.session.transition(next) {
            Ok(previous) => {
                info!(from = %previous, to = %next, "engine session");
                true
            }
            Err(e) => {
                error!(error = %e, "refusing session transition");
                false
            }
        }
    }

    /// Best-effort push toward the requester side; never waits on a slow consumer
    fn emit(&self, message: Message) {
        let reason = match self.outbox.try_send(Envelope::new(message)) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                format!("push channel full, {:?} dropped", envelope.message.kind())
            }
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                format!("push channel closed, {:?} dropped", envelope.message.kind())
            }
        };
        let error = Error::RelayFailure(reason);
        warn!(error = %error, "dropping push");
    }
}

fn answer(reply: Option<oneshot::Sender<Ack>>, ack: Ack) {
    if let Some(reply) = reply {
        if reply.send(ack).is_err() {
            debug!("requester stopped waiting for acknowledgement");
        }
    }
}

async fn next_event(engine: &mut Option<EngineProcess>) -> Option<EngineEvent> {
    match engine {
        Some(engine) => engine.recv().await,
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Requester-side access to a supervisor, directly or through a relay chain
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Envelope>,
}

impl SupervisorHandle {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    async fn request(&self, message: Message) -> Result<Ack> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(Envelope::new(message).with_reply(reply))
            .await
            .map_err(|_| Error::RelayFailure("engine host unreachable".into()))?;
        answer
            .await
            .map_err(|_| Error::RelayFailure("engine host dropped the request".into()))?
            .into_result()
    }

    /// Launches the engine and waits for the handshake to finish
    pub async fn start(&self) -> Result<()> {
        self.request(Message::Start).await.map(|_| ())
    }

    /// Sends a raw UCI command, queued until the engine is ready
    pub async fn submit(&self, command: impl Into<String>) -> Result<()> {
        self.request(Message::SendCommand {
            command: command.into(),
        })
        .await
        .map(|_| ())
    }

    /// Issues a search; the selected move arrives later as a push
    pub async fn analyze(&self, request: AnalyzeRequest) -> Result<SearchId> {
        let ack = self.request(Message::Analyze(request)).await?;
        ack.search_id
            .ok_or_else(|| Error::Protocol("analysis acknowledged without a search id".into()))
    }

    pub async fn set_strength(&self, strength: f64) -> Result<()> {
        self.request(Message::UpdateStrength { strength }).await.map(|_| ())
    }

    /// Readiness check; never changes state
    pub async fn ping(&self) -> Result<Ack> {
        self.request(Message::Ping).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(Message::Shutdown).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FakeEngine, GoReply};
    use std::time::Duration;

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
    const AFTER_E4: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";

    fn spawn_with(fake: &FakeEngine) -> (SupervisorHandle, mpsc::Receiver<Envelope>) {
        let (outbox, pushes) = mpsc::channel(32);
        let config = EngineConfig {
            handshake_timeout_ms: 200,
            ..EngineConfig::default()
        };
        let supervisor = Supervisor::new(config, Arc::new(fake.clone()), outbox).unwrap();
        let (handle, _task) = supervisor.spawn();
        (handle, pushes)
    }

    async fn next_push(pushes: &mut mpsc::Receiver<Envelope>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), pushes.recv())
            .await
            .expect("timed out waiting for a push")
            .expect("push channel closed")
            .message
    }

    async fn assert_quiet(pushes: &mut mpsc::Receiver<Envelope>) {
        let extra = tokio::time::timeout(Duration::from_millis(100), pushes.recv()).await;
        assert!(extra.is_err(), "unexpected push {:?}", extra);
    }

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| l.to_string()).collect()
    }

    async fn wait_for_state(handle: &SupervisorHandle, state: SessionState) {
        for _ in 0..200 {
            if handle.ping().await.unwrap().state == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {}", state);
    }

    #[tokio::test]
    async fn test_bootstrap_reaches_ready() {
        let fake = FakeEngine::new();
        let (handle, mut pushes) = spawn_with(&fake);

        assert_eq!(handle.ping().await.unwrap().state, Some(SessionState::Uninitialized));
        handle.start().await.unwrap();

        assert_eq!(next_push(&mut pushes).await, Message::Ready);
        assert_eq!(fake.received(), ["uci", "isready"]);
        let ack = handle.ping().await.unwrap();
        assert_eq!(ack.engine_ready, Some(true));
        assert_eq!(ack.state, Some(SessionState::Ready));
    }

    #[tokio::test]
    async fn test_readiness_checks_are_idempotent() {
        let fake = FakeEngine::new();
        let (handle, mut pushes) = spawn_with(&fake);
        handle.start().await.unwrap();
        assert_eq!(next_push(&mut pushes).await, Message::Ready);

        handle.start().await.unwrap();
        for _ in 0..3 {
            let ack = handle.ping().await.unwrap();
            assert_eq!(ack.engine_ready, Some(true));
        }
        assert_eq!(fake.launches(), 1);
        assert_eq!(fake.received(), ["uci", "isready"]);
        assert_quiet(&mut pushes).await;
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_handshake() {
        let fake = FakeEngine::new();
        let (handle, _pushes) = spawn_with(&fake);
        let (a, b) = tokio::join!(handle.start(), handle.start());
        a.unwrap();
        b.unwrap();
        assert_eq!(fake.launches(), 1);
    }

    #[tokio::test]
    async fn test_queued_commands_flush_in_submission_order() {
        let fake = FakeEngine::new().reply(GoReply::Immediate(lines(&[
            "info depth 6 multipv 1 score cp 25 nodes 900 pv e2e4 e7e5",
            "info depth 6 multipv 2 score cp 20 nodes 900 pv d2d4 d7d5",
            "bestmove e2e4 ponder e7e5",
        ])));
        let (handle, mut pushes) = spawn_with(&fake);

        handle.submit("ucinewgame").await.unwrap();
        let id = handle
            .analyze(AnalyzeRequest::new(START).multi_pv(2).depth(6).request_id("opening"))
            .await
            .unwrap();
        assert_eq!(id, SearchId(1));
        assert_eq!(handle.ping().await.unwrap().state, Some(SessionState::Uninitialized));
        assert!(fake.received().is_empty());

        handle.start().await.unwrap();
        let received = fake.wait_for_commands(6).await;
        assert_eq!(
            received,
            [
                "uci".to_string(),
                "isready".to_string(),
                "ucinewgame".to_string(),
                "setoption name MultiPV value 2".to_string(),
                format!("position fen {}", START),
                "go depth 6".to_string(),
            ]
        );

        assert_eq!(next_push(&mut pushes).await, Message::Ready);
        match next_push(&mut pushes).await {
            Message::SelectedMove(selected) => {
                assert_eq!(selected.uci, "e2e4");
                assert_eq!(selected.search_id, SearchId(1));
                assert_eq!(selected.request_id.as_deref(), Some("opening"));
            }
            other => panic!("unexpected push {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_weakened_selection_end_to_end() {
        let fake = FakeEngine::new().reply(GoReply::Immediate(lines(&[
            "info depth 10 multipv 1 score cp 80 pv e7e5",
            "info depth 10 multipv 2 score cp 50 pv c7c5",
            "info depth 10 multipv 3 score cp -10 pv a7a6",
            "bestmove e7e5",
        ])));
        let (handle, mut pushes) = spawn_with(&fake);
        handle.start().await.unwrap();
        handle.set_strength(0.5).await.unwrap();
        handle.analyze(AnalyzeRequest::new(AFTER_E4).multi_pv(3)).await.unwrap();

        assert_eq!(next_push(&mut pushes).await, Message::Ready);
        let Message::SelectedMove(selected) = next_push(&mut pushes).await else {
            panic!("expected a selected move");
        };
        assert_eq!(selected.from, "c7");
        assert_eq!(selected.to, "c5");
        assert_eq!(selected.eval, 50.0);
        wait_for_state(&handle, SessionState::Ready).await;
    }

    #[tokio::test]
    async fn test_invalid_strength_is_rejected() {
        let fake = FakeEngine::new();
        let (handle, _pushes) = spawn_with(&fake);
        match handle.set_strength(1.5).await {
            Err(Error::InvalidStrength(value)) => assert_eq!(value, 1.5),
            other => panic!("unexpected {:?}", other),
        }
        handle.set_strength(0.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_superseded_search_never_selects() {
        let fake = FakeEngine::new()
            .reply(GoReply::OnStop(lines(&[
                "info depth 9 multipv 1 score cp 300 pv a2a3",
                "bestmove a2a3",
            ])))
            .reply(GoReply::Immediate(lines(&[
                "info depth 9 multipv 1 score cp 40 pv g8f6",
                "bestmove g8f6",
            ])));
        let (handle, mut pushes) = spawn_with(&fake);
        handle.start().await.unwrap();
        assert_eq!(next_push(&mut pushes).await, Message::Ready);

        let first = handle.analyze(AnalyzeRequest::new(START).multi_pv(1).request_id("first")).await.unwrap();
        let second = handle
            .analyze(AnalyzeRequest::new(AFTER_E4).multi_pv(1).request_id("second"))
            .await
            .unwrap();
        assert!(second > first);

        let Message::SelectedMove(selected) = next_push(&mut pushes).await else {
            panic!("expected a selected move");
        };
        assert_eq!(selected.uci, "g8f6");
        assert_eq!(selected.search_id, second);
        assert_eq!(selected.request_id.as_deref(), Some("second"));
        assert_eq!(
            next_push(&mut pushes).await,
            Message::SearchFinished(SearchSummary {
                search_id: second,
                request_id: Some("second".into()),
                selected: true,
            })
        );
        assert_quiet(&mut pushes).await;

        let received = fake.received();
        assert_eq!(received[5], "stop");
        assert_eq!(received.iter().filter(|c| c.starts_with("go ")).count(), 2);
    }

    #[tokio::test]
    async fn test_empty_search_selects_nothing() {
        let fake = FakeEngine::new();
        let (handle, mut pushes) = spawn_with(&fake);
        handle.start().await.unwrap();
        assert_eq!(next_push(&mut pushes).await, Message::Ready);

        let id = handle.analyze(AnalyzeRequest::new(START)).await.unwrap();
        assert_eq!(
            next_push(&mut pushes).await,
            Message::SearchFinished(SearchSummary {
                search_id: id,
                request_id: None,
                selected: false,
            })
        );
        assert_eq!(handle.ping().await.unwrap().state, Some(SessionState::Ready));
        assert_quiet(&mut pushes).await;
    }

    #[tokio::test]
    async fn test_raw_search_output_is_never_selected() {
        // The engine answers the raw `go` late, right before the tracked one
        let fake = FakeEngine::new()
            .reply(GoReply::Immediate(Vec::new()))
            .reply(GoReply::Immediate(lines(&[
                "info depth 1 multipv 1 score cp 900 pv a2a3",
                "bestmove a2a3",
                "info depth 10 multipv 1 score cp 40 pv g8f6",
                "bestmove g8f6",
            ])));
        let (handle, mut pushes) = spawn_with(&fake);
        handle.start().await.unwrap();
        assert_eq!(next_push(&mut pushes).await, Message::Ready);

        handle.submit("go depth 1").await.unwrap();
        let id = handle.analyze(AnalyzeRequest::new(AFTER_E4).multi_pv(1)).await.unwrap();

        let Message::SelectedMove(selected) = next_push(&mut pushes).await else {
            panic!("expected a selected move");
        };
        assert_eq!(selected.uci, "g8f6");
        assert_eq!(selected.search_id, id);

        let received = fake.wait_for_commands(7).await;
        assert_eq!(
            received[2..],
            [
                "go depth 1".to_string(),
                "stop".to_string(),
                "setoption name MultiPV value 1".to_string(),
                format!("position fen {}", AFTER_E4),
                "go depth 15".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_launch_rejects_until_restart() {
        let fake = FakeEngine::failing();
        let (handle, mut pushes) = spawn_with(&fake);

        assert!(matches!(handle.start().await, Err(Error::BootstrapFailure(_))));
        assert!(matches!(next_push(&mut pushes).await, Message::Error { .. }));
        assert_eq!(handle.ping().await.unwrap().engine_ready, Some(false));
        assert!(matches!(
            handle.submit("ucinewgame").await,
            Err(Error::CommandRejected(SessionState::Failed))
        ));
        assert!(matches!(
            handle.analyze(AnalyzeRequest::new(START)).await,
            Err(Error::CommandRejected(SessionState::Failed))
        ));

        fake.set_failing(false);
        handle.start().await.unwrap();
        assert_eq!(next_push(&mut pushes).await, Message::Ready);
        // Nothing submitted while failed survives the restart
        assert_eq!(fake.received(), ["uci", "isready"]);
    }

    #[tokio::test]
    async fn test_silent_engine_times_out() {
        let fake = FakeEngine::mute();
        let (handle, mut pushes) = spawn_with(&fake);
        handle.submit("ucinewgame").await.unwrap();

        assert!(matches!(handle.start().await, Err(Error::BootstrapFailure(_))));
        assert!(matches!(next_push(&mut pushes).await, Message::Error { .. }));
        assert_eq!(handle.ping().await.unwrap().state, Some(SessionState::Failed));
        assert_eq!(fake.received(), ["uci"]);
    }

    #[tokio::test]
    async fn test_engine_exit_fails_the_session() {
        let fake = FakeEngine::new();
        let (handle, mut pushes) = spawn_with(&fake);
        handle.start().await.unwrap();
        assert_eq!(next_push(&mut pushes).await, Message::Ready);

        handle.submit("quit").await.unwrap();
        assert!(matches!(next_push(&mut pushes).await, Message::Error { .. }));
        assert_eq!(handle.ping().await.unwrap().state, Some(SessionState::Failed));
    }

    #[tokio::test]
    async fn test_invalid_request_leaves_session_alone() {
        let fake = FakeEngine::new();
        let (handle, mut pushes) = spawn_with(&fake);
        handle.start().await.unwrap();
        assert_eq!(next_push(&mut pushes).await, Message::Ready);

        let err = handle.analyze(AnalyzeRequest::new("8/8/8 w")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(handle.ping().await.unwrap().state, Some(SessionState::Ready));
        assert_eq!(fake.received(), ["uci", "isready"]);
    }

    #[tokio::test]
    async fn test_shutdown_terminates() {
        let fake = FakeEngine::new();
        let (handle, mut pushes) = spawn_with(&fake);
        handle.start().await.unwrap();
        assert_eq!(next_push(&mut pushes).await, Message::Ready);

        handle.shutdown().await.unwrap();
        assert_eq!(next_push(&mut pushes).await, Message::Terminated);
        let received = fake.wait_for_commands(3).await;
        assert_eq!(received.last().map(String::as_str), Some("quit"));
        assert!(matches!(
            handle.start().await,
            Err(Error::CommandRejected(SessionState::Terminated))
        ));
        assert!(matches!(
            handle.submit("isready").await,
            Err(Error::CommandRejected(SessionState::Terminated))
        ));
    }
}
