//! Scripted in-memory engine for tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use super::process::{EngineError, EngineLauncher, EngineProcess};
use crate::config::EngineConfig;

/// How the fake answers one `go`
#[derive(Debug, Clone)]
pub(crate) enum GoReply {
    /// Printed as soon as `go` arrives
    Immediate(Vec<String>),
    /// Held back until `stop`, like a long search being interrupted
    OnStop(Vec<String>),
}

#[derive(Debug, Default)]
struct Script {
    received: Vec<String>,
    replies: VecDeque<GoReply>,
    launches: usize,
    fail_launch: bool,
    mute_handshake: bool,
}

/// Launcher whose engines speak just enough UCI to be driven by a supervisor
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeEngine {
    script: Arc<Mutex<Script>>,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every launch fails as if the binary were missing
    pub(crate) fn failing() -> Self {
        let fake = Self::default();
        fake.script.lock().unwrap().fail_launch = true;
        fake
    }

    /// Never answers `uci`
    pub(crate) fn mute() -> Self {
        let fake = Self::default();
        fake.script.lock().unwrap().mute_handshake = true;
        fake
    }

    pub(crate) fn reply(self, reply: GoReply) -> Self {
        self.script.lock().unwrap().replies.push_back(reply);
        self
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.script.lock().unwrap().fail_launch = fail;
    }

    pub(crate) fn received(&self) -> Vec<String> {
        self.script.lock().unwrap().received.clone()
    }

    pub(crate) fn launches(&self) -> usize {
        self.script.lock().unwrap().launches
    }

    /// Polls until at least `count` commands have arrived
    pub(crate) async fn wait_for_commands(&self, count: usize) -> Vec<String> {
        for _ in 0..400 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("fake engine saw only {:?}", self.received());
    }
}

impl EngineLauncher for FakeEngine {
    fn launch(&self, config: &EngineConfig) -> Result<EngineProcess, EngineError> {
        {
            let mut script = self.script.lock().unwrap();
            if script.fail_launch {
                return Err(EngineError::SpawnError("fake engine refused to start".into()));
            }
            script.launches += 1;
        }
        let (engine_side, host_side) = tokio::io::duplex(16 * 1024);
        tokio::spawn(serve(engine_side, self.script.clone()));
        let (read, write) = tokio::io::split(host_side);
        Ok(EngineProcess::from_io(read, write, config.channel_capacity))
    }
}

async fn serve(stream: DuplexStream, script: Arc<Mutex<Script>>) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut held: Option<Vec<String>> = None;

    while let Ok(Some(line)) = lines.next_line().await {
        let output: Vec<String> = {
            let mut script = script.lock().unwrap();
            script.received.push(line.clone());
            match line.as_str() {
                "uci" if script.mute_handshake => Vec::new(),
                "uci" => vec!["id name FakeFish".into(), "uciok".into()],
                "isready" => vec!["readyok".into()],
                "stop" => held.take().unwrap_or_default(),
                "quit" => return,
                cmd if cmd.starts_with("go") => match script.replies.pop_front() {
                    Some(GoReply::Immediate(lines)) => lines,
                    Some(GoReply::OnStop(lines)) => {
                        held = Some(lines);
                        Vec::new()
                    }
                    None => vec!["bestmove (none)".into()],
                },
                _ => Vec::new(),
            }
        };
        for out in output {
            if write.write_all(format!("{}\n", out).as_bytes()).await.is_err() {
                return;
            }
        }
        if write.flush().await.is_err() {
            return;
        }
    }
}
