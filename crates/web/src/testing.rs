//! In-memory engine for handler and CLI tests

use chess_assist_core::engine::{EngineError, EngineLauncher, EngineProcess};
use chess_assist_core::EngineConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Completes the handshake and answers every `go` with the same lines
pub(crate) struct ScriptedEngine {
    go_reply: Vec<&'static str>,
}

impl ScriptedEngine {
    pub(crate) fn handshake_only() -> Self {
        Self { go_reply: Vec::new() }
    }

    pub(crate) fn answering(go_reply: &[&'static str]) -> Self {
        Self {
            go_reply: go_reply.to_vec(),
        }
    }
}

impl EngineLauncher for ScriptedEngine {
    fn launch(&self, config: &EngineConfig) -> Result<EngineProcess, EngineError> {
        let (engine_side, host_side) = tokio::io::duplex(4096);
        let go_reply = self.go_reply.clone();
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(engine_side);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply: Vec<&str> = match line.as_str() {
                    "uci" => vec!["uciok"],
                    "isready" => vec!["readyok"],
                    "quit" => return,
                    cmd if cmd.starts_with("go") => go_reply.clone(),
                    _ => continue,
                };
                for out in reply {
                    if write.write_all(format!("{}\n", out).as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });
        let (read, write) = tokio::io::split(host_side);
        Ok(EngineProcess::from_io(read, write, config.channel_capacity))
    }
}
