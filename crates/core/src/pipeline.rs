//! Requester ⇄ supervisor wiring
//!
//! Requests travel `gateway -> engine-host` to the supervisor; pushes travel
//! `engine-host -> gateway` back to whoever consumes them.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::engine::EngineLauncher;
use crate::error::Result;
use crate::relay::{Boundary, Envelope, Message, RelayChain, Target};
use crate::supervisor::{Supervisor, SupervisorHandle};

pub const GATEWAY: &str = "gateway";
pub const ENGINE_HOST: &str = "engine-host";

pub struct Pipeline {
    handle: SupervisorHandle,
    pushes: mpsc::Receiver<Envelope>,
    downstream: RelayChain,
    upstream: RelayChain,
    supervisor: JoinHandle<()>,
}

impl Pipeline {
    pub fn spawn(config: EngineConfig, launcher: Arc<dyn EngineLauncher>) -> Result<Self> {
        let capacity = config.channel_capacity;

        let (sink, pushes) = mpsc::channel(capacity);
        let upstream = RelayChain::builder(capacity)
            .hop(Boundary::passthrough(ENGINE_HOST))
            .endpoint(Boundary::endpoint(GATEWAY, Target::Requester), sink)
            .spawn();

        let (inbox, inbox_rx) = mpsc::channel(capacity);
        let supervisor = Supervisor::new(config, launcher, upstream.entry())?.spawn_with_inbox(inbox_rx);

        let downstream = RelayChain::builder(capacity)
            .hop(Boundary::passthrough(GATEWAY))
            .endpoint(Boundary::endpoint(ENGINE_HOST, Target::Supervisor), inbox)
            .spawn();
        let handle = SupervisorHandle::new(downstream.entry());

        Ok(Self {
            handle,
            pushes,
            downstream,
            upstream,
            supervisor,
        })
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Next push that made it through the chain
    pub async fn next_push(&mut self) -> Option<Message> {
        self.pushes.recv().await.map(|envelope| envelope.message)
    }

    /// Detaches the relay tasks; they stop once every handle is dropped
    pub fn into_parts(self) -> (SupervisorHandle, mpsc::Receiver<Envelope>) {
        (self.handle, self.pushes)
    }

    /// Terminates the engine and drains both chains.
    ///
    /// Waits for every other clone of the handle to be dropped.
    pub async fn shutdown(self) {
        let Pipeline {
            handle,
            pushes,
            downstream,
            upstream,
            supervisor,
        } = self;
        if let Err(e) = handle.shutdown().await {
            tracing::warn!(error = %e, "engine did not shut down cleanly");
        }
        drop(handle);
        downstream.shutdown().await;
        let _ = supervisor.await;
        drop(pushes);
        upstream.shutdown().await;
    }
}
