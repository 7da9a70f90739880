use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use chess_assist_core::{
    AnalyzeRequest, EngineConfig, Envelope, Error, Message, Pipeline, ProcessLauncher, Result, SearchId,
    SelectedMove, SupervisorHandle,
};

mod routes;
#[cfg(test)]
mod testing;

/// Pushes kept for subscribers that fall behind
const PUSH_BACKLOG: usize = 256;

#[derive(Parser, Debug)]
#[command(author, version, about = "Strength-calibrated move suggestions from a UCI engine", long_about = None)]
struct Cli {
    /// JSON engine configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine binary, overriding the config file
    #[arg(long, global = true)]
    engine: Option<PathBuf>,

    /// Selection strength between 0.0 and 1.0
    #[arg(long, global = true)]
    strength: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP interface
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: SocketAddr,
    },
    /// Analyze one position and print the selected move
    Probe {
        fen: String,
        #[arg(long)]
        depth: Option<u32>,
        #[arg(long)]
        multi_pv: Option<u32>,
    },
}

pub struct AppState {
    pub engine: SupervisorHandle,
    pub pushes: broadcast::Sender<Message>,
    /// Analyze requests are refused and selections withheld while false
    pub enabled: AtomicBool,
}

impl AppState {
    pub fn new(engine: SupervisorHandle) -> Self {
        let (pushes, _) = broadcast::channel(PUSH_BACKLOG);
        Self {
            engine,
            pushes,
            enabled: AtomicBool::new(true),
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/start", post(routes::start))
        .route("/analyze", post(routes::analyze))
        .route("/command", post(routes::command))
        .route("/strength", post(routes::strength))
        .route("/toggle", post(routes::toggle))
        .route("/status", get(routes::status))
        .route("/events", get(routes::events))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let outcome = match load_config(&cli) {
        Ok(config) => match cli.command {
            Command::Serve { bind } => serve(config, bind).await,
            Command::Probe {
                fen,
                depth,
                multi_pv,
            } => probe(config, fen, depth, multi_pv).await,
        },
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exiting");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(engine) = &cli.engine {
        config = config.with_path(engine);
    }
    if let Some(strength) = cli.strength {
        config = config.with_strength(strength);
    }
    config.validate()?;
    Ok(config)
}

async fn serve(config: EngineConfig, bind: SocketAddr) -> Result<()> {
    let pipeline = Pipeline::spawn(config, Arc::new(ProcessLauncher))?;
    let (engine, pushes) = pipeline.into_parts();
    let state = Arc::new(AppState::new(engine));
    tokio::spawn(forward_pushes(pushes, state.clone()));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "server running");

    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = state.engine.shutdown().await {
        warn!(error = %e, "engine did not shut down cleanly");
    }
    Ok(())
}

/// Fans pushes out to every `/events` subscriber
async fn forward_pushes(mut pushes: mpsc::Receiver<Envelope>, state: Arc<AppState>) {
    while let Some(envelope) = pushes.recv().await {
        // A search started before the toggle went off still completes
        if let Message::SelectedMove(selected) = &envelope.message {
            if !state.enabled.load(Ordering::Relaxed) {
                debug!(search = %selected.search_id, "assistant disabled, withholding selection");
                continue;
            }
        }
        // No subscribers is fine; pushes are not replayed
        let _ = state.pushes.send(envelope.message);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn probe(config: EngineConfig, fen: String, depth: Option<u32>, multi_pv: Option<u32>) -> Result<()> {
    let mut pipeline = Pipeline::spawn(config, Arc::new(ProcessLauncher))?;
    let engine = pipeline.handle();
    let outcome = run_probe(&mut pipeline, &engine, fen, depth, multi_pv).await;
    drop(engine);
    pipeline.shutdown().await;
    outcome
}

async fn run_probe(
    pipeline: &mut Pipeline,
    engine: &SupervisorHandle,
    fen: String,
    depth: Option<u32>,
    multi_pv: Option<u32>,
) -> Result<()> {
    engine.start().await?;

    let mut request = AnalyzeRequest::new(fen);
    if let Some(depth) = depth {
        request = request.depth(depth);
    }
    if let Some(multi_pv) = multi_pv {
        request = request.multi_pv(multi_pv);
    }
    let search = engine.analyze(request).await?;

    match await_search(pipeline, search).await? {
        Some(selected) => print_selection(&selected),
        None => println!("no move: the engine returned no candidate lines"),
    }
    Ok(())
}

/// Waits for `search` to finish and returns its selection, if it made one
async fn await_search(pipeline: &mut Pipeline, search: SearchId) -> Result<Option<SelectedMove>> {
    let mut selection = None;
    while let Some(push) = pipeline.next_push().await {
        match push {
            Message::SelectedMove(selected) if selected.search_id == search => selection = Some(selected),
            Message::SearchFinished(summary) if summary.search_id == search => return Ok(selection),
            Message::Error { message } => return Err(Error::Protocol(message)),
            _ => {}
        }
    }
    Err(Error::RelayFailure("push chain closed".into()))
}

fn print_selection(selected: &SelectedMove) {
    println!(
        "{} ({} -> {})  eval {:.0}  line {}",
        selected.uci, selected.from, selected.to, selected.eval, selected.multipv
    );
}
