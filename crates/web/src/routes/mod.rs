use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use chess_assist_core::{Ack, AnalyzeRequest, Error};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CommandBody {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct StrengthBody {
    pub strength: f64,
}

/// Sets the flag when given, flips it otherwise
#[derive(Debug, Default, Deserialize)]
pub struct ToggleBody {
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleResponse {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub enabled: bool,
    #[serde(flatten)]
    pub ack: Ack,
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidRequest(_) | Error::InvalidStrength(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::CommandRejected(_) => StatusCode::CONFLICT,
        Error::BootstrapFailure(_) | Error::Engine(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::RelayFailure(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond(outcome: Result<Ack, Error>) -> Response {
    match outcome {
        Ok(ack) => Json(ack).into_response(),
        Err(e) => {
            debug!(error = %e, "request failed");
            (status_for(&e), Json(Ack::failure(&e))).into_response()
        }
    }
}

pub async fn start(State(state): State<Arc<AppState>>) -> Response {
    respond(state.engine.start().await.map(|_| Ack::ok()))
}

pub async fn analyze(State(state): State<Arc<AppState>>, Json(request): Json<AnalyzeRequest>) -> Response {
    if !state.enabled.load(Ordering::Relaxed) {
        let ack = Ack {
            success: false,
            error: Some("assistant disabled".to_string()),
            ..Ack::default()
        };
        return (StatusCode::CONFLICT, Json(ack)).into_response();
    }
    respond(state.engine.analyze(request).await.map(|id| Ack::ok().with_search(id)))
}

pub async fn command(State(state): State<Arc<AppState>>, Json(body): Json<CommandBody>) -> Response {
    respond(state.engine.submit(body.command).await.map(|_| Ack::ok()))
}

pub async fn strength(State(state): State<Arc<AppState>>, Json(body): Json<StrengthBody>) -> Response {
    respond(state.engine.set_strength(body.strength).await.map(|_| Ack::ok()))
}

pub async fn toggle(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ToggleBody>>,
) -> Json<ToggleResponse> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let enabled = match body.enabled {
        Some(enabled) => {
            state.enabled.store(enabled, Ordering::Relaxed);
            enabled
        }
        None => !state.enabled.fetch_xor(true, Ordering::Relaxed),
    };
    debug!(enabled, "assistant toggled");
    Json(ToggleResponse { enabled })
}

pub async fn status(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.ping().await {
        Ok(ack) => Json(StatusResponse {
            enabled: state.enabled.load(Ordering::Relaxed),
            ack,
        })
        .into_response(),
        Err(e) => respond(Err(e)),
    }
}

/// Server-sent stream of every push: `ready`, `selectedMove`, `searchFinished`, `error`, `terminated`
pub async fn events(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.pushes.subscribe();
    let stream = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(message) => match Event::default().json_data(&message) {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(e) => warn!(error = %e, "cannot encode push"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "events subscriber fell behind"),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn health() -> &'static str {
    "OK"
}
