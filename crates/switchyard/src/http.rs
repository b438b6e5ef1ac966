//! HTTP control surface: a thin adapter over the session registry.
//!
//! Every mutation goes through registry methods; every read returns a
//! snapshot. `UnknownTrain` maps to 404, anything else internal to 500 with
//! a short reason.

use crate::registry::RegistryError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/trains", get(list_trains))
        .route(
            "/api/remote_control/{console_id}/train/{train_id}",
            post(bind_console),
        )
        .route("/api/remote_control/{console_id}/train", delete(unbind_console))
        .route("/stream/{train_id}", get(stream_placeholder))
        .route("/api/speedtest/download", get(speedtest_download))
        .route("/api/speedtest/upload", post(speedtest_upload))
        .route("/api/webrtc/offer", post(webrtc_offer))
        .route("/api/webrtc/answer", post(webrtc_answer))
        .route("/api/webrtc/ice-candidate", post(webrtc_ice_candidate))
}

async fn list_trains(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    let trains = state.registry.list_trains();
    debug!(count = trains.len(), "train list requested");
    Json(trains)
}

async fn bind_console(
    State(state): State<Arc<AppState>>,
    Path((console_id, train_id)): Path<(String, String)>,
) -> Response {
    info!(console_id, train_id, "bind requested");
    match state.registry.bind(&console_id, &train_id) {
        Ok(()) => Json(json!({
            "status": "success",
            "message": format!("Mapped {console_id} to {train_id}"),
        }))
        .into_response(),
        Err(RegistryError::UnknownTrain(_)) => {
            if !state.registry.has_trains() {
                state.hooks.fire_bind_with_no_train();
            }
            (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "status": "error",
                    "message": format!("Unknown train: {train_id}"),
                })),
            )
                .into_response()
        }
    }
}

async fn unbind_console(
    State(state): State<Arc<AppState>>,
    Path(console_id): Path<String>,
) -> Json<Value> {
    info!(console_id, "unbind requested");
    state.registry.unbind(&console_id);
    Json(json!({
        "status": "success",
        "message": format!("Unmapped {console_id}"),
    }))
}

/// Placeholder for a future static stream URL.
async fn stream_placeholder(Path(train_id): Path<String>) -> &'static str {
    debug!(train_id, "stream URL requested");
    ""
}

async fn speedtest_download(State(state): State<Arc<AppState>>) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(state.speedtest_blob.clone()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn speedtest_upload(body: axum::body::Bytes) -> Json<Value> {
    // Timing is done on the client; the body just has to be consumed.
    debug!(bytes = body.len(), "speedtest upload received");
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct OfferRequest {
    remote_control_id: String,
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    remote_control_id: String,
    sdp: Value,
}

#[derive(Debug, Deserialize)]
struct IceCandidateRequest {
    remote_control_id: String,
    candidate: Value,
}

/// A console asks for the bound train's current SDP offer.
async fn webrtc_offer(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OfferRequest>,
) -> Json<Value> {
    let console_id = &request.remote_control_id;
    let Some(train_id) = state.registry.train_of(console_id) else {
        return Json(json!({
            "status": "error",
            "message": "remote control not bound to a train",
            "offer": null,
        }));
    };
    match state.signaling.last_offer(&train_id) {
        Some(offer) => Json(json!({ "status": "success", "offer": offer })),
        None => Json(json!({
            "status": "error",
            "message": format!("no offer announced by train {train_id}"),
            "offer": null,
        })),
    }
}

async fn webrtc_answer(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnswerRequest>,
) -> Json<Value> {
    forward_signaling(
        &state,
        &request.remote_control_id,
        json!({
            "type": "answer",
            "remote_control_id": request.remote_control_id,
            "sdp": request.sdp,
        }),
        "Answer processed successfully",
    )
}

async fn webrtc_ice_candidate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IceCandidateRequest>,
) -> Json<Value> {
    forward_signaling(
        &state,
        &request.remote_control_id,
        json!({
            "type": "ice",
            "remote_control_id": request.remote_control_id,
            "candidate": request.candidate,
        }),
        "ICE candidate added successfully",
    )
}

fn forward_signaling(
    state: &AppState,
    console_id: &str,
    message: Value,
    success: &str,
) -> Json<Value> {
    let Some(train_id) = state.registry.train_of(console_id) else {
        return Json(json!({
            "status": "error",
            "message": "remote control not bound to a train",
        }));
    };
    if state.signaling.forward_to_train(&train_id, &message) {
        Json(json!({ "status": "success", "message": success }))
    } else {
        Json(json!({
            "status": "error",
            "message": format!("train {train_id} not reachable for signaling"),
        }))
    }
}
