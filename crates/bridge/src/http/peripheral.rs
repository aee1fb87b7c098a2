//! Peripheral status and one-shot input/output endpoints

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use protocol::StatusSnapshot;
use tracing::{debug, warn};

use super::AppState;
use crate::usb::DeviceError;

/// `GET /status`
pub async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.session.status())
}

/// `GET /serial`: recent peripheral output
pub async fn backlog(State(state): State<AppState>) -> Response {
    (
        [(CONTENT_TYPE, "application/octet-stream")],
        state.session.backlog(),
    )
        .into_response()
}

/// `POST /serial`: forward the body to the peripheral verbatim
pub async fn input(State(state): State<AppState>, body: Bytes) -> Response {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "Empty body").into_response();
    }

    let session = state.session.clone();
    let len = body.len();
    let result = tokio::task::spawn_blocking(move || session.write(&body)).await;

    match result {
        Ok(Ok(written)) => {
            debug!("Forwarded {} bytes from HTTP to peripheral", written);
            "OK".into_response()
        }
        Ok(Err(DeviceError::NotConnected)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Peripheral not connected").into_response()
        }
        Ok(Err(e)) => {
            warn!("Failed to forward {} bytes to peripheral: {}", len, e);
            (StatusCode::BAD_GATEWAY, format!("Write failed: {}", e)).into_response()
        }
        Err(e) => {
            warn!("Peripheral write task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
