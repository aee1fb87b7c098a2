//! Storage replacement endpoints

use axum::Extension;
use axum::body::{Body, BodyDataStream, Bytes};
use axum::extract::State;
use axum::http::header::{CONNECTION, CONTENT_LENGTH};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use std::io;
use std::time::Duration;
use tracing::info;

use super::AppState;
use super::auth::Authenticated;
use crate::storage::{ChunkRead, ChunkSource, ReplaceError, ReplaceRequest, ReplacementPipeline};

/// Request body as a chunk source with a per-read timeout
pub struct BodyChunkSource {
    stream: BodyDataStream,
    pending: Bytes,
    timeout: Duration,
}

impl BodyChunkSource {
    pub fn new(body: Body, timeout: Duration) -> Self {
        Self {
            stream: body.into_data_stream(),
            pending: Bytes::new(),
            timeout,
        }
    }
}

impl ChunkSource for BodyChunkSource {
    async fn next_chunk(&mut self, max: usize) -> io::Result<ChunkRead> {
        while self.pending.is_empty() {
            match tokio::time::timeout(self.timeout, self.stream.next()).await {
                Err(_) => return Ok(ChunkRead::TimedOut),
                Ok(None) => return Ok(ChunkRead::End),
                Ok(Some(Err(e))) => return Err(io::Error::other(e)),
                Ok(Some(Ok(data))) => self.pending = data,
            }
        }
        let n = max.min(self.pending.len());
        Ok(ChunkRead::Data(self.pending.split_to(n)))
    }
}

impl IntoResponse for ReplaceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReplaceError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ReplaceError::LengthRequired => StatusCode::LENGTH_REQUIRED,
            ReplaceError::EmptyPayload => StatusCode::BAD_REQUEST,
            ReplaceError::TooLarge { .. } | ReplaceError::StreamOverrun { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ReplaceError::Busy => StatusCode::CONFLICT,
            ReplaceError::Prepare { .. }
            | ReplaceError::Erase(_)
            | ReplaceError::Receive { .. }
            | ReplaceError::Write { .. }
            | ReplaceError::Truncated { .. }
            | ReplaceError::Commit(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, [(CONNECTION, "close")], self.to_string()).into_response()
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn replace(
    pipeline: &ReplacementPipeline,
    authenticated: bool,
    headers: &HeaderMap,
    body: Body,
    recv_timeout: Duration,
) -> Response {
    let request = ReplaceRequest {
        authenticated,
        declared_length: declared_length(headers),
    };
    let mut source = BodyChunkSource::new(body, recv_timeout);

    match pipeline.run(request, &mut source).await {
        Ok(report) => {
            info!(
                "{} upload complete: {} bytes, crc32 {:08x}, {} receive timeouts",
                report.kind, report.bytes_written, report.crc32, report.timeouts
            );
            ([(CONNECTION, "close")], "OK").into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `POST /upload`
pub async fn boot_image(
    State(state): State<AppState>,
    auth: Option<Extension<Authenticated>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    replace(
        &state.pipelines.boot_image,
        auth.is_some(),
        &headers,
        body,
        state.recv_timeout,
    )
    .await
}

/// `POST /uploadfs`
pub async fn content_store(
    State(state): State<AppState>,
    auth: Option<Extension<Authenticated>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    replace(
        &state.pipelines.content_store,
        auth.is_some(),
        &headers,
        body,
        state.recv_timeout,
    )
    .await
}
