//! Access gate and login flow
//!
//! A successful login issues an opaque random token, sent back as the
//! `session` cookie. Routes marked as protected pass through
//! [`require_session`] which rejects requests without a live token.

use axum::extract::rejection::FormRejection;
use axum::extract::{Request, State};
use axum::http::header::{COOKIE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Form;
use protocol::endpoints::{LOGIN_FAILURE_REDIRECT, LOGIN_SUCCESS_REDIRECT, SESSION_COOKIE};
use rand::Rng;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use super::AppState;

/// Live tokens kept before the oldest is forgotten
const MAX_SESSIONS: usize = 32;

/// Marker placed in request extensions once the gate has admitted a request
#[derive(Debug, Clone, Copy)]
pub struct Authenticated;

/// Shared-secret login and session token check
#[derive(Debug)]
pub struct AccessGate {
    password: String,
    tokens: Mutex<VecDeque<String>>,
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl AccessGate {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            tokens: Mutex::new(VecDeque::new()),
        }
    }

    /// Check `candidate` and issue a session token on match
    pub fn login(&self, candidate: &str) -> Option<String> {
        if !constant_time_eq(candidate.as_bytes(), self.password.as_bytes()) {
            return None;
        }

        let raw: [u8; 16] = rand::rng().random();
        let token: String = raw.iter().map(|b| format!("{:02x}", b)).collect();

        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        if tokens.len() == MAX_SESSIONS {
            tokens.pop_front();
        }
        tokens.push_back(token.clone());
        Some(token)
    }

    /// Whether `token` was issued by this gate and is still live
    pub fn is_valid(&self, token: &str) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|t| constant_time_eq(t.as_bytes(), token.as_bytes()))
    }

    /// Whether the request carries a live session cookie
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        session_cookie(headers).is_some_and(|token| self.is_valid(token))
    }
}

/// Value of the session cookie, if present
pub fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}

/// Route layer for protected endpoints
pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if !state.gate.authorize(req.headers()) {
        warn!(
            "Rejected unauthenticated {} {}",
            req.method(),
            req.uri().path()
        );
        return (StatusCode::UNAUTHORIZED, "Not authenticated").into_response();
    }
    req.extensions_mut().insert(Authenticated);
    next.run(req).await
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    password: String,
}

/// `POST /login`
pub async fn login(
    State(state): State<AppState>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Response {
    let token = form
        .ok()
        .and_then(|Form(form)| state.gate.login(&form.password));

    match token {
        Some(token) => {
            info!("Login successful");
            let cookie = format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, token);
            (
                StatusCode::FOUND,
                [
                    (SET_COOKIE, cookie),
                    (LOCATION, LOGIN_SUCCESS_REDIRECT.to_string()),
                ],
            )
                .into_response()
        }
        None => {
            warn!("Failed login attempt");
            (StatusCode::FOUND, [(LOCATION, LOGIN_FAILURE_REDIRECT)]).into_response()
        }
    }
}
