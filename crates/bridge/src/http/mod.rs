//! HTTP and WebSocket transport
//!
//! Every endpoint is declared once in [`route_table`] together with whether
//! it requires a login session. The router applies the access gate to the
//! protected group as a route layer, so handlers never check auth inline.

pub mod auth;
pub mod peripheral;
pub mod relay;
pub mod upload;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{MethodRouter, get, post};
use protocol::endpoints;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::hub::BroadcastHub;
use crate::indicator::{Indicator, IndicatorState};
use crate::storage::Pipelines;
use crate::usb::PeripheralSession;

pub use auth::{AccessGate, Authenticated};

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<PeripheralSession>,
    pub hub: Arc<BroadcastHub>,
    pub gate: Arc<AccessGate>,
    pub pipelines: Arc<Pipelines>,
    /// Per-read timeout on upload bodies
    pub recv_timeout: Duration,
}

/// One row of the route table
pub struct Endpoint {
    pub method: &'static str,
    pub path: &'static str,
    pub requires_auth: bool,
    pub handler: MethodRouter<AppState>,
}

/// The route table
pub fn route_table() -> Vec<Endpoint> {
    vec![
        Endpoint {
            method: "GET",
            path: endpoints::SUBSCRIBE,
            requires_auth: false,
            handler: get(relay::subscribe),
        },
        Endpoint {
            method: "GET",
            path: endpoints::SERIAL,
            requires_auth: false,
            handler: get(peripheral::backlog),
        },
        Endpoint {
            method: "POST",
            path: endpoints::SERIAL,
            requires_auth: false,
            handler: post(peripheral::input),
        },
        Endpoint {
            method: "GET",
            path: endpoints::STATUS,
            requires_auth: false,
            handler: get(peripheral::status),
        },
        Endpoint {
            method: "POST",
            path: endpoints::LOGIN,
            requires_auth: false,
            handler: post(auth::login),
        },
        Endpoint {
            method: "POST",
            path: endpoints::BOOT_IMAGE_UPLOAD,
            requires_auth: true,
            handler: post(upload::boot_image).layer(DefaultBodyLimit::disable()),
        },
        Endpoint {
            method: "POST",
            path: endpoints::CONTENT_STORE_UPLOAD,
            requires_auth: true,
            handler: post(upload::content_store).layer(DefaultBodyLimit::disable()),
        },
    ]
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let mut public = Router::new();
    let mut protected = Router::new();

    for endpoint in route_table() {
        debug!(
            "Route {} {}{}",
            endpoint.method,
            endpoint.path,
            if endpoint.requires_auth { " (auth)" } else { "" }
        );
        if endpoint.requires_auth {
            protected = protected.route(endpoint.path, endpoint.handler);
        } else {
            public = public.route(endpoint.path, endpoint.handler);
        }
    }

    let protected = protected.route_layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_session,
    ));

    public.merge(protected).with_state(state)
}

/// Bind the listen address, retrying until it succeeds
///
/// The indicator shows `NetworkDisconnected` while binding fails.
pub async fn bind_with_retry(
    addr: &str,
    retry: Duration,
    indicator: &Indicator,
    hub: &BroadcastHub,
) -> TcpListener {
    let mut failures = 0u64;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if failures > 0 {
                    info!("Bound {} after {} failed attempts", addr, failures);
                }
                hub.refresh_indicator();
                return listener;
            }
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    warn!("Failed to bind {}: {}, retrying", addr, e);
                } else {
                    debug!("Bind attempt {} failed: {}", failures, e);
                }
                indicator.set(IndicatorState::NetworkDisconnected);
                tokio::time::sleep(retry).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_route_table() {
        let table = route_table();
        let routes: HashSet<_> = table.iter().map(|e| (e.method, e.path)).collect();
        assert_eq!(routes.len(), table.len());

        let protected: Vec<_> = table
            .iter()
            .filter(|e| e.requires_auth)
            .map(|e| e.path)
            .collect();
        assert_eq!(
            protected,
            vec![endpoints::BOOT_IMAGE_UPLOAD, endpoints::CONTENT_STORE_UPLOAD]
        );
    }

    #[tokio::test]
    async fn test_bind_retry_shows_network_state() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let indicator = Indicator::new();
        let hub = BroadcastHub::new(indicator.clone(), 4);

        let bind = {
            let (addr, indicator) = (addr.clone(), indicator.clone());
            tokio::spawn(async move {
                bind_with_retry(&addr, Duration::from_millis(10), &indicator, &hub).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(indicator.get(), IndicatorState::NetworkDisconnected);

        // Overwritten between attempts; the next failure restores it
        indicator.set(IndicatorState::PeripheralConnected);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(indicator.get(), IndicatorState::NetworkDisconnected);

        drop(taken);
        let listener = tokio::time::timeout(Duration::from_secs(5), bind)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listener.local_addr().unwrap().to_string(), addr);
        assert_eq!(indicator.get(), IndicatorState::Idle);
    }
}
