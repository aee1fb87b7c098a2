//! USB serial to WebSocket bridge
//!
//! Relays a single USB virtual-serial peripheral to any number of WebSocket
//! subscribers, and accepts authenticated replacement of the boot image and
//! content store over HTTP.
//!
//! The peripheral lives on a dedicated blocking thread ([`usb`]); everything
//! network facing runs on Tokio ([`http`], [`hub`]). [`Bridge`] wires the
//! pieces together.

pub mod config;
pub mod http;
pub mod hub;
pub mod indicator;
pub mod restart;
pub mod service;
pub mod storage;
pub mod test_utils;
pub mod usb;

use anyhow::{Context, Result};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::http::{AccessGate, AppState};
use crate::hub::BroadcastHub;
use crate::indicator::{Indicator, IndicatorSink};
use crate::restart::Restarter;
use crate::storage::{Baseline, PipelineShared, Pipelines, StorageTargets};
use crate::usb::{DeviceOpener, PeripheralSession, SessionControl};

/// A running bridge: session worker, hub, indicator and HTTP state
pub struct Bridge {
    state: AppState,
    indicator: Indicator,
    control: SessionControl,
    worker: Option<thread::JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Start the session worker and background tasks
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<O>(
        config: &BridgeConfig,
        opener: O,
        targets: StorageTargets,
        restarter: Arc<dyn Restarter>,
        sink: Box<dyn IndicatorSink>,
    ) -> Result<Self>
    where
        O: DeviceOpener + 'static,
    {
        let indicator = Indicator::new();
        let session = PeripheralSession::new(config.usb.backlog_bytes, config.usb.write_timeout());

        let hub = Arc::new(BroadcastHub::new(indicator.clone(), config.hub.queue_depth));
        session.register_observer(hub.clone());

        let baseline: Baseline = {
            let hub = hub.clone();
            Arc::new(move || hub.desired_indicator())
        };
        let shared = PipelineShared::new(indicator.clone(), baseline, restarter);
        let pipelines = Pipelines::new(targets, shared, &config.storage);

        let state = AppState {
            session: session.clone(),
            hub: hub.clone(),
            gate: Arc::new(AccessGate::new(config.security.password.clone())),
            pipelines: Arc::new(pipelines),
            recv_timeout: config.storage.recv_timeout(),
        };

        let (control, worker) = crate::usb::spawn_session_worker(
            opener,
            session,
            config.usb.line,
            config.usb.retry_policy(),
        )
        .context("Failed to spawn USB session thread")?;

        let tasks = vec![
            crate::hub::spawn_keepalive(hub, config.hub.keepalive_interval()),
            crate::indicator::spawn_render_worker(
                indicator.clone(),
                sink,
                Duration::from_millis(config.indicator.render_interval_ms),
            ),
        ];

        info!("Bridge started");

        Ok(Self {
            state,
            indicator,
            control,
            worker: Some(worker),
            tasks,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn indicator(&self) -> &Indicator {
        &self.indicator
    }

    /// Router serving every endpoint against this bridge
    pub fn router(&self) -> Router {
        crate::http::router(self.state.clone())
    }

    /// Serve HTTP on `listener` until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Listening on http://{}", addr);
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server failed")
    }

    /// Stop background tasks and release the peripheral
    pub async fn shutdown(mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Err(e) = self.control.shutdown().await {
            warn!("Session worker already stopped: {}", e);
        }

        if let Some(worker) = self.worker.take() {
            tokio::task::spawn_blocking(move || worker.join())
                .await
                .context("Failed to join USB session thread")?
                .map_err(|_| anyhow::anyhow!("USB session thread panicked"))?;
        }

        info!("Bridge stopped");
        Ok(())
    }
}
