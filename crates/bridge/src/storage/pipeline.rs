//! Storage replacement pipeline
//!
//! One job streams a payload of declared length into a target region:
//!
//! ```text
//! Validating ──> [Erasing] ──> Writing ──> Committing ──> Done
//!      │             │            │             │
//!      └─────────────┴────────────┴─────────────┴──> Failed
//! ```
//!
//! Rejections in `Validating` happen before any side effect. `Erasing` is
//! only entered for targets that need it. Stream read timeouts are retried in
//! place; any other failure ends the job. A finished job and a failed commit
//! both schedule a process restart; every earlier failure leaves the previous
//! content authoritative and releases the busy indicator.
//!
//! At most one job runs at a time across all pipelines sharing a
//! [`PipelineShared`].

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::target::{ReplacementTarget, TargetFactory, TargetKind};
use crate::indicator::{Indicator, IndicatorState};
use crate::restart::Restarter;

/// Job lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Validating,
    Erasing,
    Writing,
    Committing,
    Done,
    Failed,
}

/// Why a replacement job did not complete
#[derive(Debug, Error)]
pub enum ReplaceError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Content length required")]
    LengthRequired,

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Image exceeds {kind} size ({declared} > {capacity} bytes)")]
    TooLarge {
        kind: TargetKind,
        declared: u64,
        capacity: u64,
    },

    #[error("Another replacement is in progress")]
    Busy,

    #[error("Failed to prepare {kind}: {source}")]
    Prepare { kind: TargetKind, source: io::Error },

    #[error("Erase failed: {0}")]
    Erase(io::Error),

    #[error("Receive failed after {written} bytes: {source}")]
    Receive { written: u64, source: io::Error },

    #[error("Write failed at offset {offset}: {source}")]
    Write { offset: u64, source: io::Error },

    #[error("Stream overran declared length: {received} > {declared} bytes")]
    StreamOverrun { received: u64, declared: u64 },

    #[error("Stream ended after {received} of {declared} bytes")]
    Truncated { received: u64, declared: u64 },

    #[error("Commit failed: {0}")]
    Commit(io::Error),
}

impl ReplaceError {
    /// Whether the request was turned away before any side effect
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ReplaceError::Unauthenticated
                | ReplaceError::LengthRequired
                | ReplaceError::EmptyPayload
                | ReplaceError::TooLarge { .. }
                | ReplaceError::Busy
        )
    }

    /// Whether only a restart can bring the target back to a known state
    pub fn requires_restart(&self) -> bool {
        matches!(self, ReplaceError::Commit(_))
    }
}

/// One step of the incoming payload stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRead {
    Data(Bytes),
    /// Nothing arrived within the read timeout
    TimedOut,
    /// Stream finished
    End,
}

/// Incoming payload stream
pub trait ChunkSource: Send {
    /// Next chunk of at most `max` bytes
    fn next_chunk(&mut self, max: usize) -> impl Future<Output = io::Result<ChunkRead>> + Send;
}

/// What the caller knows about a replacement request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceRequest {
    pub authenticated: bool,
    /// Declared payload length, if the caller sent one
    pub declared_length: Option<u64>,
}

/// Summary of a finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub kind: TargetKind,
    pub bytes_written: u64,
    pub crc32: u32,
    /// Stream read timeouts retried along the way
    pub timeouts: u64,
    /// Phases in the order they were entered
    pub phases: Vec<JobPhase>,
}

/// In-flight job state
struct ReplacementJob {
    kind: TargetKind,
    declared_length: u64,
    bytes_written: u64,
    phase: JobPhase,
    phases: Vec<JobPhase>,
    crc: crc32fast::Hasher,
    timeouts: u64,
}

impl ReplacementJob {
    fn new(kind: TargetKind, declared_length: u64) -> Self {
        Self {
            kind,
            declared_length,
            bytes_written: 0,
            phase: JobPhase::Validating,
            phases: vec![JobPhase::Validating],
            crc: crc32fast::Hasher::new(),
            timeouts: 0,
        }
    }

    fn enter(&mut self, phase: JobPhase) {
        info!("{} job: {:?} -> {:?}", self.kind, self.phase, phase);
        self.phase = phase;
        self.phases.push(phase);
    }

    fn record(&mut self, chunk: &[u8]) {
        self.bytes_written += chunk.len() as u64;
        self.crc.update(chunk);
        debug_assert!(self.bytes_written <= self.declared_length);
    }

    fn report(self) -> JobReport {
        JobReport {
            kind: self.kind,
            bytes_written: self.bytes_written,
            crc32: self.crc.finalize(),
            timeouts: self.timeouts,
            phases: self.phases,
        }
    }
}

/// Runs target I/O on the blocking pool, handing the target back afterwards
struct BlockingTarget(Option<Box<dyn ReplacementTarget>>);

impl BlockingTarget {
    async fn run<R, F>(&mut self, op: F) -> io::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn ReplacementTarget) -> io::Result<R> + Send + 'static,
    {
        let mut target = self
            .0
            .take()
            .ok_or_else(|| io::Error::other("target lost to an earlier failure"))?;
        let (target, result) = tokio::task::spawn_blocking(move || {
            let result = op(target.as_mut());
            (target, result)
        })
        .await
        .map_err(io::Error::other)?;
        self.0 = Some(target);
        result
    }
}

/// Indicator state to fall back to when a job gives up `Busy`
pub type Baseline = Arc<dyn Fn() -> IndicatorState + Send + Sync>;

/// State shared by every pipeline of the process
#[derive(Clone)]
pub struct PipelineShared {
    indicator: Indicator,
    baseline: Baseline,
    restarter: Arc<dyn Restarter>,
    exclusive: Arc<Mutex<()>>,
}

impl PipelineShared {
    pub fn new(indicator: Indicator, baseline: Baseline, restarter: Arc<dyn Restarter>) -> Self {
        Self {
            indicator,
            baseline,
            restarter,
            exclusive: Arc::new(Mutex::new(())),
        }
    }
}

/// Replacement pipeline for one target kind
pub struct ReplacementPipeline {
    factory: Arc<dyn TargetFactory>,
    shared: PipelineShared,
    chunk_size: usize,
    restart_delay: Duration,
}

impl ReplacementPipeline {
    pub fn new(
        factory: Arc<dyn TargetFactory>,
        shared: PipelineShared,
        chunk_size: usize,
        restart_delay: Duration,
    ) -> Self {
        Self {
            factory,
            shared,
            chunk_size: chunk_size.max(1),
            restart_delay,
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.factory.kind()
    }

    pub fn capacity(&self) -> u64 {
        self.factory.capacity()
    }

    /// Side-effect free admission checks; returns the declared length
    fn validate(&self, request: &ReplaceRequest) -> Result<u64, ReplaceError> {
        if !request.authenticated {
            return Err(ReplaceError::Unauthenticated);
        }
        let declared = request.declared_length.ok_or(ReplaceError::LengthRequired)?;
        if declared == 0 {
            return Err(ReplaceError::EmptyPayload);
        }
        let capacity = self.capacity();
        if declared > capacity {
            return Err(ReplaceError::TooLarge {
                kind: self.kind(),
                declared,
                capacity,
            });
        }
        Ok(declared)
    }

    /// Run one job to completion
    ///
    /// On success a restart has been scheduled by the time this returns.
    pub async fn run<S: ChunkSource>(
        &self,
        request: ReplaceRequest,
        source: &mut S,
    ) -> Result<JobReport, ReplaceError> {
        let kind = self.kind();
        let declared = match self.validate(&request) {
            Ok(declared) => declared,
            Err(e) => {
                info!("{} replacement rejected: {}", kind, e);
                return Err(e);
            }
        };
        let Ok(_exclusive) = self.shared.exclusive.try_lock() else {
            info!("{} replacement rejected: another job is running", kind);
            return Err(ReplaceError::Busy);
        };

        info!("{} replacement started ({} bytes)", kind, declared);
        self.shared.indicator.set(IndicatorState::Busy);

        let mut job = ReplacementJob::new(kind, declared);
        match self.execute(&mut job, source).await {
            Ok(()) => {
                job.enter(JobPhase::Done);
                info!("{} replaced ({} bytes)", kind, job.bytes_written);
                self.shared
                    .restarter
                    .schedule_restart(self.restart_delay, &format!("{} replaced", kind));
                Ok(job.report())
            }
            Err(e) => {
                job.enter(JobPhase::Failed);
                if e.requires_restart() {
                    error!("{} replacement failed: {}", kind, e);
                    self.shared.indicator.set(IndicatorState::Fault);
                    self.shared.restarter.schedule_restart(
                        self.restart_delay,
                        &format!("{} commit failed", kind),
                    );
                } else {
                    warn!(
                        "{} replacement failed after {} bytes, keeping previous content: {}",
                        kind, job.bytes_written, e
                    );
                    self.shared
                        .indicator
                        .clear_busy((self.shared.baseline)());
                }
                Err(e)
            }
        }
    }

    async fn execute<S: ChunkSource>(
        &self,
        job: &mut ReplacementJob,
        source: &mut S,
    ) -> Result<(), ReplaceError> {
        let kind = job.kind;
        let prepare = |source| ReplaceError::Prepare { kind, source };

        let mut target = BlockingTarget(Some(self.factory.create().map_err(prepare)?));
        target.run(|t| t.prepare()).await.map_err(prepare)?;

        if kind.requires_erase() {
            job.enter(JobPhase::Erasing);
            target.run(|t| t.erase()).await.map_err(ReplaceError::Erase)?;
        }

        job.enter(JobPhase::Writing);
        let capacity = self.capacity();
        while job.bytes_written < job.declared_length {
            let remaining = job.declared_length - job.bytes_written;
            let want = remaining.min(self.chunk_size as u64) as usize;

            let chunk = match source.next_chunk(want).await {
                Ok(ChunkRead::Data(chunk)) => chunk,
                Ok(ChunkRead::TimedOut) => {
                    job.timeouts += 1;
                    debug!(
                        "Receive timed out at {} bytes, retrying",
                        job.bytes_written
                    );
                    continue;
                }
                Ok(ChunkRead::End) => {
                    return Err(ReplaceError::Truncated {
                        received: job.bytes_written,
                        declared: job.declared_length,
                    });
                }
                Err(source) => {
                    return Err(ReplaceError::Receive {
                        written: job.bytes_written,
                        source,
                    });
                }
            };
            if chunk.is_empty() {
                continue;
            }

            let end = job.bytes_written + chunk.len() as u64;
            if end > job.declared_length || end > capacity {
                return Err(ReplaceError::StreamOverrun {
                    received: end,
                    declared: job.declared_length,
                });
            }

            let offset = job.bytes_written;
            let data = chunk.clone();
            target
                .run(move |t| t.write_chunk(offset, &data))
                .await
                .map_err(|source| ReplaceError::Write { offset, source })?;
            job.record(&chunk);
        }

        job.enter(JobPhase::Committing);
        let length = job.bytes_written;
        let crc32 = job.crc.clone().finalize();
        target
            .run(move |t| t.commit(length, crc32))
            .await
            .map_err(ReplaceError::Commit)
    }
}
