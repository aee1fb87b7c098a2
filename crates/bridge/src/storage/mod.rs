//! Storage replacement
//!
//! Streams uploaded payloads into raw storage regions: the alternate boot
//! image slot and the content store. See [`pipeline`] for the job state
//! machine and [`target`] for what "commit" means per region.

pub mod pipeline;
pub mod region;
pub mod target;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StorageSettings;

pub use pipeline::{
    Baseline, ChunkRead, ChunkSource, JobPhase, JobReport, PipelineShared, ReplaceError,
    ReplaceRequest, ReplacementPipeline,
};
pub use region::{FileRegion, StorageRegion};
pub use target::{
    BootImageFactory, BootPointer, ContentStoreFactory, ReplacementTarget, Slot, TargetFactory,
    TargetKind,
};

/// Where each replacement pipeline writes
#[derive(Clone)]
pub struct StorageTargets {
    pub boot_image: Arc<dyn TargetFactory>,
    pub content_store: Arc<dyn TargetFactory>,
}

impl StorageTargets {
    /// File-backed targets at the configured paths
    pub fn from_settings(settings: &StorageSettings) -> Result<Self> {
        let boot = BootImageFactory {
            slots: [
                StorageSettings::expand(&settings.boot_slots[0])?,
                StorageSettings::expand(&settings.boot_slots[1])?,
            ],
            pointer: StorageSettings::expand(&settings.boot_pointer)?,
            capacity: settings.boot_capacity,
        };
        let content = ContentStoreFactory {
            path: StorageSettings::expand(&settings.content_store)?,
            capacity: settings.content_capacity,
        };
        Ok(Self {
            boot_image: Arc::new(boot),
            content_store: Arc::new(content),
        })
    }
}

/// Both pipelines, sharing one exclusivity lock
pub struct Pipelines {
    pub boot_image: ReplacementPipeline,
    pub content_store: ReplacementPipeline,
}

impl Pipelines {
    pub fn new(targets: StorageTargets, shared: PipelineShared, settings: &StorageSettings) -> Self {
        Self {
            boot_image: ReplacementPipeline::new(
                targets.boot_image,
                shared.clone(),
                settings.chunk_size,
                Duration::from_millis(settings.boot_restart_delay_ms),
            ),
            content_store: ReplacementPipeline::new(
                targets.content_store,
                shared,
                settings.chunk_size,
                Duration::from_millis(settings.content_restart_delay_ms),
            ),
        }
    }
}
