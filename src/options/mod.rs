//! Versioned policy snapshots.
//!
//! A provider hands out the current [`GlobalConfig`] as an immutable
//! `Arc` together with a version number that increases every time a
//! different snapshot is published. Readers never see a partial update.

mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;
use crate::ratelimit::GlobalConfig;

pub use store::{StoreOptionsProvider, DEFAULT_OPTIONS_KEY, MIN_POLL_INTERVAL};

/// Source of the active policy.
pub trait OptionsProvider: Send + Sync {
    /// The latest published snapshot.
    fn current_options(&self) -> Arc<GlobalConfig>;

    /// Bumped on every publish. A single atomic load.
    fn version(&self) -> u64;
}

/// Snapshot plus version, swapped together under a writer lock.
pub(crate) struct OptionsCell {
    current: ArcSwap<GlobalConfig>,
    version: AtomicU64,
    writer: Mutex<()>,
}

impl OptionsCell {
    pub(crate) fn new(initial: GlobalConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            version: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    pub(crate) fn current(&self) -> Arc<GlobalConfig> {
        self.current.load_full()
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Publish `next` if its content differs from the current snapshot.
    /// Returns the new version, or `None` when nothing changed.
    pub(crate) fn publish(&self, next: GlobalConfig) -> Option<u64> {
        let _writer = self.writer.lock();
        if **self.current.load() == next {
            return None;
        }
        self.current.store(Arc::new(next));
        // The snapshot is stored before the version moves, so a reader that
        // sees the new version also sees the new snapshot.
        Some(self.version.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

/// Provider whose snapshots are pushed in by the host.
pub struct StaticOptionsProvider {
    cell: OptionsCell,
}

impl StaticOptionsProvider {
    /// Start from `initial`, which must validate.
    pub fn new(initial: GlobalConfig) -> Result<Self> {
        initial.validate()?;
        Ok(Self {
            cell: OptionsCell::new(initial),
        })
    }

    /// Replace the policy. Invalid documents are rejected and the current
    /// snapshot stays. Returns whether the version changed.
    pub fn publish(&self, config: GlobalConfig) -> Result<bool> {
        config.validate()?;
        match self.cell.publish(config) {
            Some(version) => {
                info!(version = version, "Published rate limit policy");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Default for StaticOptionsProvider {
    fn default() -> Self {
        Self {
            cell: OptionsCell::new(GlobalConfig::default()),
        }
    }
}

impl OptionsProvider for StaticOptionsProvider {
    fn current_options(&self) -> Arc<GlobalConfig> {
        self.cell.current()
    }

    fn version(&self) -> u64 {
        self.cell.version()
    }
}

impl std::fmt::Debug for StaticOptionsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticOptionsProvider")
            .field("version", &self.cell.version())
            .finish()
    }
}
