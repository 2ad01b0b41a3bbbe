//! Capability probes for execution strategies.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::RecordStore;

use super::ExecutionStrategy;

/// Checks whether a strategy's primitives are available.
pub trait CapabilityProbe: Send + Sync + std::fmt::Debug {
    /// Return `Ok` if `strategy` can run here, or `CapabilityUnavailable`.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityUnavailable` naming the missing primitive.
    fn check(&self, strategy: ExecutionStrategy) -> Result<()>;
}

/// Which strategies configuration allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Allow the installable sync worker.
    pub background_sync: bool,
    /// Allow the dedicated sampling thread.
    pub dedicated_worker: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            background_sync: true,
            dedicated_worker: true,
        }
    }
}

/// Probes the real runtime: configuration flags, a second store
/// connection, and thread spawning.
#[derive(Debug, Clone)]
pub struct RuntimeProbe {
    store: Arc<RecordStore>,
    settings: ProbeSettings,
}

impl RuntimeProbe {
    /// Create a probe for `store`.
    #[must_use]
    pub fn new(store: Arc<RecordStore>, settings: ProbeSettings) -> Self {
        Self { store, settings }
    }
}

impl CapabilityProbe for RuntimeProbe {
    fn check(&self, strategy: ExecutionStrategy) -> Result<()> {
        let capability = strategy.capability();
        match strategy {
            ExecutionStrategy::InstallableWorker => {
                if !self.settings.background_sync {
                    return Err(Error::capability_unavailable(
                        capability,
                        "disabled by configuration",
                    ));
                }
                self.store
                    .reopen()
                    .map(drop)
                    .map_err(|e| Error::capability_unavailable(capability, e.to_string()))
            }
            ExecutionStrategy::DedicatedWorker => {
                if !self.settings.dedicated_worker {
                    return Err(Error::capability_unavailable(
                        capability,
                        "disabled by configuration",
                    ));
                }
                std::thread::Builder::new()
                    .name("railtrace-probe".to_string())
                    .spawn(|| ())
                    .map_err(|e| Error::capability_unavailable(capability, e.to_string()))?
                    .join()
                    .map_err(|_| Error::capability_unavailable(capability, "probe thread panicked"))?;
                debug!("Dedicated worker thread probe succeeded");
                Ok(())
            }
            ExecutionStrategy::ForegroundTimer => Ok(()),
        }
    }
}
