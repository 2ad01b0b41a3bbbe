//! Execution strategies.
//!
//! Three ways to run a recording session, in order of preference:
//!
//! - [`ExecutionStrategy::InstallableWorker`]: sampling in the host, syncs
//!   registered with a background [`SyncWorker`] that owns its own store
//!   connection and also syncs on a periodic timer.
//! - [`ExecutionStrategy::DedicatedWorker`]: sampling on a
//!   [`DedicatedWorker`] thread, persistence and sync in the host.
//! - [`ExecutionStrategy::ForegroundTimer`]: everything in the host runtime.
//!
//! The strategy is chosen once at startup by [`select_strategy`]. All three
//! expose the same start/stop/trigger contract through [`StrategyRunner`].

pub mod dedicated;
pub mod probe;
pub mod sync_worker;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::queue::SyncTrigger;
use crate::record::EventFields;
use crate::reporter::StatusReporter;
use crate::sampler::{Sampler, SamplerControl, SamplerEvent, SamplerState};
use crate::sink::Sink;
use crate::storage::RecordStore;
use crate::sync::{SyncEngine, SyncReason};

pub use dedicated::DedicatedWorker;
pub use probe::{CapabilityProbe, ProbeSettings, RuntimeProbe};
pub use sync_worker::{SyncWorker, SyncWorkerHandle};

/// How a recording session is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Background sync worker with periodic sync.
    InstallableWorker,
    /// Sampling on a dedicated thread.
    DedicatedWorker,
    /// Plain timers in the host.
    ForegroundTimer,
}

impl ExecutionStrategy {
    /// Strategies in order of preference.
    pub const PREFERENCE: [Self; 3] = [
        Self::InstallableWorker,
        Self::DedicatedWorker,
        Self::ForegroundTimer,
    ];

    /// Name of the capability the strategy depends on.
    #[must_use]
    pub const fn capability(self) -> &'static str {
        match self {
            Self::InstallableWorker => "background_sync",
            Self::DedicatedWorker => "dedicated_worker",
            Self::ForegroundTimer => "timer",
        }
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InstallableWorker => write!(f, "installable_worker"),
            Self::DedicatedWorker => write!(f, "dedicated_worker"),
            Self::ForegroundTimer => write!(f, "foreground_timer"),
        }
    }
}

/// The chosen strategy and why the preferred ones were skipped.
#[derive(Debug)]
pub struct StrategySelection {
    /// Strategy to run.
    pub strategy: ExecutionStrategy,
    /// Capability failures of the strategies tried before it.
    pub fallbacks: Vec<Error>,
}

/// Probe strategies in preference order and pick the first available one.
///
/// Each unavailable capability is logged once. The foreground timer is
/// always available.
#[must_use]
pub fn select_strategy(probe: &dyn CapabilityProbe) -> StrategySelection {
    let mut fallbacks = Vec::new();
    for strategy in ExecutionStrategy::PREFERENCE {
        match probe.check(strategy) {
            Ok(()) => {
                info!(%strategy, "Execution strategy selected");
                return StrategySelection {
                    strategy,
                    fallbacks,
                };
            }
            Err(e) => {
                warn!(%strategy, error = %e, "Strategy unavailable, falling back");
                fallbacks.push(e);
            }
        }
    }
    StrategySelection {
        strategy: ExecutionStrategy::ForegroundTimer,
        fallbacks,
    }
}

/// Everything a strategy needs to run.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    /// Sampler template.
    pub sampler: Sampler,
    /// Host store.
    pub store: Arc<RecordStore>,
    /// Sink for the background worker.
    pub sink: Arc<dyn Sink>,
    /// Host sync engine.
    pub engine: SyncEngine,
    /// Status fan-out.
    pub reporter: StatusReporter,
    /// Batch cap for the background worker.
    pub max_batch_size: usize,
    /// Background worker timer period.
    pub periodic_sync_interval: Duration,
    /// Where sampled records go.
    pub events: mpsc::Sender<SamplerEvent>,
}

#[derive(Debug)]
enum Sampling {
    Host {
        control: SamplerControl,
        events: mpsc::Sender<SamplerEvent>,
    },
    Dedicated(DedicatedWorker),
}

#[derive(Debug)]
enum SyncPath {
    Host(SyncEngine),
    Worker(SyncWorker),
}

/// A launched strategy.
#[derive(Debug)]
pub struct StrategyRunner {
    strategy: ExecutionStrategy,
    sampling: Sampling,
    sync: SyncPath,
}

impl StrategyRunner {
    /// Launch `strategy`.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityUnavailable` (or a storage error) if the
    /// strategy's primitives fail to start.
    pub fn launch(strategy: ExecutionStrategy, ctx: StrategyContext) -> Result<Self> {
        let (sampling, sync) = match strategy {
            ExecutionStrategy::InstallableWorker => {
                let worker = SyncWorker::spawn(
                    &ctx.store,
                    ctx.sink,
                    ctx.reporter,
                    ctx.max_batch_size,
                    ctx.periodic_sync_interval,
                )
                .map_err(|e| Error::capability_unavailable(strategy.capability(), e.to_string()))?;
                (
                    Sampling::Host {
                        control: SamplerControl::new(ctx.sampler),
                        events: ctx.events,
                    },
                    SyncPath::Worker(worker),
                )
            }
            ExecutionStrategy::DedicatedWorker => (
                Sampling::Dedicated(DedicatedWorker::spawn(ctx.sampler, ctx.events)?),
                SyncPath::Host(ctx.engine),
            ),
            ExecutionStrategy::ForegroundTimer => (
                Sampling::Host {
                    control: SamplerControl::new(ctx.sampler),
                    events: ctx.events,
                },
                SyncPath::Host(ctx.engine),
            ),
        };

        info!(%strategy, "Execution strategy launched");
        Ok(Self {
            strategy,
            sampling,
            sync,
        })
    }

    /// Launch `strategy`, falling back to the foreground timer if it fails.
    ///
    /// Returns the runner and the launch error, if there was one.
    #[must_use]
    pub fn launch_or_fallback(
        strategy: ExecutionStrategy,
        ctx: StrategyContext,
    ) -> (Self, Option<Error>) {
        if strategy == ExecutionStrategy::ForegroundTimer {
            return (Self::foreground(ctx), None);
        }
        match Self::launch(strategy, ctx.clone()) {
            Ok(runner) => (runner, None),
            Err(e) => {
                warn!(%strategy, error = %e, "Strategy failed to launch, using foreground timer");
                (Self::foreground(ctx), Some(e))
            }
        }
    }

    fn foreground(ctx: StrategyContext) -> Self {
        Self {
            strategy: ExecutionStrategy::ForegroundTimer,
            sampling: Sampling::Host {
                control: SamplerControl::new(ctx.sampler),
                events: ctx.events,
            },
            sync: SyncPath::Host(ctx.engine),
        }
    }

    /// The running strategy.
    #[must_use]
    pub const fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Start sampling. Returns `false` if already recording.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityUnavailable` if the sampling context has died.
    pub fn start_recording(&mut self, interval: Duration, event: EventFields) -> Result<bool> {
        match &mut self.sampling {
            Sampling::Host { control, events } => {
                Ok(control.start(interval, event, events.clone()))
            }
            Sampling::Dedicated(worker) => {
                if worker.is_active() {
                    return Ok(false);
                }
                worker.start(interval, event)?;
                Ok(true)
            }
        }
    }

    /// Stop sampling. Returns whether sampling was active.
    pub fn stop_recording(&mut self) -> bool {
        match &mut self.sampling {
            Sampling::Host { control, .. } => control.stop(),
            Sampling::Dedicated(worker) => worker.stop(),
        }
    }

    /// Whether sampling is active.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        match &self.sampling {
            Sampling::Host { control, .. } => control.state() == SamplerState::Active,
            Sampling::Dedicated(worker) => worker.is_active(),
        }
    }

    /// Request a sync through this strategy's sync path.
    pub fn trigger_sync(&self, reason: SyncReason) -> bool {
        match &self.sync {
            SyncPath::Host(engine) => engine.trigger(reason),
            SyncPath::Worker(worker) => worker.handle().register(reason),
        }
    }

    /// Trigger for the queue manager's threshold.
    #[must_use]
    pub fn sync_trigger(&self) -> Arc<dyn SyncTrigger> {
        match &self.sync {
            SyncPath::Host(engine) => Arc::new(engine.clone()),
            SyncPath::Worker(worker) => Arc::new(worker.handle()),
        }
    }

    /// Stop sampling and release workers.
    pub fn shutdown(self) {
        match self.sampling {
            Sampling::Host { mut control, .. } => {
                control.stop();
            }
            Sampling::Dedicated(worker) => worker.shutdown(),
        }
        if let SyncPath::Worker(worker) = self.sync {
            worker.shutdown();
        }
        info!(strategy = %self.strategy, "Execution strategy shut down");
    }
}
