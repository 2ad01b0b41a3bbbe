//! Sampling on a dedicated OS thread.
//!
//! The thread runs its own single-threaded Tokio runtime and a
//! [`SamplerControl`]. Records come back to the host over the sampler event
//! channel; persistence and sync stay in the host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::record::EventFields;
use crate::sampler::{Sampler, SamplerControl, SamplerEvent};

const CAPABILITY: &str = "dedicated_worker";

/// Longest wait for the thread to confirm a stop.
const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Command {
    Start {
        interval: Duration,
        event: EventFields,
    },
    Stop {
        ack: std_mpsc::Sender<()>,
    },
}

/// Handle to the dedicated sampling thread.
#[derive(Debug)]
pub struct DedicatedWorker {
    commands: mpsc::UnboundedSender<Command>,
    active: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl DedicatedWorker {
    /// Spawn the sampling thread. It idles until [`DedicatedWorker::start`].
    ///
    /// # Errors
    ///
    /// Returns `CapabilityUnavailable` if the thread cannot be spawned.
    pub fn spawn(sampler: Sampler, events: mpsc::Sender<SamplerEvent>) -> Result<Self> {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(false));
        let thread_active = Arc::clone(&active);

        let thread = std::thread::Builder::new()
            .name("railtrace-sampler".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "Failed to build sampler runtime");
                        return;
                    }
                };

                runtime.block_on(async move {
                    let mut control = SamplerControl::new(sampler);
                    while let Some(command) = rx.recv().await {
                        match command {
                            Command::Start { interval, event } => {
                                control.start(interval, event, events.clone());
                            }
                            Command::Stop { ack } => {
                                control.stop();
                                let _ = ack.send(());
                            }
                        }
                    }
                    control.stop();
                    thread_active.store(false, Ordering::SeqCst);
                    debug!("Dedicated sampler thread exiting");
                });
            })
            .map_err(|e| Error::capability_unavailable(CAPABILITY, e.to_string()))?;

        info!("Dedicated sampler thread started");
        Ok(Self {
            commands,
            active,
            thread,
        })
    }

    /// Start sampling on the worker thread.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityUnavailable` if the thread has exited.
    pub fn start(&self, interval: Duration, event: EventFields) -> Result<()> {
        self.send(Command::Start { interval, event })?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop sampling. Returns whether sampling was active.
    ///
    /// Waits for the thread to cancel its schedule, so no tick emits a
    /// record once this returns.
    pub fn stop(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        let (ack, acked) = std_mpsc::channel();
        // A dead thread is already stopped.
        if self.send(Command::Stop { ack }).is_ok()
            && acked.recv_timeout(STOP_ACK_TIMEOUT).is_err()
        {
            warn!("Sampler thread did not confirm stop");
        }
        was_active
    }

    /// Whether sampling is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the worker thread is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Stop sampling and let the thread exit.
    pub fn shutdown(self) {
        self.stop();
        drop(self.commands);
        debug!("Dedicated sampler thread released");
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::capability_unavailable(CAPABILITY, "sampler thread has exited"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::PositionFeed;
    use crate::sampler::{SamplingMode, SyntheticOrigin};

    fn synthetic_sampler() -> Sampler {
        Sampler::new(
            PositionFeed::new(),
            SamplingMode::Synthetic,
            SyntheticOrigin::default(),
        )
    }

    #[tokio::test]
    async fn test_worker_thread_produces_records() {
        let (tx, mut rx) = mpsc::channel(8);
        let worker = DedicatedWorker::spawn(synthetic_sampler(), tx).unwrap();
        assert!(worker.is_alive());

        worker
            .start(Duration::from_millis(10), EventFields::default())
            .unwrap();
        assert!(worker.is_active());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SamplerEvent::Record(_)));

        assert!(worker.stop());
        assert!(!worker.is_active());
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_no_record_after_stop_returns() {
        let (tx, mut rx) = mpsc::channel(256);
        let worker = DedicatedWorker::spawn(synthetic_sampler(), tx).unwrap();
        worker
            .start(Duration::from_millis(1), EventFields::default())
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(worker.stop());
        // Records sampled before the stop are still queued.
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let (tx, _rx) = mpsc::channel(8);
        let worker = DedicatedWorker::spawn(synthetic_sampler(), tx).unwrap();
        assert!(!worker.stop());
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_thread_exits_after_shutdown() {
        let (tx, mut rx) = mpsc::channel(8);
        let worker = DedicatedWorker::spawn(synthetic_sampler(), tx).unwrap();
        worker
            .start(Duration::from_millis(5), EventFields::default())
            .unwrap();
        worker.shutdown();

        // Every sender lives on the worker thread; the channel closes once it exits.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }
}
