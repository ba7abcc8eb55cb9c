mod event_handlers;
mod run;
mod spec;
mod types;

pub use self::spec::{Expansion, WorkerSpec};
pub use self::types::{LaunchError, StopOutcome, SupervisorState};

use self::types::{Generation, Inner};
use crate::resolver::Resolve;
use crate::sink::{LifecycleObserver, OutputSink};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{info, info_span, instrument, warn, Instrument};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(3000);

/// Owns at most one running worker and its two output drains.
pub struct Supervisor {
    resolver: Arc<dyn Resolve>,
    sink: Arc<dyn OutputSink>,
    observer: Arc<dyn LifecycleObserver>,
    stop_timeout: Duration,
    // Serializes start and stop.
    transition: tokio::sync::Mutex<()>,
    inner: Arc<Mutex<Inner>>,
}

impl Supervisor {
    pub fn new(
        resolver: Arc<dyn Resolve>,
        sink: Arc<dyn OutputSink>,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        Self {
            resolver,
            sink,
            observer,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            transition: tokio::sync::Mutex::new(()),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        let inner = self.inner.lock();
        match inner.state {
            SupervisorState::Running | SupervisorState::Stopping => {
                inner.current.as_ref().and_then(|g| g.pid)
            }
            _ => None,
        }
    }

    /// Starts the worker, stopping a running one first.
    #[instrument(skip(self))]
    pub async fn start(&self, spec: WorkerSpec) -> Result<(), LaunchError> {
        let _transition = self
            .transition
            .try_lock()
            .map_err(|_| LaunchError::Busy)?;

        if self.state() == SupervisorState::Running {
            info!("Worker already running, restarting");
            self.stop_locked().await;
        }
        self.inner.lock().state = SupervisorState::Starting;

        let result = self.launch(&spec).await;
        if result.is_err() {
            self.inner.lock().state = SupervisorState::Idle;
        }
        result
    }

    async fn launch(&self, spec: &WorkerSpec) -> Result<(), LaunchError> {
        let resolver = self.resolver.clone();
        let program = tokio::task::spawn_blocking(move || resolver.resolve())
            .await
            .map_err(|err| LaunchError::SpawnFailed(err.to_string()))??;

        let spawned = run::start(&program, spec, self.sink.clone())?;
        let (kill_sender, kill_receiver) = oneshot::channel();
        let (exited_sender, exited_receiver) = watch::channel(false);

        let id = {
            let mut inner = self.inner.lock();
            inner.last_generation += 1;
            let id = inner.last_generation;
            inner.current = Some(Generation {
                id,
                pid: spawned.pid,
                cancel: spawned.cancel.clone(),
                kill: Some(kill_sender),
                exited: exited_receiver,
            });
            inner.state = SupervisorState::Running;
            id
        };

        let inner = self.inner.clone();
        let sink = self.sink.clone();
        let observer = self.observer.clone();
        let grace = self.stop_timeout;
        let pid = spawned.pid;
        tokio::spawn(
            async move {
                let status = run::reap(
                    spawned.child,
                    kill_receiver,
                    spawned.drains,
                    spawned.cancel,
                    grace,
                )
                .await;
                event_handlers::handle_exit(
                    &inner,
                    id,
                    status,
                    sink.as_ref(),
                    observer.as_ref(),
                    exited_sender,
                );
            }
            .instrument(info_span!("reaper", pid, generation = id)),
        );
        Ok(())
    }

    /// Best-effort stop. Returns once the worker exited or the stop timeout passed.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> StopOutcome {
        let _transition = self.transition.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> StopOutcome {
        let (id, cancel, kill, mut exited) = {
            let mut inner = self.inner.lock();
            if inner.state != SupervisorState::Running {
                return StopOutcome::NotRunning;
            }
            let Some(generation) = inner.current.as_mut() else {
                return StopOutcome::NotRunning;
            };
            let taken = (
                generation.id,
                generation.cancel.clone(),
                generation.kill.take(),
                generation.exited.clone(),
            );
            inner.state = SupervisorState::Stopping;
            taken
        };

        info!(generation = id, "Stopping worker...");
        cancel.cancel();
        if !*exited.borrow() {
            if let Some(kill) = kill {
                if kill.send(()).is_err() {
                    warn!("Reaper already gone");
                }
            }
        }

        let waited = tokio::time::timeout(self.stop_timeout, exited.wait_for(|e| *e))
            .await
            .map(|_| ());
        match waited {
            Ok(()) => {
                info!("Worker stopped");
                StopOutcome::Exited
            }
            Err(_) => {
                event_handlers::handle_stop_timeout(&self.inner, id);
                StopOutcome::TimedOut
            }
        }
    }
}
