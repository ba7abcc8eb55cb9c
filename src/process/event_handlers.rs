use super::run::forward;
use super::types::{Inner, SupervisorState};
use crate::sink::{LifecycleObserver, OutputSink};
use parking_lot::Mutex;
use std::process::ExitStatus;
use tokio::sync::watch;
use tracing::{info, warn};

pub(super) fn handle_exit(
    inner: &Mutex<Inner>,
    generation: u64,
    status: Option<ExitStatus>,
    sink: &dyn OutputSink,
    observer: &dyn LifecycleObserver,
    exited: watch::Sender<bool>,
) {
    let code = status.and_then(|s| s.code());
    match code {
        Some(0) => info!("Process exited with exit code 0"),
        Some(code) => warn!("Process exited with non-zero exit code {}", code),
        None => info!("Process exited without exit code"),
    }

    {
        let mut inner = inner.lock();
        let current = inner.current.as_ref().map(|g| g.id) == Some(generation);
        if current
            && matches!(
                inner.state,
                SupervisorState::Running | SupervisorState::Stopping
            )
        {
            inner.state = SupervisorState::Exited;
        }
    }

    let line = match code {
        Some(code) => format!("[process exited] code {code}\n"),
        None => "[process exited]\n".to_string(),
    };
    forward(sink, &line);
    observer.on_exited();
    let _ = exited.send(true);
}

/// The worker never confirmed its exit; retire its generation anyway.
pub(super) fn handle_stop_timeout(inner: &Mutex<Inner>, generation: u64) {
    warn!(generation, "Stop timeout reached, giving up on worker");
    let mut inner = inner.lock();
    if inner.current.as_ref().map(|g| g.id) == Some(generation) {
        inner.state = SupervisorState::Exited;
    }
}
