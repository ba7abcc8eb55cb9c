use crate::resolver::ResolveError;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Exited,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Exited,
    /// The worker did not confirm its exit in time; the handle was retired anyway.
    TimedOut,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    BinaryNotFound(#[from] ResolveError),
    #[error("Failed to start process: {0}")]
    SpawnFailed(String),
    #[error("Worker is already starting or stopping")]
    Busy,
}

/// Everything owned by one `start` call, retired together.
#[derive(Debug)]
pub(super) struct Generation {
    pub id: u64,
    pub pid: Option<u32>,
    pub cancel: CancellationToken,
    /// Asks the reaper to kill the process tree.
    pub kill: Option<oneshot::Sender<()>>,
    pub exited: watch::Receiver<bool>,
}

#[derive(Debug)]
pub(super) struct Inner {
    pub state: SupervisorState,
    pub last_generation: u64,
    pub current: Option<Generation>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: SupervisorState::Idle,
            last_generation: 0,
            current: None,
        }
    }
}
