use tokio::sync::mpsc;

/// Receives worker output, one line at a time, terminator included.
pub trait OutputSink: Send + Sync {
    fn append(&self, line: &str);

    /// False once the display has been torn down.
    fn is_available(&self) -> bool;
}

pub trait LifecycleObserver: Send + Sync {
    /// Called once per process generation, from a background task.
    fn on_exited(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Output(String),
    Exited,
}

/// Posts events to the display loop; producers never touch the display.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl OutputSink for ChannelSink {
    fn append(&self, line: &str) {
        let _ = self.sender.send(UiEvent::Output(line.to_string()));
    }

    fn is_available(&self) -> bool {
        !self.sender.is_closed()
    }
}

impl LifecycleObserver for ChannelSink {
    fn on_exited(&self) {
        let _ = self.sender.send(UiEvent::Exited);
    }
}
