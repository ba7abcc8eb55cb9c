use crate::process::{Expansion, StopOutcome, Supervisor, SupervisorState, WorkerSpec};
use crate::settings::{SettingsStore, UserSettings};
use crate::sink::UiEvent;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log_buffer::LogBuffer;
use std::fmt::Write as _;
use std::future::Future;
use std::io::BufRead;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, instrument, warn};

const HELP: &str = "\
Commands:
  start            validate the fields and launch the worker
  stop             stop the worker
  restart          stop, then start again
  status           show worker state
  log              replay recent worker output
  ip <address>     set the server address
  version <1.2x>   set the game version
  tft | roc        choose the expansion
  settings         show the saved fields
  open-settings    open the settings file in the default editor
  quit             stop the worker and exit
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
    Status,
    Log,
    Ip(String),
    Version(String),
    Tft,
    Roc,
    Settings,
    OpenSettings,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let command = match (word.to_lowercase().as_str(), rest) {
            ("start", "") => Command::Start,
            ("stop", "") => Command::Stop,
            ("restart", "") => Command::Restart,
            ("status", "") => Command::Status,
            ("log", "") => Command::Log,
            ("ip", value) if !value.is_empty() => Command::Ip(value.to_string()),
            ("version", value) if !value.is_empty() => Command::Version(value.to_string()),
            ("tft", "") => Command::Tft,
            ("roc", "") => Command::Roc,
            ("settings", "") => Command::Settings,
            ("open-settings", "") => Command::OpenSettings,
            ("help" | "?", "") => Command::Help,
            ("quit" | "exit", "") => Command::Quit,
            _ => return Err(format!("Unknown command: {line} (try `help`)")),
        };
        Ok(command)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue(Option<String>),
    Quit,
}

/// Single-threaded front end: owns the display, the editable fields and the
/// output scrollback.
pub struct Console {
    supervisor: Supervisor,
    settings: SettingsStore,
    fields: UserSettings,
    scrollback: LogBuffer<Vec<u8>>,
}

impl Console {
    pub fn new(supervisor: Supervisor, settings: SettingsStore, scrollback: usize) -> Self {
        let fields = settings.load().unwrap_or_default();
        Self {
            supervisor,
            settings,
            fields,
            scrollback: LogBuffer::new(vec![0; scrollback.max(1)]),
        }
    }

    /// Reads operator input from the process stdin and stops on Ctrl-C.
    pub async fn run(self, events: UnboundedReceiver<UiEvent>, autostart: bool) -> Result<()> {
        let input = spawn_stdin_reader();
        let interrupted = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(?err, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        self.run_with(events, input, interrupted, tokio::io::stdout(), autostart)
            .await
    }

    /// Display loop. Ends on `shutdown`, `quit` or the end of `input`, then
    /// stops the worker and saves the fields.
    pub async fn run_with<F, W>(
        mut self,
        mut events: UnboundedReceiver<UiEvent>,
        mut input: UnboundedReceiver<String>,
        shutdown: F,
        mut out: W,
        autostart: bool,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
        W: AsyncWrite + Unpin,
    {
        tokio::pin!(shutdown);

        let banner = format!(
            "wc3proxy launcher: {} / {} / {} (type `help`)\n",
            self.fields.ip,
            self.fields.version,
            Expansion::from_tft(self.fields.is_tft)
        );
        out.write_all(banner.as_bytes()).await?;
        if autostart {
            if let Flow::Continue(Some(message)) = self.execute(Command::Start).await {
                out.write_all(format!("{message}\n").as_bytes()).await?;
            }
        }
        out.flush().await?;

        loop {
            let line = select! {
                biased;
                _ = &mut shutdown => {
                    info!("Interrupted");
                    break;
                }
                Some(event) = events.recv() => {
                    let text = self.on_event(event);
                    out.write_all(text.as_bytes()).await?;
                    out.flush().await?;
                    continue;
                }
                line = input.recv() => line,
            };
            let Some(line) = line else {
                debug!("Stdin closed");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let flow = match line.parse::<Command>() {
                Ok(command) => self.execute(command).await,
                Err(message) => Flow::Continue(Some(message)),
            };
            match flow {
                Flow::Continue(Some(message)) => {
                    out.write_all(format!("{message}\n").as_bytes()).await?;
                    out.flush().await?;
                }
                Flow::Continue(None) => {}
                Flow::Quit => break,
            }
        }

        self.shutdown().await;
        out.flush().await.wrap_err("Failed to flush console output")?;
        Ok(())
    }

    /// Text to display for an event posted by the supervisor.
    pub fn on_event(&mut self, event: UiEvent) -> String {
        match event {
            UiEvent::Output(line) => {
                if let Err(err) = self.scrollback.write_str(&line) {
                    error!(?err, "Scrollback error");
                }
                line
            }
            UiEvent::Exited => "Worker exited, `start` to launch it again\n".into(),
        }
    }

    #[instrument(skip(self))]
    pub async fn execute(&mut self, command: Command) -> Flow {
        let message = match command {
            Command::Start => self.start().await,
            Command::Stop => describe_stop(self.supervisor.stop().await).into(),
            Command::Restart => {
                self.supervisor.stop().await;
                self.start().await
            }
            Command::Status => self.status(),
            Command::Log => {
                let text = self.scrollback.extract().trim_matches('\0').to_string();
                if text.is_empty() {
                    "No output yet".into()
                } else {
                    text.trim_end().to_string()
                }
            }
            Command::Ip(ip) => {
                self.fields.ip = ip;
                self.save()
            }
            Command::Version(version) => {
                self.fields.version = version;
                self.save()
            }
            Command::Tft => {
                self.fields.is_tft = true;
                self.save()
            }
            Command::Roc => {
                self.fields.is_tft = false;
                self.save()
            }
            Command::Settings => format!(
                "{}\n  Ip: {}\n  Version: {}\n  IsTft: {}",
                self.settings.path().display(),
                self.fields.ip,
                self.fields.version,
                self.fields.is_tft
            ),
            Command::OpenSettings => self.open_settings().await,
            Command::Help => HELP.trim_end().into(),
            Command::Quit => return Flow::Quit,
        };
        Flow::Continue(Some(message))
    }

    async fn start(&mut self) -> String {
        let spec = match WorkerSpec::new(
            &self.fields.ip,
            &self.fields.version,
            Expansion::from_tft(self.fields.is_tft),
        ) {
            Ok(spec) => spec,
            Err(err) => return err.to_string(),
        };
        match self.supervisor.start(spec).await {
            Ok(()) => match self.supervisor.pid() {
                Some(pid) => format!("Worker started (pid {pid})"),
                None => "Worker started".into(),
            },
            Err(err) => {
                warn!(?err, "Failed to start worker");
                err.to_string()
            }
        }
    }

    fn status(&self) -> String {
        let state = self.supervisor.state();
        match (state, self.supervisor.pid()) {
            (SupervisorState::Running, Some(pid)) => format!("Running (pid {pid})"),
            (state, _) => format!("{state:?}"),
        }
    }

    fn save(&self) -> String {
        match self.settings.save(&self.fields) {
            Ok(()) => "Saved".into(),
            Err(err) => {
                error!(?err, "Failed to save settings");
                format!("[save settings error] {err}")
            }
        }
    }

    async fn open_settings(&self) -> String {
        if let Err(err) = self.settings.ensure_exists(&self.fields) {
            return format!("Failed to open settings file: {err}");
        }
        match open_path(self.settings.path()).await {
            Ok(()) => format!("Opened {}", self.settings.path().display()),
            Err(err) => format!("Failed to open settings file: {err}"),
        }
    }

    /// Stops the worker before the host goes away, then flushes the fields.
    #[instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        info!("Shutting down");
        let outcome = self.supervisor.stop().await;
        debug!(?outcome, "Worker stopped for shutdown");
        if let Err(err) = self.settings.save(&self.fields) {
            error!(?err, "Failed to save settings on shutdown");
        }
    }
}

/// Blocking stdin reads live on their own thread so they never hold up the
/// runtime on exit.
fn spawn_stdin_reader() -> UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(?err, "Failed to read stdin");
                        break;
                    }
                }
            }
        });
    if let Err(err) = spawned {
        error!(?err, "Failed to spawn stdin reader");
    }
    rx
}

fn describe_stop(outcome: StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::NotRunning => "Worker is not running",
        StopOutcome::Exited => "Worker stopped",
        StopOutcome::TimedOut => "Worker did not confirm exit in time, moving on",
    }
}

async fn open_path(path: &Path) -> std::io::Result<()> {
    #[cfg(windows)]
    let mut command = {
        let mut command = tokio::process::Command::new("cmd");
        command.args(["/C", "start", ""]);
        command
    };
    #[cfg(target_os = "macos")]
    let mut command = tokio::process::Command::new("open");
    #[cfg(all(unix, not(target_os = "macos")))]
    let mut command = tokio::process::Command::new("xdg-open");

    let status = command
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("opener exited with {status}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{Resolve, ResolveError};
    use crate::settings::SETTINGS_FILE_NAME;
    use crate::sink::ChannelSink;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Missing;

    impl Resolve for Missing {
        fn resolve(&self) -> std::result::Result<PathBuf, ResolveError> {
            Err(ResolveError::NotFound)
        }
    }

    fn new_console(dir: &TempDir) -> Console {
        let (sink, _events) = ChannelSink::new();
        let sink = Arc::new(sink);
        let supervisor = Supervisor::new(Arc::new(Missing), sink.clone(), sink);
        Console::new(
            supervisor,
            SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME)),
            128,
        )
    }

    fn message(flow: Flow) -> String {
        match flow {
            Flow::Continue(Some(message)) => message,
            other => panic!("unexpected flow {other:?}"),
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!("start".parse::<Command>(), Ok(Command::Start));
        assert_eq!("  STOP ".parse::<Command>(), Ok(Command::Stop));
        assert_eq!(
            "ip 10.0.0.1".parse::<Command>(),
            Ok(Command::Ip("10.0.0.1".into()))
        );
        assert_eq!(
            "version   1.26".parse::<Command>(),
            Ok(Command::Version("1.26".into()))
        );
        assert_eq!("open-settings".parse::<Command>(), Ok(Command::OpenSettings));
        assert!("ip".parse::<Command>().is_err());
        assert!("start now".parse::<Command>().is_err());
        assert!("launch".parse::<Command>().is_err());
    }

    #[tokio::test]
    async fn starts_from_defaults() {
        let dir = TempDir::new().unwrap();
        let console = new_console(&dir);
        assert_eq!(console.fields, UserSettings::default());
    }

    #[tokio::test]
    async fn field_changes_are_saved() {
        let dir = TempDir::new().unwrap();
        let mut console = new_console(&dir);
        assert_eq!(message(console.execute(Command::Ip("10.1.1.1".into())).await), "Saved");
        assert_eq!(message(console.execute(Command::Tft).await), "Saved");

        let stored = SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME))
            .load()
            .unwrap();
        assert_eq!(stored.ip, "10.1.1.1");
        assert!(stored.is_tft);

        let reopened = new_console(&dir);
        assert_eq!(reopened.fields, stored);
    }

    #[tokio::test]
    async fn invalid_fields_never_reach_supervisor() {
        let dir = TempDir::new().unwrap();
        let mut console = new_console(&dir);
        console.execute(Command::Ip("999.0.0.1".into())).await;
        assert_eq!(message(console.execute(Command::Start).await), "Invalid IP");

        console.execute(Command::Ip("1.0.0.1".into())).await;
        console.execute(Command::Version("1.40".into())).await;
        assert_eq!(message(console.execute(Command::Start).await), "Invalid Version");
        assert_eq!(console.supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn reports_missing_binary() {
        let dir = TempDir::new().unwrap();
        let mut console = new_console(&dir);
        assert_eq!(
            message(console.execute(Command::Start).await),
            "Embedded CLI not found"
        );
        assert_eq!(message(console.execute(Command::Status).await), "Idle");
        assert_eq!(
            message(console.execute(Command::Stop).await),
            "Worker is not running"
        );
    }

    #[tokio::test]
    async fn log_replays_output() {
        let dir = TempDir::new().unwrap();
        let mut console = new_console(&dir);
        assert_eq!(message(console.execute(Command::Log).await), "No output yet");

        assert_eq!(console.on_event(UiEvent::Output("hello\n".into())), "hello\n");
        console.on_event(UiEvent::Output("world\n".into()));
        assert_eq!(message(console.execute(Command::Log).await), "hello\nworld");
    }

    #[tokio::test]
    async fn quit_and_shutdown_persist_fields() {
        let dir = TempDir::new().unwrap();
        let mut console = new_console(&dir);
        console.fields.version = "1.30".into();
        assert_eq!(console.execute(Command::Quit).await, Flow::Quit);
        console.shutdown().await;

        let stored = SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME))
            .load()
            .unwrap();
        assert_eq!(stored.version, "1.30");
    }

    #[tokio::test]
    async fn interrupt_wins_over_pending_output() {
        let dir = TempDir::new().unwrap();
        let mut console = new_console(&dir);
        console.fields.ip = "10.3.3.3".into();

        let (events_tx, events) = mpsc::unbounded_channel();
        for i in 0..10_000 {
            events_tx.send(UiEvent::Output(format!("line {i}\n"))).unwrap();
        }
        let (_input_tx, input) = mpsc::unbounded_channel();
        let (interrupt, interrupted) = tokio::sync::oneshot::channel::<()>();
        interrupt.send(()).unwrap();

        let run = console.run_with(
            events,
            input,
            async {
                let _ = interrupted.await;
            },
            tokio::io::sink(),
            false,
        );
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("console kept draining output after the interrupt")
            .unwrap();

        let stored = SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME))
            .load()
            .unwrap();
        assert_eq!(stored.ip, "10.3.3.3");
    }

    #[tokio::test]
    async fn interrupt_during_steady_output_is_not_lost() {
        let dir = TempDir::new().unwrap();
        let console = new_console(&dir);

        let (events_tx, events) = mpsc::unbounded_channel();
        let (_input_tx, input) = mpsc::unbounded_channel();
        let (interrupt, interrupted) = tokio::sync::oneshot::channel::<()>();
        let producer = tokio::spawn(async move {
            let mut interrupt = Some(interrupt);
            for i in 0..100_000 {
                if events_tx.send(UiEvent::Output(format!("line {i}\n"))).is_err() {
                    break;
                }
                if i == 50 {
                    if let Some(interrupt) = interrupt.take() {
                        let _ = interrupt.send(());
                    }
                }
                tokio::task::yield_now().await;
            }
        });

        let run = console.run_with(
            events,
            input,
            async {
                let _ = interrupted.await;
            },
            tokio::io::sink(),
            false,
        );
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("interrupt was lost")
            .unwrap();
        producer.abort();
    }

    #[tokio::test]
    async fn runs_commands_until_input_ends() {
        let dir = TempDir::new().unwrap();
        let console = new_console(&dir);

        let (_events_tx, events) = mpsc::unbounded_channel();
        let (input_tx, input) = mpsc::unbounded_channel();
        input_tx.send("ip 10.2.2.2".to_string()).unwrap();
        input_tx.send("".to_string()).unwrap();
        input_tx.send("bogus".to_string()).unwrap();
        drop(input_tx);

        let mut out = Vec::new();
        console
            .run_with(events, input, std::future::pending::<()>(), &mut out, false)
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("wc3proxy launcher: 1.0.0.1 / 1.29 / RoC"));
        assert!(text.contains("Saved\n"));
        assert!(text.contains("Unknown command: bogus"));

        let stored = SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME))
            .load()
            .unwrap();
        assert_eq!(stored.ip, "10.2.2.2");
    }

    #[tokio::test]
    async fn quit_command_ends_loop_with_input_open() {
        let dir = TempDir::new().unwrap();
        let console = new_console(&dir);

        let (_events_tx, events) = mpsc::unbounded_channel();
        let (input_tx, input) = mpsc::unbounded_channel();
        input_tx.send("quit".to_string()).unwrap();

        let run = console.run_with(events, input, std::future::pending::<()>(), tokio::io::sink(), false);
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(dir.path().join(SETTINGS_FILE_NAME).exists());
    }
}
