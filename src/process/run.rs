use super::spec::WorkerSpec;
use super::types::LaunchError;
use crate::sink::OutputSink;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

pub(super) struct Spawned {
    pub child: Child,
    pub pid: Option<u32>,
    pub cancel: CancellationToken,
    pub drains: Vec<JoinHandle<()>>,
}

/// Spawns the worker with piped output and starts one drain task per stream.
#[instrument(skip(spec, sink))]
pub(super) fn start(
    program: &Path,
    spec: &WorkerSpec,
    sink: Arc<dyn OutputSink>,
) -> Result<Spawned, LaunchError> {
    let mut command = Command::new(program);
    command
        .args(spec.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so the whole tree can be killed at once.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|err| LaunchError::SpawnFailed(err.to_string()))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LaunchError::SpawnFailed("Missing child stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| LaunchError::SpawnFailed("Missing child stderr".into()))?;

    let cancel = CancellationToken::new();
    let drains = vec![
        tokio::spawn(
            drain(stdout, "stdout", cancel.clone(), sink.clone())
                .instrument(info_span!("read_stdout", pid)),
        ),
        tokio::spawn(
            drain(stderr, "stderr", cancel.clone(), sink)
                .instrument(info_span!("read_stderr", pid)),
        ),
    ];

    info!("Child started: {}", spec.command_line(&program.to_string_lossy()));
    Ok(Spawned {
        child,
        pid,
        cancel,
        drains,
    })
}

pub(super) fn forward(sink: &dyn OutputSink, line: &str) {
    if sink.is_available() {
        sink.append(line);
    }
}

async fn drain<R: AsyncRead + Unpin>(
    stream: R,
    name: &'static str,
    cancel: CancellationToken,
    sink: Arc<dyn OutputSink>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut buf = Vec::new();
        let read = select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("{name} drain cancelled");
                return;
            }
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                error!(?err, "Reading {name} failed");
                forward(sink.as_ref(), &format!("[{name} read error] {err}\n"));
                return;
            }
        }
        if !buf.ends_with(b"\n") {
            buf.push(b'\n');
        }
        forward(sink.as_ref(), &String::from_utf8_lossy(&buf));
    }
    debug!("{name} closed");
}

/// Waits for the worker to exit, killing it when asked, then gives the
/// drains until `grace` to hit end-of-stream.
pub(super) async fn reap(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    drains: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    grace: Duration,
) -> Option<ExitStatus> {
    let status = select! {
        status = child.wait() => status,
        _ = kill => {
            kill_tree(&mut child);
            child.wait().await
        }
    };
    let status = match status {
        Ok(status) => Some(status),
        Err(err) => {
            error!(?err, "Failed to wait for child");
            None
        }
    };

    let deadline = Instant::now() + grace;
    for drain in drains {
        if tokio::time::timeout_at(deadline, drain).await.is_err() {
            warn!("Output still open after exit, cancelling drains");
            break;
        }
    }
    cancel.cancel();
    status
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        debug!("Child already reaped");
        return;
    };
    match killpg(Pid::from_raw(pid as nix::libc::pid_t), Signal::SIGKILL) {
        Ok(_) => info!(pid, "Killed child process group"),
        Err(err) => {
            warn!(?err, "Failed to signal process group, killing child only");
            if let Err(err) = child.start_kill() {
                error!(?err, "Failed to kill child");
            }
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        error!(?err, "Failed to kill child");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    #[derive(Default)]
    struct Lines(Mutex<Vec<String>>);

    impl Lines {
        fn taken(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    impl OutputSink for Lines {
        fn append(&self, line: &str) {
            self.0.lock().push(line.to_string());
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    /// Yields `data`, then fails every read.
    struct Failing {
        data: &'static [u8],
    }

    impl AsyncRead for Failing {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.data.is_empty() {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "boom")));
            }
            let n = self.data.len().min(buf.remaining());
            buf.put_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn read_error_ends_drain_with_one_line() {
        let sink = Arc::new(Lines::default());
        drain(
            Failing { data: b"ok\r\n" },
            "stdout",
            CancellationToken::new(),
            sink.clone(),
        )
        .await;
        assert_eq!(sink.taken(), ["ok\r\n", "[stdout read error] boom\n"]);
    }

    #[tokio::test]
    async fn unterminated_last_line_is_completed_lossily() {
        let sink = Arc::new(Lines::default());
        drain(
            &b"a\nno-newline\xff"[..],
            "stdout",
            CancellationToken::new(),
            sink.clone(),
        )
        .await;
        assert_eq!(sink.taken(), ["a\n", "no-newline\u{FFFD}\n"]);
    }

    #[tokio::test]
    async fn failed_drain_leaves_sibling_running() {
        let sink = Arc::new(Lines::default());
        let cancel = CancellationToken::new();
        let (mut writer, reader) = tokio::io::duplex(64);

        let sibling = tokio::spawn(drain(reader, "stdout", cancel.clone(), sink.clone()));
        drain(Failing { data: b"" }, "stderr", cancel.clone(), sink.clone()).await;

        writer.write_all(b"later\n").await.unwrap();
        drop(writer);
        tokio::time::timeout(Duration::from_secs(5), sibling)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.taken(), ["[stderr read error] boom\n", "later\n"]);
    }

    #[tokio::test]
    async fn cancel_stops_drain_on_open_stream() {
        let sink = Arc::new(Lines::default());
        let cancel = CancellationToken::new();
        let (_writer, reader) = tokio::io::duplex(64);

        let handle = tokio::spawn(drain(reader, "stdout", cancel.clone(), sink.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(sink.taken().is_empty());
    }
}
