use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time;

use crate::error::TranscoderError;
use crate::platform;
use crate::profile;

/// Replaced by the destination url when the process is launched.
pub const DESTINATION_PLACEHOLDER: &str = "{destination}";

/// Program and argument template used to launch a transcoder.
#[derive(Debug, Clone)]
pub struct TranscoderCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl TranscoderCommand {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TranscoderCommand {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// ffmpeg reading stdin with the fixed live profile.
    pub fn ffmpeg(program: impl Into<PathBuf>) -> Self {
        let mut args = profile::LIVE.ffmpeg_args();
        args.push(DESTINATION_PLACEHOLDER.to_string());
        Self::new(program, args)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn args_for<'a>(&'a self, destination: &'a str) -> impl Iterator<Item = &'a str> {
        self.args.iter().map(move |arg| {
            if arg == DESTINATION_PLACEHOLDER {
                destination
            } else {
                arg.as_str()
            }
        })
    }
}

/// How a transcoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub exit_code: Option<i32>,
    /// Killed after the grace period ran out.
    pub forced: bool,
}

impl Termination {
    fn from_wait(status: io::Result<ExitStatus>) -> Self {
        Termination {
            exit_code: status.ok().and_then(|status| status.code()),
            forced: false,
        }
    }

    fn forced() -> Self {
        Termination {
            exit_code: None,
            forced: true,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.forced, self.exit_code) {
            (true, _) => write!(f, "killed"),
            (false, Some(code)) => write!(f, "exit code {}", code),
            (false, None) => write!(f, "terminated by signal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Running,
    Terminating,
    Terminated(Termination),
}

impl HandleState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, HandleState::Terminated(_))
    }
}

/// One running transcoder bound to one destination.
///
/// The child process itself is owned by a reaper task spawned alongside the
/// handle. The reaper publishes the final [`Termination`] through the state
/// channel, so any number of `terminate` callers can await the same exit.
pub struct TranscoderHandle {
    pid: Option<u32>,
    destination: String,
    stdin: Mutex<Option<ChildStdin>>,
    state: Arc<watch::Sender<HandleState>>,
    stop: Arc<Notify>,
    bytes_written: AtomicU64,
}

impl TranscoderHandle {
    /// Launches the transcoder. Must be called from within a tokio runtime.
    pub fn spawn(
        command: &TranscoderCommand,
        destination: String,
        grace: Duration,
    ) -> Result<Self, TranscoderError> {
        let mut child = Command::new(command.program())
            .args(command.args_for(&destination))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscoderError::Launch {
                program: command.program().to_path_buf(),
                source,
            })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_diagnostics(
                stderr,
                destination.clone(),
                ProcessLabel(pid),
            ));
        }

        let (state, _) = watch::channel(HandleState::Running);
        let state = Arc::new(state);
        let stop = Arc::new(Notify::new());
        tokio::spawn(reap(child, pid, grace, stop.clone(), state.clone()));

        log::info!("transcoder {} started", ProcessLabel(pid));

        Ok(TranscoderHandle {
            pid,
            destination,
            stdin: Mutex::new(stdin),
            state,
            stop,
            bytes_written: AtomicU64::new(0),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn state(&self) -> HandleState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == HandleState::Running
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Appends `bytes` to the transcoder's input.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), TranscoderError> {
        let mut stdin = self.stdin.lock().await;
        let pipe = match stdin.as_mut() {
            Some(pipe) if self.is_running() => pipe,
            _ => return Err(TranscoderError::WriteAfterClose),
        };

        match pipe.write_all(bytes).await {
            Ok(()) => {
                self.bytes_written
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                Err(TranscoderError::WriteAfterClose)
            }
            Err(e) => Err(TranscoderError::Write(e)),
        }
    }

    /// Closes the input, asks the process to stop and waits until it has
    /// exited or been killed after the grace period. Safe to call repeatedly
    /// and concurrently; every caller sees the same [`Termination`].
    pub async fn terminate(&self) -> Termination {
        let first = self.state.send_if_modified(|state| {
            if *state == HandleState::Running {
                *state = HandleState::Terminating;
                true
            } else {
                false
            }
        });

        if first {
            match self.stdin.try_lock() {
                Ok(mut stdin) => {
                    stdin.take();
                    self.stop.notify_one();
                }
                Err(_) => {
                    // A write is in flight. Start the shutdown clock first so
                    // a stalled write is broken by the process going away.
                    self.stop.notify_one();
                    self.stdin.lock().await.take();
                }
            }
        }

        let mut state = self.state.subscribe();
        let settled = state
            .wait_for(HandleState::is_terminated)
            .await
            .map(|state| *state);
        match settled {
            Ok(HandleState::Terminated(termination)) => termination,
            // The handle owns a sender, so the channel cannot close first.
            _ => Termination {
                exit_code: None,
                forced: false,
            },
        }
    }
}

impl Drop for TranscoderHandle {
    fn drop(&mut self) {
        if self.is_running() {
            log::warn!(
                "transcoder {} dropped while running, stopping it",
                ProcessLabel(self.pid)
            );
            self.stop.notify_one();
        }
    }
}

#[derive(Clone, Copy)]
struct ProcessLabel(Option<u32>);

impl fmt::Display for ProcessLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(pid) => write!(f, "pid={}", pid),
            None => write!(f, "pid=?"),
        }
    }
}

async fn reap(
    mut child: Child,
    pid: Option<u32>,
    grace: Duration,
    stop: Arc<Notify>,
    state: Arc<watch::Sender<HandleState>>,
) {
    let termination = tokio::select! {
        status = child.wait() => {
            let termination = Termination::from_wait(status);
            log::info!("transcoder {} exited: {}", ProcessLabel(pid), termination);
            termination
        }
        _ = stop.notified() => {
            let termination = shut_down(&mut child, pid, grace).await;
            log::info!("transcoder {} stopped: {}", ProcessLabel(pid), termination);
            termination
        }
    };
    state.send_replace(HandleState::Terminated(termination));
}

/// Input is already closed (or about to be) when this runs. The first half
/// of the grace period lets the process drain and exit on EOF, the second
/// half follows SIGTERM, after which it is killed.
async fn shut_down(child: &mut Child, pid: Option<u32>, grace: Duration) -> Termination {
    let drain = grace / 2;
    if let Ok(status) = time::timeout(drain, child.wait()).await {
        return Termination::from_wait(status);
    }

    if let Some(pid) = pid {
        send_sigterm(pid);
    }

    match time::timeout(grace - drain, child.wait()).await {
        Ok(status) => Termination::from_wait(status),
        Err(_) => {
            if let Some(pid) = pid {
                log::warn!("{}", TranscoderError::TerminationTimeout { pid, grace });
            }
            if let Err(e) = child.kill().await {
                log::error!("failed to kill transcoder {}: {}", ProcessLabel(pid), e);
            }
            Termination::forced()
        }
    }
}

fn send_sigterm(pid: u32) {
    // SAFETY: `pid` is our own child and has not been reaped yet, the
    // reaper is the only place that waits on it.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        log::warn!(
            "failed to send SIGTERM to transcoder pid={}: {}",
            pid,
            io::Error::last_os_error()
        );
    }
}

/// Longest diagnostic line that is logged, longer ones are cut.
const MAX_DIAGNOSTIC_LINE: usize = 4096;

async fn relay_diagnostics(stderr: ChildStderr, destination: String, label: ProcessLabel) {
    let relayed = read_diagnostics(BufReader::new(stderr), &destination, |line| {
        log::debug!(target: "transcoder", "[{}] {}", label, line)
    })
    .await;
    if let Err(e) = relayed {
        log::debug!(target: "transcoder", "[{}] stderr closed: {}", label, e);
    }
}

/// Splits diagnostic output into lines on `\r` as well as `\n`, as progress
/// reports rewrite a single line with carriage returns. Empty lines are
/// skipped and the destination URL never appears unredacted.
async fn read_diagnostics<R, F>(mut reader: R, destination: &str, mut emit: F) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(String),
{
    let hidden = platform::redacted(destination);
    // Room for the whole destination, so a cut never splits it before redaction.
    let limit = MAX_DIAGNOSTIC_LINE + destination.len();
    let mut line = Vec::new();
    let mut flush = |line: &mut Vec<u8>| {
        if line.is_empty() {
            return;
        }
        let mut text = String::from_utf8_lossy(line).into_owned();
        if !destination.is_empty() {
            text = text.replace(destination, &hidden);
        }
        truncate(&mut text, MAX_DIAGNOSTIC_LINE);
        emit(text);
        line.clear();
    };

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            flush(&mut line);
            return Ok(());
        }
        let len = buf.len();
        for &byte in buf {
            match byte {
                b'\r' | b'\n' => flush(&mut line),
                _ if line.len() < limit => line.push(byte),
                _ => {}
            }
        }
        reader.consume(len);
    }
}

fn truncate(text: &mut String, max: usize) {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::time::Instant;

    const GRACE: Duration = Duration::from_millis(300);

    #[test]
    fn ffmpeg_command_ends_with_destination() {
        let command = TranscoderCommand::ffmpeg("ffmpeg");
        let args: Vec<&str> = command.args_for("rtmp://live.twitch.tv/app/K1").collect();
        assert_eq!(args.first(), Some(&"-i"));
        assert_eq!(args.last(), Some(&"rtmp://live.twitch.tv/app/K1"));
        assert!(!args.contains(&DESTINATION_PLACEHOLDER));
    }

    const DESTINATION: &str = "rtmp://live.twitch.tv/app/K1";

    #[tokio::test]
    async fn forwards_bytes_to_process_input() {
        testing::init_logger();
        let dir = tempfile::tempdir().unwrap();

        let handle = TranscoderHandle::spawn(
            &testing::recording_command(dir.path()),
            DESTINATION.to_string(),
            GRACE,
        )
        .unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(handle.destination(), DESTINATION);
        assert_eq!(handle.state(), HandleState::Running);

        handle.write(b"hello ").await.unwrap();
        handle.write(b"world").await.unwrap();
        assert_eq!(handle.bytes_written(), 11);

        let termination = handle.terminate().await;
        assert_eq!(termination.exit_code, Some(0));
        assert!(!termination.forced);
        assert_eq!(
            std::fs::read(testing::recorded(dir.path(), DESTINATION)).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn write_after_terminate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handle = TranscoderHandle::spawn(
            &testing::recording_command(dir.path()),
            DESTINATION.to_string(),
            GRACE,
        )
        .unwrap();

        handle.terminate().await;
        assert!(matches!(
            handle.write(b"late").await,
            Err(TranscoderError::WriteAfterClose)
        ));
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let handle = TranscoderHandle::spawn(
            &testing::recording_command(dir.path()),
            DESTINATION.to_string(),
            GRACE,
        )
        .unwrap();

        let (first, second) = tokio::join!(handle.terminate(), handle.terminate());
        assert_eq!(first, second);
        assert_eq!(handle.terminate().await, first);
        assert_eq!(handle.state(), HandleState::Terminated(first));
    }

    #[tokio::test]
    async fn kills_process_that_ignores_sigterm() {
        testing::init_logger();
        let dir = tempfile::tempdir().unwrap();
        let handle = TranscoderHandle::spawn(
            &testing::stubborn_command(dir.path()),
            DESTINATION.to_string(),
            GRACE,
        )
        .unwrap();
        testing::wait_for_file(&testing::recorded(dir.path(), DESTINATION)).await;

        let started = Instant::now();
        let termination = handle.terminate().await;
        assert!(termination.forced);
        assert!(started.elapsed() >= GRACE);
        assert!(started.elapsed() < GRACE + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn observes_unprompted_exit() {
        let handle = TranscoderHandle::spawn(
            &TranscoderCommand::new("sh", ["-c", "exit 3"]),
            "unused".to_string(),
            GRACE,
        )
        .unwrap();

        let mut state = handle.state.subscribe();
        state.wait_for(HandleState::is_terminated).await.unwrap();
        assert!(matches!(
            handle.write(b"chunk").await,
            Err(TranscoderError::WriteAfterClose)
        ));
        assert_eq!(handle.terminate().await.exit_code, Some(3));
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let command = TranscoderCommand::new("/nonexistent/kawa-transcoder", ["-"]);
        match TranscoderHandle::spawn(&command, "unused".to_string(), GRACE) {
            Err(TranscoderError::Launch { program, .. }) => {
                assert_eq!(program, PathBuf::from("/nonexistent/kawa-transcoder"));
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("expected a launch error"),
        }
    }

    async fn collect_diagnostics(input: &[u8], destination: &str) -> Vec<String> {
        let mut lines = Vec::new();
        read_diagnostics(input, destination, |line| lines.push(line))
            .await
            .unwrap();
        lines
    }

    #[tokio::test]
    async fn diagnostics_split_on_carriage_returns() {
        let lines = collect_diagnostics(
            b"frame=    1 fps=0.0 q=0.0\rframe=   26 fps=25 q=28.0\r\n\nconversion failed",
            DESTINATION,
        )
        .await;
        assert_eq!(
            lines,
            [
                "frame=    1 fps=0.0 q=0.0",
                "frame=   26 fps=25 q=28.0",
                "conversion failed",
            ]
        );
    }

    #[tokio::test]
    async fn diagnostics_hide_the_stream_key() {
        let output = format!(
            "Output #0, flv, to '{}':\n[flv @ 0x55] Failed to connect to {}\n",
            DESTINATION, DESTINATION
        );
        let lines = collect_diagnostics(output.as_bytes(), DESTINATION).await;
        assert_eq!(
            lines,
            [
                "Output #0, flv, to 'rtmp://live.twitch.tv/app/****':",
                "[flv @ 0x55] Failed to connect to rtmp://live.twitch.tv/app/****",
            ]
        );
        assert!(lines.iter().all(|line| !line.contains("K1")));
    }

    #[tokio::test]
    async fn oversized_diagnostic_lines_are_cut() {
        let mut output = vec![b'x'; MAX_DIAGNOSTIC_LINE * 3];
        output.extend_from_slice(b"\nnext");
        let lines = collect_diagnostics(&output, DESTINATION).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_DIAGNOSTIC_LINE);
        assert_eq!(lines[1], "next");
    }

    #[tokio::test]
    async fn relays_progress_from_a_live_process() {
        let mut child = Command::new("sh")
            .args(["-c", "printf 'frame=1\\rframe=2\\r' >&2; printf 'to %s\\n' \"$0\" >&2"])
            .arg(DESTINATION)
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stderr = child.stderr.take().unwrap();

        let mut lines = Vec::new();
        read_diagnostics(BufReader::new(stderr), DESTINATION, |line| lines.push(line))
            .await
            .unwrap();
        child.wait().await.unwrap();
        assert_eq!(
            lines,
            ["frame=1", "frame=2", "to rtmp://live.twitch.tv/app/****"]
        );
    }
}
