//! Output capture under a shared byte ceiling.
//!
//! Both pipes are read line by line. Each line is redacted before it is
//! counted, stored or streamed, so nothing downstream ever sees raw output.
//! Once the ceiling is reached further output is drained and dropped and the
//! result is marked truncated. The flag is sticky.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::error::ProcessError;
use crate::process_group::{self, DEFAULT_GRACEFUL_TIMEOUT_MS};
use crate::spawn::{SpawnSpec, spawn_confined};
use crate::stream::{ReadLineResult, read_line_with_limit};
use crate::KILLED_EXIT_CODE;

/// How long the readers may keep draining after the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-line output filter.
pub trait LineRedactor: Send + Sync {
    fn redact(&self, line: &str) -> String;

    /// Longest byte sequence the filter must see whole to match.
    ///
    /// When a line has to be cut, this many trailing bytes are discarded before
    /// redaction so a partial match cannot slip through.
    fn lookahead(&self) -> usize {
        0
    }
}

/// Leaves output unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl LineRedactor for PassThrough {
    fn redact(&self, line: &str) -> String {
        line.to_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One redacted piece of output, pushed to the consumer as it arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CaptureOptions {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
    pub redactor: Arc<dyn LineRedactor>,
    /// Bounded; chunks are dropped (and counted) when the consumer lags.
    pub chunk_tx: Option<mpsc::Sender<OutputChunk>>,
    pub cancel: CancellationToken,
}

impl CaptureOptions {
    pub fn new(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
            kill_grace: Duration::from_millis(DEFAULT_GRACEFUL_TIMEOUT_MS),
            redactor: Arc::new(PassThrough),
            chunk_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn LineRedactor>) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn with_chunks(mut self, tx: mpsc::Sender<OutputChunk>) -> Self {
        self.chunk_tx = Some(tx);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

impl fmt::Debug for CaptureOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureOptions")
            .field("timeout", &self.timeout)
            .field("max_output_bytes", &self.max_output_bytes)
            .field("kill_grace", &self.kill_grace)
            .field("streaming", &self.chunk_tx.is_some())
            .finish()
    }
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    /// Killed by a signal it did not receive from the supervisor.
    Signaled(i32),
    TimedOut,
    Cancelled,
}

impl Termination {
    /// Shell-style exit code; supervisor kills map to [`KILLED_EXIT_CODE`].
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal,
            Self::TimedOut | Self::Cancelled => KILLED_EXIT_CODE,
        }
    }

    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }

    pub fn signal(self) -> Option<i32> {
        match self {
            Self::Signaled(signal) => Some(signal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    /// Bytes kept across both streams; never above the ceiling.
    pub captured_bytes: usize,
    pub dropped_chunks: usize,
    pub duration: Duration,
    pub pid: u32,
}

#[derive(Default)]
struct CaptureState {
    stdout: String,
    stderr: String,
    captured: usize,
    truncated: bool,
    dropped_chunks: usize,
    consumer_gone: bool,
}

struct Collector {
    state: Mutex<CaptureState>,
    max_output_bytes: usize,
    redactor: Arc<dyn LineRedactor>,
    chunk_tx: Option<mpsc::Sender<OutputChunk>>,
}

impl Collector {
    fn accept(&self, stream: StreamKind, raw: &[u8], cut_by_reader: bool) {
        {
            let mut state = self.state.lock();
            if state.captured >= self.max_output_bytes {
                state.truncated |= !raw.is_empty();
                return;
            }
        }

        let raw = if cut_by_reader {
            &raw[..raw.len().saturating_sub(self.redactor.lookahead())]
        } else {
            raw
        };
        let redacted = self.redactor.redact(&String::from_utf8_lossy(raw));

        let mut state = self.state.lock();
        let remaining = self.max_output_bytes.saturating_sub(state.captured);
        let kept = if redacted.len() <= remaining {
            redacted.as_str()
        } else {
            state.truncated = true;
            &redacted[..floor_char_boundary(&redacted, remaining)]
        };
        state.truncated |= cut_by_reader;
        if kept.is_empty() {
            return;
        }

        state.captured += kept.len();
        match stream {
            StreamKind::Stdout => state.stdout.push_str(kept),
            StreamKind::Stderr => state.stderr.push_str(kept),
        }

        if let Some(tx) = self.chunk_tx.as_ref()
            && !state.consumer_gone
        {
            let chunk = OutputChunk {
                stream,
                data: kept.to_owned(),
                timestamp: Utc::now(),
            };
            match tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => state.dropped_chunks += 1,
                Err(TrySendError::Closed(_)) => state.consumer_gone = true,
            }
        }
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

async fn pump<R>(reader: R, stream: StreamKind, collector: Arc<Collector>, line_limit: usize)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_line_with_limit(&mut reader, &mut buf, line_limit).await {
            Ok(ReadLineResult::Eof) => break,
            Ok(ReadLineResult::Line) => collector.accept(stream, &buf, false),
            Ok(ReadLineResult::Truncated) => collector.accept(stream, &buf, true),
            Err(err) => {
                tracing::debug!(%stream, error = %err, "output stream closed with error");
                break;
            }
        }
    }
}

enum Completion {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

fn termination_from_status(status: ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        return Termination::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Signaled(signal);
        }
    }
    Termination::Exited(KILLED_EXIT_CODE)
}

/// Spawn `spec`, capture its output and enforce the timeout.
///
/// On timeout or cancellation the whole process group gets SIGTERM, then
/// SIGKILL after `kill_grace`. Returns once the child is reaped and both
/// streams are drained.
pub async fn run_captured(
    spec: &SpawnSpec,
    options: CaptureOptions,
) -> Result<CapturedOutput, ProcessError> {
    let started = Instant::now();
    let mut child = spawn_confined(spec)?;
    let pid = child.id().ok_or(ProcessError::MissingPid)?;
    tracing::debug!(pid, program = %spec.program, "spawned child process");

    let collector = Arc::new(Collector {
        state: Mutex::new(CaptureState::default()),
        max_output_bytes: options.max_output_bytes,
        redactor: Arc::clone(&options.redactor),
        chunk_tx: options.chunk_tx.clone(),
    });
    let line_limit = options
        .max_output_bytes
        .saturating_add(options.redactor.lookahead())
        .max(1);

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(
            stdout,
            StreamKind::Stdout,
            Arc::clone(&collector),
            line_limit,
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(
            stderr,
            StreamKind::Stderr,
            Arc::clone(&collector),
            line_limit,
        )));
    }

    let completion = tokio::select! {
        status = child.wait() => Completion::Exited(status?),
        _ = tokio::time::sleep(options.timeout) => Completion::TimedOut,
        _ = options.cancel.cancelled() => Completion::Cancelled,
    };

    let termination = match completion {
        Completion::Exited(status) => {
            // Background grandchildren would otherwise hold the pipes open.
            #[cfg(unix)]
            if let Err(err) = process_group::kill_process_group(pid) {
                tracing::debug!(pid, error = %err, "failed to reap leftover process group");
            }
            termination_from_status(status)
        }
        Completion::TimedOut => {
            tracing::warn!(
                pid,
                timeout_ms = options.timeout.as_millis() as u64,
                "execution timed out; terminating process group"
            );
            process_group::terminate_child_group(&mut child, pid, options.kill_grace).await?;
            Termination::TimedOut
        }
        Completion::Cancelled => {
            tracing::info!(pid, "execution cancelled; terminating process group");
            process_group::terminate_child_group(&mut child, pid, options.kill_grace).await?;
            Termination::Cancelled
        }
    };

    for mut handle in pumps {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
            tracing::debug!(pid, "output reader did not finish draining; aborting");
            handle.abort();
        }
    }

    let mut state = collector.state.lock();
    if state.truncated {
        tracing::debug!(
            pid,
            captured = state.captured,
            limit = options.max_output_bytes,
            "output truncated at capture ceiling"
        );
    }
    if state.dropped_chunks > 0 {
        tracing::debug!(pid, dropped = state.dropped_chunks, "stream consumer lagged; chunks dropped");
    }

    Ok(CapturedOutput {
        termination,
        stdout: std::mem::take(&mut state.stdout),
        stderr: std::mem::take(&mut state.stderr),
        truncated: state.truncated,
        captured_bytes: state.captured,
        dropped_chunks: state.dropped_chunks,
        duration: started.elapsed(),
        pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MaskSecret;

    impl LineRedactor for MaskSecret {
        fn redact(&self, line: &str) -> String {
            line.replace("secret", "******")
        }

        fn lookahead(&self) -> usize {
            "secret".len()
        }
    }

    fn collector(max: usize) -> Collector {
        Collector {
            state: Mutex::new(CaptureState::default()),
            max_output_bytes: max,
            redactor: Arc::new(MaskSecret),
            chunk_tx: None,
        }
    }

    #[test]
    fn ceiling_is_shared_and_truncation_is_sticky() {
        let collector = collector(10);
        collector.accept(StreamKind::Stdout, b"12345\n", false);
        collector.accept(StreamKind::Stderr, b"abcdefgh\n", false);
        collector.accept(StreamKind::Stdout, b"x\n", false);

        let state = collector.state.lock();
        assert_eq!(state.stdout, "12345\n");
        assert_eq!(state.stderr, "abcd");
        assert_eq!(state.captured, 10);
        assert!(state.truncated);
    }

    #[test]
    fn redaction_happens_before_counting() {
        let collector = collector(64);
        collector.accept(StreamKind::Stdout, b"a secret here\n", false);
        assert_eq!(collector.state.lock().stdout, "a ****** here\n");
    }

    #[test]
    fn reader_cut_discards_possible_partial_match() {
        let collector = collector(64);
        collector.accept(StreamKind::Stdout, b"value=secr", true);
        let state = collector.state.lock();
        assert_eq!(state.stdout, "valu");
        assert!(state.truncated);
    }

    #[test]
    fn cut_respects_utf8_boundaries() {
        assert_eq!(floor_char_boundary("héllo", 2), 1);
        assert_eq!(floor_char_boundary("abc", 10), 3);
    }

    #[test]
    fn full_channel_counts_dropped_chunks() {
        let (tx, _rx) = mpsc::channel(1);
        let collector = Collector {
            chunk_tx: Some(tx),
            ..collector(1024)
        };
        collector.accept(StreamKind::Stdout, b"one\n", false);
        collector.accept(StreamKind::Stdout, b"two\n", false);

        let state = collector.state.lock();
        assert_eq!(state.dropped_chunks, 1);
        assert_eq!(state.stdout, "one\ntwo\n");
    }

    #[test]
    fn termination_exit_codes() {
        assert_eq!(Termination::Exited(3).exit_code(), 3);
        assert_eq!(Termination::Signaled(9).exit_code(), 137);
        assert_eq!(Termination::TimedOut.exit_code(), KILLED_EXIT_CODE);
        assert!(Termination::Exited(0).success());
        assert!(!Termination::Cancelled.success());
    }

    #[test]
    fn supervisor_kills_are_not_confused_with_sigkill() {
        assert_eq!(KILLED_EXIT_CODE, -1);
        assert_ne!(
            Termination::TimedOut.exit_code(),
            Termination::Signaled(9).exit_code()
        );
        assert_eq!(Termination::Cancelled.exit_code(), KILLED_EXIT_CODE);
    }
}
