//! Supervised external processes.
//!
//! Every child is started in its own process group with piped output. Stdout
//! can be parsed as ffmpeg `-progress` key/value pairs, stderr is kept as a
//! bounded tail for diagnostics, and termination reaches the whole
//! descendant tree: SIGTERM first, SIGKILL after the grace period.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use sysinfo::{Pid, Signal, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Lines of stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 40;

/// Upper bound on waiting for output readers after the child exited.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

static PROGRESS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([a-z_]+)=(.*?)\s*$").expect("valid progress regex"));

/// Errors raised while supervising a process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The binary does not exist; never worth retrying
    #[error("Executable not found: {}", .program.display())]
    NotFound { program: PathBuf },

    #[error("Failed to start {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How stdout is interpreted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressMode {
    /// Output is drained and logged at trace level
    Ignore,
    /// ffmpeg `-progress pipe:1` output, measured against the expected duration
    Ffmpeg { expected: Option<Duration> },
}

/// Final state of a process that ran to completion.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub status: ExitStatus,
    /// Tail of stderr
    pub diagnostics: String,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// A running child with progress and diagnostics attached.
pub struct ManagedProcess {
    label: String,
    child: Child,
    pid: Option<u32>,
    progress: watch::Receiver<f64>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    readers: Vec<JoinHandle<()>>,
}

impl ManagedProcess {
    /// Starts `program` with `args` in a fresh process group.
    ///
    /// # Errors
    ///
    /// - `ProcessError::NotFound` - The executable does not exist
    /// - `ProcessError::Spawn` - Any other spawn failure
    pub fn spawn(
        label: impl Into<String>,
        program: &Path,
        args: &[OsString],
        working_dir: Option<&Path>,
        mode: ProgressMode,
    ) -> Result<Self, ProcessError> {
        let label = label.into();
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| match source.kind() {
            ErrorKind::NotFound => ProcessError::NotFound {
                program: program.to_path_buf(),
            },
            _ => ProcessError::Spawn {
                program: program.to_path_buf(),
                source,
            },
        })?;

        let pid = child.id();
        debug!(label = %label, pid = ?pid, program = %program.display(), "Spawned process");

        let (progress_tx, progress) = watch::channel(0.0);
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stdout(
                stdout,
                label.clone(),
                mode,
                progress_tx,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stderr(
                stderr,
                label.clone(),
                Arc::clone(&stderr_tail),
            )));
        }

        Ok(Self {
            label,
            child,
            pid,
            progress,
            stderr_tail,
            readers,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Latest completion fraction in `[0, 1]`.
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    /// Current stderr tail joined by newlines.
    pub fn diagnostics(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Waits for exit. Cancel safe.
    pub async fn wait(&mut self) -> Result<ExitReport, ProcessError> {
        let status = self.child.wait().await?;
        self.drain_readers().await;
        debug!(label = %self.label, pid = ?self.pid, %status, "Process exited");
        Ok(ExitReport {
            status,
            diagnostics: self.diagnostics(),
        })
    }

    /// Terminates the process tree and reaps the child.
    ///
    /// Descendants are collected before signalling so children orphaned by
    /// the leader's exit are still reached.
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), ProcessError> {
        if self.child.try_wait()?.is_some() {
            self.drain_readers().await;
            return Ok(());
        }

        let tree = match self.pid {
            Some(pid) => process_tree(pid).await,
            None => Vec::new(),
        };
        debug!(label = %self.label, pids = ?tree, "Terminating process tree");
        signal_all(tree.clone(), Signal::Term).await;

        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            warn!(label = %self.label, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, killing");
            signal_all(tree.clone(), Signal::Kill).await;
            if let Err(e) = self.child.start_kill() {
                debug!(label = %self.label, error = %e, "start_kill after SIGKILL");
            }
            self.child.wait().await?;
        }

        // Stragglers that outlived the leader
        signal_all(tree, Signal::Kill).await;
        self.drain_readers().await;
        Ok(())
    }

    async fn drain_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                // A grandchild still holds the pipe open
                abort.abort();
            }
        }
    }
}

async fn read_stdout<R>(stream: R, label: String, mode: ProgressMode, tx: watch::Sender<f64>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut parser = match mode {
        ProgressMode::Ffmpeg { expected } => Some(ProgressParser::new(expected)),
        ProgressMode::Ignore => None,
    };

    while let Ok(Some(line)) = lines.next_line().await {
        match parser.as_mut() {
            Some(parser) => {
                if let Some(fraction) = parser.feed(&line) {
                    tx.send_replace(fraction);
                }
            }
            None => trace!(label = %label, "{line}"),
        }
    }
}

async fn read_stderr<R>(stream: R, label: String, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(label = %label, "{line}");
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Turns ffmpeg `-progress` key/value lines into completion fractions.
#[derive(Debug)]
pub struct ProgressParser {
    expected: Option<Duration>,
    last: f64,
}

impl ProgressParser {
    pub fn new(expected: Option<Duration>) -> Self {
        Self {
            expected: expected.filter(|d| !d.is_zero()),
            last: 0.0,
        }
    }

    /// Returns a new fraction when the line moves progress forward.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let captures = PROGRESS_LINE.captures(line)?;
        let key = captures.get(1)?.as_str();
        let value = captures.get(2)?.as_str();

        let fraction = match key {
            "progress" if value == "end" => 1.0,
            // ffmpeg reports microseconds under both names
            "out_time_us" | "out_time_ms" => {
                let micros = value.parse::<i64>().ok()?.max(0) as u64;
                self.fraction_of(Duration::from_micros(micros))?
            }
            "out_time" => self.fraction_of(parse_timestamp(value)?)?,
            _ => return None,
        };

        // Never report regressions
        if fraction > self.last {
            self.last = fraction;
            Some(fraction)
        } else {
            None
        }
    }

    fn fraction_of(&self, position: Duration) -> Option<f64> {
        let expected = self.expected?;
        // Reserve completion for the explicit end marker
        Some((position.as_secs_f64() / expected.as_secs_f64()).clamp(0.0, 0.999))
    }
}

/// Parses `HH:MM:SS.micros`.
fn parse_timestamp(value: &str) -> Option<Duration> {
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

/// `root` and every live descendant.
pub async fn process_tree(root: u32) -> Vec<u32> {
    tokio::task::spawn_blocking(move || {
        let mut system = System::new();
        system.refresh_processes();

        let mut tree = vec![Pid::from_u32(root)];
        let mut index = 0;
        while index < tree.len() {
            let parent = tree[index];
            for (pid, process) in system.processes() {
                if process.parent() == Some(parent) && !tree.contains(pid) {
                    tree.push(*pid);
                }
            }
            index += 1;
        }
        tree.into_iter().map(|pid| pid.as_u32()).collect()
    })
    .await
    .unwrap_or_else(|_| vec![root])
}

async fn signal_all(pids: Vec<u32>, signal: Signal) {
    let result = tokio::task::spawn_blocking(move || {
        let mut system = System::new();
        system.refresh_processes();
        for pid in pids {
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                if process.kill_with(signal).is_none() {
                    // Signal unsupported on this platform
                    process.kill();
                }
            }
        }
    })
    .await;
    if let Err(e) = result {
        warn!(error = %e, "Signal task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_from_out_time_us() {
        let mut parser = ProgressParser::new(Some(Duration::from_secs(100)));
        assert_eq!(parser.feed("frame=10"), None);
        assert_eq!(parser.feed("out_time_us=25000000"), Some(0.25));
        assert_eq!(parser.feed("out_time_ms=50000000"), Some(0.5));
        // Regressions are swallowed
        assert_eq!(parser.feed("out_time_us=10000000"), None);
        assert_eq!(parser.feed("progress=continue"), None);
        assert_eq!(parser.feed("progress=end"), Some(1.0));
    }

    #[test]
    fn test_progress_from_timestamp() {
        let mut parser = ProgressParser::new(Some(Duration::from_secs(3600)));
        let fraction = parser.feed("out_time=00:30:00.000000").unwrap();
        assert!((fraction - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_progress_without_duration_only_reports_end() {
        let mut parser = ProgressParser::new(None);
        assert_eq!(parser.feed("out_time_us=25000000"), None);
        assert_eq!(parser.feed("progress=end"), Some(1.0));
    }

    #[test]
    fn test_progress_caps_below_one_until_end() {
        let mut parser = ProgressParser::new(Some(Duration::from_secs(10)));
        assert_eq!(parser.feed("out_time_us=20000000"), Some(0.999));
        assert_eq!(parser.feed("out_time_us=-5"), None);
    }

    #[test]
    fn test_timestamp_parsing() {
        assert_eq!(parse_timestamp("01:02:03.5"), Some(Duration::from_millis(3_723_500)));
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("1:2"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let result = ManagedProcess::spawn(
            "encode",
            Path::new("/definitely/not/here/ffmpeg"),
            &[],
            None,
            ProgressMode::Ignore,
        );
        assert!(matches!(result, Err(ProcessError::NotFound { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_progress_and_stderr_tail() {
        let script = "echo out_time_us=5000000; echo progress=end; echo 'warning: x' >&2; exit 3";
        let mut process = ManagedProcess::spawn(
            "encode",
            Path::new("sh"),
            &["-c".into(), script.into()],
            None,
            ProgressMode::Ffmpeg {
                expected: Some(Duration::from_secs(10)),
            },
        )
        .unwrap();
        let progress = process.progress();

        let report = process.wait().await.unwrap();
        assert!(!report.success());
        assert_eq!(report.status.code(), Some(3));
        assert_eq!(report.diagnostics, "warning: x");
        assert_eq!(*progress.borrow(), 1.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_descendants() {
        let mut process = ManagedProcess::spawn(
            "encode",
            Path::new("sh"),
            &["-c".into(), "sleep 30 & sleep 30 & wait".into()],
            None,
            ProgressMode::Ignore,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let root = process.id().unwrap();
        let tree = process_tree(root).await;
        assert!(tree.len() >= 3, "expected shell plus two sleeps, got {tree:?}");

        process.terminate(Duration::from_secs(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut system = System::new();
        system.refresh_processes();
        for pid in tree {
            let alive = system
                .process(Pid::from_u32(pid))
                .is_some_and(|p| p.status() != sysinfo::ProcessStatus::Zombie);
            assert!(!alive, "pid {pid} survived termination");
        }
    }
}
