//! Local runner implementation
//!
//! Executes a command directly on the host in its own process group, with a
//! wall-clock timeout, a sampled memory ceiling and capped output capture.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CommandSpec, ProcessOutcome, ProcessRunner, RunLimits};
use crate::memory;

/// `PATH` handed to children when none is configured
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long output readers may keep running after the child is gone
const READ_GRACE: Duration = Duration::from_secs(1);
/// How long to wait for a killed child to be reaped
const KILL_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8192;

/// Background reader of one output pipe
struct OutputReader {
    task: JoinHandle<(Vec<u8>, bool)>,
    stop: oneshot::Sender<()>,
}

impl OutputReader {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(reader: R, cap: usize) -> Self {
        let (stop, stopped) = oneshot::channel();
        Self {
            task: tokio::spawn(read_capped(reader, cap, stopped)),
            stop,
        }
    }
}

enum Finish {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    MemoryExceeded(u64),
}

/// Runner that executes commands directly on the host
#[derive(Debug, Clone)]
pub struct LocalRunner {
    /// `PATH` visible to the child; the rest of the environment is cleared
    path_env: String,
}

impl LocalRunner {
    pub fn new(path_env: impl Into<String>) -> Self {
        Self {
            path_env: path_env.into(),
        }
    }

    /// Run a program and wait for it within `limits`
    pub async fn execute(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin_content: Option<&str>,
    ) -> ProcessOutcome {
        debug!(
            "Running {:?} in {:?} (timeout {:?})",
            cmd.to_vec(),
            cmd.work_dir,
            limits.timeout
        );

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(&cmd.work_dir)
            .env_clear()
            .env("PATH", &self.path_env)
            .env("HOME", &cmd.work_dir)
            .env("LANG", "C.UTF-8")
            .stdin(if stdin_content.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            command.process_group(0);
            // SAFETY: the hook only issues setrlimit, which is async-signal-safe.
            unsafe {
                command.pre_exec(disable_core_dumps);
            }
        }

        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {:?}: {}", cmd.program, e);
                return ProcessOutcome::spawn_failure(format!(
                    "Failed to start {}: {}",
                    cmd.program, e
                ));
            }
        };

        // The child leads its own group, so its pid is the group id.
        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());

        let stdin_task = match (child.stdin.take(), stdin_content) {
            (Some(mut pipe), Some(input)) => {
                let input = input.as_bytes().to_vec();
                Some(tokio::spawn(async move {
                    if let Err(e) = pipe.write_all(&input).await {
                        if e.kind() != io::ErrorKind::BrokenPipe {
                            debug!("Failed to write stdin: {}", e);
                        }
                    }
                    // pipe dropped here: EOF for the child
                }))
            }
            _ => None,
        };

        let cap = limits.max_output_bytes;
        let stdout_reader = child.stdout.take().map(|out| OutputReader::spawn(out, cap));
        let stderr_reader = child.stderr.take().map(|err| OutputReader::spawn(err, cap));

        let memory_limit_kb = limits.memory_limit_mb.map(|mb| u64::from(mb) * 1024);
        let peak_kb = AtomicU64::new(0);

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status),
            _ = tokio::time::sleep(limits.timeout) => Finish::TimedOut,
            rss = memory::watch_group(pgid, memory_limit_kb, &peak_kb) => Finish::MemoryExceeded(rss),
        };
        let elapsed = started.elapsed();

        // Take down anything the program left behind in its group.
        kill_group(pgid);

        let mut outcome = ProcessOutcome {
            elapsed,
            ..ProcessOutcome::default()
        };

        match finish {
            Finish::Exited(Ok(status)) => {
                outcome.exit_code = exit_code_of(&status);
            }
            Finish::Exited(Err(e)) => {
                warn!("Failed to wait for {:?}: {}", cmd.program, e);
                reap(&mut child).await;
                outcome.spawn_error = Some(format!("Failed to wait for {}: {}", cmd.program, e));
            }
            Finish::TimedOut => {
                debug!("{:?} timed out after {:?}", cmd.program, limits.timeout);
                reap(&mut child).await;
                outcome.timed_out = true;
            }
            Finish::MemoryExceeded(rss) => {
                debug!("{:?} exceeded memory limit ({} KB)", cmd.program, rss);
                reap(&mut child).await;
                outcome.memory_exceeded = true;
            }
        }

        if let Some(task) = stdin_task {
            task.abort();
        }

        let ((stdout, stdout_truncated), (stderr, stderr_truncated)) =
            tokio::join!(collect_output(stdout_reader), collect_output(stderr_reader));
        outcome.stdout = stdout;
        outcome.stdout_truncated = stdout_truncated;
        outcome.stderr = stderr;
        outcome.stderr_truncated = stderr_truncated;

        let peak = peak_kb.load(Ordering::Relaxed);
        outcome.peak_memory_kb = (peak > 0).then_some(peak);

        if outcome.timed_out {
            outcome.append_stderr_line(&format!(
                "Execution timeout after {} seconds",
                limits.timeout.as_secs_f64()
            ));
        } else if outcome.memory_exceeded {
            outcome.append_stderr_line(&format!(
                "Memory limit exceeded ({} MB)",
                limits.memory_limit_mb.unwrap_or_default()
            ));
        }

        outcome
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new(DEFAULT_PATH)
    }
}

#[async_trait]
impl ProcessRunner for LocalRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin: Option<&str>,
    ) -> ProcessOutcome {
        self.execute(cmd, limits, stdin).await
    }
}

/// Read a stream to EOF (or until `stop` fires), keeping at most `cap` bytes.
///
/// Keeps draining past the cap so the child never blocks on a full pipe.
/// A read error ends the capture with whatever was read before it.
pub async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
    mut stop: oneshot::Receiver<()>,
) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut truncated = false;

    loop {
        let n = tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(n) => n,
                Err(e) => {
                    warn!("Failed to read child output: {}", e);
                    break;
                }
            },
            _ = &mut stop => break,
        };
        if n == 0 {
            break;
        }

        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&chunk[..n]);
        } else {
            buf.extend_from_slice(&chunk[..remaining]);
            truncated = true;
        }
    }

    (buf, truncated)
}

async fn collect_output(reader: Option<OutputReader>) -> (Vec<u8>, bool) {
    let Some(OutputReader { mut task, stop }) = reader else {
        return (Vec::new(), false);
    };

    if let Ok(joined) = tokio::time::timeout(READ_GRACE, &mut task).await {
        return joined_output(joined);
    }

    // A process outside the group still holds the pipe open.
    warn!(
        "Output pipe still held after {:?}; keeping what was captured",
        READ_GRACE
    );
    let _ = stop.send(());
    match tokio::time::timeout(READ_GRACE, &mut task).await {
        Ok(joined) => joined_output(joined),
        Err(_) => {
            task.abort();
            (Vec::new(), false)
        }
    }
}

fn joined_output(joined: Result<(Vec<u8>, bool), tokio::task::JoinError>) -> (Vec<u8>, bool) {
    joined.unwrap_or_else(|e| {
        warn!("Output reader task failed: {}", e);
        (Vec::new(), false)
    })
}

async fn reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("start_kill failed (already exited?): {}", e);
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!("Killed child was not reaped within {:?}", KILL_GRACE);
    }
}

#[cfg(unix)]
fn exit_code_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;

    status.code().or_else(|| status.signal().map(|sig| -sig))
}

#[cfg(not(unix))]
fn exit_code_of(status: &ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(unix)]
fn kill_group(pgid: Option<i32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid else {
        return;
    };

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<i32>) {}

#[cfg(unix)]
fn disable_core_dumps() -> io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(io::Error::from)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, dir: &std::path::Path) -> CommandSpec {
        CommandSpec::new("sh")
            .with_args(["-c", script])
            .with_work_dir(dir)
    }

    fn limits(timeout_ms: u64, max_output_bytes: usize) -> RunLimits {
        RunLimits::new(Duration::from_millis(timeout_ms), None, max_output_bytes)
    }

    fn is_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // Zombies are dead for our purposes.
            Ok(stat) => !matches!(
                stat.rsplit_once(')').and_then(|(_, rest)| rest.split_whitespace().next()),
                Some("Z") | Some("X")
            ),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_echo_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::default();

        let outcome = runner
            .execute(&sh("echo hi; echo oops >&2; exit 3", dir.path()), &limits(5000, 1024), None)
            .await;

        assert_eq!(outcome.stdout_lossy(), "hi\n");
        assert_eq!(outcome.stderr_lossy(), "oops\n");
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
        assert!(outcome.spawn_error.is_none());
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::default();

        let outcome = runner
            .execute(&sh("read name; echo \"hello $name\"", dir.path()), &limits(5000, 1024), Some("world\n"))
            .await;

        assert_eq!(outcome.stdout_lossy(), "hello world\n");
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_runs_in_work_dir_with_clean_env() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::default();

        let outcome = runner
            .execute(&sh("pwd; echo \"[$REDIS_URL]\"", dir.path()), &limits(5000, 4096), None)
            .await;

        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        let stdout = outcome.stdout_lossy();
        let mut lines = stdout.lines();
        assert_eq!(
            std::fs::canonicalize(lines.next().unwrap()).unwrap(),
            canonical
        );
        assert_eq!(lines.next(), Some("[]"));
    }

    #[tokio::test]
    async fn test_output_is_truncated_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::default();

        let outcome = runner
            .execute(
                &sh("i=0; while [ $i -lt 2000 ]; do printf 'abcdefghij'; i=$((i+1)); done", dir.path()),
                &limits(10_000, 1000),
                None,
            )
            .await;

        assert_eq!(outcome.stdout.len(), 1000);
        assert!(outcome.stdout_truncated);
        assert!(outcome.stdout.starts_with(b"abcdefghij"));
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::default();

        let started = Instant::now();
        let outcome = runner
            .execute(
                &sh("sleep 30 & echo $!; while :; do :; done", dir.path()),
                &limits(1000, 1024),
                None,
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome
            .stderr_lossy()
            .ends_with("Execution timeout after 1 seconds"));

        let descendant: i32 = outcome.stdout_lossy().trim().parse().unwrap();
        let mut gone = false;
        for _ in 0..40 {
            if !is_alive(descendant) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "background child {} survived the timeout", descendant);
    }

    #[tokio::test]
    async fn test_lingering_descendants_are_killed_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::default();

        let outcome = runner
            .execute(&sh("sleep 30 >/dev/null 2>&1 & echo $!", dir.path()), &limits(5000, 1024), None)
            .await;

        assert_eq!(outcome.exit_code, Some(0));
        let descendant: i32 = outcome.stdout_lossy().trim().parse().unwrap();
        let mut gone = false;
        for _ in 0..40 {
            if !is_alive(descendant) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::default();

        let cmd = CommandSpec::new("definitely-not-a-real-toolchain").with_work_dir(dir.path());
        let outcome = runner.execute(&cmd, &limits(1000, 1024), None).await;

        assert!(outcome.spawn_error.is_some());
        assert_eq!(outcome.exit_code, None);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_signal_exit_is_negative() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::default();

        let outcome = runner
            .execute(&sh("kill -9 $$", dir.path()), &limits(5000, 1024), None)
            .await;

        assert_eq!(outcome.exit_code, Some(-9));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_memory_ceiling_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::default();
        // 1 MB is below the footprint of any shell.
        let limits = RunLimits::new(Duration::from_secs(10), Some(1), 1024);

        let outcome = runner
            .execute(&sh("while :; do :; done", dir.path()), &limits, None)
            .await;

        assert!(outcome.memory_exceeded);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.peak_memory_kb.unwrap_or(0) > 1024);
        assert!(outcome.stderr_lossy().contains("Memory limit exceeded (1 MB)"));
    }

    #[tokio::test]
    async fn test_read_capped() {
        let data: &[u8] = b"0123456789";
        let (_keep, stopped) = oneshot::channel();
        let (buf, truncated) = read_capped(data, 4, stopped).await;
        assert_eq!(buf, b"0123");
        assert!(truncated);

        let (_keep, stopped) = oneshot::channel();
        let (buf, truncated) = read_capped(data, 10, stopped).await;
        assert_eq!(buf, b"0123456789");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_read_capped_returns_partial_on_stop() {
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"partial").await.unwrap();
        let (stop, stopped) = oneshot::channel();

        let task = tokio::spawn(read_capped(reader, 1024, stopped));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(()).unwrap();

        let (buf, truncated) = task.await.unwrap();
        assert_eq!(buf, b"partial");
        assert!(!truncated);
        drop(writer);
    }

    #[tokio::test]
    async fn test_output_kept_when_escaped_child_holds_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::default();

        let started = Instant::now();
        let outcome = runner
            .execute(&sh("echo hi; setsid sleep 5 &", dir.path()), &limits(5000, 1024), None)
            .await;

        assert_eq!(outcome.stdout_lossy(), "hi\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
