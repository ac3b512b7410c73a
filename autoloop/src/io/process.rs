//! Running child processes with a timeout, bounded output, and cancellation.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::cancel::CancelToken;

/// How often a running child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long pipe threads may linger after the child was killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// Killed because the cancellation token fired.
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Non-zero exit, timeout, or cancellation.
    pub fn failed(&self) -> bool {
        self.timed_out || self.cancelled || !self.status.success()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stderr", self.stderr_truncated)
    }
}

fn truncated_notice(label: &str, stream: &str, bytes: usize) -> String {
    if bytes > 0 {
        format!("\n[{label} {stream} truncated {bytes} bytes]\n")
    } else {
        String::new()
    }
}

/// Everything needed to run one command.
#[derive(Debug)]
pub struct CommandSpec<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// When set, stdout lines are appended here as they arrive.
    pub stream_path: Option<&'a Path>,
    pub cancel: Option<&'a CancelToken>,
}

/// Run a command, capturing stdout/stderr without risking pipe deadlocks.
///
/// Stdin is written and output is read on their own threads while the child
/// runs. On unix the child leads its own process group, and the whole group is
/// killed when the timeout elapses or the cancellation token fires; both are
/// reported in the returned [`CommandOutput`] rather than as errors.
#[instrument(skip_all, fields(timeout_secs = spec.timeout.as_secs(), output_limit_bytes = spec.output_limit_bytes, streaming = spec.stream_path.is_some()))]
pub fn run_command(mut cmd: Command, spec: &CommandSpec<'_>) -> Result<CommandOutput> {
    if spec.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let stream_file = match spec.stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        }
        None => None,
    };

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = spec.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, limit, stream_file));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let stdin_handle = match spec.stdin {
        Some(input) => {
            let child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || write_stdin(child_stdin, &input)))
        }
        None => None,
    };

    let (status, timed_out, cancelled) = wait_for_child(&mut child, spec.timeout, spec.cancel)?;
    let deadline = (timed_out || cancelled).then(|| Instant::now() + KILL_GRACE);

    if let Some(handle) = stdin_handle {
        match wait_joinable(handle, deadline) {
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => return Err(e).context("write stdin"),
            Some(Err(_)) => return Err(anyhow!("stdin writer thread panicked")),
            None => warn!("stdin writer still blocked after kill, detaching"),
        }
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle, deadline).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle, deadline).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let elapsed = started.elapsed();
    debug!(exit_code = ?status.code(), timed_out, cancelled, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        elapsed,
    })
}

/// Wait in short slices so cancellation is observed while the child runs.
fn wait_for_child(
    child: &mut Child,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<(ExitStatus, bool, bool)> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("cancellation requested, killing command");
            let status = kill_and_wait(child)?;
            return Ok((status, false, true));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            let status = kill_and_wait(child)?;
            return Ok((status, true, false));
        }
        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            return Ok((status, false, false));
        }
    }
}

fn kill_and_wait(child: &mut Child) -> Result<ExitStatus> {
    kill_group(child);
    // The child may exit between the last poll and the kill.
    if let Err(e) = child.kill()
        && e.kind() != ErrorKind::InvalidInput
    {
        return Err(e).context("kill command");
    }
    child.wait().context("wait command after kill")
}

/// Kill every process in the child's group, so tool subprocesses holding
/// the pipes go down with it.
#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(err = %e, pid, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

fn write_stdin(mut stdin: ChildStdin, input: &[u8]) -> std::io::Result<()> {
    match stdin.write_all(input) {
        Ok(()) => Ok(()),
        // The child exited or closed stdin without reading the prompt.
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("child closed stdin before prompt was fully written");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Join a thread, giving up at `deadline`. `None` means it is still running.
fn wait_joinable<T>(
    handle: thread::JoinHandle<T>,
    deadline: Option<Instant>,
) -> Option<thread::Result<T>> {
    if let Some(deadline) = deadline {
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    Some(handle.join())
}

fn join_output(
    handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
    deadline: Option<Instant>,
) -> Result<(Vec<u8>, usize)> {
    match wait_joinable(handle, deadline) {
        Some(Ok(result)) => result,
        Some(Err(_)) => Err(anyhow!("output reader thread panicked")),
        None => {
            warn!("output pipe still open after kill, discarding");
            Ok((Vec::new(), 0))
        }
    }
}

type StreamFile = Arc<Mutex<BufWriter<File>>>;

/// Read lines with a size limit, optionally tee-ing each line to a file.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    stream_file: Option<StreamFile>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(mutex) = &stream_file
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        keep_limited(&mut collected, &mut truncated, &line, limit);
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        keep_limited(&mut buf, &mut truncated, &chunk[..n], limit);
    }

    Ok((buf, truncated))
}

fn keep_limited(buf: &mut Vec<u8>, truncated: &mut usize, data: &[u8], limit: usize) {
    let remaining = limit.saturating_sub(buf.len());
    let keep = data.len().min(remaining);
    buf.extend_from_slice(&data[..keep]);
    *truncated += data.len() - keep;
}
