//! Execution engine: runs one approved command with a hard wall-clock bound.
//!
//! The child is started in its own process group, and the whole group is
//! killed when the command exits, times out, or its future is dropped.
//! Output is read into shared buffers as it arrives, which keeps
//! partial output available when the process has to be killed.
//! Each stream is capped; excess bytes are drained and dropped.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ExecutionResult;
use crate::error::RunnerError;

/// Exit code reported when the process was killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Marker appended to stderr on timeout.
pub const TIMEOUT_MARKER: &str = " (timeout)";

/// Per-stream capture limit: 16 MB. Excess bytes are drained and dropped.
const MAX_CAPTURE_BYTES: usize = 16 * 1024 * 1024;

/// How long to wait for the pipes to close once the process is gone.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
}

/// Runs `command` in `working_dir` with `env_overrides` layered over the
/// inherited environment.
///
/// Non-zero exits and timeouts are reported in the result. Only an
/// unusable working directory or an executable that cannot be started
/// produce an error.
pub async fn run(
    working_dir: &Path,
    command: &[String],
    env_overrides: &HashMap<String, String>,
    timeout: Duration,
) -> Result<ExecutionResult, RunnerError> {
    let Some((program, args)) = command.split_first() else {
        return Err(RunnerError::invalid_input("command cannot be empty"));
    };

    if !working_dir.is_dir() {
        return Err(RunnerError::ExecutionSetup(
            "working directory is not usable".to_string(),
        ));
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .envs(env_overrides)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        debug!("Failed to spawn {program}: {e}");
        RunnerError::ExecutionSetup("executable could not be started".to_string())
    })?;

    let mut group = ProcessGroup::new(child.id());
    let (stdout_buf, stdout_task) = capture(child.stdout.take());
    let (stderr_buf, stderr_task) = capture(child.stderr.take());

    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Outcome::Exited(status),
            Err(e) => {
                group.kill();
                return Err(RunnerError::Internal(anyhow::anyhow!("waiting for child failed: {e}")));
            }
        },
        _ = tokio::time::sleep(timeout) => {
            warn!(
                "Command timed out after {}s, killing process group",
                timeout.as_secs()
            );
            // Kill before reaping so the group id cannot be recycled.
            group.kill();
            if let Err(e) = child.wait().await {
                warn!("Failed to reap timed-out child: {e}");
            }
            Outcome::TimedOut
        }
    };
    let elapsed = started.elapsed();
    // Background children must not outlive the command or hold its pipes.
    group.kill();

    tokio::join!(finish_capture(stdout_task), finish_capture(stderr_task));

    let stdout = take_text(&stdout_buf);
    let mut stderr = take_text(&stderr_buf);
    let duration_seconds = round_millis(elapsed);

    let exit_code = match outcome {
        Outcome::Exited(status) => exit_code_of(status),
        Outcome::TimedOut => {
            stderr.push_str(TIMEOUT_MARKER);
            TIMEOUT_EXIT_CODE
        }
    };

    info!(
        exit_code,
        duration_seconds,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "Command finished"
    );

    Ok(ExecutionResult {
        exit_code,
        stdout,
        stderr,
        duration_seconds,
    })
}

/// Spawns a reader that appends everything it sees to a shared buffer.
fn capture<R>(reader: Option<R>) -> (SharedBuffer, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
    let task = reader.map(|mut reader| {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut buf = buffer.lock().unwrap_or_else(|p| p.into_inner());
                        let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
                        buf.extend_from_slice(&chunk[..n.min(room)]);
                    }
                    Err(e) => {
                        debug!("Output capture stopped: {e}");
                        break;
                    }
                }
            }
        })
    });
    (buffer, task)
}

/// Waits briefly for a reader to hit EOF; a stray grandchild holding the
/// pipe open must not stall the response.
async fn finish_capture(task: Option<JoinHandle<()>>) {
    let Some(mut task) = task else {
        return;
    };
    if tokio::time::timeout(IO_CAPTURE_TIMEOUT, &mut task)
        .await
        .is_err()
    {
        warn!("Output pipe still open after process exit, keeping partial output");
        task.abort();
    }
}

fn take_text(buffer: &SharedBuffer) -> String {
    let bytes = std::mem::take(&mut *buffer.lock().unwrap_or_else(|p| p.into_inner()));
    String::from_utf8_lossy(&bytes).into_owned()
}

fn round_millis(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

/// Exit status as an integer; signal deaths map to `128 + signal` so that
/// `TIMEOUT_EXIT_CODE` stays unambiguous.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    TIMEOUT_EXIT_CODE - 1
}

/// Kills the child's process group at most once, at the latest on drop.
///
/// Covers request cancellation: if the future running `run` is dropped,
/// the whole tree goes down with it.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                debug!("killpg({pgid}) failed: {e}");
            }
        }
        #[cfg(not(unix))]
        {
            // kill_on_drop on the child handles the single process case
            let _ = pgid;
        }
    }

}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
