//! Spawn a child process and stream its output line by line.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use strata_core::error::{ProvisionError, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::ExitOutcome;

/// Number of stderr lines kept for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// How long output is still read after the command itself has exited.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Spawn `cmd`, forward its output, and wait for it to exit.
///
/// Output lines are logged at debug level and, unless `quiet`, echoed to
/// the terminal. The command runs in its own process group: anything it
/// left running in the background is killed once it exits, and the whole
/// group is killed if the returned future is dropped.
pub(super) async fn run_streaming(
    mut cmd: tokio::process::Command,
    index: usize,
    program: &str,
    quiet: bool,
) -> Result<ExitOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProvisionError::CommandNotFound {
                index,
                program: program.to_string(),
            }
        } else {
            ProvisionError::Runner(format!("failed to spawn {}: {}", program, e))
        }
    })?;
    let mut group = ProcessGroup::of(&child);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    let status = {
        let stdout_task = async {
            if let Some(out) = stdout {
                forward_lines(out, |line| {
                    tracing::debug!(step = index, stream = "stdout", "{}", line);
                    if !quiet {
                        println!("  {}", line);
                    }
                })
                .await;
            }
        };

        let stderr_task = async {
            if let Some(err) = stderr {
                forward_lines(err, |line| {
                    tracing::debug!(step = index, stream = "stderr", "{}", line);
                    if !quiet {
                        eprintln!("  {}", line);
                    }
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                })
                .await;
            }
        };

        let output = async {
            tokio::join!(stdout_task, stderr_task);
        };
        tokio::pin!(output);

        let (status, drained) = tokio::select! {
            status = child.wait() => (status, false),
            () = &mut output => (child.wait().await, true),
        };

        // Background processes must not outlive the step.
        group.kill();
        if !drained && tokio::time::timeout(OUTPUT_DRAIN, &mut output).await.is_err() {
            tracing::warn!(
                step = index,
                "Output still open after the command exited, ignoring the rest"
            );
        }
        status
    };

    let status = status.map_err(|e| {
        ProvisionError::Runner(format!("failed to wait for {}: {}", program, e))
    })?;

    Ok(ExitOutcome {
        code: status.code().unwrap_or(-1),
        stderr_tail: tail.into_iter().collect::<Vec<_>>().join("\n"),
    })
}

/// Process group of a spawned command, killed on drop.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self { pgid: child.id() }
    }

    /// Send SIGKILL to every process still in the group.
    #[cfg(unix)]
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            // ESRCH just means the group is already gone.
            unsafe {
                libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Read `reader` to EOF, calling `on_line` for each line.
///
/// Invalid UTF-8 is replaced rather than aborting, so the pipe is always
/// drained and the child never blocks on a full buffer.
async fn forward_lines<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(['\n', '\r']));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read command output");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_streaming_exit_code_and_stderr_tail() {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg("echo out; echo first >&2; echo second >&2; exit 3");
        let outcome = run_streaming(cmd, 0, "/bin/sh", true).await.unwrap();
        assert_eq!(outcome.code, 3);
        assert_eq!(outcome.stderr_tail, "first\nsecond");
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_run_streaming_keeps_only_tail() {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg("i=0; while [ $i -lt 30 ]; do echo line$i >&2; i=$((i+1)); done");
        let outcome = run_streaming(cmd, 0, "/bin/sh", true).await.unwrap();
        assert!(outcome.success());
        let lines: Vec<&str> = outcome.stderr_tail.lines().collect();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines[0], "line10");
        assert_eq!(lines[19], "line29");
    }

    #[tokio::test]
    async fn test_run_streaming_missing_program() {
        let cmd = tokio::process::Command::new("/definitely/not/here");
        let err = run_streaming(cmd, 4, "/definitely/not/here", true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::CommandNotFound { index: 4, .. }
        ));
    }

    #[tokio::test]
    async fn test_background_process_does_not_hold_step() {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg("sleep 30 & echo started; exit 0");
        let start = std::time::Instant::now();
        let outcome = run_streaming(cmd, 0, "/bin/sh", true).await.unwrap();
        assert!(outcome.success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_dropped_run_kills_whole_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(format!("(sleep 1; touch '{}') & sleep 30", marker.display()));

        let run = run_streaming(cmd, 0, "/bin/sh", true);
        assert!(tokio::time::timeout(Duration::from_millis(300), run)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists());
    }
}
