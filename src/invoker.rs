//! Tool Invoker: every external diagnostic process is spawned, watched,
//! killed and reaped here, and nowhere else. One child per invocation,
//! bounded lifetime, cooperative cancellation.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::utils::task_manager::CancelFlag;

/// How often the running child is checked against the cancel flag and
/// the deadline. Long scans stay responsive without burning CPU.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Raw outcome of one tool invocation. The invoker never interprets it:
/// a non-zero exit code can be a legitimate result (f3probe reports its
/// verdict that way), so classification belongs to the caller's parser.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ToolOutput {
    /// stdout and stderr concatenated, the form most parsers want.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

pub struct ToolInvoker;

impl ToolInvoker {
    /// Run `program args..` with a hard deadline, capturing stdout/stderr.
    ///
    /// Outcomes are kept distinct: deadline expiry kills the child and
    /// returns `ToolTimeout`; a signalled cancel flag kills the child and
    /// returns `Cancelled`; a missing executable returns `ToolUnavailable`.
    /// Everything else, including non-zero exits, is an `Ok(ToolOutput)`.
    pub async fn execute(
        program: &Path,
        args: &[String],
        timeout: Duration,
        cancel: &CancelFlag,
    ) -> Result<ToolOutput> {
        Self::run(program, args, timeout, cancel, None).await
    }

    /// Like `execute`, but forwards stderr lines as they arrive. Used by
    /// long scans (badblocks) to surface "% done" progress while still
    /// honoring cancellation at the polling interval.
    pub async fn execute_streaming(
        program: &Path,
        args: &[String],
        timeout: Duration,
        cancel: &CancelFlag,
        mut on_stderr_line: impl FnMut(&str) + Send,
    ) -> Result<ToolOutput> {
        Self::run(program, args, timeout, cancel, Some(&mut on_stderr_line)).await
    }

    async fn run(
        program: &Path,
        args: &[String],
        timeout: Duration,
        cancel: &CancelFlag,
        mut on_stderr_line: Option<&mut (dyn FnMut(&str) + Send + '_)>,
    ) -> Result<ToolOutput> {
        let tool = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        debug!(tool = %tool, ?args, "spawning");

        let start = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // No child outlives its invocation, even if the caller unwinds.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EngineError::ToolUnavailable(tool.clone()),
                _ => EngineError::Io(e.to_string()),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::SystemError("failed to capture stdout pipe".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            EngineError::SystemError("failed to capture stderr pipe".to_string())
        })?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut reader = stdout;
            let _ = reader.read_to_end(&mut buf).await;
            buf
        });

        // stderr is read line-wise so streaming callers can watch it live.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
                let _ = line_tx.send(line);
            }
            collected
        });

        let mut lines_open = true;
        let deadline = start + timeout;
        let status = loop {
            tokio::select! {
                res = child.wait() => {
                    break res.map_err(EngineError::io)?;
                }
                maybe_line = line_rx.recv(), if lines_open => {
                    match maybe_line {
                        Some(line) => {
                            if let Some(cb) = &mut on_stderr_line {
                                cb(&line);
                            }
                        }
                        None => lines_open = false,
                    }
                }
                _ = sleep(POLL_INTERVAL) => {
                    if cancel.is_cancelled() {
                        Self::kill_and_reap(&mut child).await;
                        debug!(tool = %tool, "cancelled");
                        return Err(EngineError::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        Self::kill_and_reap(&mut child).await;
                        debug!(tool = %tool, "timed out");
                        return Err(EngineError::ToolTimeout(timeout.as_secs(), tool));
                    }
                }
            }
        };

        // Readers finish at pipe EOF; drain any lines still queued.
        let stdout_buf = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();
        while let Ok(line) = line_rx.try_recv() {
            if let Some(cb) = &mut on_stderr_line {
                cb(&line);
            }
        }

        Ok(ToolOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: stderr_text,
            duration: start.elapsed(),
        })
    }

    async fn kill_and_reap(child: &mut Child) {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Extract a percentage figure from a tool progress line, e.g.
/// "12.5% done" or "Testing ... 45%".
pub fn extract_percentage(line: &str) -> Option<f64> {
    let pos = line.rfind('%')?;
    if pos == 0 {
        return None;
    }
    let start = line[..pos]
        .rfind(|c: char| !c.is_ascii_digit() && c != '.')
        .map(|p| p + 1)
        .unwrap_or(0);
    let pct: f64 = line[start..pos].parse().ok()?;
    (0.0..=100.0).contains(&pct).then_some(pct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captures_streams_and_nonzero_exit() {
        let out = ToolInvoker::execute(
            &sh(),
            &args("echo out; echo err 1>&2; exit 3"),
            Duration::from_secs(5),
            &CancelFlag::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn timeout_is_distinct_and_bounded() {
        let started = Instant::now();
        let err = ToolInvoker::execute(
            &sh(),
            &args("sleep 30"),
            Duration::from_millis(400),
            &CancelFlag::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::ToolTimeout(_, _)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancel_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let cancel = CancelFlag::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            cancel2.cancel();
        });

        let script = format!("sleep 1.5 && touch {}", marker.display());
        let err = ToolInvoker::execute(&sh(), &args(&script), Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));

        // Had the process survived the kill it would create the marker.
        sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn missing_tool_maps_to_unavailable() {
        let err = ToolInvoker::execute(
            Path::new("/nonexistent/diag-tool"),
            &[],
            Duration::from_secs(1),
            &CancelFlag::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::ToolUnavailable(_)));
    }

    #[tokio::test]
    async fn streaming_forwards_stderr_lines() {
        let mut seen = Vec::new();
        let out = ToolInvoker::execute_streaming(
            &sh(),
            &args("echo '10.0% done' 1>&2; echo '55.5% done' 1>&2"),
            Duration::from_secs(5),
            &CancelFlag::new(),
            |line| seen.push(line.to_string()),
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(seen.len(), 2);
        assert_eq!(extract_percentage(&seen[1]), Some(55.5));
    }

    #[test]
    fn percentage_extraction() {
        assert_eq!(extract_percentage("12.5% done"), Some(12.5));
        assert_eq!(extract_percentage("reading: 45%"), Some(45.0));
        assert_eq!(extract_percentage("no progress here"), None);
        assert_eq!(extract_percentage("999% bogus"), None);
    }
}
