//! Runs an interpreter process under a deadline and captures its output.
//!
//! One run goes through `Starting -> Running -> {Completed | Killed} -> Reported`.
//! The child is owned by a supervisor task that either reaps it or, when told to
//! (or when the caller goes away), kills it first. The caller waits for whichever
//! comes first: the exit status or the deadline. After the deadline the kill gets a
//! short grace window to land before the run is reported as killed.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};

use super::capture::Capture;

/// Time a killed process gets to be reaped before the run is reported as killed.
pub const KILL_GRACE: Duration = Duration::from_millis(200);
/// Time the output readers get to reach end of file once the process is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ProcessRunSpec {
    pub interpreter: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    /// Fed on stdin and then closed. `None` attaches stdin to nothing.
    pub stdin_script: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessRunOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed or never reported an exit code.
    pub exit_code: Option<i32>,
    /// Kill reports, wait errors, the timeout notice and any stderr output, in that order.
    pub messages: Vec<String>,
}

/// Reader tasks for stdout and stderr, aborted when dropped.
struct Pumps(Vec<JoinHandle<()>>);

impl Pumps {
    async fn drain(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        for handle in self.0.iter_mut() {
            if timeout_at(deadline, handle).await.is_err() {
                debug!("output reader still busy after the process ended");
                break;
            }
        }
    }
}

impl Drop for Pumps {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

fn pump<R>(mut reader: R, capture: Capture) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => capture.write(&buf[..n]),
            }
        }
    })
}

/// Owns the child until it is reaped. A kill request, or the caller dropping the
/// kill sender, terminates the child first.
fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    report_tx: oneshot::Sender<String>,
    exit_tx: oneshot::Sender<std::io::Result<ExitStatus>>,
) {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let _ = exit_tx.send(status);
            }
            _ = kill_rx => {
                let report = match child.start_kill() {
                    Ok(()) => "script killed".to_string(),
                    Err(e) => format!("killing of the script failed: {}", e),
                };
                let _ = report_tx.send(report);
                let _ = exit_tx.send(child.wait().await);
            }
        }
    });
}

/// Spawns the interpreter, feeds it the script and waits for it under the deadline.
///
/// Errors are setup failures only (spawn, stdin). A process that ran, whatever its
/// fate, produces an outcome.
pub async fn run(spec: &ProcessRunSpec) -> Result<ProcessRunOutcome> {
    let mut cmd = Command::new(&spec.interpreter);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(if spec.stdin_script.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "error starting the script with '{}' in '{}'",
            spec.interpreter,
            spec.working_dir.display()
        )
    })?;
    debug!(pid = ?child.id(), interpreter = %spec.interpreter, "script started");
    // one deadline covers feeding stdin and waiting for the exit
    let deadline = Instant::now() + spec.timeout;

    let stdout = Capture::new();
    let stderr = Capture::new();
    let mut pumps = Pumps(Vec::with_capacity(2));
    if let Some(out) = child.stdout.take() {
        pumps.0.push(pump(out, stdout.clone()));
    }
    if let Some(err) = child.stderr.take() {
        pumps.0.push(pump(err, stderr.clone()));
    }

    if let (Some(script), Some(mut stdin)) = (&spec.stdin_script, child.stdin.take()) {
        let feed = async {
            stdin
                .write_all(script.as_bytes())
                .await
                .context("error writing to stdin pipe")?;
            stdin.shutdown().await.context("error closing stdin pipe")?;
            anyhow::Ok(())
        };
        timeout_at(deadline, feed).await.with_context(|| {
            format!(
                "timeout {} sec exceeded while feeding the script, script killed",
                spec.timeout.as_secs()
            )
        })??;
        drop(stdin);
    }

    let (kill_tx, kill_rx) = oneshot::channel();
    let (report_tx, report_rx) = oneshot::channel();
    let (exit_tx, mut exit_rx) = oneshot::channel();
    supervise(child, kill_rx, report_tx, exit_tx);

    let mut messages = Vec::new();
    let mut timed_out = false;
    let status = tokio::select! {
        status = &mut exit_rx => status.ok(),
        _ = sleep_until(deadline) => {
            timed_out = true;
            let _ = kill_tx.send(());
            let grace_end = Instant::now() + KILL_GRACE;
            match timeout_at(grace_end, report_rx).await {
                Ok(Ok(report)) => messages.push(report),
                _ => warn!("no kill report within {:?}", KILL_GRACE),
            }
            timeout_at(grace_end, &mut exit_rx).await.ok().and_then(Result::ok)
        }
    };

    let exit_code = exit_code(status, timed_out.then_some(spec.timeout), &mut messages);

    pumps.drain(DRAIN_GRACE).await;
    let outcome_stdout = stdout.stop_collecting();
    let outcome_stderr = stderr.stop_collecting();
    if !outcome_stderr.is_empty() {
        messages.push(outcome_stderr.clone());
    }
    debug!(?exit_code, timed_out, "script finished");

    Ok(ProcessRunOutcome {
        stdout: outcome_stdout,
        stderr: outcome_stderr,
        exit_code,
        messages,
    })
}

/// Exit code of a finished run. A run that hit its deadline has none, even where
/// the platform reports a code for a terminated process.
fn exit_code(
    status: Option<std::io::Result<ExitStatus>>,
    timed_out: Option<Duration>,
    messages: &mut Vec<String>,
) -> Option<i32> {
    let code = match status {
        Some(Ok(status)) => {
            if status.code().is_none() {
                messages.push(format!("process error: {}", status));
            }
            status.code()
        }
        Some(Err(e)) => {
            messages.push(format!("process error: {}", e));
            None
        }
        None => None,
    };
    match timed_out {
        Some(limit) => {
            messages.push(format!("timeout {} sec exceeded", limit.as_secs()));
            None
        }
        None => code,
    }
}
