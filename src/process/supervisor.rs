use crate::error::{AppError, Result};
use crate::models::LogKind;
use crate::process::proc_tree;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// One captured line of child output.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub kind: LogKind,
    pub text: String,
}

// Task scripts get a clean interpreter environment even when the server
// was launched from an activated virtualenv shell.
const STRIPPED_ENV_VARS: [&str; 5] = [
    "VIRTUAL_ENV",
    "PYTHONHOME",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "PYTHONEXECUTABLE",
];

/// Launches one subprocess and supervises it to completion: stdout/stderr
/// are forwarded line by line to the log sink, and the caller's stop flag
/// is re-checked on every wait cycle. Never touches the persistent store.
pub struct ProcessSupervisor {
    command: Vec<String>,
    stop: Arc<AtomicBool>,
    log_tx: mpsc::Sender<LogLine>,
}

impl ProcessSupervisor {
    pub fn new(command: Vec<String>, stop: Arc<AtomicBool>, log_tx: mpsc::Sender<LogLine>) -> Self {
        Self {
            command,
            stop,
            log_tx,
        }
    }

    /// Spawns the child and its two stream readers. The returned handle
    /// exposes the pid immediately; call `wait` to drive it to completion.
    pub fn spawn(self) -> Result<SupervisedProcess> {
        // A stop requested between run selection and launch means the child
        // must never start at all.
        if self.stop.load(Ordering::Relaxed) {
            return Err(AppError::Process(
                "Stop requested before launch".to_string(),
            ));
        }

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| AppError::Process("Empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            // Neutral working directory, not wherever the scheduler runs from
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in STRIPPED_ENV_VARS {
            cmd.env_remove(var);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::Process(format!("Failed to spawn {program:?}: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Process("Failed to get process ID".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Process("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Process("Failed to capture stderr".to_string()))?;

        let stdout_task = tokio::spawn(read_stream(
            stdout,
            LogKind::Out,
            self.log_tx.clone(),
            self.stop.clone(),
        ));
        let stderr_task = tokio::spawn(read_stream(
            stderr,
            LogKind::Err,
            self.log_tx,
            self.stop.clone(),
        ));

        Ok(SupervisedProcess {
            child,
            pid,
            stdout_task,
            stderr_task,
            stop: self.stop,
        })
    }
}

pub struct SupervisedProcess {
    child: Child,
    pid: u32,
    stdout_task: JoinHandle<Result<()>>,
    stderr_task: JoinHandle<Result<()>>,
    stop: Arc<AtomicBool>,
}

impl SupervisedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Polls for process exit with a zero-timeout wait in a cycle,
    /// re-evaluating the stop flag each time; once it flips, the whole
    /// process tree is terminated and the wait continues until the child
    /// actually exits. Returns the process return code (`None` when killed
    /// by a signal).
    pub async fn wait(mut self) -> Result<Option<i64>> {
        let mut tree_killed = false;

        let status = loop {
            if self.stop.load(Ordering::Relaxed) && !tree_killed {
                tracing::info!("Stop requested, terminating process tree of pid {}", self.pid);
                proc_tree::kill_tree(self.pid, KILL_TIMEOUT).await;
                tree_killed = true;
            }

            match self
                .child
                .try_wait()
                .map_err(|e| AppError::Process(format!("Failed to poll process: {e}")))?
            {
                Some(status) => break status,
                None => sleep(WAIT_POLL_INTERVAL).await,
            }
        };

        // Reader failures surface here, after the child is gone
        self.stdout_task
            .await
            .map_err(|e| AppError::Process(format!("stdout reader panicked: {e}")))??;
        self.stderr_task
            .await
            .map_err(|e| AppError::Process(format!("stderr reader panicked: {e}")))??;

        Ok(status.code().map(i64::from))
    }
}

async fn read_stream<R>(
    stream: R,
    kind: LogKind,
    log_tx: mpsc::Sender<LogLine>,
    stop: Arc<AtomicBool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();

    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| AppError::Process(format!("Failed to read child stream: {e}")))?;
        let Some(text) = line else {
            break;
        };

        if log_tx.send(LogLine { kind, text }).await.is_err() {
            // Sink gone; nothing left to forward to
            break;
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }
    }

    Ok(())
}
