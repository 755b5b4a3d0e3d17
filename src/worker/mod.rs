//! Worker supervisor — owns the external ML subprocesses
//!
//! The diarizer and transcriber run as separate OS processes speaking the
//! line protocol in [`protocol`]. The supervisor spawns them, fans their
//! stdout/stderr lines to the owning client over a typed channel, feeds PCM
//! to their stdin, and maps process exit into a typed result. It guarantees
//! at most one live instance per role and never interprets domain payloads.
//!
//! # Shutdown
//!
//! `stop(grace)` closes stdin (the workers treat EOF as end-of-stream and
//! flush) and waits; a worker that outlives the grace period is escalated
//! the same way `cancel` works: SIGTERM, another grace wait, then SIGKILL.

pub mod protocol;

use log::{debug, info, warn};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// How many trailing stderr lines are kept for failure reports
const STDERR_TAIL_LINES: usize = 20;

/// Extra wait after SIGTERM before SIGKILL
const TERM_TO_KILL_GRACE: Duration = Duration::from_secs(2);

/// Logical role a worker fills; at most one live process per role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    Diarizer,
    Transcriber,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Diarizer => write!(f, "diarizer"),
            WorkerRole::Transcriber => write!(f, "transcriber"),
        }
    }
}

/// Launch description for a worker process
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub exe: PathBuf,
    pub args: Vec<String>,
    /// Extra environment; credentials ride here. Output buffering is always
    /// disabled regardless of what the caller passes.
    pub env: Vec<(String, String)>,
}

impl WorkerSpec {
    pub fn new(exe: PathBuf) -> Self {
        Self {
            exe,
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Resolve a worker executable by name on PATH.
    pub fn locate(name: &str) -> Result<Self, WorkerError> {
        let exe = which::which(name)
            .map_err(|_| WorkerError::ExecutableNotFound(name.to_string()))?;
        Ok(Self::new(exe))
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.env.push((k.into(), v.into()));
        self
    }
}

/// Which pipe a forwarded line arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// A raw line forwarded to the owning client
#[derive(Debug, Clone)]
pub struct WorkerLine {
    pub source: StdStream,
    pub text: String,
}

/// Typed process outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Ok,
    Cancelled,
    Failed { code: i32, stderr_tail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker executable not found on PATH: {0}")]
    ExecutableNotFound(String),

    #[error("Failed to spawn {role}: {source}")]
    SpawnFailed {
        role: WorkerRole,
        source: std::io::Error,
    },

    #[error("No running {0} worker")]
    NotRunning(WorkerRole),

    #[error("Worker stdin closed")]
    StdinClosed,
}

struct LiveWorker {
    pid: Option<u32>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    cancel: CancellationToken,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
}

/// Spawns and tracks one worker per role.
pub struct WorkerSupervisor {
    workers: tokio::sync::Mutex<HashMap<WorkerRole, LiveWorker>>,
}

impl Default for WorkerSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSupervisor {
    pub fn new() -> Self {
        Self {
            workers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a worker for `role`, stopping any previous instance first.
    /// Lines from both pipes are forwarded to `line_tx` in arrival order per
    /// pipe; the channel closing does not kill the worker.
    pub async fn start(
        &self,
        role: WorkerRole,
        spec: WorkerSpec,
        line_tx: mpsc::Sender<WorkerLine>,
    ) -> Result<(), WorkerError> {
        if self.is_running(role).await {
            warn!("{} worker already running, replacing it", role);
            let _ = self.cancel(role).await;
        }

        let mut cmd = Command::new(&spec.exe);
        cmd.args(&spec.args)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|source| WorkerError::SpawnFailed { role, source })?;
        let pid = child.id();
        info!("Spawned {} worker: {:?} (pid {:?})", role, spec.exe, pid);

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let mut stdin = child.stdin.take().expect("stdin was piped");

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        // stdout reader
        {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    if tx
                        .send(WorkerLine {
                            source: StdStream::Stdout,
                            text,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        // stderr reader, keeping the tail for failure reports
        {
            let tx = line_tx;
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    {
                        let mut tail = tail.lock().expect("stderr tail lock");
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(text.clone());
                    }
                    if tx
                        .send(WorkerLine {
                            source: StdStream::Stderr,
                            text,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        // stdin writer; dropping the sender closes the pipe (EOF)
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move {
            while let Some(bytes) = stdin_rx.recv().await {
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });

        // exit monitor
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let cancel = cancel.clone();
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let exit = tokio::select! {
                    status = child.wait() => match status {
                        Ok(s) if s.success() => WorkerExit::Ok,
                        Ok(s) => WorkerExit::Failed {
                            code: s.code().unwrap_or(-1),
                            stderr_tail: drain_tail(&tail),
                        },
                        Err(e) => WorkerExit::Failed {
                            code: -1,
                            stderr_tail: format!("wait failed: {}", e),
                        },
                    },
                    _ = cancel.cancelled() => {
                        terminate(&mut child, pid, TERM_TO_KILL_GRACE).await;
                        WorkerExit::Cancelled
                    }
                };
                debug!("{} worker exit: {:?}", role, exit);
                let _ = exit_tx.send(Some(exit));
            });
        }

        self.workers.lock().await.insert(
            role,
            LiveWorker {
                pid,
                stdin_tx: Some(stdin_tx),
                cancel,
                exit_rx,
            },
        );
        Ok(())
    }

    pub async fn is_running(&self, role: WorkerRole) -> bool {
        let workers = self.workers.lock().await;
        match workers.get(&role) {
            Some(w) => w.exit_rx.borrow().is_none(),
            None => false,
        }
    }

    /// Write bytes (PCM or commands) to the worker's stdin.
    pub async fn send(&self, role: WorkerRole, bytes: Vec<u8>) -> Result<(), WorkerError> {
        let tx = {
            let workers = self.workers.lock().await;
            let worker = workers.get(&role).ok_or(WorkerError::NotRunning(role))?;
            worker
                .stdin_tx
                .as_ref()
                .ok_or(WorkerError::StdinClosed)?
                .clone()
        };
        tx.send(bytes).await.map_err(|_| WorkerError::StdinClosed)
    }

    /// Graceful stop: close stdin, give the worker `grace` to flush and
    /// exit, then escalate through SIGTERM/SIGKILL.
    pub async fn stop(&self, role: WorkerRole, grace: Duration) -> Result<WorkerExit, WorkerError> {
        let mut exit_rx = {
            let mut workers = self.workers.lock().await;
            let worker = workers.get_mut(&role).ok_or(WorkerError::NotRunning(role))?;
            worker.stdin_tx.take(); // EOF
            worker.exit_rx.clone()
        };

        let exited = tokio::time::timeout(grace, async {
            loop {
                if exit_rx.borrow().is_some() {
                    break;
                }
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !exited {
            warn!("{} worker did not exit within {:?}, escalating", role, grace);
            return self.cancel(role).await;
        }

        let exit = exit_rx.borrow().clone().unwrap_or(WorkerExit::Cancelled);
        self.workers.lock().await.remove(&role);
        Ok(exit)
    }

    /// Forceful stop: SIGTERM now, SIGKILL after the escalation grace.
    pub async fn cancel(&self, role: WorkerRole) -> Result<WorkerExit, WorkerError> {
        let mut exit_rx = {
            let mut workers = self.workers.lock().await;
            let worker = workers.get_mut(&role).ok_or(WorkerError::NotRunning(role))?;
            worker.stdin_tx.take();
            worker.cancel.cancel();
            worker.exit_rx.clone()
        };

        loop {
            if exit_rx.borrow().is_some() {
                break;
            }
            if exit_rx.changed().await.is_err() {
                break;
            }
        }
        let exit = exit_rx.borrow().clone().unwrap_or(WorkerExit::Cancelled);
        self.workers.lock().await.remove(&role);
        Ok(exit)
    }

    /// Stop every live worker; used on session teardown.
    pub async fn stop_all(&self, grace: Duration) {
        let roles: Vec<WorkerRole> = self.workers.lock().await.keys().copied().collect();
        for role in roles {
            if let Err(e) = self.stop(role, grace).await {
                warn!("Failed to stop {} worker: {}", role, e);
            }
        }
    }

    /// Pid of a live worker, for diagnostics.
    pub async fn pid(&self, role: WorkerRole) -> Option<u32> {
        self.workers.lock().await.get(&role).and_then(|w| w.pid)
    }
}

fn drain_tail(tail: &Mutex<VecDeque<String>>) -> String {
    let tail = tail.lock().expect("stderr tail lock");
    tail.iter().cloned().collect::<Vec<_>>().join("\n")
}

/// SIGTERM, wait for `grace`, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!("Worker pid {} survived SIGTERM, sending SIGKILL", pid);
    }
    #[cfg(not(unix))]
    let _ = (pid, grace);

    let _ = child.kill().await;
    let _ = child.wait().await;
}
