// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Server process supervision.
//!
//! A [`ProcessSupervisor`] starts the processes of provisioned servers. Each
//! process is represented by a [`ProcessHandle`], through which the local
//! coordinator feeds input, watches output for console sessions, and stops
//! the process.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use pp_ore::task::{AbortOnDropHandle, JoinHandleExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

/// How long a process may take to exit after its input is closed before it
/// is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// The number of output lines a slow listener may fall behind by.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Describes a process to start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessSpec {
    /// The program to run.
    pub command: String,
    /// The program's arguments.
    pub args: Vec<String>,
    /// The working directory.
    pub cwd: PathBuf,
    /// Additional environment variables.
    pub env: BTreeMap<String, String>,
}

/// Starts server processes.
#[async_trait]
pub trait ProcessSupervisor: fmt::Debug + Send + Sync {
    /// Starts the process described by `spec`.
    async fn start(&self, spec: &ProcessSpec) -> Result<Arc<dyn ProcessHandle>, anyhow::Error>;
}

/// A started server process.
#[async_trait]
pub trait ProcessHandle: fmt::Debug + Send + Sync {
    /// Reports whether the process is still running.
    fn is_running(&self) -> bool;

    /// Writes a line to the process's standard input.
    async fn send_input(&self, input: &str) -> Result<(), anyhow::Error>;

    /// Stops the process and waits for it to exit.
    ///
    /// Unless `force` is set, the process is first given the chance to exit
    /// on its own.
    async fn stop(&self, force: bool);

    /// Waits for the process to exit.
    async fn wait(&self);

    /// Returns the buffered output lines together with a receiver for
    /// subsequent lines. The receiver is closed once the process exited and
    /// its output was drained.
    fn subscribe(&self) -> OutputSubscription;
}

/// See [`ProcessHandle::subscribe`].
#[derive(Debug)]
pub struct OutputSubscription {
    /// The most recent output lines, oldest first.
    pub replay: Vec<String>,
    /// Output lines produced after the subscription.
    pub lines: broadcast::Receiver<String>,
}

/// The recent output of a process and its live listeners.
#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    /// `None` once the output is drained.
    tx: Option<broadcast::Sender<String>>,
}

impl OutputBuffer {
    fn new(capacity: usize) -> OutputBuffer {
        let (tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        OutputBuffer {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            tx: Some(tx),
        }
    }

    fn push(&mut self, line: String) {
        if self.capacity > 0 {
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line.clone());
        }
        if let Some(tx) = &self.tx {
            // No listeners is fine.
            let _ = tx.send(line);
        }
    }

    fn subscribe(&self) -> OutputSubscription {
        let lines = match &self.tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        OutputSubscription {
            replay: self.lines.iter().cloned().collect(),
            lines,
        }
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

/// A [`ProcessSupervisor`] that runs servers as child processes of the
/// local coordinator.
#[derive(Clone, Debug)]
pub struct ChildSupervisor {
    replay_lines: usize,
    stop_timeout: Duration,
}

impl ChildSupervisor {
    /// Creates a supervisor whose processes remember their last
    /// `replay_lines` output lines.
    pub fn new(replay_lines: usize) -> ChildSupervisor {
        ChildSupervisor {
            replay_lines,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Sets how long a graceful stop may take.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> ChildSupervisor {
        self.stop_timeout = stop_timeout;
        self
    }
}

#[async_trait]
impl ProcessSupervisor for ChildSupervisor {
    async fn start(&self, spec: &ProcessSpec) -> Result<Arc<dyn ProcessHandle>, anyhow::Error> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", spec.command))?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().context("stdout not captured")?;
        let stderr = child.stderr.take().context("stderr not captured")?;

        let output = Arc::new(Mutex::new(OutputBuffer::new(self.replay_lines)));
        let stdout_task =
            pp_ore::task::spawn(|| "process::stdout", read_lines(stdout, Arc::clone(&output)));
        let stderr_task =
            pp_ore::task::spawn(|| "process::stderr", read_lines(stderr, Arc::clone(&output)));

        let (exited_tx, exited_rx) = watch::channel(false);
        let kill = Arc::new(Notify::new());
        let task = {
            let kill = Arc::clone(&kill);
            let output = Arc::clone(&output);
            let command = spec.command.clone();
            pp_ore::task::spawn(|| "process::supervise", async move {
                tokio::select! {
                    _ = child.wait() => {}
                    () = kill.notified() => {
                        if let Err(error) = child.kill().await {
                            warn!(%command, ?pid, "process: kill failed: {error}");
                        }
                    }
                }
                match child.wait().await {
                    Ok(status) => info!(%command, ?pid, %status, "process: exited"),
                    Err(error) => warn!(%command, ?pid, "process: wait failed: {error}"),
                }
                // Listeners see every line before they see the end.
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                output.lock().expect("lock poisoned").close();
                let _ = exited_tx.send(true);
            })
        };
        info!(command = %spec.command, ?pid, cwd = %spec.cwd.display(), "process: started");

        Ok(Arc::new(ChildProcess {
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            output,
            exited: exited_rx,
            kill,
            stop_timeout: self.stop_timeout,
            _task: task.abort_on_drop(),
        }))
    }
}

async fn read_lines<R>(reader: R, output: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => output.lock().expect("lock poisoned").push(line),
            Ok(None) => break,
            Err(error) => {
                debug!("process: output read failed: {error}");
                break;
            }
        }
    }
}

/// A child process started by a [`ChildSupervisor`].
#[derive(Debug)]
struct ChildProcess {
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    output: Arc<Mutex<OutputBuffer>>,
    exited: watch::Receiver<bool>,
    kill: Arc<Notify>,
    stop_timeout: Duration,
    _task: AbortOnDropHandle<()>,
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn is_running(&self) -> bool {
        !*self.exited.borrow()
    }

    async fn send_input(&self, input: &str) -> Result<(), anyhow::Error> {
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            bail!("process input is closed");
        };
        pipe.write_all(input.as_bytes()).await?;
        if !input.ends_with('\n') {
            pipe.write_all(b"\n").await?;
        }
        pipe.flush().await?;
        Ok(())
    }

    async fn stop(&self, force: bool) {
        if !force {
            self.stdin.lock().await.take();
            if tokio::time::timeout(self.stop_timeout, self.wait()).await.is_ok() {
                return;
            }
            warn!(pid = ?self.pid, "process: did not exit in time, killing");
        }
        self.kill.notify_one();
        self.wait().await;
    }

    async fn wait(&self) {
        let mut exited = self.exited.clone();
        loop {
            if *exited.borrow_and_update() {
                return;
            }
            // An error means the supervising task is gone, and the process
            // with it.
            if exited.changed().await.is_err() {
                return;
            }
        }
    }

    fn subscribe(&self) -> OutputSubscription {
        self.output.lock().expect("lock poisoned").subscribe()
    }
}
