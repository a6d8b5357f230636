// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::channel::{memory_channel, pipe_channel, ChannelRx, ChannelTx};
use crate::error::{PoolError, Result};
use crate::task::{ExitResult, Task, WireMessage};

/// Env var the spawned child process checks for to know it should run the
/// worker event loop instead of whatever its normal `main` does. Set by
/// `Context::start`, read by `crate::child::is_worker_entry`.
pub const WORKER_ENTRY_MARKER: &str = "PARALLEL_POOL_WORKER_ENTRY";

/// Spawn configuration for a `Context`. The executable defaults to the
/// current binary (`std::env::current_exe`) re-exec'd with the worker-entry
/// marker set, the Rust-native reading of spec.md's "known entry script"
/// (see SPEC_FULL.md §0).
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct ContextConfig {
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub envs: HashMap<String, String>,
    /// Opaque bytes sent as the first message on the channel, ahead of any
    /// `Job`, if set. `crate::child::serve` stores them in the
    /// `Environment` under `crate::child::BOOTSTRAP_ENV_KEY` before
    /// entering its receive loop, so every `Task::run` on this worker can
    /// read them back.
    pub bootstrap: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Created,
    Started,
    Joined,
    Killed,
}

enum Executor {
    Process(tokio::process::Child),
    Thread(Option<std::thread::JoinHandle<()>>),
}

/// An executor handle: spawns a child process or OS thread running the
/// worker event loop, and owns its lifecycle (`created -> started ->
/// {joined | killed}`, spec.md §4.1). `start` hands ownership of the
/// message channel's two halves to the caller — a `Worker` drives its send
/// half directly while a dedicated task drives the receive half — so that
/// `Context` itself never needs to arbitrate between a sender and a
/// receiver sharing one `&mut self` (see DESIGN.md).
pub struct Context<T: Task> {
    state: State,
    config: ContextConfig,
    executor: Option<Executor>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    is_thread: bool,
    _marker: std::marker::PhantomData<T>,
}

type Halves<T> = (Box<dyn ChannelTx<T> + Send>, Box<dyn ChannelRx<T> + Send>);

impl<T: Task> Context<T> {
    /// A process-backed context: the child is a re-exec of `config`'s
    /// executable (or the current binary), communicating over its
    /// stdin/stdout; stderr is tee'd to this process's stderr without
    /// blocking the child.
    pub fn process(config: ContextConfig) -> Self {
        Self {
            state: State::Created,
            config,
            executor: None,
            stderr_task: None,
            is_thread: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// A thread-backed context: the "child" runs on a dedicated OS thread
    /// in this same address space, communicating over in-memory queues.
    /// Externally identical; exit code is always 0 on a clean return, and
    /// `kill` is best-effort abrupt thread termination (spec.md §4.1).
    pub fn thread() -> Self {
        Self {
            state: State::Created,
            config: ContextConfig::default(),
            executor: None,
            stderr_task: None,
            is_thread: true,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Started
    }

    /// Spawns the executor and returns the two channel halves. Calling
    /// `start` twice fails with `StatusError`.
    pub async fn start(&mut self) -> Result<Halves<T>> {
        if self.state != State::Created {
            return Err(PoolError::status(format!(
                "cannot start a context in state {:?}",
                self.state
            )));
        }

        let (mut tx, rx) = if self.is_thread {
            self.start_thread()
        } else {
            self.start_process().await?
        };

        if let Some(bytes) = self.config.bootstrap.clone() {
            tx.send(WireMessage::Bootstrap(bytes)).await?;
        }

        self.state = State::Started;
        Ok((tx, rx))
    }

    async fn start_process(&mut self) -> Result<Halves<T>> {
        let exe = match &self.config.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(PoolError::from)?,
        };

        let mut cmd = Command::new(&exe);
        cmd.args(&self.config.args);
        cmd.env(WORKER_ENTRY_MARKER, "1");
        cmd.envs(&self.config.envs);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            PoolError::context(format!("failed to spawn {}: {err}", exe.display()))
        })?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        // Drain stderr asynchronously so the child never blocks on a full
        // pipe; tee it to our own stderr.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if stderr.read_to_end(&mut buf).await.is_ok() && !buf.is_empty() {
                use std::io::Write;
                let _ = std::io::stderr().write_all(&buf);
            }
        });

        let (tx, rx) = pipe_channel(stdin, stdout);
        self.stderr_task = Some(stderr_task);
        self.executor = Some(Executor::Process(child));

        Ok((Box::new(tx), Box::new(rx)))
    }

    fn start_thread(&mut self) -> Halves<T> {
        let ((parent_tx, parent_rx), (child_tx, child_rx)) = memory_channel::<T>(32);
        let handle = std::thread::Builder::new()
            .name("parallel-pool-worker".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build worker thread runtime");
                rt.block_on(crate::child::serve(child_tx, child_rx));
            })
            .expect("failed to spawn worker thread");

        self.executor = Some(Executor::Thread(Some(handle)));
        (Box::new(parent_tx), Box::new(parent_rx))
    }

    /// Awaits the child's final exit (already read off the channel by the
    /// caller) and the underlying OS-level exit, producing the overall
    /// join result. A nonzero process exit code becomes `ContextException`;
    /// an `ExitResult::Err` is re-raised as `PanicError`.
    pub async fn wait_exit(&mut self, exit: ExitResult) -> Result<i32> {
        self.require_started()?;
        self.state = State::Joined;

        match self.executor.take() {
            Some(Executor::Process(mut child)) => {
                let status = child.wait().await.map_err(PoolError::from)?;
                if let Some(task) = self.stderr_task.take() {
                    let _ = task.await;
                }
                if !status.success() {
                    return Err(PoolError::context(format!(
                        "process exited with code {}",
                        status
                            .code()
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "unknown (terminated by signal)".to_string())
                    )));
                }
            }
            Some(Executor::Thread(Some(handle))) => {
                let _ = tokio::task::spawn_blocking(move || handle.join())
                    .await
                    .map_err(|err| PoolError::context(format!("worker thread panicked: {err}")));
            }
            _ => {}
        }

        match exit {
            ExitResult::Ok(value) => Ok(value),
            ExitResult::Err(failure) => Err(PoolError::PanicError(failure)),
        }
    }

    /// Forcibly terminates the executor. Idempotent.
    pub async fn kill(&mut self) {
        if self.state == State::Killed {
            return;
        }
        self.state = State::Killed;
        match self.executor.take() {
            Some(Executor::Process(mut child)) => {
                let _ = child.kill().await;
            }
            Some(Executor::Thread(handle)) => {
                // Best-effort: OS threads cannot be safely preempted from
                // the outside on all platforms (spec.md §4.1). We drop the
                // handle without joining; the thread observes channel
                // closure on its own next recv and exits.
                drop(handle);
            }
            None => {}
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    /// Forwards an OS signal to the executor. Process contexts only.
    #[cfg(unix)]
    pub fn signal(&self, sig: i32) -> Result<()> {
        match &self.executor {
            Some(Executor::Process(child)) => {
                let pid = child
                    .id()
                    .ok_or_else(|| PoolError::context("process has already exited"))?;
                nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::try_from(sig)
                        .map_err(|err| PoolError::status(err.to_string()))?,
                )
                .map_err(|err| PoolError::context(err.to_string()))
            }
            Some(Executor::Thread(_)) => Err(PoolError::status(
                "signal is not supported on thread-backed contexts",
            )),
            None => Err(PoolError::status("context has not been started")),
        }
    }

    /// Forwards an OS signal to the executor. Process contexts only.
    #[cfg(not(unix))]
    pub fn signal(&self, _sig: i32) -> Result<()> {
        Err(PoolError::status(
            "signal is not supported on this platform",
        ))
    }

    fn require_started(&self) -> Result<()> {
        if self.state != State::Started {
            return Err(PoolError::status(format!(
                "context is not started (state: {:?})",
                self.state
            )));
        }
        Ok(())
    }
}
