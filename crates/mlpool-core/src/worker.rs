//! A single supervised worker process.
//!
//! The orchestrator talks to a worker over JSON Lines on its stdin/stdout.
//! Requests are served one at a time, in submission order. An exit monitor
//! task owns the child handle and reports the process exit to the pool; a
//! dead worker is never restarted in place.

use std::{
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use mlpool_domain::{PoolKey, WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot, watch},
    time::timeout,
};
use tracing::{debug, trace, warn};

use crate::config::WorkerConfig;
use crate::env::Environment;
use crate::error::WorkerError;
use crate::events::WorkerExit;

/// Observable lifecycle of a started worker. A handle exists only once the
/// process has announced readiness, so there is no starting state here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Ready and never served a request.
    Ready,
    Busy,
    /// Served at least one request and is waiting for the next.
    Idle,
    Dead,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Stop,
    Kill,
}

struct WorkerIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerIo {
    async fn send(&mut self, request: &WorkerRequest) -> Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<WorkerResponse> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await?
                .ok_or_else(|| anyhow!("worker closed its output"))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .with_context(|| format!("malformed worker reply: {trimmed}"));
        }
    }
}

/// Where and how a worker is launched.
pub(crate) struct WorkerSpec<'a> {
    pub(crate) config: &'a WorkerConfig,
    pub(crate) environment: Option<&'a Environment>,
    pub(crate) pool: &'a PoolKey,
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

pub struct Worker {
    pid: u32,
    slot: usize,
    generation: u64,
    pool: PoolKey,
    io: tokio::sync::Mutex<WorkerIo>,
    alive: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    control: Mutex<Option<oneshot::Sender<Control>>>,
    exited: watch::Receiver<bool>,
    next_id: AtomicU64,
    dispatch_timeout: Duration,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("slot", &self.slot)
            .field("pool", &self.pool)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Spawns the worker process and waits for its readiness signal.
    ///
    /// # Errors
    /// Returns [`WorkerError::Startup`] when the process cannot be spawned,
    /// exits early, or stays silent past the startup timeout. The process is
    /// killed in every failure case.
    pub(crate) async fn start(
        spec: WorkerSpec<'_>,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<Arc<Self>, WorkerError> {
        let config = spec.config;
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(environment) = spec.environment {
            command.current_dir(environment.path());
            for (key, value) in environment.activation_vars() {
                command.env(key, value);
            }
        }

        let mut child = command.spawn().map_err(|err| {
            WorkerError::Startup(format!(
                "failed to start {}: {err}",
                config.program.display()
            ))
        })?;
        let started_at = Instant::now();
        let Some(pid) = child.id() else {
            return Err(WorkerError::Startup(
                "worker exited immediately after spawn".to_string(),
            ));
        };
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            kill_and_reap(&mut child).await;
            return Err(WorkerError::Startup(format!("stdio missing for worker {pid}")));
        };
        let mut io = WorkerIo {
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        match timeout(config.startup_timeout, io.recv()).await {
            Ok(Ok(WorkerResponse {
                payload: WorkerPayload::Ready { .. },
                ..
            })) => {}
            Ok(Ok(other)) => {
                kill_and_reap(&mut child).await;
                return Err(WorkerError::Startup(format!(
                    "worker {pid} sent {:?} before signalling readiness",
                    other.payload
                )));
            }
            Ok(Err(err)) => {
                kill_and_reap(&mut child).await;
                return Err(WorkerError::Startup(format!(
                    "worker {pid} failed before signalling readiness: {err:#}"
                )));
            }
            Err(_) => {
                kill_and_reap(&mut child).await;
                return Err(WorkerError::Startup(format!(
                    "worker {pid} not ready after {}ms",
                    config.startup_timeout.as_millis()
                )));
            }
        }

        let alive = Arc::new(AtomicBool::new(true));
        let state = Arc::new(Mutex::new(WorkerState::Ready));
        let (control_tx, control_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(monitor(
            child,
            control_rx,
            MonitorContext {
                alive: Arc::clone(&alive),
                state: Arc::clone(&state),
                exited: exited_tx,
                exits,
                slot: spec.slot,
                generation: spec.generation,
                pid,
                started_at,
                shutdown_timeout: config.shutdown_timeout,
            },
        ));
        debug!(pool = %spec.pool, slot = spec.slot, pid, "worker ready");

        Ok(Arc::new(Self {
            pid,
            slot: spec.slot,
            generation: spec.generation,
            pool: spec.pool.clone(),
            io: tokio::sync::Mutex::new(io),
            alive,
            state,
            control: Mutex::new(Some(control_tx)),
            exited: exited_rx,
            next_id: AtomicU64::new(1),
            dispatch_timeout: config.dispatch_timeout,
            shutdown_timeout: config.shutdown_timeout,
        }))
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Liveness as last observed by the exit monitor.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends one command and waits for its reply.
    ///
    /// A reply carrying [`WorkerPayload::Error`] is a successful round trip;
    /// only transport failures are errors here. A worker that times out or
    /// breaks protocol is killed so the pool replaces it.
    ///
    /// # Errors
    /// Returns [`WorkerError::Dead`], [`WorkerError::TimedOut`], or
    /// [`WorkerError::Protocol`].
    pub async fn dispatch(&self, command: WorkerCommand) -> Result<WorkerPayload, WorkerError> {
        if !self.is_alive() {
            return Err(WorkerError::Dead { pid: self.pid });
        }
        let mut io = self.io.lock().await;
        if !self.is_alive() {
            return Err(WorkerError::Dead { pid: self.pid });
        }
        self.set_state(WorkerState::Busy);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = WorkerRequest::new(id, command);
        trace!(pid = self.pid, id, "dispatching to worker");

        let roundtrip = async {
            io.send(&request).await?;
            io.recv().await
        };
        let outcome = match timeout(self.dispatch_timeout, roundtrip).await {
            Ok(Ok(response)) if response.id == id => Ok(response.payload),
            Ok(Ok(response)) => Err(WorkerError::Protocol {
                pid: self.pid,
                reason: format!("expected reply {id}, got {}", response.id),
            }),
            Ok(Err(err)) => {
                debug!(pid = self.pid, err = %format!("{err:#}"), "worker transport failed");
                Err(WorkerError::Dead { pid: self.pid })
            }
            Err(_) => Err(WorkerError::TimedOut {
                pid: self.pid,
                timeout_ms: self.dispatch_timeout.as_millis(),
            }),
        };
        drop(io);

        match &outcome {
            Ok(_) => self.set_state(WorkerState::Idle),
            Err(err) => {
                warn!(pool = %self.pool, slot = self.slot, pid = self.pid, %err, "worker unavailable");
                self.kill();
            }
        }
        outcome
    }

    /// Kills the process without the graceful shutdown handshake. The exit
    /// is reported as unexpected, so the owning pool respawns the slot.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::Release);
        self.send_control(Control::Kill);
    }

    /// Requests a graceful shutdown and waits for the process to exit,
    /// killing it after the shutdown timeout. Idempotent.
    pub async fn stop(&self) {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        // The monitor must see the request before the process exits.
        self.send_control(Control::Stop);
        if was_alive {
            if let Ok(mut io) = timeout(self.shutdown_timeout, self.io.lock()).await {
                let _ = io.send(&WorkerRequest::new(0, WorkerCommand::Shutdown)).await;
            }
        }
        self.wait_exit().await;
    }

    /// Resolves once the exit monitor has observed the process exit.
    pub async fn wait_exit(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }

    fn send_control(&self, control: Control) {
        let sender = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(control);
        }
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != WorkerState::Dead {
            *state = next;
        }
    }
}

struct MonitorContext {
    alive: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    exited: watch::Sender<bool>,
    exits: mpsc::UnboundedSender<WorkerExit>,
    slot: usize,
    generation: u64,
    pid: u32,
    started_at: Instant,
    shutdown_timeout: Duration,
}

enum Trigger {
    Exited(std::io::Result<ExitStatus>),
    Control(Option<Control>),
}

async fn monitor(mut child: Child, mut control: oneshot::Receiver<Control>, ctx: MonitorContext) {
    let trigger = tokio::select! {
        biased;
        requested = &mut control => Trigger::Control(requested.ok()),
        status = child.wait() => Trigger::Exited(status),
    };
    let (status, expected) = match trigger {
        Trigger::Exited(status) => (status, false),
        Trigger::Control(Some(Control::Stop)) => {
            let status = match timeout(ctx.shutdown_timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(pid = ctx.pid, "worker ignored shutdown request; killing");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            (status, true)
        }
        Trigger::Control(Some(Control::Kill)) => {
            let _ = child.start_kill();
            (child.wait().await, false)
        }
        // Handle dropped without stop; nothing is listening for a respawn.
        Trigger::Control(None) => {
            let _ = child.start_kill();
            (child.wait().await, true)
        }
    };

    ctx.alive.store(false, Ordering::Release);
    *ctx.state.lock().unwrap_or_else(PoisonError::into_inner) = WorkerState::Dead;
    let cause = match status {
        Ok(status) => status.to_string(),
        Err(err) => format!("wait failed: {err}"),
    };
    let _ = ctx.exited.send(true);
    let _ = ctx.exits.send(WorkerExit {
        slot: ctx.slot,
        generation: ctx.generation,
        pid: ctx.pid,
        cause,
        expected,
        uptime: ctx.started_at.elapsed(),
    });
}

async fn kill_and_reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}
