//! Crash-resilient subprocess worker pool.
//!
//! The pool runs a list of inputs through up to `processes` long-lived worker
//! processes. Each worker handles one item at a time: the coordinator writes
//! the item as a single JSON line to the worker's stdin and reads a single
//! JSON line back from its stdout. Workers are reused for the next item
//! until the input list is drained.
//!
//! A worker that exits with the out-of-memory exit code walks a bounded
//! recovery ladder for the item it was holding:
//!
//! ```text
//! Normal -> Retry -> RetryWithMoreMemory -> Crashed
//! ```
//!
//! `Retry` respawns with the same memory ceiling, `RetryWithMoreMemory`
//! respawns with the escalation ceiling, and `Crashed` records the item in
//! [`PoolReport::crashed`] and moves on. Any other exit is fatal to the whole
//! run: every worker is killed and [`WorkerPool::run`] returns an error.
//!
//! All bookkeeping happens on the calling thread. One reader thread per
//! spawned process forwards stdout lines over a channel, tagged with the
//! slot and spawn generation so events from replaced processes are ignored.
//! Process exits are detected separately by polling each live worker between
//! channel reads, so a closed stdout never blocks the coordinator and an exit
//! is seen even while a grandchild still holds the pipe open.
//!
//! The worker side lives in [`worker`].

use std::io::{BufRead, BufReader, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tpub_types::CrashRecoveryState;

pub mod worker;

/// Environment variable carrying a worker's memory ceiling in megabytes.
pub const MEMORY_ENV: &str = "TPUB_WORKER_MEMORY_MB";

/// Longest the coordinator blocks on the channel before polling for exits.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long an observed exit waits for stdout to drain before it is handled.
const EXIT_GRACE: Duration = Duration::from_millis(200);

/// Program, arguments and environment used to start each worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Human-readable command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self, memory_ceiling_mb: Option<u64>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        match memory_ceiling_mb {
            Some(mb) => cmd.env(MEMORY_ENV, mb.to_string()),
            None => cmd.env_remove(MEMORY_ENV),
        };
        cmd
    }
}

/// Immutable pool tuning, fixed for the lifetime of a [`WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub processes: usize,
    pub crash_recovery: bool,
    /// Ceiling for normal runs; `None` leaves the worker unlimited.
    pub memory_ceiling_mb: Option<u64>,
    /// Ceiling for the `RetryWithMoreMemory` attempt.
    pub crash_recovery_memory_ceiling_mb: u64,
    /// Exit code that marks an out-of-memory crash.
    pub oom_exit_code: i32,
    /// Wall-clock budget for one [`WorkerPool::run`].
    pub soft_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            processes: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            crash_recovery: true,
            memory_ceiling_mb: None,
            crash_recovery_memory_ceiling_mb: 4096,
            oom_exit_code: 134,
            soft_timeout: None,
        }
    }
}

impl PoolSettings {
    fn can_escalate(&self) -> bool {
        self.memory_ceiling_mb
            .is_none_or(|mb| mb < self.crash_recovery_memory_ceiling_mb)
    }
}

/// Identity of a running worker process, handed to observer callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Slot index, stable across respawns.
    pub index: usize,
    pub pid: u32,
    pub memory_ceiling_mb: Option<u64>,
}

/// Callbacks fired by the coordinator as worker events arrive.
///
/// Calls are interleaved across workers in arrival order, not input order.
pub trait PoolObserver<I, O> {
    fn on_start(&mut self, _worker: &WorkerInfo) {}

    /// A worker finished `input`. Returning an error aborts the whole run.
    fn on_output(&mut self, _input: &I, _output: &O, _worker: &WorkerInfo) -> anyhow::Result<()> {
        Ok(())
    }

    /// A worker died from memory exhaustion while holding `input`; `state`
    /// is the recovery step about to be taken.
    fn on_crash(&mut self, _input: &I, _state: CrashRecoveryState, _worker: &WorkerInfo) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl<I, O> PoolObserver<I, O> for NoopObserver {}

/// An input given up on after crash recovery was exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashedItem<I> {
    pub input: I,
    pub worker: usize,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport<I, O> {
    /// Successful items in completion order.
    pub outputs: Vec<(I, O)>,
    /// Number of worker processes started, respawns included.
    pub spawned: usize,
    pub crashed: Vec<CrashedItem<I>>,
}

impl<I, O> Default for PoolReport<I, O> {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            spawned: 0,
            crashed: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker {worker}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send item to worker {worker}")]
    Send {
        worker: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode item for worker {worker}")]
    Encode {
        worker: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("worker {worker} broke protocol: {message}")]
    Protocol { worker: usize, message: String },
    #[error("worker {worker} exited abnormally: {status}")]
    WorkerExited { worker: usize, status: String },
    #[error("worker pool did not finish within {}", humanize(.0))]
    SoftTimeout(Duration),
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

fn humanize(d: &Duration) -> String {
    format!("{}ms", d.as_millis())
}

/// Pool of identical worker processes.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    command: WorkerCommand,
    settings: PoolSettings,
}

impl WorkerPool {
    pub fn new(command: WorkerCommand, settings: PoolSettings) -> Self {
        Self { command, settings }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Run every input to a terminal outcome: a successful output or a
    /// [`CrashedItem`].
    ///
    /// Starts `min(processes, inputs.len())` workers. Fatal failures (a non-OOM
    /// exit, a send failure, a malformed output line, an observer error or the
    /// soft timeout) kill every live worker and return `Err`.
    pub fn run<I, O, Obs>(
        &self,
        inputs: Vec<I>,
        observer: &mut Obs,
    ) -> Result<PoolReport<I, O>, PoolError>
    where
        I: Serialize,
        O: DeserializeOwned,
        Obs: PoolObserver<I, O> + ?Sized,
    {
        if inputs.is_empty() {
            return Ok(PoolReport::default());
        }

        let (tx, rx) = mpsc::channel();
        let slots = self.settings.processes.max(1).min(inputs.len());
        let mut run = Run {
            pool: self,
            remaining: inputs.len(),
            pending: inputs.into_iter().map(Some).collect(),
            cursor: 0,
            workers: (0..slots).map(|_| None).collect(),
            tx,
            next_generation: 0,
            report: PoolReport::default(),
            observer,
        };

        let result = run.drive(&rx);
        run.kill_all();
        result.map(|()| run.report)
    }
}

enum Event {
    Line {
        slot: usize,
        generation: u64,
        line: String,
    },
    Closed {
        slot: usize,
        generation: u64,
    },
}

struct Worker {
    child: Child,
    stdin: Option<ChildStdin>,
    generation: u64,
    info: WorkerInfo,
    current: Option<usize>,
    crash: CrashRecoveryState,
    stdout_closed: bool,
    exited: Option<(ExitStatus, Instant)>,
}

impl Worker {
    /// The exit status once the process has exited and its output has drained.
    fn reap(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if self.exited.is_none() {
            self.exited = self.child.try_wait()?.map(|status| (status, Instant::now()));
        }
        Ok(self
            .exited
            .filter(|(_, seen)| self.stdout_closed || seen.elapsed() >= EXIT_GRACE)
            .map(|(status, _)| status))
    }

    fn kill(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct Run<'a, I, O, Obs: ?Sized> {
    pool: &'a WorkerPool,
    pending: Vec<Option<I>>,
    remaining: usize,
    cursor: usize,
    workers: Vec<Option<Worker>>,
    tx: Sender<Event>,
    next_generation: u64,
    report: PoolReport<I, O>,
    observer: &'a mut Obs,
}

impl<I, O, Obs> Run<'_, I, O, Obs>
where
    I: Serialize,
    O: DeserializeOwned,
    Obs: PoolObserver<I, O> + ?Sized,
{
    fn settings(&self) -> &PoolSettings {
        &self.pool.settings
    }

    fn drive(&mut self, rx: &Receiver<Event>) -> Result<(), PoolError> {
        let deadline = self.settings().soft_timeout.map(|t| (Instant::now() + t, t));

        for slot in 0..self.workers.len() {
            let ceiling = self.settings().memory_ceiling_mb;
            self.spawn(slot, ceiling, CrashRecoveryState::Normal)?;
            self.dispatch_next(slot)?;
        }

        while self.remaining > 0 {
            let mut wait = POLL_INTERVAL;
            if let Some((at, budget)) = deadline {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(PoolError::SoftTimeout(budget));
                }
                wait = wait.min(left);
            }

            match rx.recv_timeout(wait) {
                Ok(event) => self.handle_event(event)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.reap_exited()?;
        }

        Ok(())
    }

    fn handle_event(&mut self, event: Event) -> Result<(), PoolError> {
        match event {
            Event::Line {
                slot,
                generation,
                line,
            } => {
                if self.is_live(slot, generation) {
                    self.handle_output(slot, &line)?;
                }
            }
            Event::Closed { slot, generation } => {
                if self.is_live(slot, generation)
                    && let Some(worker) = self.workers[slot].as_mut()
                {
                    worker.stdout_closed = true;
                }
            }
        }
        Ok(())
    }

    fn reap_exited(&mut self) -> Result<(), PoolError> {
        for slot in 0..self.workers.len() {
            let Some(worker) = self.workers[slot].as_mut() else {
                continue;
            };
            let status = worker.reap().map_err(|err| PoolError::WorkerExited {
                worker: slot,
                status: err.to_string(),
            })?;
            if let Some(status) = status {
                self.handle_exit(slot, status)?;
            }
        }
        Ok(())
    }

    fn is_live(&self, slot: usize, generation: u64) -> bool {
        self.workers
            .get(slot)
            .and_then(Option::as_ref)
            .is_some_and(|w| w.generation == generation)
    }

    fn spawn(
        &mut self,
        slot: usize,
        memory_ceiling_mb: Option<u64>,
        crash: CrashRecoveryState,
    ) -> Result<(), PoolError> {
        let mut child = self
            .pool
            .command
            .to_command(memory_ceiling_mb)
            .spawn()
            .map_err(|source| PoolError::Spawn { worker: slot, source })?;

        let generation = self.next_generation;
        self.next_generation += 1;
        self.report.spawned += 1;

        let info = WorkerInfo {
            index: slot,
            pid: child.id(),
            memory_ceiling_mb,
        };
        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PoolError::Protocol {
                worker: slot,
                message: "stdout was not captured".to_string(),
            });
        };

        let tx = self.tx.clone();
        let reader = thread::Builder::new()
            .name(format!("tpub-worker-{slot}"))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if tx.send(Event::Line { slot, generation, line }).is_err() {
                        return;
                    }
                }
                let _ = tx.send(Event::Closed { slot, generation });
            });
        if let Err(source) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PoolError::Spawn { worker: slot, source });
        }

        self.workers[slot] = Some(Worker {
            child,
            stdin,
            generation,
            info,
            current: None,
            crash,
            stdout_closed: false,
            exited: None,
        });
        self.observer.on_start(&info);
        Ok(())
    }

    /// Hand the slot the next undispatched input, or retire it if none remain.
    fn dispatch_next(&mut self, slot: usize) -> Result<(), PoolError> {
        if self.cursor >= self.pending.len() {
            if let Some(mut worker) = self.workers[slot].take() {
                worker.kill();
            }
            return Ok(());
        }
        let index = self.cursor;
        self.cursor += 1;
        if let Some(worker) = self.workers[slot].as_mut() {
            worker.current = Some(index);
        }
        self.send_current(slot)
    }

    fn send_current(&mut self, slot: usize) -> Result<(), PoolError> {
        let Some(worker) = self.workers[slot].as_mut() else {
            return Ok(());
        };
        if worker.exited.is_some() {
            // The pending exit is charged to this item once it is reaped.
            return Ok(());
        }
        let Some(input) = worker.current.and_then(|i| self.pending[i].as_ref()) else {
            return Err(PoolError::Protocol {
                worker: slot,
                message: "no item assigned".to_string(),
            });
        };

        let mut line = serde_json::to_string(input)
            .map_err(|source| PoolError::Encode { worker: slot, source })?;
        line.push('\n');

        let Some(stdin) = worker.stdin.as_mut() else {
            return Err(PoolError::Protocol {
                worker: slot,
                message: "stdin was not captured".to_string(),
            });
        };
        stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(|source| PoolError::Send { worker: slot, source })
    }

    fn handle_output(&mut self, slot: usize, line: &str) -> Result<(), PoolError> {
        let Some(worker) = self.workers[slot].as_mut() else {
            return Ok(());
        };
        let Some(index) = worker.current.take() else {
            return Err(PoolError::Protocol {
                worker: slot,
                message: format!("output without an assigned item: {line}"),
            });
        };
        let info = worker.info;
        let escalated = worker.crash == CrashRecoveryState::RetryWithMoreMemory;
        worker.crash = CrashRecoveryState::Normal;

        let output: O = serde_json::from_str(line).map_err(|err| PoolError::Protocol {
            worker: slot,
            message: format!("invalid output line {line:?}: {err}"),
        })?;
        let Some(input) = self.pending[index].take() else {
            return Err(PoolError::Protocol {
                worker: slot,
                message: "item completed twice".to_string(),
            });
        };

        self.observer.on_output(&input, &output, &info)?;
        self.report.outputs.push((input, output));
        self.remaining -= 1;

        if escalated && self.cursor < self.pending.len() {
            if let Some(mut worker) = self.workers[slot].take() {
                worker.kill();
            }
            let ceiling = self.settings().memory_ceiling_mb;
            self.spawn(slot, ceiling, CrashRecoveryState::Normal)?;
        }
        self.dispatch_next(slot)
    }

    fn handle_exit(&mut self, slot: usize, status: ExitStatus) -> Result<(), PoolError> {
        let Some(mut worker) = self.workers[slot].take() else {
            return Ok(());
        };
        drop(worker.stdin.take());

        let oom_exit_code = self.settings().oom_exit_code;
        let Some(index) = worker.current.filter(|_| status.code() == Some(oom_exit_code)) else {
            return Err(PoolError::WorkerExited {
                worker: slot,
                status: status.to_string(),
            });
        };

        let next = match worker.crash {
            _ if !self.settings().crash_recovery => CrashRecoveryState::Crashed,
            CrashRecoveryState::Normal => CrashRecoveryState::Retry,
            CrashRecoveryState::Retry if self.settings().can_escalate() => {
                CrashRecoveryState::RetryWithMoreMemory
            }
            _ => CrashRecoveryState::Crashed,
        };

        if let Some(input) = self.pending[index].as_ref() {
            self.observer.on_crash(input, next, &worker.info);
        }

        match next {
            CrashRecoveryState::Retry => {
                self.spawn(slot, worker.info.memory_ceiling_mb, next)?;
                self.resend(slot, index)
            }
            CrashRecoveryState::RetryWithMoreMemory => {
                let ceiling = Some(self.settings().crash_recovery_memory_ceiling_mb);
                self.spawn(slot, ceiling, next)?;
                self.resend(slot, index)
            }
            CrashRecoveryState::Normal | CrashRecoveryState::Crashed => {
                if let Some(input) = self.pending[index].take() {
                    self.report.crashed.push(CrashedItem { input, worker: slot });
                }
                self.remaining -= 1;
                if self.cursor < self.pending.len() {
                    let ceiling = self.settings().memory_ceiling_mb;
                    self.spawn(slot, ceiling, CrashRecoveryState::Normal)?;
                    self.dispatch_next(slot)?;
                }
                Ok(())
            }
        }
    }

    fn resend(&mut self, slot: usize, index: usize) -> Result<(), PoolError> {
        if let Some(worker) = self.workers[slot].as_mut() {
            worker.current = Some(index);
        }
        self.send_current(slot)
    }

    fn kill_all(&mut self) {
        for mut worker in self.workers.iter_mut().filter_map(Option::take) {
            worker.kill();
        }
    }
}
