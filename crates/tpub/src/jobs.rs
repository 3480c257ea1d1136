use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::engine::{ALL_PACKAGES, Reporter};
use crate::events::EventLog;
use crate::pool::{PoolObserver, PoolSettings, WorkerCommand, WorkerInfo, WorkerPool};
use crate::types::{CrashRecoveryState, EventType, PackageId, PublishEvent};

/// Outcome of running a worker command over a set of packages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobsReport {
    /// Packages in completion order with whatever the worker answered.
    pub succeeded: Vec<(PackageId, Value)>,
    /// Packages given up on after exhausting crash recovery.
    pub crashed: Vec<PackageId>,
    pub spawned: usize,
}

struct JobObserver<'a> {
    reporter: &'a mut dyn Reporter,
    events: &'a mut EventLog,
    done: usize,
    total: usize,
}

impl PoolObserver<PackageId, Value> for JobObserver<'_> {
    fn on_start(&mut self, worker: &WorkerInfo) {
        let ceiling = worker
            .memory_ceiling_mb
            .map_or_else(|| "unlimited".to_string(), |mb| format!("{mb} MB"));
        self.reporter.info(&format!(
            "worker {} started (pid {}, memory {ceiling})",
            worker.index, worker.pid
        ));
        self.events.record(PublishEvent::now(
            EventType::WorkerStarted {
                worker: worker.index,
                memory_ceiling_mb: worker.memory_ceiling_mb,
            },
            ALL_PACKAGES,
        ));
    }

    fn on_output(&mut self, input: &PackageId, _output: &Value, worker: &WorkerInfo) -> Result<()> {
        self.done += 1;
        self.reporter.info(&format!(
            "[{}/{}] {input} finished on worker {}",
            self.done, self.total, worker.index
        ));
        self.events.record(PublishEvent::now(
            EventType::JobSucceeded {
                worker: worker.index,
            },
            input.to_string(),
        ));
        self.reporter.progress(self.done, self.total, &input.to_string());
        Ok(())
    }

    fn on_crash(&mut self, input: &PackageId, state: CrashRecoveryState, worker: &WorkerInfo) {
        self.events.record(PublishEvent::now(
            EventType::WorkerCrashed {
                worker: worker.index,
                state,
            },
            input.to_string(),
        ));
        if state == CrashRecoveryState::Crashed {
            self.done += 1;
            self.reporter.error(&format!(
                "[{}/{}] {input} ran out of memory on worker {}; giving up",
                self.done, self.total, worker.index
            ));
            self.events.record(PublishEvent::now(
                EventType::JobCrashed {
                    worker: worker.index,
                },
                input.to_string(),
            ));
            self.reporter.progress(self.done, self.total, &input.to_string());
        } else {
            self.reporter.warn(&format!(
                "{input} ran out of memory on worker {}; next step: {state}",
                worker.index
            ));
        }
    }
}

/// Run `command` once per package through a [`WorkerPool`].
///
/// Each worker receives `{"name": ..., "majorVersion": ...}` lines and must
/// answer each with one JSON value.
pub fn run_jobs(
    settings: &PoolSettings,
    command: WorkerCommand,
    packages: Vec<PackageId>,
    reporter: &mut dyn Reporter,
    events: &mut EventLog,
) -> Result<JobsReport> {
    if packages.is_empty() {
        reporter.info("no packages to run");
        return Ok(JobsReport::default());
    }

    reporter.info(&format!(
        "running `{}` over {} packages with up to {} workers",
        command.display(),
        packages.len(),
        settings.processes
    ));

    let total = packages.len();
    let pool = WorkerPool::new(command, settings.clone());
    let mut observer = JobObserver {
        reporter: &mut *reporter,
        events: &mut *events,
        done: 0,
        total,
    };

    match pool.run(packages, &mut observer) {
        Ok(report) => {
            let crashed: Vec<PackageId> = report.crashed.into_iter().map(|c| c.input).collect();
            if !crashed.is_empty() {
                reporter.warn(&format!("{} packages crashed: {}", crashed.len(), join(&crashed)));
            }
            Ok(JobsReport {
                succeeded: report.outputs,
                crashed,
                spawned: report.spawned,
            })
        }
        Err(err) => {
            let message = err.to_string();
            reporter.error(&format!("worker pool failed: {message}"));
            events.record(PublishEvent::now(EventType::PoolFailed { message }, ALL_PACKAGES));
            Err(err).context("worker pool failed")
        }
    }
}

fn join(ids: &[PackageId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
