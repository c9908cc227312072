//! Group-based dispatch of programs over the fleet.
//!
//! Jobs are launched in `(group, insertion)` order. Within a group, each job
//! takes the next slot of the current [`SlotPartition`]; when every slot is
//! taken the dispatcher waits for the fleet to report free capacity and opens
//! a new epoch. A group is drained (none of its jobs still running) before
//! the first job of the next group is launched. A job exiting with a
//! non-zero status is recorded and reported but never stops the run.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::process::ExitStatus;
use std::time::Duration;

use chrono::{DateTime, Local};
use colored::ColoredString;
use colourado::{Color, ColorPalette, PaletteType};
use itertools::zip;

use crate::error::{MarionetteError, Result};
use crate::fleet::{CapacityEntry, FleetRegistry};
use crate::host::{self, HostRef};
use crate::program::Program;
use crate::report::{JobReport, RunEvent, RunLog};
use crate::scheduler::{Assignment, SlotPartition};
use crate::transport::{CapturedOutput, LocalTransport, ProcessHandle, Transport};

/// Timing knobs of a run.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Pause after every launch.
    pub launch_delay: Duration,
    /// Pause once every slot of a snapshot is taken, and poll interval while
    /// every host is busy.
    pub busy_wait: Duration,
    /// Poll interval while draining a group.
    pub drain_wait: Duration,
    /// Upper bound on a single wait for capacity. `None` waits forever.
    pub capacity_timeout: Option<Duration>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            launch_delay: Duration::from_secs(2),
            busy_wait: Duration::from_secs(10),
            drain_wait: Duration::from_secs(10),
            capacity_timeout: None,
        }
    }
}

pub enum JobState {
    Pending,
    Launched {
        handle: Box<dyn ProcessHandle>,
        host: String,
        started_at: DateTime<Local>,
    },
    Completed {
        status: ExitStatus,
        host: String,
        started_at: DateTime<Local>,
        ended_at: DateTime<Local>,
    },
    Failed {
        /// `None` when the process could not be started or was lost.
        status: Option<ExitStatus>,
        output: CapturedOutput,
        host: String,
        started_at: DateTime<Local>,
        ended_at: DateTime<Local>,
    },
}

impl fmt::Debug for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "Pending"),
            JobState::Launched { host, .. } => write!(f, "Launched({})", host),
            JobState::Completed { status, host, .. } => {
                write!(f, "Completed({}, {})", host, status)
            }
            JobState::Failed { status, host, .. } => write!(f, "Failed({}, {:?})", host, status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Pending,
    Launched,
    Completed,
    Failed,
}

#[derive(Debug)]
pub struct Job {
    program: Program,
    state: JobState,
}

impl Job {
    fn new(program: Program) -> Self {
        Self {
            program,
            state: JobState::Pending,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn command(&self) -> &str {
        &self.program.command
    }

    pub fn group(&self) -> u32 {
        self.program.group
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn outcome(&self) -> JobOutcome {
        match self.state {
            JobState::Pending => JobOutcome::Pending,
            JobState::Launched { .. } => JobOutcome::Launched,
            JobState::Completed { .. } => JobOutcome::Completed,
            JobState::Failed { .. } => JobOutcome::Failed,
        }
    }

    pub fn is_launched(&self) -> bool {
        matches!(self.state, JobState::Launched { .. })
    }

    pub fn host(&self) -> Option<&str> {
        match &self.state {
            JobState::Pending => None,
            JobState::Launched { host, .. }
            | JobState::Completed { host, .. }
            | JobState::Failed { host, .. } => Some(host),
        }
    }

    /// Captured output of a failed job.
    pub fn failure_output(&self) -> Option<&CapturedOutput> {
        match &self.state {
            JobState::Failed { output, .. } => Some(output),
            _ => None,
        }
    }

    fn report(&self, job: usize) -> JobReport {
        let (status, started_at, ended_at) = match &self.state {
            JobState::Pending => (None, None, None),
            JobState::Launched { started_at, .. } => (None, Some(*started_at), None),
            JobState::Completed {
                status,
                started_at,
                ended_at,
                ..
            } => (status.code(), Some(*started_at), Some(*ended_at)),
            JobState::Failed {
                status,
                started_at,
                ended_at,
                ..
            } => (
                status.and_then(|s| s.code()),
                Some(*started_at),
                Some(*ended_at),
            ),
        };
        JobReport {
            job,
            group: self.group(),
            command: self.command().to_string(),
            host: self.host().map(str::to_string),
            outcome: format!("{:?}", self.outcome()).to_lowercase(),
            status,
            started_at,
            ended_at,
        }
    }
}

/// Counts of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.completed == self.total
    }
}

pub struct Dispatcher {
    jobs: Vec<Job>,
    options: DispatchOptions,
    log: RunLog,
    colors: HashMap<String, Color>,
}

impl Dispatcher {
    pub fn new(options: DispatchOptions) -> Self {
        Self {
            jobs: Vec::new(),
            options,
            log: RunLog::new(),
            colors: HashMap::new(),
        }
    }

    /// Adds a program, keeping jobs sorted by group and in insertion order
    /// within a group.
    pub fn add_program(&mut self, program: impl Into<Program>) {
        self.jobs.push(Job::new(program.into()));
        self.jobs.sort_by_key(Job::group);
    }

    pub fn add_programs<P: Into<Program>>(&mut self, programs: impl IntoIterator<Item = P>) {
        self.jobs
            .extend(programs.into_iter().map(|p| Job::new(p.into())));
        self.jobs.sort_by_key(Job::group);
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn outcomes(&self) -> Vec<JobOutcome> {
        self.jobs.iter().map(Job::outcome).collect()
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// Forgets every program and the log.
    pub fn clear(&mut self) {
        self.jobs.clear();
        self.log.clear();
    }

    fn ensure_programs(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(MarionetteError::Config("The program list is empty.".into()));
        }
        Ok(())
    }

    fn summary(&self) -> RunSummary {
        let count = |outcome| self.jobs.iter().filter(|j| j.outcome() == outcome).count();
        RunSummary {
            total: self.jobs.len(),
            completed: count(JobOutcome::Completed),
            failed: count(JobOutcome::Failed),
        }
    }

    fn colorhost(&self, host: &str) -> ColoredString {
        let color = self.colors.get(host).cloned().unwrap_or(Color {
            red: 1.0,
            green: 1.0,
            blue: 1.0,
        });
        host::prettify(host, color)
    }

    /// Dispatches every program over the fleet.
    ///
    /// Returns normally even when some jobs failed; inspect [`Self::jobs`] or
    /// the summary to find out. Only configuration problems and a capacity
    /// wait running past [`DispatchOptions::capacity_timeout`] abort the run.
    pub async fn run(&mut self, fleet: &mut FleetRegistry) -> Result<RunSummary> {
        self.ensure_programs()?;
        for job in &mut self.jobs {
            job.state = JobState::Pending;
        }
        let names = fleet.host_names();
        let palette = ColorPalette::new(names.len() as u32, PaletteType::Pastel, false);
        self.colors = zip(names, palette.colors).collect();

        let mut group_start = 0;
        let first = self.jobs[0].group();
        self.log.push(RunEvent::GroupStarted { group: first });
        tracing::info!(group = first, "group started");
        let capacity = fleet.refresh_capacity().await;
        let mut partition = self.open_epoch(first, capacity)?;
        for index in 0..self.jobs.len() {
            let group = self.jobs[index].group();
            if index > 0 && group != self.jobs[index - 1].group() {
                let previous = self.jobs[index - 1].group();
                self.drain(group_start..index).await;
                self.log.push(RunEvent::GroupDrained { group: previous });
                tracing::info!(group = previous, "group drained");
                group_start = index;
                self.log.push(RunEvent::GroupStarted { group });
                tracing::info!(group, "group started");
                let capacity = fleet.refresh_capacity().await;
                partition = self.open_epoch(group, capacity)?;
            }

            let assignment = loop {
                if let Some(assignment) = partition.assign() {
                    break assignment;
                }
                self.log.push(RunEvent::HostsBusy {
                    group,
                    launched: partition.launched(),
                });
                tracing::info!(group, launched = partition.launched(), "all hosts busy");
                // The load average lags behind the launches just made.
                tokio::time::sleep(self.options.busy_wait).await;
                let capacity = fleet
                    .wait_for_capacity(self.options.busy_wait, self.options.capacity_timeout)
                    .await?;
                partition = self.open_epoch(group, capacity)?;
            };
            self.launch(index, assignment, fleet).await;

            tokio::time::sleep(self.options.launch_delay).await;
            self.sweep().await;
        }

        let last = self.jobs.len();
        self.drain(group_start..last).await;
        let group = self.jobs[last - 1].group();
        self.log.push(RunEvent::GroupDrained { group });
        tracing::info!(group, "group drained");
        self.sweep().await;

        for (index, job) in self.jobs.iter().enumerate() {
            self.log.push(RunEvent::Report(job.report(index)));
        }
        let summary = self.summary();
        tracing::info!(
            total = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            "all programs are done"
        );
        Ok(summary)
    }

    fn open_epoch(&mut self, group: u32, capacity: Vec<CapacityEntry>) -> Result<SlotPartition> {
        let partition = SlotPartition::new(capacity)?;
        self.log.push(RunEvent::Capacity {
            group,
            hosts: partition.snapshot().to_vec(),
            cumulative: partition.cumulative().to_vec(),
        });
        tracing::debug!(group, total = partition.total(), "new capacity epoch");
        Ok(partition)
    }

    async fn launch(&mut self, index: usize, assignment: Assignment, fleet: &FleetRegistry) {
        let Assignment { slot, host } = assignment;
        let command = self.jobs[index].command().to_string();
        self.log.push(RunEvent::Assigned {
            job: index,
            slot,
            host: host.clone(),
        });
        let started_at = Local::now();
        match fleet.spawn_on(&HostRef::from(host.as_str()), &command).await {
            Ok(handle) => {
                println!("{} === launch '{}' ===", self.colorhost(&host), command);
                tracing::debug!(job = index, host = %host, slot, "launched");
                self.log.push(RunEvent::Launched {
                    job: index,
                    command,
                    host: host.clone(),
                });
                self.jobs[index].state = JobState::Launched {
                    handle,
                    host,
                    started_at,
                };
            }
            Err(error) => {
                let output = CapturedOutput {
                    stdout: String::new(),
                    stderr: error.to_string(),
                };
                self.record_failure(index, None, output, host, started_at);
            }
        }
    }

    /// Checks every running job of the run, without blocking on any of them.
    async fn sweep(&mut self) {
        for index in 0..self.jobs.len() {
            let polled = match &mut self.jobs[index].state {
                JobState::Launched { handle, .. } => handle.poll(),
                _ => continue,
            };
            match polled {
                Ok(None) => {}
                Ok(Some(status)) => self.finish(index, Ok(status)).await,
                Err(error) => self.finish(index, Err(error)).await,
            }
        }
    }

    async fn finish(&mut self, index: usize, status: Result<ExitStatus>) {
        let (mut handle, host, started_at) =
            match std::mem::replace(&mut self.jobs[index].state, JobState::Pending) {
                JobState::Launched {
                    handle,
                    host,
                    started_at,
                } => (handle, host, started_at),
                other => {
                    self.jobs[index].state = other;
                    return;
                }
            };
        match status {
            Ok(status) if status.success() => {
                println!("{} === done ({}) ===", self.colorhost(&host), status);
                self.log.push(RunEvent::Completed {
                    job: index,
                    host: host.clone(),
                });
                self.jobs[index].state = JobState::Completed {
                    status,
                    host,
                    started_at,
                    ended_at: Local::now(),
                };
            }
            Ok(status) => {
                let output = handle
                    .collect_output()
                    .await
                    .unwrap_or_else(|error| CapturedOutput {
                        stdout: String::new(),
                        stderr: error.to_string(),
                    });
                self.record_failure(index, Some(status), output, host, started_at);
            }
            Err(error) => {
                let output = CapturedOutput {
                    stdout: String::new(),
                    stderr: error.to_string(),
                };
                self.record_failure(index, None, output, host, started_at);
            }
        }
    }

    fn record_failure(
        &mut self,
        index: usize,
        status: Option<ExitStatus>,
        output: CapturedOutput,
        host: String,
        started_at: DateTime<Local>,
    ) {
        let command = self.jobs[index].command().to_string();
        tracing::warn!(
            job = index,
            host = %host,
            command = %command,
            status = ?status.and_then(|s| s.code()),
            stderr = %output.stderr.trim_end(),
            "program failed; the other programs keep running"
        );
        self.log.push(RunEvent::Failed {
            job: index,
            command,
            host: host.clone(),
            status: status.and_then(|s| s.code()),
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        });
        self.jobs[index].state = JobState::Failed {
            status,
            output,
            host,
            started_at,
            ended_at: Local::now(),
        };
    }

    /// Waits until no job in `range` is running anymore.
    async fn drain(&mut self, range: Range<usize>) {
        loop {
            self.sweep().await;
            if !self.jobs[range.clone()].iter().any(Job::is_launched) {
                return;
            }
            tokio::time::sleep(self.options.drain_wait).await;
        }
    }

    /// Checks that every program's executable exists on this machine.
    ///
    /// The first program failing the check aborts: it means the executable
    /// is missing, which no host of the fleet would fix.
    pub async fn try_run(&mut self) -> Result<()> {
        self.ensure_programs()?;
        for job in &self.jobs {
            let program = job.program();
            let checked = program.locate_executable();
            self.log.push(RunEvent::Tried {
                program: program.basename().to_string(),
                command: program.command.clone(),
                error: checked.as_ref().err().cloned(),
            });
            if let Err(reason) = checked {
                return Err(MarionetteError::DryRun {
                    program: program.basename().to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Runs every program in order on this machine, one at a time.
    ///
    /// Unlike [`Self::run`], the first failing program aborts.
    pub async fn run_local(&mut self) -> Result<RunSummary> {
        self.ensure_programs()?;
        for index in 0..self.jobs.len() {
            let command = self.jobs[index].command().to_string();
            let program = self.jobs[index].program().basename().to_string();
            println!("Program name: {}", program);
            let started_at = Local::now();
            let out = LocalTransport.run("localhost", &command).await?;
            self.log.push(RunEvent::RanLocally {
                program: program.clone(),
                status: out.status.code(),
                output: out.output.clone(),
            });
            if !out.status.success() {
                self.jobs[index].state = JobState::Failed {
                    status: Some(out.status),
                    output: CapturedOutput {
                        stdout: out.output,
                        stderr: String::new(),
                    },
                    host: "localhost".to_string(),
                    started_at,
                    ended_at: Local::now(),
                };
                return Err(MarionetteError::LocalRun {
                    program,
                    status: out.status.to_string(),
                });
            }
            self.jobs[index].state = JobState::Completed {
                status: out.status,
                host: "localhost".to_string(),
                started_at,
                ended_at: Local::now(),
            };
        }
        Ok(self.summary())
    }
}
