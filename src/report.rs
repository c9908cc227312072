//! The run log.
//!
//! Every decision the dispatcher takes is appended to a [`RunLog`] as a
//! timestamped [`RunEvent`]. Once a run is over, one [`JobReport`] per job is
//! appended and the log can be rendered as a plain text report.

use std::fmt;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::fleet::CapacityEntry;

const RULE_WIDTH: usize = 78;

/// Final word on one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job: usize,
    pub group: u32,
    pub command: String,
    pub host: Option<String>,
    pub outcome: String,
    pub status: Option<i32>,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    GroupStarted {
        group: u32,
    },
    /// A new capacity epoch starts.
    Capacity {
        group: u32,
        hosts: Vec<CapacityEntry>,
        cumulative: Vec<usize>,
    },
    /// Every slot of the epoch is taken; waiting for a host to free up.
    HostsBusy {
        group: u32,
        launched: usize,
    },
    Assigned {
        job: usize,
        slot: usize,
        host: String,
    },
    Launched {
        job: usize,
        command: String,
        host: String,
    },
    Completed {
        job: usize,
        host: String,
    },
    Failed {
        job: usize,
        command: String,
        host: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    GroupDrained {
        group: u32,
    },
    /// Outcome of the dry run of one program.
    Tried {
        program: String,
        command: String,
        error: Option<String>,
    },
    /// A program run in the foreground on this machine.
    RanLocally {
        program: String,
        status: Option<i32>,
        output: String,
    },
    Report(JobReport),
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunEvent::GroupStarted { group } => write!(f, "Group {} started", group),
            RunEvent::Capacity {
                group,
                hosts,
                cumulative,
            } => {
                let hosts: Vec<_> = hosts
                    .iter()
                    .map(|h| format!("{}:{}", h.identity, h.available_slots))
                    .collect();
                write!(
                    f,
                    "Group {} available hosts [{}], cumulative sum {:?}",
                    group,
                    hosts.join(", "),
                    cumulative
                )
            }
            RunEvent::HostsBusy { group, launched } => write!(
                f,
                "--- Hosts busy --- group {} after {} launches",
                group, launched
            ),
            RunEvent::Assigned { job, slot, host } => {
                write!(f, "Job {} takes slot {} on '{}'", job, slot, host)
            }
            RunEvent::Launched { job, command, host } => {
                write!(f, "Job {} launched on '{}': {}", job, host, command)
            }
            RunEvent::Completed { job, host } => write!(f, "Job {} completed on '{}'", job, host),
            RunEvent::Failed {
                job,
                command,
                host,
                status,
                stdout,
                stderr,
            } => write!(
                f,
                "WARNING: The program \"{}\" (job {}) does not work on the host '{}'.\n\
                 status: {}\n  STDOUT: {}\n  STDERR: {}",
                command,
                job,
                host,
                display_status(*status),
                stdout.trim_end(),
                stderr.trim_end()
            ),
            RunEvent::GroupDrained { group } => write!(f, "Group {} drained", group),
            RunEvent::Tried {
                program,
                command,
                error,
            } => match error {
                None => write!(f, "Running program \"{}\":\n   {}", program, command),
                Some(error) => write!(
                    f,
                    "Running program \"{}\":\n   {}\n   failed: {}",
                    program, command, error
                ),
            },
            RunEvent::RanLocally {
                program,
                status,
                output,
            } => write!(
                f,
                "Program \"{}\" exited with status {}\n{}",
                program,
                display_status(*status),
                output.trim_end()
            ),
            RunEvent::Report(report) => write!(
                f,
                "{}\nStatus: {}\nHostname: {}\nStarted at {}\nEnded approximately at {}",
                report.command,
                report.outcome,
                report.host.as_deref().unwrap_or("-"),
                display_time(report.started_at),
                display_time(report.ended_at)
            ),
        }
    }
}

fn display_status(status: Option<i32>) -> String {
    status.map_or_else(|| "none".to_string(), |code| code.to_string())
}

fn display_time(at: Option<DateTime<Local>>) -> String {
    at.map_or_else(|| "-".to_string(), |at| at.format("%a %b %e %T %Y").to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEntry {
    pub at: DateTime<Local>,
    pub event: RunEvent,
}

/// Append-only sequence of run events.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct RunLog {
    entries: Vec<RunEntry>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: RunEvent) {
        self.entries.push(RunEntry {
            at: Local::now(),
            event,
        });
    }

    pub fn entries(&self) -> &[RunEntry] {
        &self.entries
    }

    pub fn events(&self) -> impl Iterator<Item = &RunEvent> {
        self.entries.iter().map(|entry| &entry.event)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, predicate: impl Fn(&RunEvent) -> bool) -> usize {
        self.events().filter(|event| predicate(event)).count()
    }

    pub fn reports(&self) -> impl Iterator<Item = &JobReport> {
        self.events().filter_map(|event| match event {
            RunEvent::Report(report) => Some(report),
            _ => None,
        })
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Renders the log as text: the event trail first, then the job reports
    /// separated by group banners.
    pub fn render(&self) -> String {
        let rule = "-".repeat(RULE_WIDTH);
        let mut out = format!("{}\n\n", rule);
        let mut group = None;
        for entry in &self.entries {
            match &entry.event {
                RunEvent::Report(report) => {
                    if group.is_some_and(|g| g != report.group) {
                        let banner = format!("### GROUP {} ###", report.group);
                        out.push_str(&format!(
                            "{:^width$}\n\n{}\n\n",
                            banner,
                            rule,
                            width = RULE_WIDTH
                        ));
                    }
                    group = Some(report.group);
                    out.push_str(&format!("{}\n\n{}\n\n", entry.event, rule));
                }
                event => {
                    out.push_str(&format!("[{}] {}\n", entry.at.format("%T"), event));
                    if matches!(event, RunEvent::GroupDrained { .. }) {
                        out.push_str(&format!("{}\n", rule));
                    }
                }
            }
        }
        out
    }
}

impl fmt::Display for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(job: usize, group: u32) -> JobReport {
        JobReport {
            job,
            group,
            command: format!("echo {}", job),
            host: Some("node1".to_string()),
            outcome: "completed".to_string(),
            status: Some(0),
            started_at: Some(Local::now()),
            ended_at: Some(Local::now()),
        }
    }

    #[test]
    fn test_push_appends_in_order() {
        let mut log = RunLog::new();
        assert!(log.is_empty());
        log.push(RunEvent::GroupStarted { group: 0 });
        log.push(RunEvent::Completed {
            job: 0,
            host: "node1".into(),
        });
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.events().next(),
            Some(&RunEvent::GroupStarted { group: 0 })
        );
        assert_eq!(log.count(|e| matches!(e, RunEvent::Completed { .. })), 1);
    }

    #[test]
    fn test_render_separates_groups() {
        let mut log = RunLog::new();
        log.push(RunEvent::Report(report(0, 0)));
        log.push(RunEvent::Report(report(1, 0)));
        log.push(RunEvent::Report(report(2, 3)));
        let text = log.render();
        assert_eq!(text.matches("### GROUP 3 ###").count(), 1);
        assert!(!text.contains("### GROUP 0 ###"));
        assert!(text.contains("echo 2\nStatus: completed\nHostname: node1"));
        assert!(text.find("echo 1").unwrap() < text.find("### GROUP 3 ###").unwrap());
    }

    #[test]
    fn test_failure_display_carries_output() {
        let event = RunEvent::Failed {
            job: 1,
            command: "./simulate".into(),
            host: "node2".into(),
            status: Some(1),
            stdout: "partial\n".into(),
            stderr: "segfault\n".into(),
        };
        let text = event.to_string();
        assert!(text.contains("does not work on the host 'node2'"));
        assert!(text.contains("STDOUT: partial"));
        assert!(text.contains("STDERR: segfault"));
    }

    #[test]
    fn test_serializes_to_yaml() {
        let mut log = RunLog::new();
        log.push(RunEvent::HostsBusy {
            group: 1,
            launched: 4,
        });
        let yaml = serde_yaml::to_string(&log).unwrap();
        assert!(yaml.contains("event: hosts_busy"));
        assert!(yaml.contains("launched: 4"));
    }
}
