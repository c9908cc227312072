//! Marionette: a load-aware SSH job dispatcher.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to run commands on hosts.
pub mod transport;
// How to describe and probe hosts.
pub mod host;
// The fleet of hosts and its capacity.
pub mod fleet;
// Slot partitioning over a capacity snapshot.
pub mod scheduler;
// How to parse and represent programs.
pub mod program;
// The run log and report.
pub mod report;
// Group-based dispatch loop.
pub mod dispatcher;

pub use config::{Config, Mode};
pub use dispatcher::{DispatchOptions, Dispatcher, Job, JobOutcome, JobState, RunSummary};
pub use error::{MarionetteError, Result};
pub use fleet::{available_slots, CapacityEntry, FleetRegistry, HostSource};
pub use host::{HostDescriptor, HostProbe, HostRef, LoadSample};
pub use program::{load_programs, parse_programs, Program};
pub use report::{JobReport, RunEvent, RunLog};
pub use scheduler::{host_for_slot, Assignment, SlotPartition};
pub use transport::{
    launch_wait, CapturedOutput, Killer, LocalTransport, OutputBuffer, Pipe, ProcessHandle,
    RemoteOutput, SshTransport, TaskHandle, Transport, TransportConfig,
};
