//! Configuration for Marionette.
//!
//! Holds clap structs for command line arguments and flags, and turns them
//! into the transport and dispatch settings the library takes.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use openssh::KnownHosts;

use crate::dispatcher::DispatchOptions;
use crate::transport::TransportConfig;

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    /// Run on the fleet (run), dry run (try), run here one by one (local),
    /// or show the state of the fleet (status)
    #[arg(value_enum)]
    pub mode: Mode,

    /// Host file to use: one host name per line
    #[arg(long, default_value = "hosts.txt")]
    pub hosts_file: PathBuf,

    /// Program file to use: a YAML list of commands or {command, group} mappings
    #[arg(long, default_value = "programs.yaml")]
    pub programs_file: PathBuf,

    /// Seconds to wait between two launches
    #[arg(long, default_value = "2", value_parser = parse_seconds)]
    pub delay: Duration,

    /// Seconds between two capacity checks while every host is busy
    #[arg(long, default_value = "10", value_parser = parse_seconds)]
    pub busy_wait: Duration,

    /// Seconds between two checks while waiting for a group to finish
    #[arg(long, default_value = "10", value_parser = parse_seconds)]
    pub drain_wait: Duration,

    /// Give up after waiting this many seconds for a free host. Waits forever if unset
    #[arg(long, value_parser = parse_seconds)]
    pub capacity_timeout: Option<Duration>,

    /// Write the run report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Use this ssh configuration file (ssh -F)
    #[arg(long)]
    pub ssh_config: Option<PathBuf>,

    /// What to do with unknown host keys
    #[arg(long, value_enum, default_value = "add")]
    pub known_hosts: KnownHostsPolicy,

    /// Seconds to wait for an SSH connection
    #[arg(long, default_value = "10", value_parser = parse_seconds)]
    pub connect_timeout: Duration,

    /// Seconds to wait for a probing command (uptime, free, ...)
    #[arg(long, default_value = "30", value_parser = parse_seconds)]
    pub query_timeout: Duration,

    /// Host names run on this machine without SSH. Defaults to localhost
    #[arg(long = "local-host")]
    pub local_hosts: Vec<String>,
}

#[derive(Debug, PartialEq, Clone, Copy, ValueEnum)]
pub enum Mode {
    Run,
    Try,
    Local,
    Status,
}

#[derive(Debug, PartialEq, Clone, Copy, ValueEnum)]
pub enum KnownHostsPolicy {
    /// Refuse unknown host keys
    Strict,
    /// Add unknown host keys to known_hosts
    Add,
    /// Accept unknown host keys without recording them
    Accept,
}

impl From<KnownHostsPolicy> for KnownHosts {
    fn from(policy: KnownHostsPolicy) -> Self {
        match policy {
            KnownHostsPolicy::Strict => KnownHosts::Strict,
            KnownHostsPolicy::Add => KnownHosts::Add,
            KnownHostsPolicy::Accept => KnownHosts::Accept,
        }
    }
}

/// Parses a non-negative, finite number of seconds.
fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| format!("'{}' is not a non-negative number of seconds", value))
}

impl Config {
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            launch_delay: self.delay,
            busy_wait: self.busy_wait,
            drain_wait: self.drain_wait,
            capacity_timeout: self.capacity_timeout,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig {
            ssh_config: self.ssh_config.clone(),
            known_hosts: self.known_hosts.into(),
            connect_timeout: Some(self.connect_timeout),
            ..TransportConfig::default()
        };
        if !self.local_hosts.is_empty() {
            config.local_hosts = self.local_hosts.iter().cloned().collect();
        }
        config
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }
}
