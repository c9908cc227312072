//! Hosts of the fleet.
//!
//! A [`HostDescriptor`] carries what is known about one host: its processor
//! count and total memory, fetched once, and whether it answered the last
//! probe. [`HostProbe`] fills descriptors in and samples load and memory
//! usage. Load and memory sampling never fail: an unreachable host, a timed
//! out query or unparsable output is reported as data.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use colourado::Color;

use crate::error::{MarionetteError, Result};
use crate::transport::{RemoteOutput, Transport};

pub const LIVENESS_COMMAND: &str = "uptime";
pub const PROCESSOR_COMMAND: &str = "grep -c ^processor /proc/cpuinfo";
pub const TOTAL_MEMORY_COMMAND: &str = "grep ^MemTotal /proc/meminfo | cut -d : -f 2";
pub const LOAD_COMMAND: &str = "uptime";
pub const USED_MEMORY_COMMAND: &str = "free -k";

/// A host given either by name or with already known properties.
#[derive(Debug, Clone, PartialEq)]
pub enum HostRef {
    ByName(String),
    ByDescriptor(HostDescriptor),
}

impl HostRef {
    pub fn identity(&self) -> &str {
        match self {
            HostRef::ByName(name) => name,
            HostRef::ByDescriptor(descriptor) => descriptor.identity(),
        }
    }
}

impl From<&str> for HostRef {
    fn from(name: &str) -> Self {
        HostRef::ByName(name.to_string())
    }
}

impl From<String> for HostRef {
    fn from(name: String) -> Self {
        HostRef::ByName(name)
    }
}

impl From<HostDescriptor> for HostRef {
    fn from(descriptor: HostDescriptor) -> Self {
        HostRef::ByDescriptor(descriptor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostDescriptor {
    identity: String,
    /// Cached for the lifetime of the descriptor once known.
    processor_count: Option<usize>,
    /// Cached like `processor_count`, in kB.
    total_memory_kb: Option<u64>,
    reachable: bool,
}

impl HostDescriptor {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            processor_count: None,
            total_memory_kb: None,
            reachable: false,
        }
    }

    /// A host whose processor count is imposed instead of queried.
    pub fn with_processors(identity: impl Into<String>, processors: usize) -> Self {
        Self {
            processor_count: Some(processors),
            ..Self::new(identity)
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Number of processors, or 0 while unknown.
    pub fn processor_count(&self) -> usize {
        self.processor_count.unwrap_or(0)
    }

    /// Total memory in kB, or 0 while unknown.
    pub fn total_memory_kb(&self) -> u64 {
        self.total_memory_kb.unwrap_or(0)
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub(crate) fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
    }

    pub(crate) fn knows_processors(&self) -> bool {
        self.processor_count.is_some()
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        prettify(&self.identity, color)
    }
}

impl fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.identity)
    }
}

pub fn prettify(identity: &str, color: Color) -> ColoredString {
    let r = (color.red * 255.0) as u8;
    let g = (color.green * 255.0) as u8;
    let b = (color.blue * 255.0) as u8;
    format!("[{}]", identity).truecolor(r, g, b)
}

/// System load averages over the past 1, 5 and 15 minutes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadSample {
    Unavailable,
    Sampled {
        one_min: f64,
        five_min: f64,
        fifteen_min: f64,
    },
}

impl LoadSample {
    pub fn one_min(&self) -> Option<f64> {
        match self {
            LoadSample::Sampled { one_min, .. } => Some(*one_min),
            LoadSample::Unavailable => None,
        }
    }
}

impl fmt::Display for LoadSample {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadSample::Unavailable => write!(f, "off"),
            LoadSample::Sampled {
                one_min,
                five_min,
                fifteen_min,
            } => write!(f, "{:.2}, {:.2}, {:.2}", one_min, five_min, fifteen_min),
        }
    }
}

/// Output must be a single non-empty line.
fn single_line(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed.lines().count() != 1 {
        return None;
    }
    Some(trimmed)
}

pub fn parse_processor_count(output: &str) -> Option<usize> {
    single_line(output)?.parse().ok()
}

/// Parses the value part of the `MemTotal` line, e.g. `  16318536 kB`.
pub fn parse_total_memory(output: &str) -> Option<u64> {
    single_line(output)?.split_whitespace().next()?.parse().ok()
}

/// Parses the three trailing fields of `uptime`.
pub fn parse_load_average(output: &str) -> Option<(f64, f64, f64)> {
    let line = output.lines().rev().find(|line| !line.trim().is_empty())?;
    let fields: Vec<_> = line.split_whitespace().collect();
    if fields.len() < 3 {
        return None;
    }
    let mut loads = fields[fields.len() - 3..]
        .iter()
        .map(|field| field.trim_end_matches(',').parse::<f64>());
    match (loads.next()?, loads.next()?, loads.next()?) {
        (Ok(one), Ok(five), Ok(fifteen)) if one >= 0.0 => Some((one, five, fifteen)),
        _ => None,
    }
}

/// Parses the `used` column of the `Mem:` row of `free -k`.
pub fn parse_used_memory(output: &str) -> Option<u64> {
    output
        .lines()
        .find(|line| line.trim_start().starts_with("Mem:"))?
        .split_whitespace()
        .nth(2)?
        .parse()
        .ok()
}

/// Queries hosts over a [`Transport`], giving up on any query after `timeout`.
#[derive(Clone)]
pub struct HostProbe {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl HostProbe {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Runs a query, folding transport errors and timeouts into `None`.
    async fn query(&self, host: &str, command: &str) -> Option<RemoteOutput> {
        match tokio::time::timeout(self.timeout, self.transport.run(host, command)).await {
            Ok(Ok(output)) => Some(output),
            Ok(Err(error)) => {
                tracing::debug!(host, command, %error, "query failed");
                None
            }
            Err(_) => {
                tracing::debug!(host, command, timeout = ?self.timeout, "query timed out");
                None
            }
        }
    }

    /// Probes a host, turning a name into a descriptor.
    ///
    /// An unreachable host is not an error; only a reachable host answering
    /// with malformed processor or memory information is.
    pub async fn probe(&self, host: HostRef) -> Result<HostDescriptor> {
        let mut descriptor = match host {
            HostRef::ByName(name) => HostDescriptor::new(name),
            HostRef::ByDescriptor(descriptor) => descriptor,
        };
        self.refresh(&mut descriptor).await?;
        Ok(descriptor)
    }

    /// Re-derives reachability and fetches the static properties still unknown.
    pub async fn refresh(&self, descriptor: &mut HostDescriptor) -> Result<()> {
        descriptor.reachable = self.is_alive(&descriptor.identity).await;
        if !descriptor.reachable {
            return Ok(());
        }
        self.processor_count(descriptor).await?;
        self.total_memory(descriptor).await?;
        Ok(())
    }

    pub async fn is_alive(&self, host: &str) -> bool {
        matches!(self.query(host, LIVENESS_COMMAND).await, Some(out) if out.status.success())
    }

    /// Runs a query whose answer must be well formed once the host responds.
    async fn strict_query<T>(
        &self,
        descriptor: &mut HostDescriptor,
        command: &str,
        parse: fn(&str) -> Option<T>,
    ) -> Result<Option<T>> {
        let Some(out) = self.query(&descriptor.identity, command).await else {
            descriptor.reachable = false;
            return Ok(None);
        };
        match parse(&out.output) {
            Some(value) if out.status.success() => Ok(Some(value)),
            _ => Err(MarionetteError::HostIntegrity {
                host: descriptor.identity.clone(),
                command: command.to_string(),
                output: out.output,
            }),
        }
    }

    /// Returns the processor count, querying the host the first time.
    pub async fn processor_count(&self, descriptor: &mut HostDescriptor) -> Result<usize> {
        if let Some(count) = descriptor.processor_count {
            return Ok(count);
        }
        if let Some(count) = self
            .strict_query(descriptor, PROCESSOR_COMMAND, parse_processor_count)
            .await?
        {
            descriptor.processor_count = Some(count);
        }
        Ok(descriptor.processor_count())
    }

    /// Returns the total memory in kB, querying the host the first time.
    pub async fn total_memory(&self, descriptor: &mut HostDescriptor) -> Result<u64> {
        if let Some(memory) = descriptor.total_memory_kb {
            return Ok(memory);
        }
        if let Some(memory) = self
            .strict_query(descriptor, TOTAL_MEMORY_COMMAND, parse_total_memory)
            .await?
        {
            descriptor.total_memory_kb = Some(memory);
        }
        Ok(descriptor.total_memory_kb())
    }

    pub async fn load_average(&self, host: &str) -> LoadSample {
        let parsed = self
            .query(host, LOAD_COMMAND)
            .await
            .filter(|out| out.status.success())
            .and_then(|out| parse_load_average(&out.output));
        match parsed {
            Some((one_min, five_min, fifteen_min)) => LoadSample::Sampled {
                one_min,
                five_min,
                fifteen_min,
            },
            None => LoadSample::Unavailable,
        }
    }

    /// Used memory in kB, `None` when unavailable.
    pub async fn used_memory(&self, host: &str) -> Option<u64> {
        self.query(host, USED_MEMORY_COMMAND)
            .await
            .filter(|out| out.status.success())
            .and_then(|out| parse_used_memory(&out.output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_processor_count() {
        assert_eq!(parse_processor_count("8\n"), Some(8));
        assert_eq!(parse_processor_count("  16  "), Some(16));
        assert_eq!(parse_processor_count(""), None);
        assert_eq!(parse_processor_count("Warning: added host\n8"), None);
        assert_eq!(parse_processor_count("eight"), None);
    }

    #[test]
    fn test_parse_total_memory() {
        assert_eq!(parse_total_memory("       16318536 kB\n"), Some(16318536));
        assert_eq!(parse_total_memory("kB"), None);
        assert_eq!(parse_total_memory("1 kB\n2 kB"), None);
    }

    #[test]
    fn test_parse_load_average() {
        let out = " 14:02:11 up 12 days,  3:04,  2 users,  load average: 0.52, 0.58, 0.59\n";
        assert_eq!(parse_load_average(out), Some((0.52, 0.58, 0.59)));
        let busy = "10:00  up 1 day, 2:03, 1 user, load averages: 3.60 2.10 1.00";
        assert_eq!(parse_load_average(busy), Some((3.6, 2.1, 1.0)));
        assert_eq!(parse_load_average("ssh: connect to host x port 22"), None);
        assert_eq!(parse_load_average(""), None);
    }

    #[test]
    fn test_parse_used_memory() {
        let out = "\
               total        used        free      shared  buff/cache   available
Mem:        16318536     5123456     8000000      123456     3195080    10800000
Swap:        2097148           0     2097148
";
        assert_eq!(parse_used_memory(out), Some(5123456));
        assert_eq!(parse_used_memory("Swap: 1 2 3"), None);
    }

    #[test]
    fn test_host_ref_identity() {
        assert_eq!(HostRef::from("node1").identity(), "node1");
        let descriptor = HostDescriptor::with_processors("node2", 4);
        assert_eq!(HostRef::from(descriptor).identity(), "node2");
    }

    #[test]
    fn test_descriptor_defaults_to_zero_capacity() {
        let descriptor = HostDescriptor::new("node1");
        assert!(!descriptor.is_reachable());
        assert_eq!(descriptor.processor_count(), 0);
        assert_eq!(descriptor.total_memory_kb(), 0);
        assert_eq!(descriptor.to_string(), "[node1]");
    }
}
