//! The fleet of hosts and its capacity.
//!
//! A [`FleetRegistry`] owns one [`HostDescriptor`] per host. Every fleet-wide
//! query fans out one future per host and joins all of them before returning,
//! so a slow host delays a refresh but never truncates it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use futures::future::{join, join_all};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{MarionetteError, Result};
use crate::host::{HostDescriptor, HostProbe, HostRef, LoadSample};
use crate::transport::{self, CapturedOutput, ProcessHandle, RemoteOutput};

/// Where the hosts of a fleet come from.
#[derive(Debug, Clone)]
pub enum HostSource {
    List(Vec<HostRef>),
    /// Plain text file with one host name per line.
    File(PathBuf),
}

impl From<Vec<HostRef>> for HostSource {
    fn from(hosts: Vec<HostRef>) -> Self {
        HostSource::List(hosts)
    }
}

/// Reads a host file. Blank lines and lines starting with `#` are skipped.
pub fn read_host_file(path: &Path) -> Result<Vec<HostRef>> {
    if !path.is_file() {
        return Err(MarionetteError::Config(format!(
            "The file '{}' not found.",
            path.display()
        )));
    }
    let hosts: Vec<HostRef> = fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(HostRef::from)
        .collect();
    if hosts.is_empty() {
        return Err(MarionetteError::Config(format!(
            "The file '{}' is empty.",
            path.display()
        )));
    }
    Ok(hosts)
}

/// Number of programs a host can take on right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityEntry {
    pub identity: String,
    pub available_slots: usize,
}

impl CapacityEntry {
    pub fn new(identity: impl Into<String>, available_slots: usize) -> Self {
        Self {
            identity: identity.into(),
            available_slots,
        }
    }
}

/// `floor(processors - load + 0.5)`, or `None` unless the 1-minute load is
/// below `processors - 0.5`.
pub fn available_slots(processors: usize, one_min_load: f64) -> Option<usize> {
    let processors = processors as f64;
    if !(one_min_load < processors - 0.5) {
        return None;
    }
    Some((processors - one_min_load + 0.5).floor() as usize)
}

pub struct FleetRegistry {
    hosts: Vec<HostDescriptor>,
    probe: HostProbe,
    faults: Vec<String>,
    /// Hosts with a fault in `faults`; each host is recorded once.
    faulty: HashSet<String>,
}

impl FleetRegistry {
    /// Builds the fleet and probes every host concurrently.
    ///
    /// Fails when the source names no host, names one twice, or when not a
    /// single host turns out to be reachable.
    pub async fn connect(source: impl Into<HostSource>, probe: HostProbe) -> Result<Self> {
        let refs = match source.into() {
            HostSource::List(refs) => refs,
            HostSource::File(path) => read_host_file(&path)?,
        };
        if refs.is_empty() {
            return Err(MarionetteError::Config("The hosts list is empty.".into()));
        }
        let mut seen = HashSet::new();
        for host in &refs {
            if host.identity().trim().is_empty() {
                return Err(MarionetteError::Config(
                    "A host must be given by a non-empty name.".into(),
                ));
            }
            if !seen.insert(host.identity().to_string()) {
                return Err(MarionetteError::DuplicateHost(host.identity().to_string()));
            }
        }

        let probes = refs.into_iter().map(|host| {
            let probe = probe.clone();
            async move {
                let identity = host.identity().to_string();
                (identity, probe.probe(host).await)
            }
        });
        let results = join_all(probes).await;
        let mut registry = Self {
            hosts: Vec::new(),
            probe,
            faults: Vec::new(),
            faulty: HashSet::new(),
        };
        for (identity, result) in results {
            match result {
                Ok(descriptor) => registry.hosts.push(descriptor),
                Err(error) => {
                    registry.record_fault(&identity, &error);
                    registry.hosts.push(HostDescriptor::new(identity));
                }
            }
        }

        if registry.connected_host_number() == 0 {
            return Err(MarionetteError::NoReachableHost {
                faults: registry.faults,
            });
        }
        tracing::info!(
            hosts = registry.host_count(),
            connected = registry.connected_host_number(),
            "fleet ready"
        );
        Ok(registry)
    }

    pub fn hosts(&self) -> &[HostDescriptor] {
        &self.hosts
    }

    pub fn host_names(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.identity().to_string()).collect()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn connected_host_number(&self) -> usize {
        self.hosts.iter().filter(|h| h.is_reachable()).count()
    }

    /// `(name, processors)` for every host.
    pub fn processor_counts(&self) -> Vec<(String, usize)> {
        self.hosts
            .iter()
            .map(|h| (h.identity().to_string(), h.processor_count()))
            .collect()
    }

    /// Integrity faults met while probing, oldest first, one per host.
    pub fn faults(&self) -> &[String] {
        &self.faults
    }

    pub fn probe(&self) -> &HostProbe {
        &self.probe
    }

    /// Samples the load averages of every host.
    pub async fn uptimes(&self) -> Vec<(String, LoadSample)> {
        let probe = &self.probe;
        join_all(self.hosts.iter().map(|host| async move {
            (
                host.identity().to_string(),
                probe.load_average(host.identity()).await,
            )
        }))
        .await
    }

    /// Samples the used memory (kB) of every host.
    pub async fn used_memory(&self) -> Vec<(String, Option<u64>)> {
        let probe = &self.probe;
        join_all(self.hosts.iter().map(|host| async move {
            (
                host.identity().to_string(),
                probe.used_memory(host.identity()).await,
            )
        }))
        .await
    }

    /// Takes a capacity snapshot of the fleet.
    ///
    /// Reachability of every host is re-derived from its load sample. A host
    /// coming back whose processor count was never fetched gets it fetched
    /// now. Unreachable hosts and hosts without a free slot are left out.
    pub async fn refresh_capacity(&mut self) -> Vec<CapacityEntry> {
        let probe = &self.probe;
        let samples = join_all(self.hosts.iter_mut().map(|host| async move {
            let (load, used_memory) = join(
                probe.load_average(host.identity()),
                probe.used_memory(host.identity()),
            )
            .await;
            host.set_reachable(load.one_min().is_some());
            let mut fault = None;
            if host.is_reachable() && !host.knows_processors() {
                if let Err(error) = probe.processor_count(host).await {
                    host.set_reachable(false);
                    fault = Some(error);
                }
            }
            tracing::debug!(
                host = %host.identity(),
                %load,
                used_memory_kb = ?used_memory,
                "sampled"
            );
            (load, fault)
        }))
        .await;

        let mut capacity = Vec::new();
        let mut faults = Vec::new();
        for (host, (load, fault)) in self.hosts.iter().zip(samples) {
            if let Some(error) = fault {
                faults.push((host.identity().to_string(), error));
                continue;
            }
            if !host.is_reachable() {
                continue;
            }
            let slots = load
                .one_min()
                .and_then(|load| available_slots(host.processor_count(), load));
            if let Some(slots) = slots {
                capacity.push(CapacityEntry::new(host.identity(), slots));
            }
        }
        for (identity, error) in faults {
            self.record_fault(&identity, &error);
        }
        capacity
    }

    fn record_fault(&mut self, identity: &str, error: &MarionetteError) {
        if !self.faulty.insert(identity.to_string()) {
            tracing::debug!(host = %identity, %error, "host still fails its integrity check");
            return;
        }
        tracing::warn!(host = %identity, %error, "host failed its integrity check");
        self.faults.push(error.to_string());
    }

    /// Refreshes until some host has capacity, sleeping `poll_interval`
    /// between attempts.
    ///
    /// With `timeout` set, gives up with [`MarionetteError::CapacityTimeout`]
    /// once that much time passed; without it, waits forever.
    pub async fn wait_for_capacity(
        &mut self,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<Vec<CapacityEntry>> {
        let started = Instant::now();
        loop {
            let capacity = self.refresh_capacity().await;
            if !capacity.is_empty() {
                return Ok(capacity);
            }
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    return Err(MarionetteError::CapacityTimeout(timeout));
                }
            }
            tracing::debug!(?poll_interval, "all hosts busy");
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Looks a host up among the fleet.
    pub fn resolve(&self, host: &HostRef) -> Result<&HostDescriptor> {
        self.hosts
            .iter()
            .find(|h| h.identity() == host.identity())
            .ok_or_else(|| MarionetteError::UnknownHost(host.identity().to_string()))
    }

    /// Runs a command on a host of the fleet in the foreground.
    pub async fn run_on(&self, host: &HostRef, command: &str) -> Result<RemoteOutput> {
        let host = self.resolve(host)?;
        self.probe.transport().run(host.identity(), command).await
    }

    /// Starts a command on a host of the fleet without waiting for it.
    pub async fn spawn_on(&self, host: &HostRef, command: &str) -> Result<Box<dyn ProcessHandle>> {
        let host = self.resolve(host)?;
        self.probe.transport().spawn(host.identity(), command).await
    }

    /// Runs a command on a host of the fleet, killing it after `limit`.
    pub async fn launch_wait_on(
        &self,
        host: &HostRef,
        command: &str,
        limit: Duration,
        poll_interval: Duration,
    ) -> Result<(Option<ExitStatus>, CapturedOutput)> {
        let host = self.resolve(host)?;
        transport::launch_wait(
            self.probe.transport().as_ref(),
            host.identity(),
            command,
            limit,
            poll_interval,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_available_slots_rounds_to_nearest() {
        assert_eq!(available_slots(4, 1.0), Some(3));
        assert_eq!(available_slots(4, 0.4), Some(4));
        assert_eq!(available_slots(2, 0.1), Some(2));
        assert_eq!(available_slots(1, 0.0), Some(1));
    }

    #[test]
    fn test_available_slots_excludes_busy_hosts() {
        assert_eq!(available_slots(4, 3.6), None);
        assert_eq!(available_slots(4, 3.5), None);
        assert_eq!(available_slots(4, 8.0), None);
        assert_eq!(available_slots(0, 0.0), None);
        assert_eq!(available_slots(4, f64::NAN), None);
    }

    #[test]
    fn test_read_host_file_skips_blank_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "node1\n\n  node2  \n# node3\n").unwrap();
        let hosts = read_host_file(file.path()).unwrap();
        assert_eq!(hosts, vec![HostRef::from("node1"), HostRef::from("node2")]);
    }

    #[test]
    fn test_read_host_file_rejects_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let error = read_host_file(file.path()).unwrap_err();
        assert!(matches!(error, MarionetteError::Config(msg) if msg.contains("empty")));
    }

    #[test]
    fn test_read_host_file_rejects_missing_file() {
        let error = read_host_file(Path::new("/nonexistent/hosts.txt")).unwrap_err();
        assert!(matches!(error, MarionetteError::Config(msg) if msg.contains("not found")));
    }
}
