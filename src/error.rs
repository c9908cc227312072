use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarionetteError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Host '{host}' returned malformed output for '{command}': {output:?}")]
    HostIntegrity {
        host: String,
        command: String,
        output: String,
    },
    #[error("The host '{0}' is not part of the fleet.")]
    UnknownHost(String),
    #[error("The host '{0}' appears more than once in the fleet.")]
    DuplicateHost(String),
    #[error("The list of connected hosts is empty ({} probe faults).", .faults.len())]
    NoReachableHost { faults: Vec<String> },
    #[error("No host freed up any capacity within {0:?}.")]
    CapacityTimeout(Duration),
    #[error("Program \"{program}\" failed the dry run: {reason}")]
    DryRun { program: String, reason: String },
    #[error("Program \"{program}\" failed ({status}).")]
    LocalRun { program: String, status: String },
    #[error("Lost track of a spawned process: {0}")]
    ProcessLost(String),
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    Ssh(#[from] openssh::Error),
    #[error("Failed to execute local command: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, MarionetteError>;
