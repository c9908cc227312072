//! Programs to dispatch.
//!
//! A program is a ready-to-run shell command and the group it belongs to.
//! Groups run one after the other; programs of one group run concurrently.

use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use void::Void;

use crate::error::{MarionetteError, Result};
use crate::serde::string_or_mapping;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    /// Shell command, already fully substituted.
    pub command: String,
    /// Group index. Lower groups finish before higher groups start.
    #[serde(default)]
    pub group: u32,
}

impl Program {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            group: 0,
        }
    }

    pub fn with_group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    /// The executable, i.e. the first word of the command.
    pub fn program_name(&self) -> Option<&str> {
        self.command.split_whitespace().next()
    }

    pub fn basename(&self) -> &str {
        self.program_name()
            .and_then(|name| name.rsplit('/').next())
            .unwrap_or_default()
    }

    /// Finds the executable the command starts with on this machine.
    ///
    /// A name containing `/` must be an existing file; a bare name must be
    /// found in one of the `PATH` directories.
    pub fn locate_executable(&self) -> std::result::Result<PathBuf, String> {
        let name = self
            .program_name()
            .ok_or_else(|| "the command is empty".to_string())?;
        if name.contains('/') {
            let path = Path::new(name);
            return if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(format!("'{}' is not a file", name))
            };
        }
        env::var_os("PATH")
            .iter()
            .flat_map(env::split_paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| format!("'{}' was not found in PATH", name))
    }
}

impl FromStr for Program {
    type Err = Void;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for Program {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

impl From<String> for Program {
    fn from(command: String) -> Self {
        Self::new(command)
    }
}

#[derive(Debug, Deserialize)]
struct ProgramSpec(#[serde(deserialize_with = "string_or_mapping")] Program);

/// Parses a YAML list of programs.
///
/// Each entry is either a bare command (group 0) or a mapping with a
/// `command` and an optional `group`.
pub fn parse_programs(yaml: &str) -> Result<Vec<Program>> {
    let specs: Vec<ProgramSpec> = serde_yaml::from_str(yaml)?;
    validate(specs)
}

/// Reads a YAML list of programs from `path`.
pub fn load_programs(path: &Path) -> Result<Vec<Program>> {
    let file = File::open(path).map_err(|e| {
        MarionetteError::Config(format!("Failed to open '{}': {}", path.display(), e))
    })?;
    let specs: Vec<ProgramSpec> = serde_yaml::from_reader(file)?;
    validate(specs)
}

fn validate(specs: Vec<ProgramSpec>) -> Result<Vec<Program>> {
    let programs: Vec<Program> = specs.into_iter().map(|spec| spec.0).collect();
    if let Some(index) = programs.iter().position(|p| p.command.trim().is_empty()) {
        return Err(MarionetteError::Config(format!(
            "Program {} has an empty command.",
            index
        )));
    }
    Ok(programs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_and_mapped_programs() {
        let programs = parse_programs(
            r#"
- echo first
- command: ./simulate config.cfg
  group: 2
- command: echo grouped
"#,
        )
        .unwrap();
        assert_eq!(
            programs,
            vec![
                Program::new("echo first"),
                Program::new("./simulate config.cfg").with_group(2),
                Program::new("echo grouped"),
            ]
        );
    }

    #[test]
    fn test_parse_rejects_missing_command() {
        assert!(parse_programs("- group: 1").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_command() {
        let error = parse_programs("- '  '").unwrap_err();
        assert!(matches!(error, MarionetteError::Config(_)));
    }

    #[test]
    fn test_names() {
        let program = Program::new("/usr/bin/nice -n 10 ./run");
        assert_eq!(program.program_name(), Some("/usr/bin/nice"));
        assert_eq!(program.basename(), "nice");
        assert_eq!(Program::new("").basename(), "");
    }

    #[test]
    fn test_locate_executable() {
        assert!(Program::new("sh -c true").locate_executable().is_ok());
        assert!(Program::new("/bin/sh -c true").locate_executable().is_ok());
        assert!(Program::new("./definitely-not-here").locate_executable().is_err());
        assert!(Program::new("no-such-program-xyz").locate_executable().is_err());
        assert!(Program::new("   ").locate_executable().is_err());
    }
}
