use std::path::PathBuf;

use crate::child::ChildCommand;
use crate::pty::WindowSize;

/// Startup parameters for one bridge session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Program followed by its arguments. Must not be empty.
    pub command: Vec<String>,
    /// Working directory for the child; inherited when `None`.
    pub cwd: Option<PathBuf>,
    /// Initial terminal geometry.
    pub size: WindowSize,
}

impl BridgeConfig {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            cwd: None,
            size: WindowSize::default(),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.size = WindowSize::new(rows, cols);
        self
    }

    /// Check the configuration before any terminal or process work happens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ChildCommand::new(&self.command, self.cwd.as_deref()).map(|_| ())
    }
}

/// Invalid startup configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    EmptyCommand,
    InvalidArgument(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EmptyCommand => {
                write!(f, "no command provided; specify it after --, e.g. pty-bridge -- bash")
            }
            ConfigError::InvalidArgument(arg) => {
                write!(f, "argument contains a NUL byte: {arg:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::new(vec!["bash".into()]);
        assert_eq!(config.size, WindowSize::new(30, 120));
        assert_eq!(config.cwd, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = BridgeConfig::new(Vec::new());
        assert_eq!(config.validate(), Err(ConfigError::EmptyCommand));

        let config = BridgeConfig::new(vec![String::new(), "arg".into()]);
        assert_eq!(config.validate(), Err(ConfigError::EmptyCommand));
    }

    #[test]
    fn test_nul_bytes_rejected() {
        let config = BridgeConfig::new(vec!["echo".into(), "a\0b".into()]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidArgument(_))));

        let config = BridgeConfig::new(vec!["echo".into()]).with_cwd("/tmp/\0");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidArgument(_))));
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::new(vec!["top".into()])
            .with_cwd("/tmp")
            .with_size(40, 100);
        assert_eq!(config.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(config.size, WindowSize::new(40, 100));
    }
}
