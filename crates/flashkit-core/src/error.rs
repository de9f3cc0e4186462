//! Error taxonomy shared by every component.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// One failed mirror during a download attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorFailure {
    pub url: String,
    pub message: String,
}

impl fmt::Display for MirrorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.message)
    }
}

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Tool not found: {tool} (tried {} candidates)", .tried.len())]
    ToolNotFound { tool: String, tried: Vec<PathBuf> },

    #[error("Download of {tool} failed on every mirror: {}", join_failures(.attempts))]
    DownloadFailed {
        tool: String,
        attempts: Vec<MirrorFailure>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Device {id} is unauthorized, confirm the prompt on the device")]
    DeviceUnauthorized { id: String },

    #[error("No device attached in {mode} mode")]
    DeviceAbsent { mode: String },

    #[error("Partition not found in firmware: {partition}")]
    PartitionNotFound { partition: String },

    #[error("Size mismatch for {partition}: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch {
        partition: String,
        expected: u64,
        actual: u64,
    },

    #[error("{command} exited with {}: {output}", .code.map_or("signal".to_string(), |c| c.to_string()))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Invalid size value: {0:?}")]
    InvalidSize(String),

    #[error("Another flash or backup operation is already running")]
    OperationInProgress,

    #[error("Operation declined by user")]
    Declined,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlashError {
    /// Whether a flash attempt hitting this error may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FlashError::PartitionNotFound { .. }
                | FlashError::Declined
                | FlashError::Cancelled
                | FlashError::ToolNotFound { .. }
        )
    }
}

impl From<toml::de::Error> for FlashError {
    fn from(e: toml::de::Error) -> Self {
        FlashError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for FlashError {
    fn from(e: toml::ser::Error) -> Self {
        FlashError::Config(e.to_string())
    }
}

fn join_failures(attempts: &[MirrorFailure]) -> String {
    if attempts.is_empty() {
        return "no mirrors configured".to_string();
    }
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = FlashError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_failed_names_every_mirror() {
        let err = FlashError::DownloadFailed {
            tool: "adb".into(),
            attempts: vec![
                MirrorFailure {
                    url: "https://a/x.zip".into(),
                    message: "timeout".into(),
                },
                MirrorFailure {
                    url: "https://b/x.zip".into(),
                    message: "404".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("https://a/x.zip (timeout)"));
        assert!(msg.contains("https://b/x.zip (404)"));
    }

    #[test]
    fn test_size_mismatch_carries_sizes() {
        let err = FlashError::SizeMismatch {
            partition: "boot".into(),
            expected: 10,
            actual: 9,
        };
        assert_eq!(
            err.to_string(),
            "Size mismatch for boot: expected 10 bytes, got 9 bytes"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(FlashError::DeviceAbsent { mode: "bootloader".into() }.is_retryable());
        assert!(FlashError::DeviceUnauthorized { id: "x".into() }.is_retryable());
        assert!(!FlashError::Declined.is_retryable());
    }
}
