// src/error.rs
//! Error types for the GPS engine

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GpsError>;

#[derive(Error, Debug)]
pub enum GpsError {
    /// Protocol detection gave up on a candidate device
    #[error("detection failed on '{device}': {reason}")]
    Detection {
        device: String,
        reason: String,
        #[source]
        source: Option<Box<GpsError>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out after {after:?} while {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Another lifecycle command held the command lock past the deadline
    #[error("engine is busy: could not run '{command}' while another command is in progress")]
    Busy { command: &'static str },

    /// A lifecycle command acquired the lock but failed while executing
    #[error("command '{command}' failed")]
    Command {
        command: &'static str,
        #[source]
        source: Box<GpsError>,
    },

    #[error("invalid value for {name}: {reason}")]
    InvalidConfig { name: &'static str, reason: String },

    #[error("no GPS device could be found")]
    NoDevice,

    #[error("the interpreter is not running")]
    NotRunning,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("operation was cancelled")]
    Cancelled,

    /// The device has no live stream to hand out
    #[error("device '{device}' is not open")]
    NotOpen { device: String },
}

impl GpsError {
    pub fn detection(device: impl Into<String>, reason: impl Into<String>) -> Self {
        GpsError::Detection {
            device: device.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub fn detection_with_source(
        device: impl Into<String>,
        reason: impl Into<String>,
        source: GpsError,
    ) -> Self {
        GpsError::Detection {
            device: device.into(),
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        GpsError::Timeout { operation, after }
    }

    pub fn command(command: &'static str, source: GpsError) -> Self {
        GpsError::Command {
            command,
            source: Box::new(source),
        }
    }

    pub fn invalid_config(name: &'static str, reason: impl Into<String>) -> Self {
        GpsError::InvalidConfig {
            name,
            reason: reason.into(),
        }
    }

    /// True when the underlying transport is gone and a reconnect is the
    /// right response, as opposed to a recoverable per-packet problem.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            GpsError::Io(_)
            | GpsError::Serial(_)
            | GpsError::Timeout { .. }
            | GpsError::NotOpen { .. } => true,
            GpsError::Command { source, .. } => source.is_connection_loss(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GpsError::Cancelled)
    }
}
