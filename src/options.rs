// src/options.rs
//! Interpreter tuning knobs with validating setters

use std::time::Duration;

use crate::error::{GpsError, Result};

/// DOP values above this are meaningless; the ceiling setters stay inside it.
pub const MAXIMUM_ALLOWED_DOP: f32 = 50.0;

/// Configuration for the interpreter's worker and precision handling.
///
/// Invalid values are rejected at the setter, so a constructed options value
/// is always internally consistent.
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    allow_automatic_reconnection: bool,
    maximum_reconnection_attempts: i32,
    is_fix_required: bool,
    maximum_horizontal_dop: f32,
    maximum_vertical_dop: f32,
    is_filter_enabled: bool,
    typical_position_error: f64,
    command_timeout: Duration,
    reconnection_delay: Duration,
    discovery_timeout: Duration,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            allow_automatic_reconnection: true,
            maximum_reconnection_attempts: -1,
            is_fix_required: false,
            maximum_horizontal_dop: MAXIMUM_ALLOWED_DOP,
            maximum_vertical_dop: MAXIMUM_ALLOWED_DOP,
            is_filter_enabled: true,
            typical_position_error: 6.0,
            command_timeout: Duration::from_secs(5),
            reconnection_delay: Duration::from_secs(1),
            discovery_timeout: Duration::from_secs(10),
        }
    }
}

impl InterpreterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_automatic_reconnection(&self) -> bool {
        self.allow_automatic_reconnection
    }

    pub fn set_allow_automatic_reconnection(&mut self, value: bool) {
        self.allow_automatic_reconnection = value;
    }

    /// `-1` means retry forever.
    pub fn maximum_reconnection_attempts(&self) -> i32 {
        self.maximum_reconnection_attempts
    }

    pub fn set_maximum_reconnection_attempts(&mut self, value: i32) -> Result<()> {
        if value < -1 {
            return Err(GpsError::invalid_config(
                "maximum_reconnection_attempts",
                "must be -1 (unlimited) or a non-negative count",
            ));
        }
        self.maximum_reconnection_attempts = value;
        Ok(())
    }

    /// When set, position, speed, bearing and altitude reports are dropped
    /// while the device has no fix.
    pub fn is_fix_required(&self) -> bool {
        self.is_fix_required
    }

    pub fn set_is_fix_required(&mut self, value: bool) {
        self.is_fix_required = value;
    }

    pub fn maximum_horizontal_dop(&self) -> f32 {
        self.maximum_horizontal_dop
    }

    pub fn set_maximum_horizontal_dop(&mut self, value: f32) -> Result<()> {
        validate_dop("maximum_horizontal_dop", value)?;
        self.maximum_horizontal_dop = value;
        Ok(())
    }

    pub fn maximum_vertical_dop(&self) -> f32 {
        self.maximum_vertical_dop
    }

    pub fn set_maximum_vertical_dop(&mut self, value: f32) -> Result<()> {
        validate_dop("maximum_vertical_dop", value)?;
        self.maximum_vertical_dop = value;
        Ok(())
    }

    pub fn is_filter_enabled(&self) -> bool {
        self.is_filter_enabled
    }

    pub fn set_is_filter_enabled(&mut self, value: bool) {
        self.is_filter_enabled = value;
    }

    /// Expected error of an ordinary autonomous fix, in meters. Used as the
    /// precision estimate when the fix quality gives nothing better.
    pub fn typical_position_error(&self) -> f64 {
        self.typical_position_error
    }

    pub fn set_typical_position_error(&mut self, value: f64) -> Result<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(GpsError::invalid_config(
                "typical_position_error",
                "must be a positive, finite number of meters",
            ));
        }
        self.typical_position_error = value;
        Ok(())
    }

    /// How long a lifecycle command waits for the command lock before
    /// giving up as busy.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn set_command_timeout(&mut self, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(GpsError::invalid_config(
                "command_timeout",
                "must be greater than zero",
            ));
        }
        self.command_timeout = value;
        Ok(())
    }

    pub fn reconnection_delay(&self) -> Duration {
        self.reconnection_delay
    }

    pub fn set_reconnection_delay(&mut self, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(GpsError::invalid_config(
                "reconnection_delay",
                "must be greater than zero",
            ));
        }
        self.reconnection_delay = value;
        Ok(())
    }

    /// How long `start` and the reconnect path wait for the registry to
    /// produce a confirmed device.
    pub fn discovery_timeout(&self) -> Duration {
        self.discovery_timeout
    }

    pub fn set_discovery_timeout(&mut self, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(GpsError::invalid_config(
                "discovery_timeout",
                "must be greater than zero",
            ));
        }
        self.discovery_timeout = value;
        Ok(())
    }
}

fn validate_dop(name: &'static str, value: f32) -> Result<()> {
    if !value.is_finite() || value <= 0.0 || value > MAXIMUM_ALLOWED_DOP {
        return Err(GpsError::invalid_config(
            name,
            format!("must be within (0, {}]", MAXIMUM_ALLOWED_DOP),
        ));
    }
    Ok(())
}
