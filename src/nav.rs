// src/nav.rs
//! Navigation data structures and utilities

use chrono::{DateTime, Local, Utc};

/// A validated geographic coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    latitude: f64,
    longitude: f64,
}

impl Position {
    /// Build a position, rejecting non-finite or out-of-range coordinates.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }
        Some(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}°, {:.6}°", self.latitude, self.longitude)
    }
}

/// Whether the device currently reports a positional fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixStatus {
    #[default]
    Unknown,
    NoFix,
    Fix,
}

/// How the device decides between 2D and 3D operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixMode {
    #[default]
    Unknown,
    Manual,
    Automatic,
}

/// Dimensionality of the current fix, from GSA field 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixMethod {
    #[default]
    Unknown,
    NoFix,
    Fix2D,
    Fix3D,
}

impl From<u8> for FixMethod {
    fn from(value: u8) -> Self {
        match value {
            1 => FixMethod::NoFix,
            2 => FixMethod::Fix2D,
            3 => FixMethod::Fix3D,
            _ => FixMethod::Unknown,
        }
    }
}

impl FixMethod {
    pub fn description(&self) -> &'static str {
        match self {
            FixMethod::Unknown => "Unknown",
            FixMethod::NoFix => "No fix",
            FixMethod::Fix2D => "2D fix",
            FixMethod::Fix3D => "3D fix",
        }
    }
}

/// Correction level of the current fix, from GGA field 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixQuality {
    #[default]
    Unknown,
    NoFix,
    GpsFix,
    DifferentialGpsFix,
    PulsePerSecond,
    FixedRealTimeKinematic,
    FloatRealTimeKinematic,
    Estimated,
    Manual,
    Simulated,
}

impl From<u8> for FixQuality {
    fn from(value: u8) -> Self {
        match value {
            0 => FixQuality::NoFix,
            1 => FixQuality::GpsFix,
            2 => FixQuality::DifferentialGpsFix,
            3 => FixQuality::PulsePerSecond,
            4 => FixQuality::FixedRealTimeKinematic,
            5 => FixQuality::FloatRealTimeKinematic,
            6 => FixQuality::Estimated,
            7 => FixQuality::Manual,
            8 => FixQuality::Simulated,
            _ => FixQuality::Unknown,
        }
    }
}

impl FixQuality {
    pub fn description(&self) -> &'static str {
        match self {
            FixQuality::Unknown => "Unknown",
            FixQuality::NoFix => "No fix",
            FixQuality::GpsFix => "GPS",
            FixQuality::DifferentialGpsFix => "DGPS",
            FixQuality::PulsePerSecond => "PPS",
            FixQuality::FixedRealTimeKinematic => "RTK",
            FixQuality::FloatRealTimeKinematic => "Float RTK",
            FixQuality::Estimated => "Estimated",
            FixQuality::Manual => "Manual",
            FixQuality::Simulated => "Simulation",
        }
    }

    /// Any quality above `NoFix` counts as a usable fix.
    pub fn is_fix(&self) -> bool {
        !matches!(self, FixQuality::Unknown | FixQuality::NoFix)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Satellite {
    pub prn: u8,                 // Satellite PRN/ID number
    pub elevation: Option<f32>,  // Elevation angle in degrees
    pub azimuth: Option<f32>,    // Azimuth angle in degrees
    pub snr: Option<f32>,        // Signal-to-noise ratio in dB
    pub is_fixed: bool,          // Whether satellite participates in the fix
}

impl Satellite {
    pub fn new(prn: u8) -> Self {
        Self {
            prn,
            elevation: None,
            azimuth: None,
            snr: None,
            is_fixed: false,
        }
    }

    pub fn constellation(&self) -> &'static str {
        match self.prn {
            1..=32 => "GPS",
            33..=64 => "SBAS",
            65..=96 => "GLONASS",
            120..=163 => "BEIDOU",
            193..=197 => "QZSS",
            211..=246 => "GALILEO",
            _ => "UNKNOWN",
        }
    }

    pub fn signal_strength_description(&self) -> &'static str {
        match self.snr {
            Some(snr) if snr >= 40.0 => "Excellent",
            Some(snr) if snr >= 35.0 => "Good",
            Some(snr) if snr >= 25.0 => "Fair",
            Some(snr) if snr >= 15.0 => "Poor",
            Some(_) => "Very Poor",
            None => "Unknown",
        }
    }
}

/// Snapshot of everything the engine currently knows about the vehicle.
///
/// Every field starts out invalid (`None` or `Unknown`) and only becomes
/// valid once a sentence carrying it has been accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigationState {
    pub utc_time: Option<DateTime<Utc>>,
    pub local_time: Option<DateTime<Local>>,
    pub position: Option<Position>,
    pub altitude: Option<f64>,                 // meters above mean sea level
    pub altitude_above_ellipsoid: Option<f64>, // meters above the WGS84 ellipsoid
    pub geoidal_separation: Option<f64>,       // meters, geoid minus ellipsoid
    pub speed: Option<f64>,                    // km/h over ground
    pub bearing: Option<f64>,                  // degrees, direction of travel
    pub heading: Option<f64>,                  // degrees, direction the vehicle faces
    pub magnetic_variation: Option<f64>,       // degrees, east negative
    pub fix_status: FixStatus,
    pub fix_mode: FixMode,
    pub fix_method: FixMethod,
    pub fix_quality: FixQuality,
    pub fixed_satellite_count: Option<u8>,
    pub horizontal_dop: Option<f32>,
    pub vertical_dop: Option<f32>,
    pub mean_dop: Option<f32>,
    pub satellites: Vec<Satellite>,
}

impl NavigationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything and return to the all-invalid state.
    pub fn initialize(&mut self) {
        *self = Self::default();
    }

    pub fn has_fix(&self) -> bool {
        self.fix_status == FixStatus::Fix
    }

    pub fn fixed_satellites(&self) -> impl Iterator<Item = &Satellite> {
        self.satellites.iter().filter(|sat| sat.is_fixed)
    }
}
