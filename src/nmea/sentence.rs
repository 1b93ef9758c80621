// src/nmea/sentence.rs
//! Typed NMEA sentence parsing

use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};

use crate::error::{GpsError, Result};
use crate::nav::{FixMethod, FixMode, FixQuality, Position, Satellite};

pub const KNOTS_TO_KMH: f64 = 1.852;

/// One parsed sentence. Fields a device left empty stay `None`; a type we
/// recognize but cannot use arrives as `Unsupported` so callers can count it.
#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    /// GGA - Global Positioning System Fix Data
    Gga {
        utc_time: Option<NaiveTime>,
        position: Option<Position>,
        fix_quality: FixQuality,
        satellites_in_use: Option<u8>,
        horizontal_dop: Option<f32>,
        altitude: Option<f64>,
        geoidal_separation: Option<f64>,
    },
    /// RMC - Recommended Minimum Navigation Information
    Rmc {
        utc_time: Option<NaiveTime>,
        utc_date: Option<NaiveDate>,
        is_valid: bool,
        position: Option<Position>,
        speed_kmh: Option<f64>,
        bearing: Option<f64>,
        magnetic_variation: Option<f64>,
    },
    /// GSA - Dilution of Precision and active satellites
    Gsa {
        fix_mode: FixMode,
        fix_method: FixMethod,
        fixed_prns: Vec<u8>,
        mean_dop: Option<f32>,
        horizontal_dop: Option<f32>,
        vertical_dop: Option<f32>,
    },
    /// GSV - Satellites in view (one message of a numbered cycle)
    Gsv {
        total_messages: u8,
        message_number: u8,
        satellites_in_view: Option<u8>,
        satellites: Vec<Satellite>,
    },
    /// GLL - Geographic position, latitude / longitude
    Gll {
        position: Option<Position>,
        utc_time: Option<NaiveTime>,
        is_valid: bool,
    },
    /// VTG - Track made good and ground speed
    Vtg {
        bearing_true: Option<f64>,
        bearing_magnetic: Option<f64>,
        speed_kmh: Option<f64>,
    },
    /// HDT - Heading, true
    Hdt { heading: Option<f64> },
    /// Structurally valid NMEA of a type the engine does not model
    Unsupported { sentence_type: String },
}

/// Parse a single framed sentence. The trailing `*hh` checksum, if present,
/// is stripped but not validated here; use [`verify_checksum`] first when
/// reading from an untrusted stream.
pub fn parse_sentence(line: &str) -> Result<Sentence> {
    if !line.is_ascii() {
        return Err(GpsError::Parse("sentence contains non-ASCII bytes".into()));
    }

    let body = line.split('*').next().unwrap_or(line);
    let parts: Vec<&str> = body.split(',').collect();
    let header = parts[0];
    if !header.starts_with('$') || header.len() < 6 {
        return Err(GpsError::Parse(format!(
            "malformed sentence header '{}'",
            header
        )));
    }

    // Skip the two-letter talker id so $GPGGA, $GNGGA and friends all land
    // in the same arm.
    match header.get(3..).unwrap_or_default() {
        "GGA" => Ok(parse_gga(&parts)),
        "RMC" => Ok(parse_rmc(&parts)),
        "GSA" => Ok(parse_gsa(&parts)),
        "GSV" => Ok(parse_gsv(&parts)),
        "GLL" => Ok(parse_gll(&parts)),
        "VTG" => Ok(parse_vtg(&parts)),
        "HDT" => Ok(parse_hdt(&parts)),
        _ => Ok(Sentence::Unsupported {
            sentence_type: header.trim_start_matches('$').to_string(),
        }),
    }
}

fn parse_gga(parts: &[&str]) -> Sentence {
    Sentence::Gga {
        utc_time: parts.get(1).and_then(|f| parse_utc_time(f)),
        position: parse_position(parts, 2),
        fix_quality: field::<u8>(parts, 6)
            .map(FixQuality::from)
            .unwrap_or_default(),
        satellites_in_use: field(parts, 7),
        horizontal_dop: field(parts, 8),
        altitude: field(parts, 9),
        geoidal_separation: field(parts, 11),
    }
}

fn parse_rmc(parts: &[&str]) -> Sentence {
    let magnetic_variation = field::<f64>(parts, 10).map(|variation| {
        // easterly variation is reported as a negative angle
        match parts.get(11).copied() {
            Some("E") => -variation,
            _ => variation,
        }
    });

    Sentence::Rmc {
        utc_time: parts.get(1).and_then(|f| parse_utc_time(f)),
        utc_date: parts.get(9).and_then(|f| parse_utc_date(f)),
        is_valid: parts.get(2).copied() == Some("A"),
        position: parse_position(parts, 3),
        speed_kmh: field::<f64>(parts, 7).map(|knots| knots * KNOTS_TO_KMH),
        bearing: field(parts, 8),
        magnetic_variation,
    }
}

fn parse_gsa(parts: &[&str]) -> Sentence {
    let fix_mode = match parts.get(1).copied() {
        Some("A") => FixMode::Automatic,
        Some("M") => FixMode::Manual,
        _ => FixMode::Unknown,
    };

    let mut fixed_prns = Vec::new();
    for index in 3..15 {
        if let Some(prn) = field::<u8>(parts, index) {
            fixed_prns.push(prn);
        }
    }

    Sentence::Gsa {
        fix_mode,
        fix_method: field::<u8>(parts, 2)
            .map(FixMethod::from)
            .unwrap_or_default(),
        fixed_prns,
        mean_dop: field(parts, 15),
        horizontal_dop: field(parts, 16),
        vertical_dop: field(parts, 17),
    }
}

fn parse_gsv(parts: &[&str]) -> Sentence {
    let mut satellites = Vec::new();

    // Four satellites per message, four fields per satellite
    let mut index = 4;
    while index + 3 < parts.len() {
        if let Some(prn) = field::<u8>(parts, index) {
            let mut satellite = Satellite::new(prn);
            satellite.elevation = field(parts, index + 1);
            satellite.azimuth = field(parts, index + 2);
            satellite.snr = field(parts, index + 3);
            satellites.push(satellite);
        }
        index += 4;
    }

    Sentence::Gsv {
        total_messages: field(parts, 1).unwrap_or(1),
        message_number: field(parts, 2).unwrap_or(1),
        satellites_in_view: field(parts, 3),
        satellites,
    }
}

fn parse_gll(parts: &[&str]) -> Sentence {
    Sentence::Gll {
        position: parse_position(parts, 1),
        utc_time: parts.get(5).and_then(|f| parse_utc_time(f)),
        is_valid: parts.get(6).copied() == Some("A"),
    }
}

fn parse_vtg(parts: &[&str]) -> Sentence {
    // Prefer the explicit km/h field; fall back to converting knots
    let speed_kmh = field::<f64>(parts, 7)
        .or_else(|| field::<f64>(parts, 5).map(|knots| knots * KNOTS_TO_KMH));

    Sentence::Vtg {
        bearing_true: field(parts, 1),
        bearing_magnetic: field(parts, 3),
        speed_kmh,
    }
}

fn parse_hdt(parts: &[&str]) -> Sentence {
    Sentence::Hdt {
        heading: field(parts, 1),
    }
}

/// Parse one optional field, treating empty and malformed values alike.
fn field<T: FromStr>(parts: &[&str], index: usize) -> Option<T> {
    parts
        .get(index)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse().ok())
}

/// Convert a ddmm.mmmm angle plus hemisphere letter to signed degrees.
fn parse_angular(value: &str, hemisphere: &str) -> Option<f64> {
    let raw: f64 = value.parse().ok()?;
    let degrees = (raw / 100.0) as i32;
    let minutes = raw % 100.0;
    let mut angle = degrees as f64 + minutes / 60.0;
    if hemisphere == "S" || hemisphere == "W" {
        angle = -angle;
    }
    Some(angle)
}

/// Read latitude/hemisphere/longitude/hemisphere starting at `lat_index`.
fn parse_position(parts: &[&str], lat_index: usize) -> Option<Position> {
    let latitude = parse_angular(parts.get(lat_index)?, parts.get(lat_index + 1)?)?;
    let longitude = parse_angular(parts.get(lat_index + 2)?, parts.get(lat_index + 3)?)?;
    Position::new(latitude, longitude)
}

/// Parse hhmmss or hhmmss.sss UTC time-of-day.
fn parse_utc_time(value: &str) -> Option<NaiveTime> {
    if value.len() < 6 {
        return None;
    }
    let hours: u32 = value.get(0..2)?.parse().ok()?;
    let minutes: u32 = value.get(2..4)?.parse().ok()?;
    let seconds: f64 = value.get(4..)?.parse().ok()?;
    if !(0.0..60.0).contains(&seconds) {
        return None;
    }
    let whole = seconds as u32;
    let millis = ((seconds - whole as f64) * 1000.0).round() as u32;
    NaiveTime::from_hms_milli_opt(hours, minutes, whole, millis.min(999))
}

/// Parse a ddmmyy UTC date. Two-digit years below 80 are mapped to 20xx.
fn parse_utc_date(value: &str) -> Option<NaiveDate> {
    if value.len() != 6 {
        return None;
    }
    let day: u32 = value.get(0..2)?.parse().ok()?;
    let month: u32 = value.get(2..4)?.parse().ok()?;
    let year: i32 = value.get(4..6)?.parse().ok()?;
    let year = if year < 80 { 2000 + year } else { 1900 + year };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// XOR of all bytes between `$` and `*`, the NMEA checksum.
pub fn sentence_checksum(line: &str) -> u8 {
    let bytes = line.as_bytes();
    let start = if bytes.first() == Some(&b'$') { 1 } else { 0 };
    let end = bytes
        .iter()
        .position(|&b| b == b'*')
        .unwrap_or(bytes.len());

    let mut checksum: u8 = 0;
    for &b in &bytes[start..end] {
        checksum ^= b;
    }
    checksum
}

/// Validate the trailing `*hh` checksum. Sentences without one pass; a
/// present but malformed or mismatched checksum fails.
pub fn verify_checksum(line: &str) -> bool {
    let bytes = line.as_bytes();
    if bytes.first() != Some(&b'$') {
        return false;
    }

    let Some(asterisk) = bytes.iter().position(|&b| b == b'*') else {
        return true;
    };
    if bytes.len() < asterisk + 3 {
        return false;
    }

    let expected = match (
        (bytes[asterisk + 1] as char).to_digit(16),
        (bytes[asterisk + 2] as char).to_digit(16),
    ) {
        (Some(high), Some(low)) => (high * 16 + low) as u8,
        _ => return false,
    };

    expected == sentence_checksum(line)
}
