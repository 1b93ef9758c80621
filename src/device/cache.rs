// src/device/cache.rs
//! Persistent per-device detection statistics

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GpsError, Result};

/// Everything worth remembering about one device between runs. Reliability
/// and average connect time are derived from these counters, so a device
/// that worked before gets probed first on the next start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub baud_rate: Option<u32>,
    pub successful_detection_count: u32,
    pub failed_detection_count: u32,
    pub total_connection_time_ms: u64,
    pub date_detected: Option<DateTime<Utc>>,
    pub date_connected: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    devices: HashMap<String, CacheEntry>,
}

/// Statistics store keyed by stable device identity (`serial:/dev/ttyUSB0`
/// and friends). Backed by a JSON file, or purely in-memory for tests.
#[derive(Debug)]
pub struct DeviceCache {
    path: Option<PathBuf>,
    entries: HashMap<String, CacheEntry>,
}

impl DeviceCache {
    /// A cache that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: HashMap::new(),
        }
    }

    /// Load the per-user cache, starting empty if it is missing or broken.
    pub fn load_default() -> Self {
        match Self::default_path() {
            Ok(path) => Self::load_from(path).unwrap_or_else(|e| {
                warn!("Could not load device cache: {}", e);
                Self {
                    path: Self::default_path().ok(),
                    entries: HashMap::new(),
                }
            }),
            Err(e) => {
                warn!("No usable cache location: {}", e);
                Self::in_memory()
            }
        }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path: Some(path),
                entries: HashMap::new(),
            });
        }

        let contents = std::fs::read_to_string(&path)?;
        let file: CacheFile = serde_json::from_str(&contents)?;
        Ok(Self {
            path: Some(path),
            entries: file.devices,
        })
    }

    pub fn entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the cache out. In-memory caches save trivially.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = CacheFile {
            devices: self.entries.clone(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn default_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").map_err(|_| {
            GpsError::invalid_config("cache_path", "HOME environment variable not set")
        })?;

        Ok(PathBuf::from(home)
            .join(".config")
            .join("gps-engine")
            .join("devices.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> CacheEntry {
        CacheEntry {
            name: "/dev/ttyUSB0 @ 4800 baud".into(),
            baud_rate: Some(4800),
            successful_detection_count: 3,
            failed_detection_count: 1,
            total_connection_time_ms: 2450,
            date_detected: Some(Utc::now()),
            date_connected: Some(Utc::now()),
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DeviceCache::load_from(dir.path().join("devices.json")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("devices.json");

        let mut cache = DeviceCache::load_from(&path).unwrap();
        cache.insert("serial:/dev/ttyUSB0", sample_entry());
        cache.save().unwrap();

        let reloaded = DeviceCache::load_from(&path).unwrap();
        let entry = reloaded.entry("serial:/dev/ttyUSB0").unwrap();
        assert_eq!(entry.successful_detection_count, 3);
        assert_eq!(entry.failed_detection_count, 1);
        assert_eq!(entry.baud_rate, Some(4800));
    }

    #[test]
    fn test_remove_erases_entry() {
        let mut cache = DeviceCache::in_memory();
        cache.insert("serial:/dev/ttyS1", sample_entry());

        assert!(cache.remove("serial:/dev/ttyS1"));
        assert!(!cache.remove("serial:/dev/ttyS1"));
        assert!(cache.entry("serial:/dev/ttyS1").is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "not json at all {").unwrap();

        assert!(DeviceCache::load_from(&path).is_err());
    }

    #[test]
    fn test_in_memory_save_is_a_no_op() {
        let mut cache = DeviceCache::in_memory();
        cache.insert("virtual:test", sample_entry());
        cache.save().unwrap();
    }
}
