//! Namespaced key-value settings persisted as a JSON document.
//!
//! Mirrors the NVS layout used by the device: every value lives under a
//! `namespace/key` pair (`audio/output_volume`, `alarm_clock/alarm_0`, ...).
//! Writes are flushed to disk immediately when a backing file is set.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type Namespaces = BTreeMap<String, Map<String, Value>>;

struct Store {
    path: Option<PathBuf>,
    data: Namespaces,
}

/// Cheaply cloneable handle to the shared settings store.
#[derive(Clone)]
pub struct Settings {
    store: Arc<Mutex<Store>>,
}

impl Settings {
    /// Open (or create) the settings file at `path`.
    ///
    /// A missing file starts empty. A corrupt file is logged and replaced on
    /// the next write rather than failing startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings file {}", path.display()))?;
            match serde_json::from_str::<Namespaces>(&text) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("Settings file {} is corrupt ({}), starting empty", path.display(), e);
                    Namespaces::new()
                }
            }
        } else {
            Namespaces::new()
        };

        Ok(Self {
            store: Arc::new(Mutex::new(Store { path: Some(path), data })),
        })
    }

    /// Volatile store, nothing is written to disk.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store {
                path: None,
                data: Namespaces::new(),
            })),
        }
    }

    pub fn get_int(&self, namespace: &str, key: &str, default: i64) -> i64 {
        self.get(namespace, key)
            .and_then(|v| v.as_i64())
            .unwrap_or(default)
    }

    pub fn get_string(&self, namespace: &str, key: &str, default: &str) -> String {
        self.get(namespace, key)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool(&self, namespace: &str, key: &str, default: bool) -> bool {
        self.get(namespace, key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    pub fn set_int(&self, namespace: &str, key: &str, value: i64) -> Result<()> {
        self.set(namespace, key, Value::from(value))
    }

    pub fn set_string(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.set(namespace, key, Value::from(value))
    }

    pub fn set_bool(&self, namespace: &str, key: &str, value: bool) -> Result<()> {
        self.set(namespace, key, Value::from(value))
    }

    #[cfg(test)]
    pub fn erase_key(&self, namespace: &str, key: &str) -> Result<()> {
        let mut store = self.store.lock();
        let removed = store
            .data
            .get_mut(namespace)
            .and_then(|ns| ns.remove(key))
            .is_some();
        if removed {
            store.flush()?;
        }
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        let store = self.store.lock();
        store.data.get(namespace).and_then(|ns| ns.get(key)).cloned()
    }

    fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let mut store = self.store.lock();
        store
            .data
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        store.flush()
    }
}

impl Store {
    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(&self.data)?;
        // 先写临时文件再重命名，避免断电时留下半截文件
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, text)
            .with_context(|| format!("Failed to write settings file {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace settings file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_absent() {
        let settings = Settings::in_memory();
        assert_eq!(settings.get_int("audio", "output_volume", 70), 70);
        assert_eq!(settings.get_string("alarm_clock", "alarm_0", ""), "");
        assert!(settings.get_bool("wifi", "sleep_mode", true));
    }

    #[test]
    fn namespaces_are_isolated() {
        let settings = Settings::in_memory();
        settings.set_int("audio", "output_volume", 42).unwrap();
        assert_eq!(settings.get_int("display", "output_volume", -1), -1);
        assert_eq!(settings.get_int("audio", "output_volume", -1), 42);
    }

    #[test]
    fn type_mismatch_falls_back_to_default() {
        let settings = Settings::in_memory();
        settings.set_string("wifi", "sleep_mode", "yes").unwrap();
        assert!(!settings.get_bool("wifi", "sleep_mode", false));
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings = Settings::open(&path).unwrap();
        settings.set_string("alarm_clock", "alarm_3", "wake").unwrap();
        settings.set_int("alarm_clock", "alarm_time_3", 1_700_000_000).unwrap();
        settings.set_bool("wifi", "sleep_mode", false).unwrap();
        drop(settings);

        let reopened = Settings::open(&path).unwrap();
        assert_eq!(reopened.get_string("alarm_clock", "alarm_3", ""), "wake");
        assert_eq!(reopened.get_int("alarm_clock", "alarm_time_3", 0), 1_700_000_000);
        assert!(!reopened.get_bool("wifi", "sleep_mode", true));
    }

    #[test]
    fn erase_removes_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings::open(&path).unwrap();
        settings.set_int("audio", "output_volume", 30).unwrap();
        settings.erase_key("audio", "output_volume").unwrap();

        let reopened = Settings::open(&path).unwrap();
        assert_eq!(reopened.get_int("audio", "output_volume", 7), 7);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let settings = Settings::open(&path).unwrap();
        assert_eq!(settings.get_int("audio", "output_volume", 5), 5);
    }
}
