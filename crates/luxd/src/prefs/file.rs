// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! File-backed preferences.
//!
//! The on-disk format is one `key = value` pair per line. Keys repeat for
//! multi-valued entries. Lines that don't parse are skipped with a warning;
//! a missing file on load is treated as an empty store so first runs work.

use super::{MemoryPreferences, Preferences};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Preferences persisted to a `<name>.conf` file in a settings directory.
pub struct FilePreferences {
    store: MemoryPreferences,
    path: PathBuf,
}

impl FilePreferences {
    /// `directory/<name>.conf` backs the store. The directory must exist by
    /// the time [`Preferences::save`] runs.
    pub fn new(directory: &std::path::Path, name: &str) -> Self {
        FilePreferences {
            store: MemoryPreferences::new(name),
            path: directory.join(format!("{}.conf", name)),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Preferences for FilePreferences {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn set_value(&mut self, key: &str, value: &str) {
        self.store.set_value(key, value);
    }

    fn set_multiple_value(&mut self, key: &str, value: &str) {
        self.store.set_multiple_value(key, value);
    }

    fn get_value(&self, key: &str) -> Option<String> {
        self.store.get_value(key)
    }

    fn get_multiple_value(&self, key: &str) -> Vec<String> {
        self.store.get_multiple_value(key)
    }

    fn remove_value(&mut self, key: &str) -> bool {
        self.store.remove_value(key)
    }

    fn load(&mut self) -> crate::Result<()> {
        self.store.clear();
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("[PREFS] no file at {}, starting empty", self.path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    self.store
                        .set_multiple_value(key.trim(), value.trim());
                }
                None => {
                    log::warn!(
                        "[PREFS] skipping malformed line in {}: {:?}",
                        self.path.display(),
                        line
                    );
                }
            }
        }
        Ok(())
    }

    fn save(&self) -> crate::Result<()> {
        let mut out = Vec::new();
        for (key, values) in self.store.entries() {
            for value in values {
                let _ = writeln!(out, "{} = {}", key, value);
            }
        }
        fs::write(&self.path, out)?;
        log::debug!("[PREFS] saved {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = FilePreferences::new(dir.path(), "port");
        prefs.set_value("1-2-I-0", "5");
        prefs.set_value("1-2-I-0_priority_value", "120");
        prefs.save().unwrap();

        let mut restored = FilePreferences::new(dir.path(), "port");
        restored.load().unwrap();
        assert_eq!(restored.get_value("1-2-I-0"), Some("5".to_string()));
        assert_eq!(
            restored.get_value("1-2-I-0_priority_value"),
            Some("120".to_string())
        );
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = FilePreferences::new(dir.path(), "nothing");
        prefs.load().unwrap();
        assert_eq!(prefs.get_value("any"), None);
    }

    #[test]
    fn test_load_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.conf");
        std::fs::write(&path, "# comment\nok = 1\nnot a pair\n").unwrap();
        let mut prefs = FilePreferences::new(dir.path(), "server");
        prefs.load().unwrap();
        assert_eq!(prefs.get_value("ok"), Some("1".to_string()));
        assert_eq!(prefs.get_value("not a pair"), None);
    }

    #[test]
    fn test_multi_value_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = FilePreferences::new(dir.path(), "multi");
        prefs.set_multiple_value("devices", "/dev/ttyUSB0");
        prefs.set_multiple_value("devices", "/dev/ttyUSB1");
        prefs.save().unwrap();

        let mut restored = FilePreferences::new(dir.path(), "multi");
        restored.load().unwrap();
        assert_eq!(
            restored.get_multiple_value("devices"),
            vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]
        );
    }
}
