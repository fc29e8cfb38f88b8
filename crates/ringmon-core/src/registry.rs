//! Name → series-log mapping, confined to the storage worker.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use tracing::{debug, error, warn};

use crate::codec::StoreType;
use crate::storage::SeriesLog;

/// All open series of one data directory. Series are created lazily: a
/// write creates the file with an explicit store type, a read only ever
/// opens what already exists.
pub struct Registry {
    datadir: PathBuf,
    series: HashMap<String, SeriesLog>,
}

impl Registry {
    pub fn new(datadir: impl Into<PathBuf>) -> Registry {
        let datadir = datadir.into();
        if let Err(e) = std::fs::create_dir_all(&datadir) {
            warn!(dir = %datadir.display(), error = %e, "creating data directory failed");
        }
        Registry { datadir, series: HashMap::new() }
    }

    pub fn datadir(&self) -> &PathBuf {
        &self.datadir
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Records one sample, creating the series with `stype` on first
    /// contact. A store-type mismatch rejects the write and leaves the
    /// series usable.
    pub fn addv(&mut self, name: &str, time: u32, value: f64, stype: StoreType) -> io::Result<()> {
        if !self.series.contains_key(name) {
            let log = SeriesLog::open(&self.datadir, name, Some(stype))?;
            self.series.insert(name.to_string(), log);
        }
        self.series
            .get_mut(name)
            .expect("series was just inserted")
            .append_typed(time, value, stype)
    }

    /// Looks a series up for reading, loading its file on a miss. Unknown
    /// series resolve to `None`; the caller substitutes NaN or zero rows.
    pub fn resolve(&mut self, name: &str) -> Option<&mut SeriesLog> {
        if !self.series.contains_key(name) {
            match SeriesLog::open(&self.datadir, name, None) {
                Ok(log) => {
                    self.series.insert(name.to_string(), log);
                }
                Err(e) => {
                    debug!(series = name, error = %e, "series not loadable");
                    return None;
                }
            }
        }
        self.series.get_mut(name)
    }

    /// Forces every open series to disk; used on shutdown.
    pub fn flush_all(&mut self) {
        for (name, log) in &mut self.series {
            if let Err(e) = log.flush(true) {
                error!(series = name, error = %e, "flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn addv_creates_series_lazily() {
        let dir = tempdir().unwrap();
        let mut reg = Registry::new(dir.path());
        assert!(reg.is_empty());
        reg.addv("host.load", 1000, 0.5, StoreType::F16).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(dir.path().join("host.load").exists());
    }

    #[test]
    fn addv_rejects_store_type_change() {
        let dir = tempdir().unwrap();
        let mut reg = Registry::new(dir.path());
        reg.addv("a", 1000, 1.0, StoreType::F16).unwrap();
        assert!(reg.addv("a", 1005, 2.0, StoreType::AUint).is_err());
        // the original series still accepts matching writes
        reg.addv("a", 1005, 2.0, StoreType::F16).unwrap();
    }

    #[test]
    fn resolve_misses_unknown_series() {
        let dir = tempdir().unwrap();
        let mut reg = Registry::new(dir.path());
        assert!(reg.resolve("nope").is_none());
    }

    #[test]
    fn resolve_reopens_flushed_series() {
        let dir = tempdir().unwrap();
        {
            let mut reg = Registry::new(dir.path());
            reg.addv("a", 1000, 1.5, StoreType::F16).unwrap();
            reg.flush_all();
        }
        let mut reg = Registry::new(dir.path());
        let log = reg.resolve("a").unwrap();
        assert_eq!(log.store_type(), StoreType::F16);
        assert_eq!(log.levels()[0].time, 1000);
    }
}
