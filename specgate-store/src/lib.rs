//! Namespaced key/value log over sled.
//!
//! The time-series subsystem stores period-aligned entries and per-series
//! state here. Keys are UTF-8 strings; namespaces are plain key prefixes,
//! so a `Namespace` is a cheap view that can be nested.

use std::path::Path;

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store error: {0}")]
    Backend(#[from] sled::Error),

    #[error("store value is not UTF-8")]
    Encoding,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A sled database handle.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        let db = sled::open(path.as_ref())?;
        debug!("opened store at {}", path.as_ref().display());
        Ok(Store { db })
    }

    /// An in-memory store for tests.
    pub fn temporary() -> Result<Store> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Store { db })
    }

    /// The root namespace.
    pub fn ns(&self, prefix: impl Into<String>) -> Namespace {
        Namespace { db: self.db.clone(), prefix: prefix.into() }
    }
}

/// A prefix view over the store.
#[derive(Clone)]
pub struct Namespace {
    db: sled::Db,
    prefix: String,
}

impl Namespace {
    /// Nest a further prefix under this namespace.
    pub fn ns(&self, suffix: &str) -> Namespace {
        Namespace { db: self.db.clone(), prefix: format!("{}{}", self.prefix, suffix) }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(self.full_key(key))? {
            Some(value) => {
                let s = String::from_utf8(value.to_vec()).map_err(|_| StoreError::Encoding)?;
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.insert(self.full_key(key), value.as_bytes())?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(self.full_key(key))?;
        Ok(())
    }

    /// All entries under this namespace, keys stripped of the prefix,
    /// in ascending key order.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(self.prefix.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| StoreError::Encoding)?;
            let value = String::from_utf8(value.to_vec()).map_err(|_| StoreError::Encoding)?;
            out.push((key[self.prefix.len()..].to_string(), value));
        }
        Ok(out)
    }

    /// Entries with `low <= key <= high`, descending from `high`, at most
    /// `max` results (0 means unbounded).
    pub fn range_desc(&self, high: &str, low: &str, max: usize) -> Result<Vec<(String, String)>> {
        let start = self.full_key(low);
        let end = self.full_key(high);

        let mut out = Vec::new();
        for item in self.db.range(start.as_bytes()..=end.as_bytes()).rev() {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| StoreError::Encoding)?;
            let value = String::from_utf8(value.to_vec()).map_err(|_| StoreError::Encoding)?;
            out.push((key[self.prefix.len()..].to_string(), value));

            if max != 0 && max <= out.len() {
                break;
            }
        }
        Ok(out)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_remove() {
        let store = Store::temporary().unwrap();
        let ns = store.ns(":metrics:");

        assert_eq!(ns.get("state").unwrap(), None);
        ns.set("state", "{}").unwrap();
        assert_eq!(ns.get("state").unwrap(), Some("{}".to_string()));
        ns.remove("state").unwrap();
        assert_eq!(ns.get("state").unwrap(), None);
    }

    #[test]
    fn namespaces_do_not_leak() {
        let store = Store::temporary().unwrap();
        let a = store.ns(":a:");
        let b = store.ns(":b:");

        a.set("k", "1").unwrap();
        b.set("k", "2").unwrap();

        assert_eq!(a.get("k").unwrap(), Some("1".to_string()));
        assert_eq!(b.get("k").unwrap(), Some("2".to_string()));
        assert_eq!(a.entries().unwrap(), vec![("k".to_string(), "1".to_string())]);
    }

    #[test]
    fn nested_namespace() {
        let store = Store::temporary().unwrap();
        let series = store.ns(":cpu:");
        let keys = series.ns("keys:");

        keys.set("abc", "SELECT 1").unwrap();
        assert_eq!(series.get("keys:abc").unwrap(), Some("SELECT 1".to_string()));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = Store::open(&path).unwrap();
            let ns = store.ns(":m:");
            ns.set("keys:abc", "SELECT 1").unwrap();
            ns.flush().unwrap();
        }

        let store = Store::open(&path).unwrap();
        let ns = store.ns(":m:");
        assert_eq!(ns.get("keys:abc").unwrap(), Some("SELECT 1".to_string()));
    }

    #[test]
    fn descending_range_with_limit() {
        let store = Store::temporary().unwrap();
        let ns = store.ns(":t:");

        for key in ["20240101000000", "20240101000010", "20240101000020", "20240101000030"] {
            ns.set(key, key).unwrap();
        }

        let all = ns.range_desc("99999999999999", "00000000000000", 0).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].0, "20240101000030");
        assert_eq!(all[3].0, "20240101000000");

        let limited = ns.range_desc("99999999999999", "20240101000010", 2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].0, "20240101000030");
        assert_eq!(limited[1].0, "20240101000020");
    }
}
