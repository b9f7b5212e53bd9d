//! JSON documents kept on local disk: the active-instance snapshot used for
//! restart recovery and the symbol allow-list the market feed subscribes to.

use crate::models::InstanceKey;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Read a JSON document, `Ok(None)` if the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON document via a sibling temp file and rename, creating parent directories
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

/// Instance keys that were running when the controller last shut down
pub struct ActiveSetStore {
    path: PathBuf,
}

impl ActiveSetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn save(&self, keys: &[InstanceKey]) -> Result<()> {
        write_json(&self.path, &keys)?;
        tracing::info!(
            "Saved {} active instance(s) to {}",
            keys.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Load the snapshot; a missing file is an empty set
    pub fn load(&self) -> Result<Vec<InstanceKey>> {
        match read_json(&self.path)? {
            Some(keys) => Ok(keys),
            None => {
                tracing::warn!("No active instance file at {}", self.path.display());
                Ok(Vec::new())
            }
        }
    }
}

/// Symbols the market data feed subscribes to
pub struct SymbolListStore {
    path: PathBuf,
}

impl SymbolListStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Vec<String>>> {
        read_json(&self.path)
    }

    /// Append `symbol` if absent. Returns the resulting list and whether it changed.
    ///
    /// The list must already exist; it is owned by whoever deploys the feed.
    pub fn add(&self, symbol: &str) -> Result<(Vec<String>, bool)> {
        let mut symbols = self.load()?.ok_or_else(|| {
            std::io::Error::new(
                ErrorKind::NotFound,
                format!("symbol list not found: {}", self.path.display()),
            )
        })?;

        if symbols.iter().any(|s| s == symbol) {
            return Ok((symbols, false));
        }

        symbols.push(symbol.to_string());
        write_json(&self.path, &symbols)?;
        tracing::info!("Added {} to symbol list ({} total)", symbol, symbols.len());

        Ok((symbols, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_active_set_roundtrip_keeps_order() {
        let dir = tempdir().unwrap();
        let store = ActiveSetStore::new(dir.path().join("active_traders.json"));

        let keys = vec![
            InstanceKey::new("SOL/USD", "alice"),
            InstanceKey::new("ETH/USD", "bob"),
            InstanceKey::new("SOL/USD", "bob"),
        ];
        store.save(&keys).unwrap();

        assert_eq!(store.load().unwrap(), keys);
    }

    #[test]
    fn test_active_set_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = ActiveSetStore::new(dir.path().join("nope.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_symbol_list_add_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("symbol_list.json");
        write_json(&path, &vec!["SOL/USD".to_string()]).unwrap();
        let store = SymbolListStore::new(&path);

        let (list, changed) = store.add("ETH/USD").unwrap();
        assert!(changed);
        assert_eq!(list, vec!["SOL/USD", "ETH/USD"]);

        let (list, changed) = store.add("ETH/USD").unwrap();
        assert!(!changed);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_symbol_list_add_requires_existing_file() {
        let dir = tempdir().unwrap();
        let store = SymbolListStore::new(dir.path().join("symbol_list.json"));

        let err = store.add("SOL/USD").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_write_json_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/c.json");

        write_json(&path, &serde_json::json!({"x": 1})).unwrap();

        let value: Option<serde_json::Value> = read_json(&path).unwrap();
        assert_eq!(value.unwrap()["x"], 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_read_json_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();

        let result: Result<Option<Vec<String>>> = read_json(&path);
        assert!(result.is_err());
    }
}
