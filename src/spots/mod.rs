//! Per-source spot geometry.
//!
//! Spots are persisted as a JSON array of `[x, y, width, height]` integer tuples, one
//! file per source. Entries that are not four non-negative integers with a positive
//! size are skipped individually; the rest of the file still loads.

pub mod editor;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::Region;

pub use editor::{EditEvent, EditOutcome, SpotEditor};

/// Load/save capability for spot geometry.
pub trait SpotStore: Send + Sync {
    /// Regions for `source_id`, in stored order. A source with no stored geometry
    /// yields an empty list.
    fn load(&self, source_id: &str) -> Result<Vec<Region>>;

    fn save(&self, source_id: &str, regions: &[Region]) -> Result<()>;
}

/// JSON files, one per source.
#[derive(Clone, Debug, Default)]
pub struct JsonSpotStore {
    paths: BTreeMap<String, PathBuf>,
}

impl JsonSpotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.insert(source_id, path);
        self
    }

    pub fn insert(&mut self, source_id: impl Into<String>, path: impl Into<PathBuf>) {
        self.paths.insert(source_id.into(), path.into());
    }

    pub fn path_for(&self, source_id: &str) -> Result<&Path> {
        self.paths
            .get(source_id)
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow!("no spot file configured for source '{}'", source_id))
    }
}

impl SpotStore for JsonSpotStore {
    fn load(&self, source_id: &str) -> Result<Vec<Region>> {
        let path = self.path_for(source_id)?;
        if !path.exists() {
            log::warn!(
                "source {}: spot file {} not found, no spots configured",
                source_id,
                path.display()
            );
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read spot file {}", path.display()))?;
        let regions = parse_regions(&raw)
            .with_context(|| format!("invalid spot file {}", path.display()))?;
        log::info!(
            "source {}: loaded {} spots from {}",
            source_id,
            regions.len(),
            path.display()
        );
        Ok(regions)
    }

    fn save(&self, source_id: &str, regions: &[Region]) -> Result<()> {
        let path = self.path_for(source_id)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = serialize_regions(regions)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace spot file {}", path.display()))?;
        Ok(())
    }
}

/// Process-local store, used by tests and demos.
#[derive(Debug, Default)]
pub struct InMemorySpotStore {
    regions: Mutex<HashMap<String, Vec<Region>>>,
}

impl InMemorySpotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(self, source_id: impl Into<String>, regions: Vec<Region>) -> Self {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source_id.into(), regions);
        self
    }
}

impl SpotStore for InMemorySpotStore {
    fn load(&self, source_id: &str) -> Result<Vec<Region>> {
        Ok(self
            .regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save(&self, source_id: &str, regions: &[Region]) -> Result<()> {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source_id.to_string(), regions.to_vec());
        Ok(())
    }
}

/// Parse a spot file body, skipping malformed entries with a warning.
pub fn parse_regions(raw: &str) -> Result<Vec<Region>> {
    let value: Value = serde_json::from_str(raw).context("spot file is not valid JSON")?;
    let Value::Array(entries) = value else {
        return Err(anyhow!("spot file must contain a JSON array"));
    };
    let mut regions = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match parse_entry(entry) {
            Ok(region) => regions.push(region),
            Err(err) => log::warn!("skipping spot entry {} ({}): {}", index, entry, err),
        }
    }
    Ok(regions)
}

fn parse_entry(entry: &Value) -> Result<Region> {
    let fields = entry
        .as_array()
        .ok_or_else(|| anyhow!("expected [x, y, width, height]"))?;
    if fields.len() != 4 {
        return Err(anyhow!("expected 4 values, found {}", fields.len()));
    }
    let mut values = [0u32; 4];
    for (slot, field) in values.iter_mut().zip(fields) {
        *slot = field
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| anyhow!("'{}' is not a non-negative pixel coordinate", field))?;
    }
    let [x, y, width, height] = values;
    Region::new(x, y, width, height)
}

pub fn serialize_regions(regions: &[Region]) -> Result<String> {
    let tuples: Vec<[u32; 4]> = regions.iter().map(Region::as_tuple).collect();
    serde_json::to_string(&tuples).context("serialize spots")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: u32, y: u32, w: u32, h: u32) -> Region {
        Region::new(x, y, w, h).unwrap()
    }

    #[test]
    fn json_store_round_trips_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonSpotStore::new().with_source("lot1", dir.path().join("spots/lot1.json"));
        let regions = vec![region(50, 40, 90, 30), region(10, 10, 20, 20), region(300, 5, 90, 30)];
        store.save("lot1", &regions)?;
        assert_eq!(store.load("lot1")?, regions);
        Ok(())
    }

    #[test]
    fn missing_file_loads_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonSpotStore::new().with_source("lot1", dir.path().join("absent.json"));
        assert!(store.load("lot1")?.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_source_is_an_error() {
        let store = JsonSpotStore::new();
        assert!(store.load("lot1").is_err());
        assert!(store.save("lot1", &[]).is_err());
    }

    #[test]
    fn malformed_entries_are_skipped_individually() -> Result<()> {
        let raw = r#"[[1,2,90,30], [1,2,3], "spot", [5,5,-1,10], [7,8,0,10], [9,9,1.5,2], [100,200,90,30]]"#;
        let regions = parse_regions(raw)?;
        assert_eq!(regions, vec![region(1, 2, 90, 30), region(100, 200, 90, 30)]);
        Ok(())
    }

    #[test]
    fn non_array_body_is_rejected() {
        assert!(parse_regions(r#"{"spots": []}"#).is_err());
        assert!(parse_regions("not json").is_err());
    }

    #[test]
    fn in_memory_store_round_trips() -> Result<()> {
        let store = InMemorySpotStore::new();
        assert!(store.load("lot1")?.is_empty());
        store.save("lot1", &[region(1, 1, 5, 5)])?;
        assert_eq!(store.load("lot1")?, vec![region(1, 1, 5, 5)]);
        Ok(())
    }
}
