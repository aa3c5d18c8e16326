//! Sandbox lifecycle records and their on-disk footprint.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use crate::errors::{GatewayError, GatewayResult};
use crate::models::SandboxId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    pub sandbox_id: SandboxId,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub quota_bytes: u64,
    #[serde(default)]
    pub used_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl SandboxRecord {
    pub fn new(sandbox_id: SandboxId) -> Self {
        Self {
            sandbox_id,
            user_id: None,
            quota_bytes: 0,
            used_bytes: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    sandboxes: Vec<SandboxRecord>,
}

/// JSON-file registry of sandboxes, written back with [`SandboxRegistry::save`].
#[derive(Debug)]
pub struct SandboxRegistry {
    path: PathBuf,
    records: BTreeMap<SandboxId, SandboxRecord>,
}

impl SandboxRegistry {
    /// Loads `path`; a missing file is an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> GatewayResult<Self> {
        let path = path.into();
        let file: RegistryFile = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RegistryFile::default(),
            Err(err) => return Err(err.into()),
        };
        let records = file
            .sandboxes
            .into_iter()
            .map(|record| (record.sandbox_id.clone(), record))
            .collect();
        Ok(Self { path, records })
    }

    pub fn save(&self) -> GatewayResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = RegistryFile {
            sandboxes: self.records.values().cloned().collect(),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn records(&self) -> impl Iterator<Item = &SandboxRecord> {
        self.records.values()
    }

    pub fn get(&self, id: &SandboxId) -> Option<&SandboxRecord> {
        self.records.get(id)
    }

    pub fn get_or_insert(&mut self, id: &SandboxId) -> &mut SandboxRecord {
        self.records
            .entry(id.clone())
            .or_insert_with(|| SandboxRecord::new(id.clone()))
    }

    pub fn get_mut(&mut self, id: &SandboxId) -> Option<&mut SandboxRecord> {
        self.records.get_mut(id)
    }

    pub fn remove(&mut self, id: &SandboxId) -> Option<SandboxRecord> {
        self.records.remove(id)
    }
}

/// Parses a user-supplied id, refusing ids with nothing usable in them.
pub fn parse_id(raw: &str) -> GatewayResult<SandboxId> {
    SandboxId::parse(raw)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("invalid sandbox id '{raw}'")))
}

pub fn sandbox_dir(clients_dir: &Path, id: &SandboxId) -> PathBuf {
    clients_dir.join(id.as_str())
}

/// Total size of regular files below `path`, hidden files included and
/// symlinks not followed. Missing directories count as zero.
pub fn dir_size(path: &Path) -> u64 {
    if !path.is_dir() {
        return 0;
    }
    WalkBuilder::new(path)
        .standard_filters(false)
        .follow_links(false)
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Empties the sandbox directory but keeps it. `false` if it did not exist.
pub fn reset_dir(path: &Path) -> GatewayResult<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(true)
}

/// Removes the sandbox directory. `false` if it did not exist.
pub fn remove_dir(path: &Path) -> GatewayResult<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    fs::remove_dir_all(path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_survives_a_round_trip_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/sandboxes.json");
        let mut registry = SandboxRegistry::load(&path).unwrap();
        assert_eq!(registry.records().count(), 0);

        let id = parse_id("alice").unwrap();
        registry.get_or_insert(&id).quota_bytes = 1024;
        registry.save().unwrap();

        let reloaded = SandboxRegistry::load(&path).unwrap();
        assert_eq!(reloaded.get(&id).unwrap().quota_bytes, 1024);
    }

    #[test]
    fn dir_size_counts_hidden_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("nested")).unwrap();
        fs::write(tmp.path().join("a.txt"), b"12345").unwrap();
        fs::write(tmp.path().join(".hidden"), b"123").unwrap();
        fs::write(tmp.path().join("nested/b.bin"), b"12").unwrap();
        assert_eq!(dir_size(tmp.path()), 10);
        assert_eq!(dir_size(&tmp.path().join("missing")), 0);
    }

    #[test]
    fn reset_keeps_the_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("alice");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("sub/file"), b"x").unwrap();
        assert!(reset_dir(&dir).unwrap());
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        assert!(remove_dir(&dir).unwrap());
        assert!(!remove_dir(&dir).unwrap());
    }

    #[test]
    fn ids_are_sanitized_before_touching_disk() {
        assert_eq!(parse_id("../alice").unwrap().as_str(), "alice");
        assert!(matches!(parse_id("../"), Err(GatewayError::InvalidRequest(_))));
        let dir = sandbox_dir(Path::new("/srv/clients"), &parse_id("../../etc").unwrap());
        assert_eq!(dir, Path::new("/srv/clients/etc"));
    }
}
