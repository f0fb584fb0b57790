use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::model::{ExactStats, MediaKind, PackageInfo};
use crate::scanner::{DirectoryScanner, ScanLimits};

pub trait PackageMetadataProvider: Send + Sync {
    fn package_info(&self, key: &str) -> Result<PackageInfo, SourceError>;
}

pub trait StorageStatsProvider: Send + Sync {
    fn query(&self, key: &str) -> Result<ExactStats, SourceError>;
}

pub trait ContentIndexProvider: Send + Sync {
    fn is_supported(&self) -> bool {
        true
    }

    fn media_sizes(&self, key: &str, kind: MediaKind) -> Result<Vec<u64>, SourceError>;
}

pub(crate) fn source_error_from_io(err: std::io::Error, what: &str) -> SourceError {
    match err.kind() {
        ErrorKind::PermissionDenied => SourceError::PermissionDenied(format!("{what}: {err}")),
        ErrorKind::NotFound => SourceError::Unavailable(format!("{what}: not found")),
        _ => SourceError::Io(err),
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryPackageIndex {
    root: PathBuf,
    scanner: DirectoryScanner,
}

impl DirectoryPackageIndex {
    pub fn new(root: impl Into<PathBuf>, limits: ScanLimits) -> Self {
        Self {
            root: root.into(),
            scanner: DirectoryScanner::new(limits),
        }
    }
}

impl PackageMetadataProvider for DirectoryPackageIndex {
    fn package_info(&self, key: &str) -> Result<PackageInfo, SourceError> {
        let install_path = self.root.join(key);
        let metadata = fs::metadata(&install_path)
            .map_err(|err| source_error_from_io(err, &format!("package {key}")))?;

        let file_size = if metadata.is_dir() {
            self.scanner.quick_size(&install_path, &|| false)
        } else {
            metadata.len()
        };

        Ok(PackageInfo {
            install_path,
            file_size,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotStatsProvider {
    entries: HashMap<String, ExactStats>,
}

impl SnapshotStatsProvider {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read stats snapshot {}", path.display()))?;
        let entries: HashMap<String, ExactStats> = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Self { entries })
    }

    pub fn from_entries(entries: HashMap<String, ExactStats>) -> Self {
        Self { entries }
    }
}

impl StorageStatsProvider for SnapshotStatsProvider {
    fn query(&self, key: &str) -> Result<ExactStats, SourceError> {
        self.entries
            .get(key)
            .copied()
            .ok_or_else(|| SourceError::Unavailable(format!("no storage statistics for {key}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedMediaItem {
    pub kind: MediaKind,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotContentIndex {
    entries: HashMap<String, Vec<IndexedMediaItem>>,
}

impl SnapshotContentIndex {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read media index {}", path.display()))?;
        let entries: HashMap<String, Vec<IndexedMediaItem>> = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Self { entries })
    }

    pub fn from_entries(entries: HashMap<String, Vec<IndexedMediaItem>>) -> Self {
        Self { entries }
    }
}

impl ContentIndexProvider for SnapshotContentIndex {
    fn media_sizes(&self, key: &str, kind: MediaKind) -> Result<Vec<u64>, SourceError> {
        Ok(self
            .entries
            .get(key)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.kind == kind)
                    .map(|item| item.size)
                    .collect()
            })
            .unwrap_or_default())
    }
}
