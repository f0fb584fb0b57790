use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::confidence::{score, ConfidenceInputs, ConfidenceWeights};
use crate::config::{EngineConfig, StorageLayout};
use crate::error::{AnalysisError, SourceError};
use crate::media::ContentIndexAdapter;
use crate::model::{
    AnalysisMode, DataSource, DiscoveredFields, ExactFields, ExactStats, MediaKind, MediaOrigin,
    MediaSizes, PackageInfo, PerMedia, ScanResult, StorageBreakdown,
};
use crate::providers::{PackageMetadataProvider, StorageStatsProvider};
use crate::scanner::DirectoryScanner;

const BASIC_MODE_LIMITATION: &str = "basic mode: file system scan not performed";
const REDUCED_ACCURACY_LIMITATION: &str =
    "reduced accuracy: only the installed package size is reported";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    PreferScan,
    PreferContentIndex,
}

#[derive(Debug)]
enum DirAccess {
    Unconfigured,
    Missing,
    Denied(String),
    Scanned(ScanResult),
}

impl DirAccess {
    fn result(&self) -> Option<&ScanResult> {
        match self {
            Self::Scanned(result) => Some(result),
            _ => None,
        }
    }
}

pub struct SourceAggregator {
    packages: Arc<dyn PackageMetadataProvider>,
    stats: DataSource<Arc<dyn StorageStatsProvider>>,
    media: ContentIndexAdapter,
    scanner: DirectoryScanner,
    layout: StorageLayout,
    weights: ConfidenceWeights,
    tie_break: TieBreak,
}

impl std::fmt::Debug for SourceAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceAggregator")
            .field("stats", &self.stats.unavailable_reason().unwrap_or("available"))
            .field("media", &self.media)
            .field("scanner", &self.scanner)
            .field("layout", &self.layout)
            .finish()
    }
}

impl SourceAggregator {
    pub fn new(packages: Arc<dyn PackageMetadataProvider>, config: &EngineConfig) -> Self {
        Self {
            packages,
            stats: DataSource::Unavailable("no storage statistics provider configured".to_string()),
            media: ContentIndexAdapter::unsupported("no content index configured"),
            scanner: DirectoryScanner::new(config.scan),
            layout: config.layout.clone(),
            weights: config.weights,
            tie_break: config.media_tie_break,
        }
    }

    pub fn with_stats(mut self, stats: DataSource<Arc<dyn StorageStatsProvider>>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_content_index(mut self, media: ContentIndexAdapter) -> Self {
        self.media = media;
        self
    }

    pub fn analyze(
        &self,
        key: &str,
        mode: AnalysisMode,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<StorageBreakdown, AnalysisError> {
        validate_key(key)?;
        info!(key, ?mode, "analysis started");

        let stats = self.query_stats(key);
        ensure_active(key, is_cancelled)?;

        match mode {
            AnalysisMode::Basic => match stats {
                Ok(stats) => Ok(StorageBreakdown::new(
                    key,
                    mode,
                    ExactFields::from(stats),
                    DiscoveredFields::default(),
                    self.weights.basic_baseline,
                    vec![BASIC_MODE_LIMITATION.to_string()],
                )),
                Err(err) => {
                    let limitations = vec![stats_limitation(&err)];
                    self.fallback(key, mode, self.packages.package_info(key), limitations)
                }
            },
            AnalysisMode::Detailed => self.analyze_detailed(key, stats, is_cancelled),
        }
    }

    fn analyze_detailed(
        &self,
        key: &str,
        stats: Result<ExactStats, SourceError>,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<StorageBreakdown, AnalysisError> {
        let mut limitations = Vec::new();
        let mut exact = ExactFields::default();
        let mut package = None;

        let stats_ok = match stats {
            Ok(stats) => {
                exact = ExactFields::from(stats);
                true
            }
            Err(err) => {
                limitations.push(stats_limitation(&err));
                let info = self.packages.package_info(key);
                match &info {
                    Ok(info) => exact.apk_size = info.file_size,
                    Err(err) => limitations.push(format!("package metadata unavailable: {err}")),
                }
                package = Some(info);
                false
            }
        };
        ensure_active(key, is_cancelled)?;

        let obb = self.scan_dir(self.layout.obb_dir(key).as_deref(), is_cancelled);
        ensure_active(key, is_cancelled)?;
        let external = self.scan_dir(self.layout.external_data_dir(key).as_deref(), is_cancelled);
        ensure_active(key, is_cancelled)?;
        record_dir_limitations("OBB directory", &obb, &mut limitations);
        record_dir_limitations("external data directory", &external, &mut limitations);

        // Kinds that answered are merged even when another kind failed.
        let attribution = if self.media.is_supported() {
            let attribution = self.media.attribute_media(key, is_cancelled);
            ensure_active(key, is_cancelled)?;
            if let Some(limitation) = attribution.limitation.clone() {
                limitations.push(limitation);
            }
            Some(attribution)
        } else {
            None
        };

        let empty = ScanResult::default();
        let obb_scan = obb.result().unwrap_or(&empty);
        let external_scan = external.result().unwrap_or(&empty);
        let index_sizes = attribution
            .as_ref()
            .map(|attribution| attribution.sizes)
            .unwrap_or_default();
        let (media, media_sources) =
            merge_media(&external_scan.media_sizes(), &index_sizes, self.tie_break);

        let discovered = DiscoveredFields {
            obb_size: obb_scan.total_size,
            external_data_size: external_scan
                .total_size
                .saturating_sub(external_scan.media_sizes().total()),
            media,
            media_sources,
            databases_size: external_scan.databases_size,
            logs_size: external_scan.logs_size,
            residual_size: external_scan.residual_size,
            database_breakdown: external_scan.database_files.clone(),
        };

        if !stats_ok && discovered.estimated_total() == 0 {
            let package = package.unwrap_or_else(|| self.packages.package_info(key));
            return self.fallback(key, AnalysisMode::Detailed, package, limitations);
        }

        let confidence = score(
            &self.weights,
            &ConfidenceInputs {
                stats_ok,
                obb_found: obb_scan.total_size > 0,
                external_data_found: external_scan.total_size > 0,
                content_index_ok: attribution.as_ref().is_some_and(|a| a.accessible),
                limitations: limitations.len(),
            },
        );
        debug!(
            key,
            confidence,
            limitations = limitations.len(),
            estimated = discovered.estimated_total(),
            "detailed analysis merged"
        );

        Ok(StorageBreakdown::new(
            key,
            AnalysisMode::Detailed,
            exact,
            discovered,
            confidence,
            limitations,
        ))
    }

    fn fallback(
        &self,
        key: &str,
        mode: AnalysisMode,
        package: Result<PackageInfo, SourceError>,
        mut limitations: Vec<String>,
    ) -> Result<StorageBreakdown, AnalysisError> {
        let info = package.map_err(|err| AnalysisError::Failed {
            key: key.to_string(),
            reason: format!("no source could measure the package: {err}"),
        })?;
        warn!(key, "falling back to package size only");

        limitations.retain(|limitation| !limitation.starts_with("package metadata"));
        limitations.push(REDUCED_ACCURACY_LIMITATION.to_string());
        Ok(StorageBreakdown::new(
            key,
            mode,
            ExactFields {
                apk_size: info.file_size,
                ..ExactFields::default()
            },
            DiscoveredFields::default(),
            self.weights.fallback,
            limitations,
        ))
    }

    fn query_stats(&self, key: &str) -> Result<ExactStats, SourceError> {
        let result = match &self.stats {
            DataSource::Available(provider) => provider.query(key),
            DataSource::Unavailable(reason) => Err(SourceError::Unavailable(reason.clone())),
        };
        if let Err(err) = &result {
            warn!(key, "storage statistics failed: {err}");
        }
        result
    }

    fn scan_dir(&self, dir: Option<&Path>, is_cancelled: &dyn Fn() -> bool) -> DirAccess {
        let Some(dir) = dir else {
            return DirAccess::Unconfigured;
        };

        match fs::read_dir(dir) {
            Ok(_) => DirAccess::Scanned(self.scanner.scan(dir, is_cancelled)),
            Err(err) if err.kind() == ErrorKind::NotFound => DirAccess::Missing,
            Err(err) => {
                warn!(dir = %dir.display(), "directory not accessible: {err}");
                DirAccess::Denied(err.to_string())
            }
        }
    }
}

fn record_dir_limitations(label: &str, access: &DirAccess, limitations: &mut Vec<String>) {
    match access {
        DirAccess::Denied(reason) => {
            limitations.push(format!("{label} not accessible: {reason}"));
        }
        DirAccess::Scanned(result) if result.limit_reached => limitations.push(format!(
            "{label} scan stopped at limits after {} files; sizes are partial",
            result.files_scanned
        )),
        DirAccess::Scanned(_) | DirAccess::Missing | DirAccess::Unconfigured => {}
    }
}

fn stats_limitation(err: &SourceError) -> String {
    format!("storage statistics unavailable ({err}); exact sizes not reported")
}

pub fn merge_media(
    scan: &MediaSizes,
    index: &MediaSizes,
    tie_break: TieBreak,
) -> (MediaSizes, PerMedia<MediaOrigin>) {
    let mut sizes = MediaSizes::default();
    let mut origins = PerMedia::<MediaOrigin>::default();

    for kind in MediaKind::ALL {
        let (scanned, indexed) = (*scan.get(kind), *index.get(kind));
        let origin = match scanned.cmp(&indexed) {
            _ if scanned == 0 && indexed == 0 => MediaOrigin::None,
            std::cmp::Ordering::Greater => MediaOrigin::Scan,
            std::cmp::Ordering::Less => MediaOrigin::ContentIndex,
            std::cmp::Ordering::Equal => match tie_break {
                TieBreak::PreferScan => MediaOrigin::Scan,
                TieBreak::PreferContentIndex => MediaOrigin::ContentIndex,
            },
        };
        *sizes.get_mut(kind) = scanned.max(indexed);
        *origins.get_mut(kind) = origin;
    }

    (sizes, origins)
}

fn validate_key(key: &str) -> Result<(), AnalysisError> {
    let invalid = key.trim().is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0']);
    if invalid {
        return Err(AnalysisError::Failed {
            key: key.to_string(),
            reason: "key is not a valid application identifier".to_string(),
        });
    }
    Ok(())
}

fn ensure_active(key: &str, is_cancelled: &dyn Fn() -> bool) -> Result<(), AnalysisError> {
    if is_cancelled() {
        return Err(AnalysisError::Cancelled {
            key: key.to_string(),
        });
    }
    Ok(())
}
