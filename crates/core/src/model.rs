use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    Basic,
    #[default]
    Detailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub key: String,
    pub mode: AnalysisMode,
    pub force_refresh: bool,
    pub timeout: Option<Duration>,
}

impl AnalysisRequest {
    pub fn new(key: impl Into<String>, mode: AnalysisMode) -> Self {
        Self {
            key: key.into(),
            mode,
            force_refresh: false,
            timeout: None,
        }
    }

    pub fn force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub enum DataSource<T> {
    Available(T),
    Unavailable(String),
}

impl<T> DataSource<T> {
    pub fn available(&self) -> Option<&T> {
        match self {
            Self::Available(source) => Some(source),
            Self::Unavailable(_) => None,
        }
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        match self {
            Self::Available(_) => None,
            Self::Unavailable(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Images,
    Videos,
    Audio,
    Documents,
}

impl MediaKind {
    pub const ALL: [MediaKind; 4] = [
        MediaKind::Images,
        MediaKind::Videos,
        MediaKind::Audio,
        MediaKind::Documents,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Videos => "videos",
            Self::Audio => "audio",
            Self::Documents => "documents",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PerMedia<T> {
    pub images: T,
    pub videos: T,
    pub audio: T,
    pub documents: T,
}

pub type MediaSizes = PerMedia<u64>;

impl<T> PerMedia<T> {
    pub fn get(&self, kind: MediaKind) -> &T {
        match kind {
            MediaKind::Images => &self.images,
            MediaKind::Videos => &self.videos,
            MediaKind::Audio => &self.audio,
            MediaKind::Documents => &self.documents,
        }
    }

    pub fn get_mut(&mut self, kind: MediaKind) -> &mut T {
        match kind {
            MediaKind::Images => &mut self.images,
            MediaKind::Videos => &mut self.videos,
            MediaKind::Audio => &mut self.audio,
            MediaKind::Documents => &mut self.documents,
        }
    }
}

impl MediaSizes {
    pub fn total(&self) -> u64 {
        MediaKind::ALL
            .iter()
            .fold(0_u64, |sum, kind| sum.saturating_add(*self.get(*kind)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaOrigin {
    #[default]
    None,
    Scan,
    ContentIndex,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResult {
    pub total_size: u64,
    pub databases_size: u64,
    pub logs_size: u64,
    pub images_size: u64,
    pub videos_size: u64,
    pub audio_size: u64,
    pub documents_size: u64,
    pub residual_size: u64,
    pub database_files: BTreeMap<String, u64>,
    pub files_scanned: u64,
    // Depth or entry budget was hit, or the walk was cancelled. The sizes are
    // a lower bound when set.
    pub limit_reached: bool,
}

impl ScanResult {
    pub fn media_sizes(&self) -> MediaSizes {
        MediaSizes {
            images: self.images_size,
            videos: self.videos_size,
            audio: self.audio_size,
            documents: self.documents_size,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaAttribution {
    pub sizes: MediaSizes,
    pub accessible: bool,
    pub limitation: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExactStats {
    pub app_bytes: u64,
    pub data_bytes: u64,
    pub cache_bytes: u64,
    #[serde(default)]
    pub external_cache_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub install_path: PathBuf,
    pub file_size: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ExactFields {
    pub apk_size: u64,
    pub app_data_internal: u64,
    pub cache_internal: u64,
    pub cache_external: u64,
}

impl From<ExactStats> for ExactFields {
    fn from(stats: ExactStats) -> Self {
        Self {
            apk_size: stats.app_bytes,
            app_data_internal: stats.data_bytes,
            cache_internal: stats.cache_bytes,
            cache_external: stats.external_cache_bytes,
        }
    }
}

impl ExactFields {
    pub fn total(&self) -> u64 {
        self.apk_size
            .saturating_add(self.app_data_internal)
            .saturating_add(self.cache_internal)
            .saturating_add(self.cache_external)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DiscoveredFields {
    pub obb_size: u64,
    pub external_data_size: u64,
    pub media: MediaSizes,
    pub media_sources: PerMedia<MediaOrigin>,
    pub databases_size: u64,
    pub logs_size: u64,
    pub residual_size: u64,
    pub database_breakdown: BTreeMap<String, u64>,
}

impl DiscoveredFields {
    // Database, log and residual sizes are a drill-down of the external
    // data and are not added again.
    pub fn estimated_total(&self) -> u64 {
        self.obb_size
            .saturating_add(self.external_data_size)
            .saturating_add(self.media.total())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StorageBreakdown {
    key: String,
    mode: AnalysisMode,
    #[serde(flatten)]
    exact: ExactFields,
    #[serde(flatten)]
    discovered: DiscoveredFields,
    media_size: u64,
    total_exact: u64,
    total_estimated: u64,
    total_combined: u64,
    confidence_level: f32,
    limitations: Vec<String>,
    scan_timestamp: String,
}

impl StorageBreakdown {
    pub fn new(
        key: impl Into<String>,
        mode: AnalysisMode,
        exact: ExactFields,
        discovered: DiscoveredFields,
        confidence_level: f32,
        limitations: Vec<String>,
    ) -> Self {
        let total_exact = exact.total();
        let total_estimated = discovered.estimated_total();
        let confidence_level = if confidence_level.is_nan() {
            0.0
        } else {
            confidence_level.clamp(0.0, 1.0)
        };

        Self {
            key: key.into(),
            mode,
            media_size: discovered.media.total(),
            exact,
            discovered,
            total_exact,
            total_estimated,
            total_combined: total_exact.saturating_add(total_estimated),
            confidence_level,
            limitations,
            scan_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    pub fn exact(&self) -> &ExactFields {
        &self.exact
    }

    pub fn discovered(&self) -> &DiscoveredFields {
        &self.discovered
    }

    pub fn apk_size(&self) -> u64 {
        self.exact.apk_size
    }

    pub fn media_size(&self) -> u64 {
        self.media_size
    }

    pub fn total_exact(&self) -> u64 {
        self.total_exact
    }

    pub fn total_estimated(&self) -> u64 {
        self.total_estimated
    }

    pub fn total_combined(&self) -> u64 {
        self.total_combined
    }

    pub fn confidence_level(&self) -> f32 {
        self.confidence_level
    }

    pub fn limitations(&self) -> &[String] {
        &self.limitations
    }

    pub fn scan_timestamp(&self) -> &str {
        &self.scan_timestamp
    }
}
