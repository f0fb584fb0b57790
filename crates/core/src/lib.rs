pub mod aggregate;
pub mod cache;
pub mod cancel;
pub mod category;
pub mod confidence;
pub mod config;
pub mod error;
pub mod media;
pub mod model;
pub mod providers;
pub mod scanner;
pub mod scheduler;

pub use aggregate::{merge_media, SourceAggregator, TieBreak};
pub use cache::RequestCache;
pub use cancel::{CancelReason, CancelToken};
pub use category::{categorize_extension, categorize_path, FileCategory};
pub use confidence::{score, ConfidenceInputs, ConfidenceWeights};
pub use config::{EngineConfig, StorageLayout};
pub use error::{AnalysisError, ConfigError, SourceError};
pub use media::ContentIndexAdapter;
pub use model::{
    AnalysisMode, AnalysisRequest, DataSource, DiscoveredFields, ExactFields, ExactStats,
    MediaAttribution, MediaKind, MediaOrigin, MediaSizes, PackageInfo, PerMedia, ScanResult,
    StorageBreakdown,
};
pub use providers::{
    ContentIndexProvider, DirectoryPackageIndex, IndexedMediaItem, PackageMetadataProvider,
    SnapshotContentIndex, SnapshotStatsProvider, StorageStatsProvider,
};
pub use scanner::{DirectoryScanner, ScanLimits};
pub use scheduler::{ActiveTaskSnapshot, AnalysisHandle, AnalysisResult, Scheduler, TaskState};
