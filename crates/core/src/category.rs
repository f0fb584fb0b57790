use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::model::MediaKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Database,
    Log,
    Media(MediaKind),
    Residual,
}

const DATABASE_EXTENSIONS: &[&str] = &[
    "db", "sqlite", "sqlite3", "db3", "db-wal", "db-shm", "db-journal", "realm",
];
const LOG_EXTENSIONS: &[&str] = &["log", "logs", "trace", "crash", "dmp"];
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "heic", "heif", "svg", "ico", "tif", "tiff",
];
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "webm", "3gp", "avi", "mov", "m4v", "wmv", "flv", "ts",
];
const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "aac", "m4a", "wav", "ogg", "oga", "flac", "opus", "amr", "mid", "midi",
];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "rtf", "odt", "ods", "odp",
    "csv", "epub", "md",
];

static EXTENSION_TABLE: Lazy<HashMap<&'static str, FileCategory>> = Lazy::new(|| {
    let groups: [(&[&str], FileCategory); 6] = [
        (DATABASE_EXTENSIONS, FileCategory::Database),
        (LOG_EXTENSIONS, FileCategory::Log),
        (IMAGE_EXTENSIONS, FileCategory::Media(MediaKind::Images)),
        (VIDEO_EXTENSIONS, FileCategory::Media(MediaKind::Videos)),
        (AUDIO_EXTENSIONS, FileCategory::Media(MediaKind::Audio)),
        (DOCUMENT_EXTENSIONS, FileCategory::Media(MediaKind::Documents)),
    ];

    let mut table = HashMap::new();
    for (extensions, category) in groups {
        for extension in extensions {
            table.insert(*extension, category);
        }
    }
    table
});

pub fn categorize_extension(extension: &str) -> FileCategory {
    let lowered = extension.to_ascii_lowercase();
    EXTENSION_TABLE
        .get(lowered.as_str())
        .copied()
        .unwrap_or(FileCategory::Residual)
}

pub fn categorize_path(path: &Path) -> FileCategory {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(categorize_extension)
        .unwrap_or(FileCategory::Residual)
}
