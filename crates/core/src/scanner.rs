use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::category::{categorize_path, FileCategory};
use crate::model::{MediaKind, ScanResult};

pub const DEFAULT_MAX_DEPTH: usize = 5;
pub const DEFAULT_MAX_FILES: u64 = 5_000;
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanLimits {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    // Entry budget. Directories count against it as well as files.
    #[serde(default = "default_max_files")]
    pub max_files: u64,
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_max_files() -> u64 {
    DEFAULT_MAX_FILES
}

fn default_large_file_threshold() -> u64 {
    DEFAULT_LARGE_FILE_THRESHOLD
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_files: DEFAULT_MAX_FILES,
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
        }
    }
}

#[derive(Debug, Default)]
struct WalkOutcome {
    files_scanned: u64,
    limit_reached: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryScanner {
    limits: ScanLimits,
}

impl DirectoryScanner {
    pub fn new(limits: ScanLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ScanLimits {
        &self.limits
    }

    pub fn scan(&self, root: &Path, is_cancelled: &dyn Fn() -> bool) -> ScanResult {
        let mut result = ScanResult::default();
        let threshold = self.limits.large_file_threshold;

        let outcome = walk(root, &self.limits, is_cancelled, &mut |path: &Path, size: u64| {
            result.total_size = result.total_size.saturating_add(size);
            let category = if size > threshold {
                FileCategory::Residual
            } else {
                categorize_path(path)
            };

            let bucket = match category {
                FileCategory::Database => {
                    let name = path
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string())
                        .unwrap_or_default();
                    let current = result.database_files.entry(name).or_insert(0);
                    *current = current.saturating_add(size);
                    &mut result.databases_size
                }
                FileCategory::Log => &mut result.logs_size,
                FileCategory::Media(MediaKind::Images) => &mut result.images_size,
                FileCategory::Media(MediaKind::Videos) => &mut result.videos_size,
                FileCategory::Media(MediaKind::Audio) => &mut result.audio_size,
                FileCategory::Media(MediaKind::Documents) => &mut result.documents_size,
                FileCategory::Residual => &mut result.residual_size,
            };
            *bucket = bucket.saturating_add(size);
        });

        result.files_scanned = outcome.files_scanned;
        result.limit_reached = outcome.limit_reached;
        debug!(
            root = %root.display(),
            files = result.files_scanned,
            bytes = result.total_size,
            limit_reached = result.limit_reached,
            "directory scan finished"
        );
        result
    }

    pub fn quick_size(&self, root: &Path, is_cancelled: &dyn Fn() -> bool) -> u64 {
        let mut total = 0_u64;
        let outcome = walk(root, &self.limits, is_cancelled, &mut |_: &Path, size: u64| {
            total = total.saturating_add(size);
        });
        if outcome.limit_reached {
            debug!(root = %root.display(), total, "quick size stopped at limits");
        }
        total
    }
}

fn walk(
    root: &Path,
    limits: &ScanLimits,
    is_cancelled: &dyn Fn() -> bool,
    on_file: &mut dyn FnMut(&Path, u64),
) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();
    let mut visited = 0_u64;

    // One level past max_depth so that too-deep directories are seen and
    // flagged, never entered.
    let mut iter = WalkDir::new(root)
        .follow_links(false)
        .max_depth(limits.max_depth.saturating_add(1))
        .into_iter();

    while let Some(item) = iter.next() {
        // Every entry below the root spends budget, directories included.
        let is_root = matches!(&item, Ok(entry) if entry.depth() == 0);
        if !is_root {
            if visited >= limits.max_files {
                outcome.limit_reached = true;
                break;
            }
            visited += 1;
        }

        if is_cancelled() {
            debug!(root = %root.display(), "walk cancelled; result is partial");
            outcome.limit_reached = true;
            break;
        }

        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                debug!(root = %root.display(), "skipping unreadable entry: {err}");
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            if entry.depth() > limits.max_depth {
                outcome.limit_reached = true;
                iter.skip_current_dir();
            }
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                debug!(path = %entry.path().display(), "metadata read failed: {err}");
                continue;
            }
        };

        outcome.files_scanned += 1;
        on_file(entry.path(), size);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;
    use std::path::{Path, PathBuf};

    use super::{DirectoryScanner, ScanLimits};

    const MB: u64 = 1024 * 1024;

    fn write_file(path: &Path, size: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, vec![0_u8; size as usize]).expect("write file");
    }

    fn never() -> bool {
        false
    }

    fn nested_tree(root: &Path, levels: usize) -> PathBuf {
        let mut dir = root.to_path_buf();
        write_file(&dir.join("f.bin"), 10);
        for level in 1..=levels {
            dir = dir.join(format!("d{level}"));
            write_file(&dir.join("f.bin"), 10);
        }
        dir
    }

    #[test]
    fn flat_directory_is_categorized() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_file(&temp.path().join("app.db"), MB);
        write_file(&temp.path().join("photo.jpg"), MB);
        write_file(&temp.path().join("blob.xyz"), MB);

        let result = DirectoryScanner::default().scan(temp.path(), &never);
        assert_eq!(result.databases_size, MB);
        assert_eq!(result.images_size, MB);
        assert_eq!(result.residual_size, MB);
        assert_eq!(result.total_size, 3 * MB);
        assert_eq!(result.files_scanned, 3);
        assert!(!result.limit_reached);
        assert_eq!(result.database_files.get("app.db"), Some(&MB));
    }

    #[test]
    fn tree_deeper_than_max_depth_is_flagged_and_not_entered() {
        let temp = tempfile::tempdir().expect("tempdir");
        nested_tree(temp.path(), 6);

        let scanner = DirectoryScanner::new(ScanLimits {
            max_depth: 5,
            ..ScanLimits::default()
        });
        let result = scanner.scan(temp.path(), &never);
        assert!(result.limit_reached);
        // root plus d1..d5 are listed; d6 is not.
        assert_eq!(result.files_scanned, 6);
        assert_eq!(result.total_size, 60);
    }

    #[test]
    fn tree_exactly_at_max_depth_is_complete() {
        let temp = tempfile::tempdir().expect("tempdir");
        nested_tree(temp.path(), 5);

        let result = DirectoryScanner::default().scan(temp.path(), &never);
        assert!(!result.limit_reached);
        assert_eq!(result.files_scanned, 6);
    }

    #[test]
    fn wide_tree_stops_at_file_budget() {
        let temp = tempfile::tempdir().expect("tempdir");
        for dir in 0..5 {
            for file in 0..10 {
                write_file(&temp.path().join(format!("d{dir}/f{file}.log")), 1);
            }
        }

        let scanner = DirectoryScanner::new(ScanLimits {
            max_files: 17,
            ..ScanLimits::default()
        });
        let result = scanner.scan(temp.path(), &never);
        assert!(result.limit_reached);
        // First directory and its 10 files, then the second directory and 5
        // of its files.
        assert_eq!(result.files_scanned, 15);
        assert_eq!(result.logs_size, 15);
    }

    #[test]
    fn empty_directories_spend_the_budget() {
        let temp = tempfile::tempdir().expect("tempdir");
        for outer in 0..20 {
            for inner in 0..10 {
                fs::create_dir_all(temp.path().join(format!("d{outer}/e{inner}")))
                    .expect("mkdir");
            }
        }

        let polls = Cell::new(0_u32);
        let counting = || {
            polls.set(polls.get() + 1);
            false
        };
        let scanner = DirectoryScanner::new(ScanLimits {
            max_files: 10,
            ..ScanLimits::default()
        });
        let result = scanner.scan(temp.path(), &counting);
        assert!(result.limit_reached);
        assert_eq!(result.files_scanned, 0);
        // The root plus ten budgeted entries.
        assert!(polls.get() <= 11, "visited {} entries", polls.get());
    }

    #[test]
    fn exact_file_budget_is_not_a_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        for file in 0..4 {
            write_file(&temp.path().join(format!("f{file}.txt")), 2);
        }

        let scanner = DirectoryScanner::new(ScanLimits {
            max_files: 4,
            ..ScanLimits::default()
        });
        let result = scanner.scan(temp.path(), &never);
        assert!(!result.limit_reached);
        assert_eq!(result.documents_size, 8);
    }

    #[test]
    fn large_files_count_as_residual_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_file(&temp.path().join("movie.mp4"), 2_048);
        write_file(&temp.path().join("clip.mp4"), 512);

        let scanner = DirectoryScanner::new(ScanLimits {
            large_file_threshold: 1_024,
            ..ScanLimits::default()
        });
        let result = scanner.scan(temp.path(), &never);
        assert_eq!(result.videos_size, 512);
        assert_eq!(result.residual_size, 2_048);
        assert_eq!(result.total_size, 2_560);
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let temp = tempfile::tempdir().expect("tempdir");
        for file in 0..20 {
            write_file(&temp.path().join(format!("f{file}.bin")), 1);
        }

        let polls = Cell::new(0_u32);
        let cancel_after_three = || {
            polls.set(polls.get() + 1);
            polls.get() > 3
        };
        let result = DirectoryScanner::default().scan(temp.path(), &cancel_after_three);
        assert!(result.limit_reached);
        assert!(result.files_scanned < 20);
    }

    #[test]
    fn missing_root_yields_empty_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = DirectoryScanner::default().scan(&temp.path().join("absent"), &never);
        assert_eq!(result.files_scanned, 0);
        assert_eq!(result.total_size, 0);
        assert!(!result.limit_reached);
    }

    #[test]
    fn quick_size_matches_scan_total() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_file(&temp.path().join("a/b/c.db"), 300);
        write_file(&temp.path().join("a/x.png"), 200);

        let scanner = DirectoryScanner::default();
        assert_eq!(scanner.quick_size(temp.path(), &never), 500);
        assert_eq!(scanner.scan(temp.path(), &never).total_size, 500);
    }
}
