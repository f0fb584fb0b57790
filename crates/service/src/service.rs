use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{Context, Result};
use app_footprint_core::{
    ActiveTaskSnapshot, AnalysisHandle, AnalysisRequest, ContentIndexAdapter, ContentIndexProvider,
    DataSource, DirectoryPackageIndex, EngineConfig, Scheduler, SnapshotContentIndex,
    SnapshotStatsProvider, SourceAggregator, StorageStatsProvider,
};
use tracing::{debug, info, warn};

use crate::wire::{AnalysisRequestDto, Command, ErrorEnvelope, Reply};

#[derive(Debug, Clone, Default)]
pub struct SourcePaths {
    pub packages_root: PathBuf,
    pub stats_snapshot: Option<PathBuf>,
    pub media_index: Option<PathBuf>,
}

/// Wires the file-backed providers into an aggregator. A snapshot that is
/// missing or unreadable marks its capability unavailable for the lifetime
/// of the aggregator instead of failing startup.
pub fn build_aggregator(config: &EngineConfig, paths: &SourcePaths) -> SourceAggregator {
    let packages = Arc::new(DirectoryPackageIndex::new(
        paths.packages_root.clone(),
        config.scan,
    ));

    let stats: DataSource<Arc<dyn StorageStatsProvider>> = match &paths.stats_snapshot {
        None => DataSource::Unavailable("no storage statistics snapshot configured".to_string()),
        Some(path) => match SnapshotStatsProvider::load(path) {
            Ok(provider) => DataSource::Available(Arc::new(provider)),
            Err(err) => {
                warn!(path = %path.display(), "storage statistics unavailable: {err:#}");
                DataSource::Unavailable(format!("{err:#}"))
            }
        },
    };

    let media = match &paths.media_index {
        None => ContentIndexAdapter::unsupported("no content index configured"),
        Some(path) => match SnapshotContentIndex::load(path) {
            Ok(index) => {
                let index: Arc<dyn ContentIndexProvider> = Arc::new(index);
                ContentIndexAdapter::new(DataSource::Available(index))
            }
            Err(err) => {
                warn!(path = %path.display(), "content index unavailable: {err:#}");
                ContentIndexAdapter::unsupported(format!("{err:#}"))
            }
        },
    };

    SourceAggregator::new(packages, config)
        .with_stats(stats)
        .with_content_index(media)
}

#[derive(Debug)]
pub struct AnalysisService {
    scheduler: Scheduler,
}

impl AnalysisService {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn from_sources(config: &EngineConfig, paths: &SourcePaths) -> Result<Self> {
        let scheduler = Scheduler::new(build_aggregator(config, paths), config)
            .context("failed to start analysis scheduler")?;
        Ok(Self::new(scheduler))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn submit(&self, request: AnalysisRequestDto) -> AnalysisHandle {
        self.scheduler.submit(AnalysisRequest::from(request))
    }

    pub fn analyze(&self, request: AnalysisRequestDto) -> Reply {
        reply_for(self.submit(request))
    }

    pub fn cancel_analysis(&self, key: &str) {
        self.scheduler.cancel(key);
    }

    pub fn cancel_all(&self) {
        self.scheduler.cancel_all();
    }

    pub fn clear_cache(&self) {
        self.scheduler.clear_cache();
    }

    pub fn active_tasks(&self) -> Vec<ActiveTaskSnapshot> {
        self.scheduler.active_tasks()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    pub fn process_line(&self, line: &str) -> Reply {
        match parse_command(line) {
            Ok(Command::Analyze(request)) => self.analyze(request),
            Ok(command) => self.control(&command),
            Err(envelope) => Reply::Error(envelope),
        }
    }

    /// Serves newline-delimited JSON commands until EOF or a `shutdown`
    /// command. Analyses run concurrently; their replies are written as they
    /// complete, so output order can differ from input order.
    pub fn serve<R, W>(&self, input: R, output: W) -> Result<()>
    where
        R: BufRead,
        W: Write + Send,
    {
        let output = Mutex::new(output);
        info!("serving analysis requests");

        thread::scope(|scope| -> Result<()> {
            for line in input.lines() {
                let line = line.context("failed to read request line")?;
                if line.trim().is_empty() {
                    continue;
                }

                match parse_command(&line) {
                    Ok(Command::Analyze(request)) => {
                        let handle = self.submit(request);
                        let output = &output;
                        scope.spawn(move || {
                            let key = handle.key().to_string();
                            if let Err(err) = write_reply(output, &reply_for(handle)) {
                                warn!(key, "failed to write analysis reply: {err:#}");
                            }
                        });
                    }
                    Ok(command) => {
                        let reply = self.control(&command);
                        write_reply(&output, &reply)?;
                        if command == Command::Shutdown {
                            break;
                        }
                    }
                    Err(envelope) => write_reply(&output, &Reply::Error(envelope))?,
                }
            }
            Ok(())
        })?;

        info!("request stream closed");
        Ok(())
    }

    fn control(&self, command: &Command) -> Reply {
        debug!(op = command.name(), "control command");
        match command {
            Command::Analyze(_) => {
                return Reply::Error(ErrorEnvelope::invalid_request(
                    "analyze is not a control command",
                ))
            }
            Command::CancelAnalysis { key } => self.cancel_analysis(key),
            Command::CancelAll => self.cancel_all(),
            Command::ClearCache => self.clear_cache(),
            Command::Shutdown => self.shutdown(),
        }
        Reply::ack(command)
    }
}

fn parse_command(line: &str) -> Result<Command, ErrorEnvelope> {
    serde_json::from_str(line).map_err(|err| {
        warn!("rejected request line: {err}");
        ErrorEnvelope::invalid_request(err.to_string())
    })
}

fn reply_for(handle: AnalysisHandle) -> Reply {
    let key = handle.key().to_string();
    match handle.wait() {
        Ok(breakdown) => Reply::Breakdown(breakdown.as_ref().clone()),
        Err(err) => Reply::Error(ErrorEnvelope::from_error(&key, &err)),
    }
}

fn write_reply<W: Write>(output: &Mutex<W>, reply: &Reply) -> Result<()> {
    let payload = serde_json::to_string(reply).context("failed to serialize reply")?;
    let mut output = output.lock().unwrap_or_else(PoisonError::into_inner);
    writeln!(output, "{payload}").context("failed to write reply")?;
    output.flush().context("failed to flush reply")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::io::Cursor;
    use std::path::Path;

    use app_footprint_core::{EngineConfig, ExactStats};

    use super::{AnalysisService, SourcePaths};
    use crate::wire::{AnalysisRequestDto, Reply};

    fn write_stats(path: &Path) {
        let mut entries = HashMap::new();
        entries.insert(
            "com.example".to_string(),
            ExactStats {
                app_bytes: 4096,
                data_bytes: 1024,
                cache_bytes: 512,
                external_cache_bytes: 0,
            },
        );
        fs::write(path, serde_json::to_string(&entries).expect("json")).expect("write stats");
    }

    fn service(root: &Path) -> AnalysisService {
        fs::create_dir_all(root.join("packages")).expect("mkdir");
        fs::write(root.join("packages/com.example"), vec![0_u8; 4096]).expect("package");
        write_stats(&root.join("stats.json"));

        let paths = SourcePaths {
            packages_root: root.join("packages"),
            stats_snapshot: Some(root.join("stats.json")),
            media_index: None,
        };
        AnalysisService::from_sources(&EngineConfig::default(), &paths).expect("service")
    }

    #[test]
    fn analyze_returns_flat_breakdown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let service = service(temp.path());

        let reply = service.analyze(AnalysisRequestDto {
            mode: app_footprint_core::AnalysisMode::Basic,
            ..AnalysisRequestDto::new("com.example")
        });
        let json = serde_json::to_value(&reply).expect("json");
        assert_eq!(json["key"], "com.example");
        assert_eq!(json["apk_size"], 4096);
        assert_eq!(json["total_exact"], 5632);
        assert!(json["limitations"].is_array());
        assert!(json["database_breakdown"].is_object());
    }

    #[test]
    fn unknown_package_is_a_failed_envelope() {
        let temp = tempfile::tempdir().expect("tempdir");
        let service = service(temp.path());

        let reply = service.analyze(AnalysisRequestDto::new("com.missing"));
        let Reply::Error(envelope) = reply else {
            panic!("expected an error envelope");
        };
        assert_eq!(envelope.key, "com.missing");
        assert_eq!(envelope.error, "failed");
    }

    #[test]
    fn control_commands_never_fail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let service = service(temp.path());

        for line in [
            r#"{"op":"cancel_analysis","key":"com.idle"}"#,
            r#"{"op":"cancel_all"}"#,
            r#"{"op":"clear_cache"}"#,
            r#"{"op":"clear_cache"}"#,
        ] {
            let json = serde_json::to_value(service.process_line(line)).expect("json");
            assert_eq!(json["ok"], true);
        }
        assert!(service.process_line("not json").is_error());
    }

    #[test]
    fn serve_answers_each_line_and_stops_on_shutdown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let service = service(temp.path());
        let input = Cursor::new(
            [
                r#"{"op":"analyze","key":"com.example","mode":"basic"}"#,
                "",
                r#"{"op":"bogus"}"#,
                r#"{"op":"shutdown"}"#,
                r#"{"op":"analyze","key":"com.never"}"#,
            ]
            .join("\n"),
        );
        let mut output = Vec::new();

        service.serve(input, &mut output).expect("serve");

        let replies = String::from_utf8(output)
            .expect("utf8")
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("reply json"))
            .collect::<Vec<_>>();
        assert_eq!(replies.len(), 3);
        assert!(replies
            .iter()
            .any(|reply| reply["error"] == "invalid_request"));
        assert!(replies.iter().any(|reply| reply["op"] == "shutdown"));
        // The analysis either finished before shutdown or was cancelled by it.
        assert!(replies
            .iter()
            .any(|reply| reply["key"] == "com.example"));
        assert!(service.scheduler().is_shut_down());
        assert!(!replies.iter().any(|reply| reply["key"] == "com.never"));
    }
}
