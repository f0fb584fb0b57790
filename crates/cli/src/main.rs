use std::fs;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use app_footprint_core::{AnalysisMode, DirectoryScanner, EngineConfig, ScanLimits, StorageBreakdown};
use app_footprint_service::{AnalysisRequestDto, AnalysisService, Reply, SourcePaths};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "app-footprint",
    version,
    about = "Estimate how much storage an installed app really uses."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Analyze one app and print its storage breakdown.
    Analyze(AnalyzeArgs),
    /// Scan a single directory with the bounded scanner.
    Scan(ScanArgs),
    /// Answer newline-delimited JSON requests from stdin on stdout.
    Serve(SourceArgs),
    /// Print the effective engine configuration as JSON.
    Config(SourceArgs),
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliMode {
    Basic,
    Detailed,
}

impl From<CliMode> for AnalysisMode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Basic => AnalysisMode::Basic,
            CliMode::Detailed => AnalysisMode::Detailed,
        }
    }
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Engine configuration JSON. Defaults apply for missing fields.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding installed packages as `<root>/<key>`.
    #[arg(long, value_name = "DIR", default_value = ".")]
    packages_root: PathBuf,

    /// Root of per-app external data directories.
    #[arg(long, value_name = "DIR")]
    external_root: Option<PathBuf>,

    /// Root of per-app expansion-file directories.
    #[arg(long, value_name = "DIR")]
    obb_root: Option<PathBuf>,

    /// Storage statistics snapshot (`{key: {app_bytes, data_bytes, ...}}`).
    #[arg(long, value_name = "FILE")]
    stats_snapshot: Option<PathBuf>,

    /// Content index snapshot (`{key: [{kind, size}]}`).
    #[arg(long, value_name = "FILE")]
    media_index: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    /// App identifier.
    key: String,

    #[arg(long, value_enum, default_value = "detailed")]
    mode: CliMode,

    /// Bypass the cache.
    #[arg(long)]
    force_refresh: bool,

    /// Per-request timeout; the configured default applies when omitted.
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Print the raw JSON breakdown instead of a summary.
    #[arg(long)]
    json: bool,

    /// Also write the JSON breakdown to this file.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[command(flatten)]
    sources: SourceArgs,
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Directory to scan.
    path: PathBuf,

    /// Maximum traversal depth (root is depth 0).
    #[arg(long)]
    max_depth: Option<usize>,

    /// Maximum number of entries to visit, directories included.
    #[arg(long)]
    max_files: Option<u64>,

    /// Optional JSON output file for the scan result.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze(args) => run_analyze_command(args),
        Commands::Scan(args) => run_scan_command(args),
        Commands::Serve(args) => run_serve_command(args),
        Commands::Config(args) => {
            let config = load_config(&args)?;
            let payload =
                serde_json::to_string_pretty(&config).context("failed to serialize config")?;
            println!("{payload}");
            Ok(())
        }
    }
}

fn load_config(args: &SourceArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &args.external_root {
        config.layout.external_data_root = Some(root.clone());
    }
    if let Some(root) = &args.obb_root {
        config.layout.obb_root = Some(root.clone());
    }
    Ok(config)
}

fn build_service(args: &SourceArgs) -> Result<AnalysisService> {
    let config = load_config(args)?;
    let paths = SourcePaths {
        packages_root: args.packages_root.clone(),
        stats_snapshot: args.stats_snapshot.clone(),
        media_index: args.media_index.clone(),
    };
    AnalysisService::from_sources(&config, &paths)
}

fn run_analyze_command(args: AnalyzeArgs) -> Result<()> {
    let service = build_service(&args.sources)?;
    let request = AnalysisRequestDto {
        key: args.key.clone(),
        mode: args.mode.into(),
        force_refresh: args.force_refresh,
        timeout_ms: args.timeout_ms,
    };

    let breakdown = match service.analyze(request) {
        Reply::Breakdown(breakdown) => breakdown,
        Reply::Error(envelope) => {
            anyhow::bail!("{} ({})", envelope.message, envelope.error)
        }
        Reply::Ack(_) => anyhow::bail!("unexpected acknowledgement for {}", args.key),
    };
    service.shutdown();

    if let Some(output) = &args.output {
        write_json(output, &breakdown)?;
        println!("Breakdown written to {}", output.display());
    }

    if args.json {
        let payload =
            serde_json::to_string_pretty(&breakdown).context("failed to serialize breakdown")?;
        println!("{payload}");
    } else {
        print_breakdown(&breakdown);
    }
    Ok(())
}

fn print_breakdown(breakdown: &StorageBreakdown) {
    let exact = breakdown.exact();
    let discovered = breakdown.discovered();
    println!(
        "{} ({:?}) at {}",
        breakdown.key(),
        breakdown.mode(),
        breakdown.scan_timestamp()
    );
    println!(
        "Exact: apk={} data={} cache={} external_cache={} total={}",
        human_bytes(exact.apk_size),
        human_bytes(exact.app_data_internal),
        human_bytes(exact.cache_internal),
        human_bytes(exact.cache_external),
        human_bytes(breakdown.total_exact())
    );
    println!(
        "Estimated: obb={} external_data={} media={} total={}",
        human_bytes(discovered.obb_size),
        human_bytes(discovered.external_data_size),
        human_bytes(breakdown.media_size()),
        human_bytes(breakdown.total_estimated())
    );
    println!(
        "  databases={} logs={} residual={}",
        human_bytes(discovered.databases_size),
        human_bytes(discovered.logs_size),
        human_bytes(discovered.residual_size)
    );
    for (name, size) in &discovered.database_breakdown {
        println!("  - {name}: {}", human_bytes(*size));
    }
    println!(
        "Combined: {} | confidence {:.2}",
        human_bytes(breakdown.total_combined()),
        breakdown.confidence_level()
    );
    for limitation in breakdown.limitations() {
        println!("Limitation: {limitation}");
    }
}

fn run_scan_command(args: ScanArgs) -> Result<()> {
    let defaults = ScanLimits::default();
    let limits = ScanLimits {
        max_depth: args.max_depth.unwrap_or(defaults.max_depth),
        max_files: args.max_files.unwrap_or(defaults.max_files),
        ..defaults
    };
    let scanner = DirectoryScanner::new(limits);
    let result = scanner.scan(&args.path, &|| false);

    info!(path = %args.path.display(), files = result.files_scanned, "scan finished");
    println!(
        "Scanned {} file(s) under {}, total {}{}.",
        result.files_scanned,
        args.path.display(),
        human_bytes(result.total_size),
        if result.limit_reached {
            " (limit reached, lower bound)"
        } else {
            ""
        }
    );
    println!(
        "databases={} logs={} images={} videos={} audio={} documents={} residual={}",
        human_bytes(result.databases_size),
        human_bytes(result.logs_size),
        human_bytes(result.images_size),
        human_bytes(result.videos_size),
        human_bytes(result.audio_size),
        human_bytes(result.documents_size),
        human_bytes(result.residual_size)
    );

    if let Some(output) = &args.output {
        write_json(output, &result)?;
        println!("Scan JSON written to {}", output.display());
    }
    Ok(())
}

fn run_serve_command(args: SourceArgs) -> Result<()> {
    let service = build_service(&args)?;
    let stdin = io::stdin();
    service.serve(stdin.lock(), BufWriter::new(io::stdout()))?;
    service.shutdown();
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    fs::write(path, payload).with_context(|| format!("failed to write {}", path.display()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout carries protocol replies in `serve`.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn human_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if value == 0 {
        return "0 B".to_string();
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{human_bytes, Cli, Commands};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn analyze_flags_parse() {
        let cli = Cli::try_parse_from([
            "app-footprint",
            "analyze",
            "com.example",
            "--mode",
            "basic",
            "--timeout-ms",
            "500",
            "--packages-root",
            "/tmp/packages",
        ])
        .expect("parse");
        let Commands::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.key, "com.example");
        assert_eq!(args.timeout_ms, Some(500));
        assert!(!args.force_refresh);
    }

    #[test]
    fn human_bytes_picks_a_unit() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(512), "512.0 B");
        assert_eq!(human_bytes(10 * 1024 * 1024), "10.0 MB");
    }
}
