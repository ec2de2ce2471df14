use anyhow::{Context, Result, bail};
use clap::Parser;
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::time::Duration;

use tessera::cli::Args;
use tessera::config::{self, AppConfig, PathConfig};
use tessera::entities::{FragmentManager, Metadata, composite, load_into, save_image};
use tessera::stitch::{RigidStitcher, StitchBudget, StitchStatus};

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }
    init_logging(&args, &path_config)?;

    info!("Tessera starting...");
    debug!("Command-line args: {:?}", args);

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::config_file(config::CONFIG_FILE, &path_config));
    info!("Config path: {}", config_path.display());
    let app_config = AppConfig::load(&config_path)?;

    // Load fragments; failures are reported, the rest still load
    let mut manager = FragmentManager::new();
    let report = load_into(&mut manager, args.input_paths());
    if report.is_partial() {
        warn!("{} of {} input(s) failed to load", report.failed.len(), report.failed.len() + report.loaded.len());
    }
    if manager.is_empty() {
        bail!("No fragment images could be loaded");
    }
    info!("Loaded {} fragment(s)", manager.len());

    if let Some(path) = &args.placements {
        let metadata = Metadata::from_json(path)
            .with_context(|| format!("Failed to read placements: {}", path.display()))?;
        let applied = manager.apply_metadata(&metadata);
        if applied < metadata.len() {
            warn!("Placements: {} of {} records matched a fragment", applied, metadata.len());
        }
        info!("Applied {} placement(s) from {}", applied, path.display());
    }

    if args.stitch {
        let stitcher = RigidStitcher::new(app_config.stitch.clone());
        let budget = StitchBudget {
            max_iterations: args.max_iterations,
            time_limit: args.time_budget_ms.map(Duration::from_millis),
            cancel: None,
        };
        let result = stitcher.stitch_manager(&mut manager, &IndexMap::new(), &budget)?;
        if result.status == StitchStatus::Degenerate {
            warn!("{}", result.summary());
        } else {
            info!("{}", result.summary());
        }
        if !result.reverted.is_empty() {
            warn!("Stitch kept the initial guess for {} fragment(s)", result.reverted.len());
        }
    }

    if let Some(path) = &args.metadata_out {
        manager
            .export_metadata()
            .to_json(path)
            .with_context(|| format!("Failed to write metadata: {}", path.display()))?;
        info!("Metadata written to {}", path.display());
    }

    if let Some(path) = &args.composite_out {
        let Some(canvas) = composite(&manager.get_all_fragments()) else {
            bail!("Nothing visible to composite");
        };
        save_image(&canvas, path)
            .with_context(|| format!("Failed to write composite: {}", path.display()))?;
        info!("Composite {}x{} written to {}", canvas.width(), canvas.height(), path.display());
    }

    if args.metadata_out.is_none() {
        // Without an output file the placements go to stdout
        println!("{}", manager.export_metadata().to_json_string()?);
    }

    Ok(())
}
