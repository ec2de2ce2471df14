use clap::Parser;
use log::warn;
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Images: image 0.25 (PNG, JPEG, TIFF, TGA, BMP)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Rigid stitching of scanned tissue fragments
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Fragment images or glob patterns (e.g. "scans/*.png")
    #[arg(value_name = "IMAGE", required = true)]
    pub inputs: Vec<String>,

    /// Initial placements: metadata JSON from a previous run
    #[arg(short = 'p', long = "placements", value_name = "JSON")]
    pub placements: Option<PathBuf>,

    /// Refine placements by overlap alignment
    #[arg(short = 's', long = "stitch")]
    pub stitch: bool,

    /// Stitch iteration cap (overrides config)
    #[arg(long = "max-iterations", value_name = "N")]
    pub max_iterations: Option<usize>,

    /// Stitch wall-time budget in milliseconds
    #[arg(long = "time-budget-ms", value_name = "MS")]
    pub time_budget_ms: Option<u64>,

    /// Write fragment metadata JSON here
    #[arg(short = 'm', long = "metadata-out", value_name = "JSON")]
    pub metadata_out: Option<PathBuf>,

    /// Write the composited canvas here (format by extension)
    #[arg(short = 'o', long = "composite-out", value_name = "IMAGE")]
    pub composite_out: Option<PathBuf>,

    /// Configuration file (default: tessera.json in the config directory)
    #[arg(long = "config", value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Enable debug logging to file (default: tessera.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Args {
    /// Expand glob patterns; plain paths pass through in order.
    ///
    /// A pattern matching nothing is kept verbatim so the loader reports it.
    pub fn input_paths(&self) -> Vec<PathBuf> {
        self.inputs.iter().flat_map(|input| expand_input(input)).collect()
    }
}

fn expand_input(input: &str) -> Vec<PathBuf> {
    if !input.contains(['*', '?', '[']) {
        return vec![PathBuf::from(input)];
    }
    match glob::glob(input) {
        Ok(entries) => {
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| match entry {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!("Glob {}: {}", input, e);
                        None
                    }
                })
                .filter(|p| p.is_file())
                .collect();
            if paths.is_empty() {
                warn!("Pattern matched no files: {}", input);
                paths.push(PathBuf::from(input));
            }
            paths
        }
        Err(e) => {
            warn!("Invalid glob pattern {}: {}", input, e);
            vec![PathBuf::from(input)]
        }
    }
}
