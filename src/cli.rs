//! Command-line parsing for the `elephant` binary.

use std::env;
use std::path::PathBuf;

/// What the binary should do after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve HTTP, with the ingestion scheduler unless disabled.
    Serve {
        /// Skip background ingestion.
        no_scheduler: bool,
    },
    /// Run one ingestion pass and exit.
    Once,
    /// Write a run's call history as CSV and exit.
    ExportStats {
        /// Run to export.
        run_id: String,
        /// Destination file.
        out: PathBuf,
    },
    /// Print usage and exit.
    Help,
}

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOptions {
    /// TOML configuration file; defaults apply when absent.
    pub config: Option<PathBuf>,
    /// Overrides `server.host`/`server.port`.
    pub bind: Option<String>,
    /// Selected action.
    pub command: Command,
}

/// Parses the process arguments.
///
/// # Errors
///
/// Returns a message describing the first invalid argument.
pub fn parse_args() -> Result<CliOptions, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    parse_args_from(args)
}

/// Parses `args`, excluding the program name.
///
/// # Errors
///
/// Returns a message for unknown flags, missing values, repeated flags, and
/// conflicting modes.
pub fn parse_args_from(args: Vec<String>) -> Result<CliOptions, String> {
    let mut i = 0usize;
    let mut config = None;
    let mut bind = None;
    let mut once = false;
    let mut no_scheduler = false;
    let mut export_stats = None;
    let mut out = None;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let path = args.next_or_err(i, "missing value for --config (expected a TOML file path)")?;
                if config.replace(PathBuf::from(path)).is_some() {
                    return Err("--config provided more than once".to_string());
                }
            }
            "--bind" => {
                i += 1;
                let addr = args.next_or_err(i, "missing value for --bind (expected host:port)")?;
                if bind.replace(addr.to_string()).is_some() {
                    return Err("--bind provided more than once".to_string());
                }
            }
            "--export-stats" => {
                i += 1;
                let id = args.next_or_err(i, "missing value for --export-stats (expected a run id)")?;
                if export_stats.replace(id.to_string()).is_some() {
                    return Err("--export-stats provided more than once".to_string());
                }
            }
            "--out" => {
                i += 1;
                let path = args.next_or_err(i, "missing value for --out (expected a file path)")?;
                if out.replace(PathBuf::from(path)).is_some() {
                    return Err("--out provided more than once".to_string());
                }
            }
            "--once" => once = true,
            "--no-scheduler" => no_scheduler = true,
            "--help" | "-h" => {
                return Ok(CliOptions {
                    config,
                    bind,
                    command: Command::Help,
                });
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    let command = match (export_stats, out, once) {
        (Some(_), _, true) => {
            return Err("`--once` and `--export-stats` are mutually exclusive".to_string());
        }
        (Some(run_id), Some(out), false) => Command::ExportStats { run_id, out },
        (Some(_), None, false) => return Err("--export-stats requires --out <path>".to_string()),
        (None, Some(_), _) => return Err("--out is only valid with --export-stats".to_string()),
        (None, None, true) => Command::Once,
        (None, None, false) => Command::Serve { no_scheduler },
    };

    Ok(CliOptions {
        config,
        bind,
        command,
    })
}

trait SliceArgExt {
    fn next_or_err(&self, index: usize, err: &str) -> Result<&str, String>;
}

impl SliceArgExt for [String] {
    fn next_or_err(&self, index: usize, err: &str) -> Result<&str, String> {
        self.get(index)
            .map(String::as_str)
            .ok_or_else(|| err.to_string())
    }
}

/// Prints usage to stderr.
pub fn print_usage() {
    eprintln!("elephant: carbon grid-intensity service");
    eprintln!();
    eprintln!("Usage: elephant [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>              Load configuration from a TOML file");
    eprintln!("  --bind <host:port>           Override the listen address");
    eprintln!("  --no-scheduler               Serve without background ingestion");
    eprintln!("  --once                       Run one ingestion pass and exit");
    eprintln!("  --export-stats <run_id>      Export a simulation's call history");
    eprintln!("  --out <path>                 CSV destination for --export-stats");
    eprintln!("  --help                       Show this help message");
    eprintln!();
    eprintln!("DATABASE_URL overrides database.path; RUST_LOG overrides logging.level.");
}
