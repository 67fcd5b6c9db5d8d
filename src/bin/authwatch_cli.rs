use std::path::PathBuf;
use structopt::StructOpt;

use authwatch::config::Config;
use authwatch::detection::PatternExtractor;
use authwatch::engine::{serve, EngineError, ServeError};
use authwatch::input::event_log::{SecurityRecord, FAILED_LOGON_EVENT_ID};
use authwatch::input::journal::decode_record;
use authwatch::input::EventXmlParser;
use authwatch::models::{Cursor, LogEntry, Platform};
use authwatch::preflight::checker_for;

/// authwatch command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "authwatch", about = "Failed-login detector CLI")]
pub enum Cli {
    /// Run the detection loop until interrupted
    Run {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Validate the configuration and the log source permissions
    Check {
        /// Path to configuration file
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Extract failed logins from an exported log
    Extract {
        /// Journal JSON export, plain sshd log, or `wevtutil qe Security /f:xml` export
        #[structopt(short, long)]
        file: PathBuf,
        /// Treat the file as a Windows security log export
        #[structopt(long)]
        windows: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let cli = Cli::from_args();

    match cli {
        Cli::Run { config } => {
            if !config.exists() {
                eprintln!("Configuration file not found: {:?}", config);
                eprintln!("Run 'authwatch config' to generate a default configuration");
                std::process::exit(1);
            }
            let config = Config::from_file(&config)?;

            let Some(platform) = Platform::current() else {
                eprintln!("Unsupported operating system: {}", std::env::consts::OS);
                std::process::exit(1);
            };

            match serve(platform, &config) {
                Ok(stats) => println!(
                    "Stopped: {} entries read, {} alerts raised",
                    stats.entries, stats.alerts
                ),
                Err(ServeError::Engine(e @ EngineError::Disabled(_))) => println!("{}", e),
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
        }
        Cli::Check { config } => {
            let config = if config.exists() {
                Config::from_file(&config)?
            } else {
                println!("Configuration file not found: {:?}, using defaults", config);
                Config::default()
            };
            println!("Configuration loaded successfully");

            let Some(platform) = Platform::current() else {
                eprintln!("Unsupported operating system: {}", std::env::consts::OS);
                std::process::exit(1);
            };
            if !config.detection.platform_enabled(platform) {
                println!("{} detection is disabled", platform);
                return Ok(());
            }
            match checker_for(platform, &config.detection).check() {
                Ok(()) => println!("{} log source is readable", platform),
                Err(e) => {
                    eprintln!("Pre-flight check failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Cli::Extract { file, windows } => {
            if !file.exists() {
                eprintln!("File not found: {:?}", file);
                std::process::exit(1);
            }
            let contents = std::fs::read_to_string(&file)?;
            let entries = if windows {
                windows_entries(&contents)
            } else {
                journal_entries(&contents)
            };

            let platform = if windows { Platform::Windows } else { Platform::Linux };
            let extractor = PatternExtractor::new(platform);
            let events: Vec<_> = entries.iter().filter_map(|e| extractor.extract(e)).collect();

            println!("Read {} entries, {} failed login(s):\n", entries.len(), events.len());
            for event in events {
                println!("  [{}] {}", event.observed_at.to_rfc3339(), event.summary());
            }
        }
    }

    Ok(())
}

/// Lines of `journalctl -o json` output or of a plain text log
fn journal_entries(contents: &str) -> Vec<LogEntry> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| match decode_record(line) {
            Ok((_, entry)) => entry,
            Err(_) => LogEntry {
                raw_message: line.to_string(),
                fields: None,
                sequence_token: Cursor::Record(number as u64 + 1),
                received_at: chrono::Utc::now(),
            },
        })
        .collect()
}

fn windows_entries(contents: &str) -> Vec<LogEntry> {
    EventXmlParser::new()
        .parse_all(contents)
        .into_iter()
        .filter(|record| record.event_id == FAILED_LOGON_EVENT_ID)
        .map(SecurityRecord::into_entry)
        .collect()
}
