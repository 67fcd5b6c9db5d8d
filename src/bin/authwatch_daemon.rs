use std::env;
use std::path::PathBuf;

use authwatch::config::Config;
use authwatch::engine::{serve, EngineError, ServeError};
use authwatch::models::Platform;

/// Main daemon entry point for the failed-login detector
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("Starting authwatch daemon...");

    // Load configuration
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let config = Config::load_or_default(&config_path);

    let Some(platform) = Platform::current() else {
        eprintln!("Unsupported operating system: {}", env::consts::OS);
        std::process::exit(1);
    };

    match serve(platform, &config) {
        Ok(stats) => {
            log::info!(
                "authwatch stopped: {} entries read, {} alerts raised",
                stats.entries,
                stats.alerts
            );
            Ok(())
        }
        Err(ServeError::Engine(e @ EngineError::Disabled(_))) => {
            log::info!("{}", e);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
