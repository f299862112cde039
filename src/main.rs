use std::path::PathBuf;
use std::process::ExitCode;

use stamp_cache::logging::init_logging;
use stamp_cache::raster::disk;
use stamp_cache::{CacheConfig, Session};
use tracing::error;

/// Config file used when none is given on the command line
fn default_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("stamp-cache");
    path.push("config.json");
    path
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let config = match CacheConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Could not load configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut session = Session::new(config);
    session.start_flusher();

    // Opening the cache imports the bundled snapshot when it changed
    let stats = match session.cache_stats() {
        Ok(stats) => stats,
        Err(e) => {
            error!(error = %e, "Local cache unavailable");
            session.shutdown().await;
            return ExitCode::FAILURE;
        }
    };

    println!("Local cache: {}", session.config().db_path().display());
    println!("  rows:              {}", stats.rows);
    println!("  snapshot attached: {}", stats.snapshot_attached);
    println!("  rebuilt on open:   {}", stats.rebuilt);
    match stats.last_refresh {
        Some(at) => println!("  last refresh:      {}", at.to_rfc3339()),
        None => println!("  last refresh:      never"),
    }
    println!(
        "Tile cache: {} ({} bytes)",
        session.config().tile_cache_dir.display(),
        disk::disk_usage(&session.config().tile_cache_dir)
    );

    session.shutdown().await;
    ExitCode::SUCCESS
}
