//! Stats Report - print a snapshot's validation statistics
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin stats_report -- <snapshot_id> [network_acronym] [filter...]
//! ```
//!
//! Filters use `field:value` or `field@@value`, e.g. `is_valid:false` or
//! `invalid_rules@@12`. The aggregate is printed to stdout as JSON.
//!
//! ## Environment Variables
//!
//! - STORE_BASEPATH - Storage root (default: /tmp/data/)
//! - VALIDATION_CURSOR_PAGE_SIZE - Rows per cursor page (default: 1000)
//! - RUST_LOG - Logging level (optional, default: info)

use snapshot_validation_stats::{ErrorClass, StaticNetworkResolver, StatsConfig, ValidationStatsService};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;

fn usage() -> ExitCode {
    eprintln!("usage: stats_report <snapshot_id> [network_acronym] [filter...]");
    ExitCode::from(2)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(snapshot_id) = args.first().and_then(|raw| raw.parse::<i64>().ok()) else {
        return usage();
    };

    // Second argument is the network unless it already looks like a filter
    let (acronym, filters) = match args.get(1) {
        Some(arg) if !arg.contains(':') && !arg.contains("@@") => (Some(arg.clone()), &args[2..]),
        _ => (None, &args[1..]),
    };

    let resolver = match acronym {
        Some(acronym) => StaticNetworkResolver::with_default(acronym),
        None => StaticNetworkResolver::new(),
    };
    let config = StatsConfig::from_env();
    log::info!("📊 Stats report for snapshot {}", snapshot_id);
    log::info!("   Storage root: {}", config.base_path.display());

    let service = ValidationStatsService::new(config, Arc::new(resolver));
    let outcome = service.query_aggregated_stats(snapshot_id, filters);
    if let Err(e) = service.shutdown() {
        log::warn!("⚠️  Shutdown: {}", e);
    }

    match outcome {
        Ok(stats) => match serde_json::to_string_pretty(&stats) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("❌ Failed to serialize stats: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            log::error!("❌ {}", e);
            match e.class() {
                ErrorClass::NoStatistics => ExitCode::from(3),
                ErrorClass::ClientError => ExitCode::from(2),
                ErrorClass::ServerError => ExitCode::FAILURE,
            }
        }
    }
}
