use std::process::ExitCode;

use tracing::{error, info};

use rapidstore::{Config, StorageService};

/// One-shot maintenance run: soft-delete expired files, then erase the blobs
/// of deleted files. Meant to be scheduled externally.
#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    // Load configuration
    let config = match Config::load_with_env(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {config_path}: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = rapidstore::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        rapidstore::logging::init_console_only(&config.logging.level);
    }

    info!("rapidstore maintenance sweep");

    let service = match StorageService::open(&config).await {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to open storage: {e}");
            return ExitCode::FAILURE;
        }
    };

    match service.process_set_to_delete_files().await {
        Ok(swept) => info!("Marked {swept} expired files as deleted"),
        Err(e) => {
            error!("Expiry sweep failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    match service.remove_deleted_files().await {
        Ok(report) => {
            info!(
                "Examined {} deleted files: {} erased, {} already missing, {} failed",
                report.examined, report.erased, report.missing, report.failed
            );
            if report.failed > 0 {
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("Blob sweep failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
