// =============================================================================
// Meridian Trader Fleet — Main Entry Point
// =============================================================================
//
// Loads the persisted fleet, starts every trader whose running flag is set,
// and drives a graceful shutdown: on Ctrl+C each trader is stopped in
// parallel under a global deadline, then the process exits cleanly.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod ai;
mod decision;
mod exchange;
mod manager;
mod notify;
mod settings;
mod signal_source;
mod store;
mod trader;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::manager::{ManagerConfig, TraderManager};
use crate::notify::Notifier;
use crate::settings::Settings;
use crate::signal_source::{SignalSourceCache, SignalSourceConfig};
use crate::store::{TraderStore, DEFAULT_USER};

/// Global deadline for stopping the fleet on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

const SETTINGS_PATH: &str = "settings.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Trader Fleet — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut settings = match Settings::load(SETTINGS_PATH) {
        Ok(settings) => settings,
        Err(e) if !std::path::Path::new(SETTINGS_PATH).exists() => {
            warn!(error = %e, "no settings file — using defaults");
            Settings::default()
        }
        // A present-but-broken settings file is a hard failure.
        Err(e) => return Err(e),
    };
    settings.apply_env();
    settings.validate()?;

    info!(
        admin_mode = settings.admin_mode,
        use_default_coins = settings.use_default_coins,
        database = %settings.database_url,
        "configuration ready"
    );

    // ── 2. Open the trader store ─────────────────────────────────────────
    let store = Arc::new(TraderStore::connect(&settings.database_url).await?);
    store.init_schema().await?;

    // ── 3. Shared signal-source cache ────────────────────────────────────
    let signal = Arc::new(SignalSourceCache::new(SignalSourceConfig::from_settings(
        &settings,
    )));

    // ── 4. Load the fleet ────────────────────────────────────────────────
    let notifier = Arc::new(Notifier::spawn());
    let manager = Arc::new(
        TraderManager::new(signal, ManagerConfig::from_settings(&settings))
            .with_notifier(notifier.clone()),
    );

    let loaded = if settings.admin_mode {
        manager.load_all(&store).await?
    } else {
        manager.load_user_traders(&store, DEFAULT_USER).await?
    };
    info!(loaded, "traders registered");

    // ── 5. Start traders flagged as running ──────────────────────────────
    manager.start_running().await;

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    manager.shutdown(SHUTDOWN_DEADLINE).await;
    notifier.shutdown().await;

    if let Err(e) = settings.save(SETTINGS_PATH) {
        warn!(error = %e, "failed to save settings on shutdown");
    }

    info!("Meridian Trader Fleet shut down complete.");
    Ok(())
}
