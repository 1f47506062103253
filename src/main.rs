//! Order Executor - Main entry point
//!
//! Config files: order-executor.toml, order-executor.yaml, config.toml
//! `--write-config PATH` writes the effective configuration (token redacted) and exits

use anyhow::Result;
use order_executor::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod app;

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let msg = format!("🛑 PANIC at {}: {}", location, info);
        eprintln!("{}", msg);
        let _ = std::fs::write(std::env::temp_dir().join("order-executor-crash.log"), format!("{}\n", msg));
        default_panic(info);
    }));

    let config = app::init::load_config()?;
    app::init::init_logging(config.log_level.as_deref().unwrap_or("info"));

    if let Some(path) = write_config_path() {
        return config.save_to_file(path);
    }

    info!("Starting Order Executor v{}", VERSION);
    info!("  Snapshot: {}", config.storage.snapshot_path.display());
    info!("  History: {}", config.storage.history_path.display());
    info!("  Stale after: {}h", config.engine.stale_after_hours);

    let cancel = CancellationToken::new();
    let components = app::init::init_components(&config, &cancel).await?;
    let mut engine = components.engine;

    let summary = engine.recover().await?;
    if summary.snapshot_corrupt {
        error!("⚠️ Position snapshot was corrupt; started with no recovered positions");
    }
    info!("Preferences: {}", components.preferences.summary().await);
    if !components.preferences.has_complete().await {
        warn!("Preferences incomplete; orders need explicit qty/capital, sl and tgt until /prefs is set");
    }

    let runner = tokio::spawn(run(
        engine,
        components.events,
        config.runner_settings(),
        cancel.clone(),
    ));
    tokio::spawn(app::console::print_notifications(components.notifications));
    tokio::spawn(app::console::run_console(
        components.handle,
        components.broker,
        components.preferences,
        components.simulation,
        cancel.clone(),
    ));

    info!("Executor initialized, waiting for commands...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    let engine = runner.await?;
    info!("Shutting down with {} tracked positions", engine.positions().count());
    Ok(())
}

fn write_config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--write-config" {
            return args.next();
        }
    }
    None
}
