use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};
use fedsim_core::{init_tracing, load_config};

mod federation;

use federation::FederationModule;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("fedsim")?;
    info!("fedsim starting");

    let cfg = load_config("fedsim")?;
    info!(?cfg, "config_loaded");

    let stop = Arc::new(AtomicBool::new(false));
    let module = FederationModule::new(cfg, Arc::clone(&stop))?;
    let mut search = tokio::task::spawn_blocking(move || module.run());

    // Ctrl-C lets the running round finish, then stops at the next boundary.
    let summary = tokio::select! {
        res = &mut search => res??,
        _ = signal::ctrl_c() => {
            warn!("shutdown_requested");
            stop.store(true, Ordering::Relaxed);
            search.await??
        }
    };

    let best = summary.best.as_ref().and_then(|r| r.best_accuracy);
    info!(trials = summary.trials_run, ?best, "shutdown");
    Ok(())
}
