// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use crate::args::Args;
use crate::listener::Listener;
use clap::Parser;
use eyre::{Report, eyre};
use mimalloc::MiMalloc;
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR2};
use std::time::Duration;
use stunt_common::tracing;
use stunt_kernel::{NoopDatabase, Scheduler};
use tokio::sync::watch;
use ::tracing::{info, warn};

mod args;
mod listener;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Host for the stunt runtime.
///   * Restores the newest checkpoint, if any
///   * Accepts line-oriented TCP connections
///   * Runs the scheduler until a signal asks it to stop
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let args = Args::parse();
    tracing::init_tracing(args.debug).map_err(|e| eyre!("Unable to configure logging: {}", e))?;

    let config = args.load_config()?;
    info!(
        max_background_threads = config.runtime.max_background_threads,
        threading = config.runtime.background_threading,
        checkpoints = ?config.checkpoint.output_path,
        "Configuration loaded"
    );

    let mut scheduler = Scheduler::new(config.clone(), Box::new(NoopDatabase {}));

    let coordinator = scheduler.coordinator().clone();
    signal_hook::flag::register(SIGUSR2, coordinator.signal_flag())?;
    signal_hook::flag::register(SIGINT, coordinator.shutdown_flag())?;
    signal_hook::flag::register(SIGTERM, coordinator.shutdown_flag())?;

    match scheduler.restore_latest() {
        Ok(Some(summary)) => info!(
            pending_finalization = summary.pending_finalization,
            in_flight = summary.in_flight,
            "Restored from checkpoint"
        ),
        Ok(None) => info!("Starting without a checkpoint"),
        Err(e) => return Err(eyre!("Unable to restore from checkpoint: {}", e)),
    }

    // Connections live on the runtime; the scheduler keeps the main thread.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("stunt-net")
        .build()?;
    let listener = runtime
        .block_on(Listener::bind(&config.network.listen_address))
        .map_err(|e| {
            eyre!(
                "Unable to listen on {}: {}",
                config.network.listen_address,
                e
            )
        })?;
    let (terminate_send, terminate_receive) = watch::channel(false);
    let listen_loop = runtime.spawn(listener.run(scheduler.sessions().clone(), terminate_receive));

    let report = scheduler.run();
    let _ = terminate_send.send(true);
    if let Err(e) = runtime.block_on(listen_loop) {
        warn!(?e, "Listener task failed");
    }
    runtime.shutdown_timeout(Duration::from_secs(1));

    if report.timed_out {
        warn!(
            outstanding_threads = report.outstanding_threads,
            "Shut down with background threads still running"
        );
    }
    info!(
        resumed_during_drain = report.resumed_during_drain,
        final_checkpoint = ?report.final_checkpoint,
        sessions_held = report.sessions_held,
        "Done."
    );
    Ok(())
}
