/*
 *  main.rs
 *
 *  PostBox - posts on glass
 *  (c) 2024-26 PostBox contributors
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use anyhow::Context;
use env_logger::Env;
use log::{error, info};

#[cfg(unix)] // Only compile this block on Unix-like systems
use tokio::signal::unix::{signal, SignalKind};

mod config;
mod error;
mod feed;
mod lcd;
mod supervisor;
mod text;

use supervisor::Supervisor;

include!(concat!(env!("OUT_DIR"), "/build_info.rs"));

/// Waits for SIGINT, SIGTERM, or SIGHUP and returns once any of them
/// arrives, allowing for graceful shutdown.
#[cfg(unix)]
async fn signal_handler() -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT received. Initiating graceful shutdown.");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received. Initiating graceful shutdown.");
        }
        _ = sighup.recv() => {
            info!("SIGHUP received. Initiating graceful shutdown.");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load().context("failed to load configuration")?;

    // Initialize the logger with the configured level
    let default_level = cfg.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    info!("{} - posts on glass", env!("CARGO_PKG_NAME"));
    info!("v.{} built {}", env!("CARGO_PKG_VERSION"), BUILD_DATE);

    let supervisor = Supervisor::new(cfg)?;

    tokio::select! {
        // Handle Unix signals for graceful shutdown
        _ = signal_handler() => {
            info!("Main application exiting.");
        }

        // The supervisor runs until the consecutive-error threshold or
        // a fatal auth rejection gives up on the device.
        code = supervisor.run() => {
            error!("supervisor terminated");
            log::logger().flush();
            std::process::exit(code);
        }
    }

    Ok(())
}
