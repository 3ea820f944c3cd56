// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bluetooth Basic bridge
//!
//! Serves the session gateway as JSON lines on stdin/stdout. Logs go to
//! stderr.

use anyhow::{bail, Result};
use bluetooth_basic::bluetooth::{BluerBackend, BluetoothBackend, GrantedPermissions};
use bluetooth_basic::bridge::Bridge;
use bluetooth_basic::config::Config;
use bluetooth_basic::gateway::Gateway;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = match config_path()? {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };

    // Initialize logging, RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("bluetooth_basic=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Starting Bluetooth Basic v{}...", env!("CARGO_PKG_VERSION"));

    let backend: Option<Arc<dyn BluetoothBackend>> = match BluerBackend::new(&config.bluetooth).await {
        Ok(backend) => {
            info!("Bluetooth adapter ready");
            Some(Arc::new(backend))
        }
        Err(e) => {
            warn!("Bluetooth unavailable: {:#}", e);
            None
        }
    };

    let gateway = Gateway::new(backend, Arc::new(GrantedPermissions), &config.session);
    let bridge = Bridge::new(gateway);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    bridge
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), shutdown)
        .await?;

    info!("Goodbye");
    Ok(())
}

/// `--config <path>` from the command line, if given.
fn config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--config") => match args.next() {
            Some(path) => Ok(Some(PathBuf::from(path))),
            None => bail!("--config needs a path"),
        },
        Some(other) => bail!("unknown argument: {}", other),
    }
}
