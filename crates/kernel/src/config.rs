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

//! Config is created by the host daemon, and passed through the scheduler, whereupon it is
//! available to all components. Used to hold things typically configured by CLI flags, etc.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub checkpoint: CheckpointConfig,
    pub network: NetworkConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How many background (off-scheduler) threads may be live at once.
    pub max_background_threads: usize,
    /// When false, background requests are run inline on the scheduler thread.
    pub background_threading: bool,
    /// How long shutdown waits for background threads to finish before giving up on them.
    pub shutdown_drain_timeout: Duration,
    pub shutdown_poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_background_threads: 20,
            background_threading: true,
            shutdown_drain_timeout: Duration::from_secs(30),
            shutdown_poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Where checkpoints are written and restored from. No directory, no checkpoints.
    pub output_path: Option<PathBuf>,
    /// Time between timer-triggered checkpoints.
    pub interval: Option<Duration>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_address: String,
    /// Connections which have not logged in within this long are closed by the sweep.
    pub connect_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:7777".to_string(),
            connect_timeout: Duration::from_secs(300),
        }
    }
}
