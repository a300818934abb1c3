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

use clap::builder::ValueHint;
use clap_derive::Parser;
use eyre::eyre;
use figment::Figment;
use figment::providers::{Format as ProviderFormat, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use stunt_kernel::config::{CheckpointConfig, Config, NetworkConfig, RuntimeConfig};

#[derive(Parser, Debug, Serialize, Deserialize)]
pub struct Args {
    #[arg(
        long,
        value_name = "config",
        help = "Path to configuration (YAML) file to use, if any. If not specified, defaults are used. \
                Configuration file values can be overridden by command line arguments.",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    runtime_args: RuntimeArgs,

    #[command(flatten)]
    checkpoint_args: CheckpointArgs,

    #[command(flatten)]
    network_args: NetworkArgs,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    pub debug: bool,
}

#[derive(Parser, Debug, Serialize, Deserialize)]
pub struct RuntimeArgs {
    #[arg(
        long,
        value_name = "max-background-threads",
        help = "How many background threads may be running at once"
    )]
    pub max_background_threads: Option<usize>,

    #[arg(
        long,
        help = "Run background work inline on the scheduler thread instead of on threads of its own"
    )]
    pub no_background_threads: bool,

    #[arg(
        long,
        value_name = "shutdown-timeout-seconds",
        help = "How long shutdown waits for background threads before giving up on them"
    )]
    pub shutdown_timeout_seconds: Option<u64>,
}

impl RuntimeArgs {
    pub fn merge_config(&self, config: &mut RuntimeConfig) -> Result<(), eyre::Report> {
        if let Some(max) = self.max_background_threads {
            if max == 0 {
                return Err(eyre!("--max-background-threads must be at least 1"));
            }
            config.max_background_threads = max;
        }
        if self.no_background_threads {
            config.background_threading = false;
        }
        if let Some(secs) = self.shutdown_timeout_seconds {
            config.shutdown_drain_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }
}

#[derive(Parser, Debug, Serialize, Deserialize)]
pub struct CheckpointArgs {
    #[arg(
        long,
        value_name = "checkpoint-dir",
        help = "Directory checkpoints are written to, and restored from at startup",
        value_hint = ValueHint::DirPath
    )]
    pub checkpoint_dir: Option<PathBuf>,

    #[arg(
        long,
        value_name = "checkpoint-interval-seconds",
        help = "Interval in seconds between timer-triggered checkpoints"
    )]
    pub checkpoint_interval_seconds: Option<u64>,
}

impl CheckpointArgs {
    pub fn merge_config(&self, config: &mut CheckpointConfig) -> Result<(), eyre::Report> {
        if let Some(dir) = self.checkpoint_dir.as_ref() {
            config.output_path = Some(dir.clone());
        }
        if let Some(secs) = self.checkpoint_interval_seconds {
            config.interval = Some(Duration::from_secs(secs));
        }
        Ok(())
    }
}

#[derive(Parser, Debug, Serialize, Deserialize)]
pub struct NetworkArgs {
    #[arg(long, value_name = "listen", help = "Address to accept connections on")]
    pub listen: Option<String>,

    #[arg(
        long,
        value_name = "connect-timeout-seconds",
        help = "Close connections which have not logged in after this many seconds"
    )]
    pub connect_timeout_seconds: Option<u64>,
}

impl NetworkArgs {
    pub fn merge_config(&self, config: &mut NetworkConfig) -> Result<(), eyre::Report> {
        if let Some(listen) = self.listen.as_ref() {
            config.listen_address = listen.clone();
        }
        if let Some(secs) = self.connect_timeout_seconds {
            config.connect_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }
}

impl Args {
    fn merge_config(&self, mut config: Config) -> Result<Config, eyre::Report> {
        self.runtime_args.merge_config(&mut config.runtime)?;
        self.checkpoint_args.merge_config(&mut config.checkpoint)?;
        self.network_args.merge_config(&mut config.network)?;
        Ok(config)
    }

    /// Load the configuration file if we have it, then merge the arguments over it.
    pub fn load_config(&self) -> Result<Config, eyre::Report> {
        // Figment can't merge the clap args itself; they're flattened.
        let config = match self.config_file.as_ref() {
            Some(config_path) => Figment::new()
                .merge(Serialized::defaults(Config::default()))
                .merge(Yaml::file(config_path))
                .extract::<Config>()
                .map_err(|e| {
                    eyre!(
                        "Failed to parse configuration from {:?}: {}",
                        config_path,
                        e
                    )
                })?,
            None => Config::default(),
        };
        self.merge_config(config)
    }
}
