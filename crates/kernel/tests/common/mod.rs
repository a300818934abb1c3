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

//! Helpers shared by the scheduler scenario tests.

#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use stunt_kernel::config::{CheckpointConfig, Config, RuntimeConfig};
use stunt_kernel::testing::{DatabaseProbe, FinalizerBehavior, MockDatabase};
use stunt_kernel::Scheduler;

pub fn test_config(max_background_threads: usize, checkpoint_dir: Option<&Path>) -> Config {
    Config {
        runtime: RuntimeConfig {
            max_background_threads,
            shutdown_drain_timeout: Duration::from_secs(10),
            shutdown_poll_interval: Duration::from_millis(5),
            ..Default::default()
        },
        checkpoint: CheckpointConfig {
            output_path: checkpoint_dir.map(Path::to_path_buf),
            interval: None,
        },
        ..Default::default()
    }
}

pub fn test_scheduler(config: Config, behavior: FinalizerBehavior) -> (Scheduler, DatabaseProbe) {
    let (database, probe) = MockDatabase::new(behavior);
    (Scheduler::new(config, Box::new(database)), probe)
}

/// Step the scheduler until `done` holds, failing the test if that takes too long.
pub fn run_until(scheduler: &mut Scheduler, mut done: impl FnMut(&Scheduler) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(scheduler) {
        assert!(Instant::now() < deadline, "scheduler did not reach the expected state");
        scheduler.run_once();
    }
}

/// Wait, without stepping the scheduler, for background threads to report back.
pub fn wait_for_threads(scheduler: &Scheduler, live: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while scheduler.gateway().live_waiters() != live {
        assert!(Instant::now() < deadline, "background threads did not finish");
        std::thread::sleep(Duration::from_millis(1));
    }
}
