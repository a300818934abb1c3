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

pub use crate::config::Config;
pub use crate::db::{Database, NoopDatabase};
pub use crate::tasks::scheduler::{Scheduler, SchedulerStats, ShutdownReport};
pub use crate::tasks::scheduler_client::SchedulerClient;
pub use stunt_common::tasks::TaskId;

pub mod builtins;
pub mod config;
pub mod db;
pub mod tasks;

pub mod testing;
