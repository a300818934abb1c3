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

//! Test doubles for the kernel: a recording transport, a database whose finalizers can be made
//! to fail, and task bodies scripted from closures.

mod mock_database;
mod mock_transport;
mod scripted_task;

pub use mock_database::{DatabaseProbe, FinalizerBehavior, MockDatabase};
pub use mock_transport::{MockTransport, TransportProbe};
pub use scripted_task::{ResumeProbe, ScriptedTask};
