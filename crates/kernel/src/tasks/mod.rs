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

use stunt_common::tasks::{SchedulerError, TaskId};
use stunt_var::{Obj, Var};

pub mod background;
pub mod checkpoint;
pub mod finalization;
pub mod scheduler;
pub mod scheduler_client;
pub mod sessions;
pub mod task;

/// Returned on submission; resolves when the task completes or is aborted.
pub struct TaskHandle(TaskId, oneshot::Receiver<Result<Var, SchedulerError>>);

impl TaskHandle {
    pub fn new(task_id: TaskId, receiver: oneshot::Receiver<Result<Var, SchedulerError>>) -> Self {
        Self(task_id, receiver)
    }

    pub fn task_id(&self) -> TaskId {
        self.0
    }

    pub fn receiver(&self) -> &oneshot::Receiver<Result<Var, SchedulerError>> {
        &self.1
    }

    pub fn into_receiver(self) -> oneshot::Receiver<Result<Var, SchedulerError>> {
        self.1
    }
}

/// External interface description of a task, for the purpose of task listings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TaskDescription {
    pub task_id: TaskId,
    pub player: Obj,
    pub description: String,
    pub status: String,
}
