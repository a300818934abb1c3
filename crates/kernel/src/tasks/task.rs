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

use std::sync::Arc;

use stunt_common::tasks::TaskId;
use stunt_var::{Obj, Var};

use crate::tasks::background::{BackgroundGateway, BackgroundRequest};
use crate::tasks::checkpoint::CheckpointCoordinator;
use crate::tasks::finalization::FinalizationQueue;
use crate::tasks::sessions::{SessionId, SessionRegistry};

pub enum TaskInput {
    Start,
    /// The result of the background request the task last returned.
    Resume(Var),
}

pub enum TaskResponse {
    Complete(Var),
    /// The task raised, or otherwise gave up.
    Abort(String),
    /// Park the task until this has run; it will be stepped again with `TaskInput::Resume`.
    Background(BackgroundRequest),
}

/// A unit of cooperatively scheduled work. The scheduler steps it until it completes.
pub trait TaskBody: Send {
    fn step(&mut self, input: TaskInput, ctx: &mut TaskContext) -> TaskResponse;

    fn describe(&self) -> String {
        "task".to_string()
    }
}

/// Requests a running task makes of the scheduler, acted on once its step returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TaskAction {
    Kill(TaskId),
}

pub struct TaskContext<'a> {
    pub task_id: TaskId,
    pub player: Obj,
    pub session: Option<SessionId>,
    pub gateway: &'a Arc<BackgroundGateway>,
    pub sessions: &'a Arc<SessionRegistry>,
    pub finalizers: &'a Arc<FinalizationQueue>,
    pub coordinator: &'a Arc<CheckpointCoordinator>,
    pub(crate) actions: &'a mut Vec<TaskAction>,
    pub(crate) next_object_id: &'a mut u64,
    pub(crate) task_owner: &'a dyn Fn(TaskId) -> Option<Obj>,
    pub(crate) wizards: &'a dyn Fn(Obj) -> bool,
}

impl TaskContext<'_> {
    pub fn is_wizard(&self, player: Obj) -> bool {
        (self.wizards)(player)
    }

    /// The player a task runs on behalf of, if there is such a task.
    pub fn task_owner(&self, task_id: TaskId) -> Option<Obj> {
        (self.task_owner)(task_id)
    }

    /// Kill `task_id` once this step returns. False if there is no such task.
    pub fn kill_task(&mut self, task_id: TaskId) -> bool {
        if self.task_owner(task_id).is_none() {
            return false;
        }
        self.actions.push(TaskAction::Kill(task_id));
        true
    }

    /// Ids for anonymous objects and waifs.
    pub fn new_object_id(&mut self) -> u64 {
        *self.next_object_id += 1;
        *self.next_object_id
    }
}
