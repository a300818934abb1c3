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

use std::time::Duration;

use flume::Sender;
use stunt_common::tasks::{SchedulerError, TaskId};
use stunt_var::Obj;

use crate::tasks::TaskHandle;
use crate::tasks::background::WaiterInfo;
use crate::tasks::finalization::FinalizationStats;
use crate::tasks::sessions::SessionId;
use crate::tasks::task::TaskBody;

/// Checkpoints write the whole database, so callers wait longer for them.
const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(60);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A handle for talking to the scheduler from the outside world.
/// This is not meant to be used by running tasks, but by the daemon, tests, etc.
#[derive(Clone)]
pub struct SchedulerClient {
    pub(crate) scheduler_sender: Sender<SchedulerClientMsg>,
}

impl SchedulerClient {
    pub fn new(scheduler_sender: Sender<SchedulerClientMsg>) -> Self {
        Self { scheduler_sender }
    }

    /// Submit a task to run on behalf of `player`, optionally attached to a connection.
    pub fn submit_task(
        &self,
        player: Obj,
        session: Option<SessionId>,
        body: Box<dyn TaskBody>,
    ) -> Result<TaskHandle, SchedulerError> {
        let (reply, receive) = oneshot::channel();
        self.send(SchedulerClientMsg::SubmitTask {
            player,
            session,
            body,
            reply,
        })?;
        receive
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| SchedulerError::SchedulerNotResponding)?
    }

    pub fn kill_task(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        let (reply, receive) = oneshot::channel();
        self.send(SchedulerClientMsg::KillTask { task_id, reply })?;
        receive
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| SchedulerError::SchedulerNotResponding)?
    }

    /// Request a checkpoint and wait for it to be written.
    pub fn request_checkpoint(&self) -> Result<(), SchedulerError> {
        let (reply, receive) = oneshot::channel();
        self.send(SchedulerClientMsg::Checkpoint { reply })?;
        receive
            .recv_timeout(CHECKPOINT_TIMEOUT)
            .map_err(|_| SchedulerError::SchedulerNotResponding)?
    }

    /// Ask the scheduler to shut down. Returns once the request has been accepted, not once
    /// shutdown has finished.
    pub fn submit_shutdown(&self, message: Option<&str>) -> Result<(), SchedulerError> {
        let (reply, receive) = oneshot::channel();
        self.send(SchedulerClientMsg::Shutdown {
            message: message.map(str::to_string),
            reply,
        })?;
        receive
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| SchedulerError::SchedulerNotResponding)?
    }

    pub fn background_threads(&self) -> Result<Vec<WaiterInfo>, SchedulerError> {
        let (reply, receive) = oneshot::channel();
        self.send(SchedulerClientMsg::BackgroundThreads { reply })?;
        receive
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| SchedulerError::SchedulerNotResponding)
    }

    pub fn finalization_stats(&self) -> Result<FinalizationStats, SchedulerError> {
        let (reply, receive) = oneshot::channel();
        self.send(SchedulerClientMsg::FinalizationStats { reply })?;
        receive
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| SchedulerError::SchedulerNotResponding)
    }

    fn send(&self, msg: SchedulerClientMsg) -> Result<(), SchedulerError> {
        self.scheduler_sender
            .send(msg)
            .map_err(|_| SchedulerError::SchedulerNotResponding)
    }
}

pub enum SchedulerClientMsg {
    /// Start a new task.
    SubmitTask {
        player: Obj,
        session: Option<SessionId>,
        body: Box<dyn TaskBody>,
        reply: oneshot::Sender<Result<TaskHandle, SchedulerError>>,
    },
    /// Kill a task, whether it is ready to run or parked on a background thread.
    KillTask {
        task_id: TaskId,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// Checkpoint, replying once the checkpoint file is in place.
    Checkpoint {
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    Shutdown {
        message: Option<String>,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    BackgroundThreads {
        reply: oneshot::Sender<Vec<WaiterInfo>>,
    },
    FinalizationStats {
        reply: oneshot::Sender<FinalizationStats>,
    },
}
