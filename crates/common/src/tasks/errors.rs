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

use crate::tasks::TaskId;
use strum::Display;
use stunt_var::{E_EXEC, E_QUOTA, ErrorCode, Var, v_error_map};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler not responding")]
    SchedulerNotResponding,
    #[error("Task not found: {0:?}")]
    TaskNotFound(TaskId),
    #[error("Could not start task (internal error)")]
    CouldNotStartTask,
    #[error("Task aborted due to error.")]
    TaskAbortedError,
    #[error("Task aborted due to cancellation.")]
    TaskAbortedCancelled,
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Checkpoint failed: {0}")]
    CheckpointFailed(String),
}

/// Why a request to run work off the scheduler thread was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackgroundError {
    #[error("Too many background threads ({live} live, maximum {max})")]
    TooManyThreads { live: usize, max: usize },
    #[error("Could not start background thread: {0}")]
    SpawnFailed(String),
    #[error("Server is shutting down; no new background work accepted")]
    ShuttingDown,
    #[error("Task {0} is already waiting on a background thread")]
    TaskAlreadyWaiting(TaskId),
}

impl BackgroundError {
    /// Cap reached and OS refusal are reported identically to MOO code.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            BackgroundError::TooManyThreads { .. } | BackgroundError::SpawnFailed(_)
        )
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            BackgroundError::TooManyThreads { .. }
            | BackgroundError::SpawnFailed(_)
            | BackgroundError::ShuttingDown => E_QUOTA,
            BackgroundError::TaskAlreadyWaiting(_) => E_EXEC,
        }
    }

    pub fn to_error_map(&self) -> Var {
        v_error_map(self.error_code(), &self.to_string())
    }
}

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum CheckpointReason {
    Timer,
    Signal,
    Explicit,
    Shutdown,
}
