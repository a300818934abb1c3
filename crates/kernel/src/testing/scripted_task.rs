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

use std::sync::{Arc, Mutex, PoisonError};

use stunt_var::Var;

use crate::tasks::background::{BackgroundRequest, WaiterContext};
use crate::tasks::task::{TaskBody, TaskContext, TaskInput, TaskResponse};

type StepFn = Box<dyn FnMut(TaskInput, &mut TaskContext) -> TaskResponse + Send>;

/// A task whose every step is a call to a closure.
pub struct ScriptedTask {
    description: String,
    step: StepFn,
}

impl ScriptedTask {
    pub fn new(
        description: &str,
        step: impl FnMut(TaskInput, &mut TaskContext) -> TaskResponse + Send + 'static,
    ) -> Self {
        Self {
            description: description.to_string(),
            step: Box::new(step),
        }
    }

    /// Runs `callback` in the background once, then completes with whatever it resumed with.
    pub fn background<F>(title: &str, argument: Var, callback: F) -> (Self, ResumeProbe)
    where
        F: FnOnce(Var, &mut WaiterContext) -> Var + Send + 'static,
    {
        let probe = ResumeProbe::default();
        let resumes = probe.clone();
        let description = title.to_string();
        let title = description.clone();
        let mut request = Some((argument, callback));
        let task = Self::new(&description, move |input, _ctx| match input {
            TaskInput::Start => match request.take() {
                Some((argument, callback)) => TaskResponse::Background(BackgroundRequest::new(
                    title.clone(),
                    argument,
                    callback,
                )),
                None => TaskResponse::Abort("started twice".to_string()),
            },
            TaskInput::Resume(value) => {
                resumes.record(value.clone());
                TaskResponse::Complete(value)
            }
        });
        (task, probe)
    }
}

impl TaskBody for ScriptedTask {
    fn step(&mut self, input: TaskInput, ctx: &mut TaskContext) -> TaskResponse {
        (self.step)(input, ctx)
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// Every value a scripted task was resumed with.
#[derive(Clone, Default)]
pub struct ResumeProbe {
    resumes: Arc<Mutex<Vec<Var>>>,
}

impl ResumeProbe {
    fn record(&self, value: Var) {
        self.resumes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }

    pub fn resumes(&self) -> Vec<Var> {
        self.resumes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
