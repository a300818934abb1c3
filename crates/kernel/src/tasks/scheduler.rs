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

//! The cooperative scheduler. One thread steps every task; background threads, connections and
//! clients talk to it over channels and the shared registries, and it polls them once per tick.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use flume::{Receiver, Sender};
use indexmap::IndexMap;
use minstant::Instant;
use stunt_common::tasks::{CheckpointReason, SchedulerError, TaskId};
use stunt_var::{NOTHING, Obj, Pinned, SYSTEM_OBJECT, Var};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::tasks::background::{
    BackgroundCompletion, BackgroundGateway, Suspension, TaskEnumAction, WaiterHandle,
};
use crate::tasks::checkpoint::{
    CheckpointCoordinator, CheckpointError, RestoreSummary, latest_checkpoint, load_checkpoint,
    write_checkpoint,
};
use crate::tasks::finalization::{FinalizationQueue, FinalizerDispatch, FinalizerError};
use crate::tasks::scheduler_client::{SchedulerClient, SchedulerClientMsg};
use crate::tasks::sessions::{CloseReason, SessionId, SessionRegistry};
use crate::tasks::task::{TaskAction, TaskBody, TaskContext, TaskInput, TaskResponse};
use crate::tasks::{TaskDescription, TaskHandle};

const SCHEDULER_TICK_TIME: Duration = Duration::from_millis(5);

/// Turns a line of connection input into a task.
pub type CommandParser = Box<dyn Fn(&str) -> Result<Box<dyn TaskBody>, String> + Send>;

type TaskReply = oneshot::Sender<Result<Var, SchedulerError>>;

/// Scheduler-side per-task record.
struct Task {
    player: Obj,
    session: Option<SessionId>,
    description: String,
    /// Taken out while the task is being stepped.
    body: Option<Box<dyn TaskBody>>,
    /// Set while parked on a background thread.
    waiting: Option<WaiterHandle>,
    reply: Option<TaskReply>,
}

enum StepOutcome {
    Finished(Result<Var, String>),
    Parked,
    Gone,
}

enum Event {
    Client(SchedulerClientMsg),
    Completion(BackgroundCompletion),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SchedulerStats {
    pub started: usize,
    pub completed: usize,
    pub aborted: usize,
    pub killed: usize,
    /// Tasks resumed with a background thread's result.
    pub resumed: usize,
    /// Of those, how many were resumed while shutdown was draining.
    pub resumed_during_drain: usize,
    /// Background results thrown away because their task had been killed.
    pub discarded: usize,
    pub checkpoints: usize,
    pub checkpoint_failures: usize,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShutdownReport {
    /// Background threads were still running when the drain timeout ran out.
    pub timed_out: bool,
    pub outstanding_threads: usize,
    pub resumed_during_drain: usize,
    pub final_checkpoint: Option<PathBuf>,
    /// Connections that could not be closed because something still held them.
    pub sessions_held: usize,
}

/// Responsible for the dispatching, control, and accounting of tasks in the system.
/// There should be only one scheduler per server.
pub struct Scheduler {
    config: Arc<Config>,
    database: Box<dyn Database>,
    gateway: Arc<BackgroundGateway>,
    completions: Receiver<BackgroundCompletion>,
    sessions: Arc<SessionRegistry>,
    finalizers: Arc<FinalizationQueue>,
    coordinator: Arc<CheckpointCoordinator>,
    command_parser: CommandParser,
    client_sender: Sender<SchedulerClientMsg>,
    client_receiver: Receiver<SchedulerClientMsg>,

    tasks: IndexMap<TaskId, Task>,
    ready: VecDeque<(TaskId, TaskInput)>,
    next_task_id: TaskId,
    next_object_id: u64,
    stats: SchedulerStats,
    draining: bool,
}

impl Scheduler {
    pub fn new(config: Config, database: Box<dyn Database>) -> Self {
        let (gateway, completions) = BackgroundGateway::new(&config.runtime);
        Self::with_gateway(config, database, gateway, completions)
    }

    /// As `new`, with a gateway built by the caller (e.g. with its own thread starter).
    pub fn with_gateway(
        config: Config,
        database: Box<dyn Database>,
        gateway: Arc<BackgroundGateway>,
        completions: Receiver<BackgroundCompletion>,
    ) -> Self {
        let (client_sender, client_receiver) = flume::unbounded();
        let next_object_id = database.max_object_id();
        Self {
            sessions: Arc::new(SessionRegistry::new(&config.network)),
            coordinator: Arc::new(CheckpointCoordinator::new(&config.checkpoint)),
            finalizers: FinalizationQueue::new(),
            config: Arc::new(config),
            database,
            gateway,
            completions,
            command_parser: Box::new(crate::builtins::parse_command),
            client_sender,
            client_receiver,
            tasks: IndexMap::new(),
            ready: VecDeque::new(),
            next_task_id: 0,
            next_object_id,
            stats: SchedulerStats::default(),
            draining: false,
        }
    }

    pub fn with_command_parser(mut self, parser: CommandParser) -> Self {
        self.command_parser = parser;
        self
    }

    pub fn client(&self) -> SchedulerClient {
        SchedulerClient::new(self.client_sender.clone())
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<BackgroundGateway> {
        &self.gateway
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn finalizers(&self) -> &Arc<FinalizationQueue> {
        &self.finalizers
    }

    pub fn coordinator(&self) -> &Arc<CheckpointCoordinator> {
        &self.coordinator
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Restore from the newest checkpoint in the configured directory, if there is one.
    pub fn restore_latest(&mut self) -> Result<Option<RestoreSummary>, CheckpointError> {
        let Some(dir) = self.config.checkpoint.output_path.clone() else {
            return Ok(None);
        };
        let Some(path) = latest_checkpoint(&dir)? else {
            info!(?dir, "No checkpoint to restore from");
            return Ok(None);
        };
        let summary = load_checkpoint(&path, self.database.as_mut(), &self.finalizers)?;
        // Restored values keep their ids; new ones must not collide with them.
        let queued = self.finalizers.summary().iter().map(|e| e.id).max();
        let highest = queued
            .unwrap_or_default()
            .max(self.database.max_object_id());
        self.next_object_id = self.next_object_id.max(highest);
        Ok(Some(summary))
    }

    /// Submit a task directly, from the scheduler's own thread.
    pub fn submit_task(
        &mut self,
        player: Obj,
        session: Option<SessionId>,
        body: Box<dyn TaskBody>,
    ) -> Result<TaskHandle, SchedulerError> {
        if self.draining || self.coordinator.is_shutdown_requested() {
            return Err(SchedulerError::ShuttingDown);
        }
        let (reply, receiver) = oneshot::channel();
        let task_id = self.create_task(player, session, body, Some(reply));
        self.ready.push_back((task_id, TaskInput::Start));
        Ok(TaskHandle::new(task_id, receiver))
    }

    /// Kill a task. A parked task's background thread keeps running, but its result is dropped.
    pub fn kill_task(&mut self, task_id: TaskId) -> Result<(), SchedulerError> {
        let Some(task) = self.tasks.shift_remove(&task_id) else {
            return Err(SchedulerError::TaskNotFound(task_id));
        };
        let waiters = self.gateway.kill_task(task_id);
        let mut discarded = 0;
        self.ready.retain(|(id, input)| {
            if *id != task_id {
                return true;
            }
            if matches!(input, TaskInput::Resume(_)) {
                discarded += 1;
            }
            false
        });
        self.stats.discarded += discarded;
        self.stats.killed += 1;
        info!(task_id, waiters, discarded, description = %task.description, "Task killed");
        if let Some(reply) = task.reply {
            let _ = reply.send(Err(SchedulerError::TaskAbortedCancelled));
        }
        Ok(())
    }

    /// Offer every task parked on a background thread to `f`, killing the ones it asks to.
    pub fn kill_matching(&mut self, f: impl FnMut(TaskId, &str) -> TaskEnumAction) -> usize {
        let victims = self.gateway.enumerate(f);
        victims
            .into_iter()
            .filter(|task_id| self.kill_task(*task_id).is_ok())
            .count()
    }

    pub fn tasks(&self) -> Vec<TaskDescription> {
        let mut statuses = AHashMap::new();
        self.gateway.enumerate(|task_id, status| {
            statuses.insert(task_id, status.to_string());
            TaskEnumAction::Continue
        });
        self.tasks
            .iter()
            .map(|(task_id, task)| TaskDescription {
                task_id: *task_id,
                player: task.player,
                description: task.description.clone(),
                status: statuses
                    .remove(task_id)
                    .unwrap_or_else(|| "ready".to_string()),
            })
            .collect()
    }

    /// Execute the scheduler loop until shutdown is requested, then shut down.
    pub fn run(mut self) -> ShutdownReport {
        info!("Starting scheduler loop");
        while self.run_once() {}
        self.shutdown()
    }

    /// One iteration of the main loop. Returns false once shutdown has been requested.
    pub fn run_once(&mut self) -> bool {
        let timeout = if self.ready.is_empty() {
            SCHEDULER_TICK_TIME
        } else {
            Duration::ZERO
        };
        self.wait_for_events(timeout);
        self.process_events();

        if let Some(reason) = self.coordinator.poll() {
            let result = self.checkpoint(reason).map(|_| ());
            self.coordinator.finish(result);
        }

        let finalizers = self.finalizers.clone();
        let drained = finalizers.drain_once(self);
        if drained.finalized > 0 || drained.freed > 0 {
            debug!(
                finalized = drained.finalized,
                failed = drained.failed,
                freed = drained.freed,
                "Drained finalization queue"
            );
        }

        self.start_command_tasks();
        self.run_ready();
        self.sessions.sweep();

        !self.coordinator.is_shutdown_requested()
    }

    /// Stop taking new work, give background threads a bounded time to finish, write a final
    /// checkpoint and close every connection that can be closed.
    pub fn shutdown(mut self) -> ShutdownReport {
        let message = self
            .coordinator
            .shutdown_message()
            .unwrap_or_else(|| "shutdown requested".to_string());
        info!(%message, "Shutting down");
        self.sessions
            .broadcast(&format!("*** Shutting down: {message} ***"));
        self.gateway.stop_accepting();
        self.sessions.set_input_suspended(true);
        self.draining = true;

        let runtime = &self.config.runtime;
        let (drain_timeout, poll_interval) =
            (runtime.shutdown_drain_timeout, runtime.shutdown_poll_interval);
        let deadline = Instant::now() + drain_timeout;
        let mut timed_out = false;
        let mut last_report = Instant::now();
        loop {
            self.process_events();
            self.run_ready();
            let live = self.gateway.live_waiters();
            if live == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    live,
                    ?drain_timeout,
                    "Timed out waiting for background threads; shutting down anyway"
                );
                timed_out = true;
                break;
            }
            if last_report.elapsed() >= Duration::from_secs(1) {
                info!(live, "Waiting for background threads to finish");
                last_report = Instant::now();
            }
            self.wait_for_events(poll_interval);
        }
        // Anything that finished between the last poll and the table emptying is in the channel.
        self.process_events();
        self.run_ready();

        let outstanding_threads = self.gateway.live_waiters();
        let final_checkpoint = if self.config.checkpoint.output_path.is_some() {
            self.checkpoint(CheckpointReason::Shutdown).ok()
        } else {
            None
        };
        self.coordinator.fail_waiters(SchedulerError::ShuttingDown);

        for (task_id, task) in self.tasks.drain(..) {
            debug!(task_id, description = %task.description, "Abandoning task at shutdown");
            if let Some(reply) = task.reply {
                let _ = reply.send(Err(SchedulerError::ShuttingDown));
            }
        }
        self.ready.clear();

        let sessions_held = self.sessions.close_all(CloseReason::Shutdown);
        if sessions_held > 0 {
            warn!(sessions_held, "Connections still held at shutdown");
        }
        info!(
            outstanding_threads,
            resumed_during_drain = self.stats.resumed_during_drain,
            "Scheduler done."
        );
        ShutdownReport {
            timed_out,
            outstanding_threads,
            resumed_during_drain: self.stats.resumed_during_drain,
            final_checkpoint,
            sessions_held,
        }
    }
}

impl Scheduler {
    fn wait_for_events(&mut self, timeout: Duration) {
        let event = flume::Selector::new()
            .recv(&self.client_receiver, |msg| msg.ok().map(Event::Client))
            .recv(&self.completions, |c| c.ok().map(Event::Completion))
            .wait_timeout(timeout)
            .ok()
            .flatten();
        match event {
            Some(Event::Client(msg)) => self.handle_client_msg(msg),
            Some(Event::Completion(completion)) => self.handle_completion(completion),
            None => {}
        }
    }

    fn process_events(&mut self) {
        while let Ok(msg) = self.client_receiver.try_recv() {
            self.handle_client_msg(msg);
        }
        while let Ok(completion) = self.completions.try_recv() {
            self.handle_completion(completion);
        }
    }

    fn handle_client_msg(&mut self, msg: SchedulerClientMsg) {
        match msg {
            SchedulerClientMsg::SubmitTask {
                player,
                session,
                body,
                reply,
            } => {
                let _ = reply.send(self.submit_task(player, session, body));
            }
            SchedulerClientMsg::KillTask { task_id, reply } => {
                let _ = reply.send(self.kill_task(task_id));
            }
            SchedulerClientMsg::Checkpoint { reply } => {
                if self.draining {
                    let _ = reply.send(Err(SchedulerError::ShuttingDown));
                    return;
                }
                self.coordinator
                    .request_with_reply(CheckpointReason::Explicit, reply);
            }
            SchedulerClientMsg::Shutdown { message, reply } => {
                self.coordinator.request_shutdown(message);
                let _ = reply.send(Ok(()));
            }
            SchedulerClientMsg::BackgroundThreads { reply } => {
                let _ = reply.send(self.gateway.describe());
            }
            SchedulerClientMsg::FinalizationStats { reply } => {
                let _ = reply.send(self.finalizers.stats());
            }
        }
    }

    fn handle_completion(&mut self, completion: BackgroundCompletion) {
        let BackgroundCompletion {
            handle,
            task_id,
            result,
        } = completion;
        let Some(task) = self.tasks.get_mut(&task_id) else {
            debug!(%handle, task_id, "Task is gone; discarding background result");
            self.stats.discarded += 1;
            return;
        };
        if task.waiting != Some(handle) {
            warn!(%handle, task_id, waiting = ?task.waiting, "Result from a thread the task is not waiting on");
            self.stats.discarded += 1;
            return;
        }
        task.waiting = None;
        self.stats.resumed += 1;
        if self.draining {
            self.stats.resumed_during_drain += 1;
        }
        self.ready.push_back((task_id, TaskInput::Resume(result)));
    }

    fn start_command_tasks(&mut self) {
        for (session, line) in self.sessions.take_input() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let player = self
                .sessions
                .get(session)
                .and_then(|s| s.player())
                .unwrap_or(NOTHING);
            match (self.command_parser)(line) {
                Ok(body) => {
                    let task_id = self.create_task(player, Some(session), body, None);
                    self.ready.push_back((task_id, TaskInput::Start));
                }
                Err(message) => {
                    self.sessions.send(session, &format!("!! {message}"));
                }
            }
        }
    }

    fn create_task(
        &mut self,
        player: Obj,
        session: Option<SessionId>,
        body: Box<dyn TaskBody>,
        reply: Option<TaskReply>,
    ) -> TaskId {
        self.next_task_id += 1;
        let task_id = self.next_task_id;
        let description = body.describe();
        debug!(task_id, %player, ?session, %description, "Task created");
        self.tasks.insert(
            task_id,
            Task {
                player,
                session,
                description,
                body: Some(body),
                waiting: None,
                reply,
            },
        );
        self.stats.started += 1;
        task_id
    }

    fn run_ready(&mut self) {
        let batch: Vec<_> = self.ready.drain(..).collect();
        for (task_id, input) in batch {
            self.step_task(task_id, input);
        }
    }

    /// Step a task until it finishes or parks. A background request that runs inline, or is
    /// refused, resumes the task straight away.
    fn step_task(&mut self, task_id: TaskId, input: TaskInput) -> StepOutcome {
        let mut input = input;
        loop {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                return StepOutcome::Gone;
            };
            let Some(mut body) = task.body.take() else {
                error!(task_id, "Task stepped re-entrantly");
                return StepOutcome::Gone;
            };
            let (player, session) = (task.player, task.session);

            let mut actions = vec![];
            let response = {
                let tasks = &self.tasks;
                let task_owner = |id: TaskId| tasks.get(&id).map(|t| t.player);
                let database = &self.database;
                let wizards = |player: Obj| database.is_wizard(player);
                let mut ctx = TaskContext {
                    task_id,
                    player,
                    session,
                    gateway: &self.gateway,
                    sessions: &self.sessions,
                    finalizers: &self.finalizers,
                    coordinator: &self.coordinator,
                    actions: &mut actions,
                    next_object_id: &mut self.next_object_id,
                    task_owner: &task_owner,
                    wizards: &wizards,
                };
                body.step(input, &mut ctx)
            };
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.body = Some(body);
            }

            let outcome = match response {
                TaskResponse::Complete(value) => StepOutcome::Finished(Ok(value)),
                TaskResponse::Abort(message) => StepOutcome::Finished(Err(message)),
                TaskResponse::Background(request) => {
                    let title = request.title().to_string();
                    match self.gateway.suspend(task_id, request) {
                        Ok(Suspension::Waiting(handle)) => {
                            if let Some(task) = self.tasks.get_mut(&task_id) {
                                task.waiting = Some(handle);
                            }
                            StepOutcome::Parked
                        }
                        Ok(Suspension::Immediate(value)) => {
                            input = TaskInput::Resume(value);
                            self.process_actions(actions);
                            continue;
                        }
                        Err(e) => {
                            debug!(task_id, %title, ?e, "Background request refused");
                            input = TaskInput::Resume(e.to_error_map());
                            self.process_actions(actions);
                            continue;
                        }
                    }
                }
            };
            if let StepOutcome::Finished(result) = &outcome {
                self.complete_task(task_id, result.clone());
            }
            self.process_actions(actions);
            return outcome;
        }
    }

    fn complete_task(&mut self, task_id: TaskId, result: Result<Var, String>) {
        let Some(task) = self.tasks.shift_remove(&task_id) else {
            return;
        };
        match &result {
            Ok(value) => {
                self.stats.completed += 1;
                debug!(task_id, %value, "Task completed");
                if let Some(session) = task.session {
                    self.sessions.send(session, &format!("=> {value}"));
                }
            }
            Err(message) => {
                self.stats.aborted += 1;
                warn!(task_id, %message, description = %task.description, "Task aborted");
                if let Some(session) = task.session {
                    self.sessions.send(session, &format!("!! {message}"));
                }
            }
        }
        if let Some(reply) = task.reply {
            let _ = reply.send(result.map_err(|_| SchedulerError::TaskAbortedError));
        }
    }

    fn process_actions(&mut self, actions: Vec<TaskAction>) {
        for action in actions {
            match action {
                TaskAction::Kill(victim) => {
                    if let Err(e) = self.kill_task(victim) {
                        debug!(victim, ?e, "Kill requested for a task that is already gone");
                    }
                }
            }
        }
    }

    fn checkpoint(&mut self, reason: CheckpointReason) -> Result<PathBuf, SchedulerError> {
        let written = match self.config.checkpoint.output_path.as_deref() {
            None => Err(CheckpointError::NotConfigured),
            Some(dir) => {
                let was_suspended = self.sessions.set_input_suspended(true);
                let written = write_checkpoint(
                    dir,
                    reason,
                    self.database.as_ref(),
                    &self.finalizers,
                    self.gateway.live_waiters(),
                );
                self.sessions.set_input_suspended(was_suspended);
                written
            }
        };
        match written {
            Ok(path) => {
                self.stats.checkpoints += 1;
                Ok(path)
            }
            Err(e) => {
                error!(?e, %reason, "Checkpoint failed");
                self.stats.checkpoint_failures += 1;
                Err(SchedulerError::CheckpointFailed(e.to_string()))
            }
        }
    }
}

impl FinalizerDispatch for Scheduler {
    fn finalize(&mut self, value: Var) -> Result<(), FinalizerError> {
        let Some(body) = self.database.finalizer(value) else {
            return Ok(());
        };
        let task_id = self.create_task(SYSTEM_OBJECT, None, body, None);
        match self.step_task(task_id, TaskInput::Start) {
            StepOutcome::Finished(Err(message)) => Err(FinalizerError::Aborted(message)),
            StepOutcome::Finished(Ok(_)) | StepOutcome::Parked | StepOutcome::Gone => Ok(()),
        }
    }

    fn destroy(&mut self, value: &Pinned) {
        self.database.destroy(value);
    }
}
