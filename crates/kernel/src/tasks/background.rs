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

//! Running blocking or expensive work off the scheduler thread.
//!
//! A task hands the gateway a `BackgroundRequest`; the gateway registers a waiter for it in the
//! handle table, starts a detached OS thread to run the callback, and the task is parked until
//! the worker reports back over the completion channel. The scheduler thread never blocks on a
//! worker: it only drains that channel.
//!
//! Workers deregister themselves. If the owning task was killed while the callback ran, the
//! waiter is no longer `active` and the result is dropped on the worker thread instead of being
//! sent. Cleanup for the request's extra data runs exactly once on every path, including
//! rejection and failure to start the thread.

use std::any::Any;
use std::fmt::{Display, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use flume::{Receiver, Sender};
use indexmap::IndexMap;
use minstant::Instant;
use stunt_common::tasks::{BackgroundError, TaskId};
use stunt_var::{E_EXEC, Var, v_error_map};
use tracing::{debug, error, warn};

use crate::config::RuntimeConfig;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct WaiterHandle(pub u32);

impl Display for WaiterHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type ExtraData = Box<dyn Any + Send>;
pub type WorkerFn = Box<dyn FnOnce(Var, &mut WaiterContext) -> Var + Send>;
pub type CleanupFn = Box<dyn FnOnce(Option<ExtraData>) + Send>;
pub type ThreadStarter =
    dyn Fn(String, Box<dyn FnOnce() + Send>) -> Result<(), std::io::Error> + Send + Sync;

/// What a task asks to have run in the background.
pub struct BackgroundRequest {
    title: String,
    callback: WorkerFn,
    argument: Var,
    extra: Option<ExtraData>,
    cleanup: Option<CleanupFn>,
}

impl BackgroundRequest {
    pub fn new<F>(title: impl Into<String>, argument: Var, callback: F) -> Self
    where
        F: FnOnce(Var, &mut WaiterContext) -> Var + Send + 'static,
    {
        Self {
            title: title.into(),
            callback: Box::new(callback),
            argument,
            extra: None,
            cleanup: None,
        }
    }

    /// Opaque data made available to the callback through `WaiterContext::extra`.
    pub fn with_extra(mut self, extra: impl Any + Send) -> Self {
        self.extra = Some(Box::new(extra));
        self
    }

    /// Called with the extra data once the request is finished with, however it finished.
    pub fn with_cleanup(mut self, cleanup: impl FnOnce(Option<ExtraData>) + Send + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

/// What the callback sees while it runs.
pub struct WaiterContext {
    handle: Option<WaiterHandle>,
    active: Arc<AtomicBool>,
    extra: Option<ExtraData>,
}

impl WaiterContext {
    /// `None` when running inline on the scheduler thread.
    pub fn handle(&self) -> Option<WaiterHandle> {
        self.handle
    }

    /// Long running callbacks should check this now and then, and give up early once the
    /// owning task has been killed. Nobody will see their result anyway.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn extra<T: 'static>(&self) -> Option<&T> {
        self.extra.as_ref()?.downcast_ref()
    }
}

/// A finished background callback, on its way back to the scheduler.
#[derive(Debug)]
pub struct BackgroundCompletion {
    pub handle: WaiterHandle,
    pub task_id: TaskId,
    pub result: Var,
}

pub enum Suspension {
    /// The task must wait for a completion for this handle.
    Waiting(WaiterHandle),
    /// Threading is off; the work was done synchronously.
    Immediate(Var),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskEnumAction {
    Continue,
    Kill,
    Stop,
}

#[derive(Clone, Debug)]
pub struct WaiterInfo {
    pub handle: WaiterHandle,
    pub task_id: TaskId,
    pub title: String,
    pub active: bool,
    pub elapsed: Duration,
}

struct Waiter {
    task_id: TaskId,
    title: String,
    active: Arc<AtomicBool>,
    started: Instant,
}

#[derive(Default)]
struct HandleTable {
    waiters: IndexMap<WaiterHandle, Waiter>,
    next_handle: u32,
}

impl HandleTable {
    fn register(&mut self, task_id: TaskId, title: &str, active: Arc<AtomicBool>) -> WaiterHandle {
        // Handles only restart from 1 when nothing is outstanding, so they never collide.
        if self.waiters.is_empty() {
            self.next_handle = 1;
        }
        let handle = WaiterHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.waiters.insert(
            handle,
            Waiter {
                task_id,
                title: title.to_string(),
                active,
                started: Instant::now(),
            },
        );
        handle
    }

    fn remove(&mut self, handle: WaiterHandle) -> Option<Waiter> {
        self.waiters.shift_remove(&handle)
    }

    fn is_waiting(&self, task_id: TaskId) -> bool {
        self.waiters.values().any(|w| w.task_id == task_id)
    }
}

/// The pieces of a request that travel with the worker.
struct Job {
    title: String,
    callback: Option<WorkerFn>,
    argument: Option<Var>,
    ctx: WaiterContext,
    cleanup: Option<CleanupFn>,
}

impl Job {
    fn new(request: BackgroundRequest, active: Arc<AtomicBool>) -> Self {
        Self {
            title: request.title,
            callback: Some(request.callback),
            argument: Some(request.argument),
            ctx: WaiterContext {
                handle: None,
                active,
                extra: request.extra,
            },
            cleanup: request.cleanup,
        }
    }

    /// Run the callback. Panics become an `E_EXEC` error map.
    fn run(&mut self) -> Var {
        let (Some(callback), Some(argument)) = (self.callback.take(), self.argument.take()) else {
            return v_error_map(E_EXEC, "Background job has already run");
        };
        let ctx = &mut self.ctx;
        match catch_unwind(AssertUnwindSafe(move || callback(argument, ctx))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(title = %self.title, panic = %message, "Background callback panicked");
                v_error_map(E_EXEC, &message)
            }
        }
    }

    fn finish(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        let extra = self.ctx.extra.take();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(move || cleanup(extra))) {
            error!(
                title = %self.title,
                panic = %panic_message(panic.as_ref()),
                "Background cleanup panicked"
            );
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.finish();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Background callback panicked".to_string()
    }
}

fn start_os_thread(name: String, f: Box<dyn FnOnce() + Send>) -> Result<(), std::io::Error> {
    // Detached: the JoinHandle is dropped and the thread reports back over the channel.
    std::thread::Builder::new().name(name).spawn(f).map(|_| ())
}

pub struct BackgroundGateway {
    table: Mutex<HandleTable>,
    max_threads: AtomicUsize,
    threading: AtomicBool,
    accepting: AtomicBool,
    completions: Sender<BackgroundCompletion>,
    starter: Box<ThreadStarter>,
}

impl BackgroundGateway {
    pub fn new(config: &RuntimeConfig) -> (Arc<Self>, Receiver<BackgroundCompletion>) {
        Self::with_thread_starter(config, Box::new(start_os_thread))
    }

    /// As `new`, but with a custom way of starting threads.
    pub fn with_thread_starter(
        config: &RuntimeConfig,
        starter: Box<ThreadStarter>,
    ) -> (Arc<Self>, Receiver<BackgroundCompletion>) {
        let (completions, receiver) = flume::unbounded();
        let gateway = Arc::new(Self {
            table: Mutex::new(HandleTable::default()),
            max_threads: AtomicUsize::new(config.max_background_threads),
            threading: AtomicBool::new(config.background_threading),
            accepting: AtomicBool::new(true),
            completions,
            starter,
        });
        (gateway, receiver)
    }

    fn table(&self) -> MutexGuard<'_, HandleTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Suspend `task_id` on `request`.
    ///
    /// Refusals (cap reached, shutting down, the task already waiting) happen before anything is
    /// registered or started. A thread that cannot be started is reported as resource exhaustion,
    /// with the waiter torn down again.
    pub fn suspend(
        self: &Arc<Self>,
        task_id: TaskId,
        request: BackgroundRequest,
    ) -> Result<Suspension, BackgroundError> {
        let active = Arc::new(AtomicBool::new(true));
        let mut job = Job::new(request, active.clone());

        if !self.accepting.load(Ordering::Acquire) {
            return Err(BackgroundError::ShuttingDown);
        }

        if !self.threading.load(Ordering::Acquire) {
            let result = job.run();
            job.finish();
            return Ok(Suspension::Immediate(result));
        }

        let handle = {
            let mut table = self.table();
            let live = table.waiters.len();
            let max = self.max_threads.load(Ordering::Acquire);
            if live >= max {
                warn!(live, max, title = %job.title, "Background thread limit reached");
                return Err(BackgroundError::TooManyThreads { live, max });
            }
            if table.is_waiting(task_id) {
                return Err(BackgroundError::TaskAlreadyWaiting(task_id));
            }
            table.register(task_id, &job.title, active)
        };
        job.ctx.handle = Some(handle);

        debug!(%handle, task_id, title = %job.title, "Starting background thread");
        let gateway = self.clone();
        let started = (self.starter)(
            format!("stunt-bg-{handle}"),
            Box::new(move || gateway.run_worker(handle, task_id, job)),
        );
        if let Err(e) = started {
            error!(?e, %handle, task_id, "Could not start background thread");
            self.table().remove(handle);
            return Err(BackgroundError::SpawnFailed(e.to_string()));
        }
        Ok(Suspension::Waiting(handle))
    }

    fn run_worker(&self, handle: WaiterHandle, task_id: TaskId, mut job: Job) {
        let result = job.run();
        job.finish();

        let mut table = self.table();
        let Some(waiter) = table.remove(handle) else {
            error!(%handle, task_id, "Background waiter vanished from the handle table");
            return;
        };
        if waiter.active.load(Ordering::Acquire) {
            // Sent under the table lock, so an empty table means every result is in the channel.
            let completion = BackgroundCompletion {
                handle,
                task_id,
                result,
            };
            if self.completions.send(completion).is_err() {
                warn!(%handle, task_id, "Scheduler has gone away; dropping background result");
            }
        } else {
            drop(table);
            debug!(%handle, task_id, "Task was killed; discarding background result");
            drop(result);
        }
    }

    /// Mark every waiter belonging to `task_id` inactive. Returns how many there were.
    pub fn kill_task(&self, task_id: TaskId) -> usize {
        let table = self.table();
        let mut killed = 0;
        for waiter in table.waiters.values().filter(|w| w.task_id == task_id) {
            waiter.active.store(false, Ordering::Release);
            killed += 1;
        }
        killed
    }

    /// Offer every waiter to `f`, as the task-listing and kill machinery do with ordinary tasks.
    /// Returns the tasks whose waiters `f` asked to kill.
    pub fn enumerate(&self, mut f: impl FnMut(TaskId, &str) -> TaskEnumAction) -> Vec<TaskId> {
        let snapshot: Vec<_> = self
            .table()
            .waiters
            .iter()
            .map(|(handle, w)| (*handle, w.task_id, w.active.clone()))
            .collect();
        let mut killed = vec![];
        for (handle, task_id, active) in snapshot {
            match f(task_id, &format!("waiting on thread {handle}")) {
                TaskEnumAction::Continue => {}
                TaskEnumAction::Kill => {
                    active.store(false, Ordering::Release);
                    killed.push(task_id);
                }
                TaskEnumAction::Stop => break,
            }
        }
        killed
    }

    pub fn handles(&self) -> Vec<WaiterHandle> {
        self.table().waiters.keys().copied().collect()
    }

    pub fn describe(&self) -> Vec<WaiterInfo> {
        self.table()
            .waiters
            .iter()
            .map(|(handle, w)| WaiterInfo {
                handle: *handle,
                task_id: w.task_id,
                title: w.title.clone(),
                active: w.active.load(Ordering::Acquire),
                elapsed: w.started.elapsed(),
            })
            .collect()
    }

    pub fn live_waiters(&self) -> usize {
        self.table().waiters.len()
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads.load(Ordering::Acquire)
    }

    /// Applies to the next request; waiters already running are unaffected. Returns the old value.
    pub fn set_max_threads(&self, max: usize) -> usize {
        self.max_threads.swap(max, Ordering::AcqRel)
    }

    pub fn threading(&self) -> bool {
        self.threading.load(Ordering::Acquire)
    }

    pub fn set_threading(&self, enabled: bool) -> bool {
        self.threading.swap(enabled, Ordering::AcqRel)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}
