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

//! Checkpoints: when to take them, and how they're written and read back.
//!
//! The coordinator is a small latch shared by everything that can ask for a checkpoint (the
//! interval timer, `SIGUSR2`, the `checkpoint()` builtin, an admin client). Requests coalesce
//! while one is pending. The scheduler polls it once per iteration and performs the checkpoint
//! on its own thread, so nothing interpreter-visible moves while it's being written.
//!
//! It also carries the shutdown request, which is terminal.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use minstant::Instant;
use stunt_common::tasks::{CheckpointReason, SchedulerError};
use stunt_var::{DecodingError, VarReader, VarWriter};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::CheckpointConfig;
use crate::db::Database;
use crate::tasks::finalization::FinalizationQueue;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint directory configured")]
    NotConfigured,
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not read checkpoint {path:?}: {source}")]
    Decoding {
        path: PathBuf,
        #[source]
        source: DecodingError,
    },
    #[error("{0:?} is not a checkpoint")]
    BadHeader(PathBuf),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointState {
    Idle,
    Requested(CheckpointReason),
    Running(CheckpointReason),
}

pub type CheckpointNotifier = Box<dyn Fn(CheckpointReason, bool) + Send + Sync>;

struct Latch {
    state: CheckpointState,
    /// Asked for again while running.
    follow_up: Option<CheckpointReason>,
    last_finished: Instant,
    /// Checkpoints started so far.
    runs: u64,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CheckpointCoordinator {
    latch: Mutex<Latch>,
    interval: Option<Duration>,
    signal_requested: Arc<AtomicBool>,
    shutdown_requested: Arc<AtomicBool>,
    shutdown_message: Mutex<Option<String>>,
    /// Each waiter is answered by the first checkpoint to start after it asked.
    waiters: Mutex<Vec<(u64, oneshot::Sender<Result<(), SchedulerError>>)>>,
    notifier: Mutex<Option<CheckpointNotifier>>,
}

impl CheckpointCoordinator {
    pub fn new(config: &CheckpointConfig) -> Self {
        Self {
            latch: Mutex::new(Latch {
                state: CheckpointState::Idle,
                follow_up: None,
                last_finished: Instant::now(),
                runs: 0,
            }),
            interval: config.interval,
            signal_requested: Arc::new(AtomicBool::new(false)),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            shutdown_message: Mutex::new(None),
            waiters: Mutex::new(vec![]),
            notifier: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CheckpointState {
        locked(&self.latch).state
    }

    /// Returns false if this request was folded into one already pending.
    pub fn request(&self, reason: CheckpointReason) -> bool {
        let mut latch = locked(&self.latch);
        Self::latch_request(&mut latch, reason)
    }

    fn latch_request(latch: &mut Latch, reason: CheckpointReason) -> bool {
        match latch.state {
            CheckpointState::Idle => {
                latch.state = CheckpointState::Requested(reason);
                debug!(%reason, "Checkpoint requested");
                true
            }
            CheckpointState::Requested(_) => false,
            CheckpointState::Running(_) => {
                let fresh = latch.follow_up.is_none();
                latch.follow_up.get_or_insert(reason);
                fresh
            }
        }
    }

    /// Request a checkpoint and get told how it went.
    pub fn request_and_wait(
        &self,
        reason: CheckpointReason,
    ) -> oneshot::Receiver<Result<(), SchedulerError>> {
        let (send, recv) = oneshot::channel();
        self.request_with_reply(reason, send);
        recv
    }

    pub fn request_with_reply(
        &self,
        reason: CheckpointReason,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    ) {
        let mut latch = locked(&self.latch);
        locked(&self.waiters).push((latch.runs + 1, reply));
        Self::latch_request(&mut latch, reason);
    }

    /// Set from a signal handler to request a checkpoint.
    pub fn signal_flag(&self) -> Arc<AtomicBool> {
        self.signal_requested.clone()
    }

    /// Set from a signal handler to request shutdown.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown_requested.clone()
    }

    pub fn request_shutdown(&self, message: Option<String>) {
        if let Some(message) = message {
            locked(&self.shutdown_message).get_or_insert(message);
        }
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub fn shutdown_message(&self) -> Option<String> {
        locked(&self.shutdown_message).clone()
    }

    pub fn set_notifier(&self, notifier: CheckpointNotifier) {
        *locked(&self.notifier) = Some(notifier);
    }

    /// Called by the scheduler each iteration. If a checkpoint should happen now, moves to
    /// `Running` and says why.
    pub fn poll(&self) -> Option<CheckpointReason> {
        if self.signal_requested.swap(false, Ordering::AcqRel) {
            self.request(CheckpointReason::Signal);
        }
        let mut latch = locked(&self.latch);
        if let (CheckpointState::Idle, Some(interval)) = (latch.state, self.interval)
            && latch.last_finished.elapsed() >= interval
        {
            latch.state = CheckpointState::Requested(CheckpointReason::Timer);
        }
        match latch.state {
            CheckpointState::Requested(reason) => {
                latch.state = CheckpointState::Running(reason);
                latch.runs += 1;
                Some(reason)
            }
            _ => None,
        }
    }

    /// The scheduler's done with the checkpoint `poll` gave it.
    pub fn finish(&self, result: Result<(), SchedulerError>) {
        let (reason, run) = {
            let mut latch = locked(&self.latch);
            let CheckpointState::Running(reason) = latch.state else {
                warn!(state = ?latch.state, "Checkpoint finished without running");
                return;
            };
            latch.last_finished = Instant::now();
            latch.state = match latch.follow_up.take() {
                Some(again) => CheckpointState::Requested(again),
                None => CheckpointState::Idle,
            };
            (reason, latch.runs)
        };
        let answered: Vec<_> = {
            let mut waiters = locked(&self.waiters);
            let (now, later): (Vec<_>, Vec<_>) =
                waiters.drain(..).partition(|(target, _)| *target <= run);
            *waiters = later;
            now
        };
        for (_, waiter) in answered {
            let _ = waiter.send(result.clone());
        }
        if let Some(notifier) = locked(&self.notifier).as_ref() {
            notifier(reason, result.is_ok());
        }
    }

    /// Answer everyone still waiting for a checkpoint that is now never going to happen.
    pub fn fail_waiters(&self, error: SchedulerError) -> usize {
        let waiters: Vec<_> = locked(&self.waiters).drain(..).collect();
        let count = waiters.len();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        count
    }
}

const HEADER_PREFIX: &str = "** stunt checkpoint";
const IN_FLIGHT_SUFFIX: &str = " background threads in flight";

fn next_checkpoint_path(dir: &Path) -> PathBuf {
    let mut stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    loop {
        let path = dir.join(format!("checkpoint-{stamp:016}.db"));
        if !path.exists() {
            return path;
        }
        stamp += 1;
    }
}

/// Write a checkpoint into `dir`: first to an `.in-progress` file, renamed into place once
/// complete.
pub fn write_checkpoint(
    dir: &Path,
    reason: CheckpointReason,
    database: &dyn Database,
    finalizers: &FinalizationQueue,
    in_flight: usize,
) -> Result<PathBuf, CheckpointError> {
    fs::create_dir_all(dir)?;
    let final_path = next_checkpoint_path(dir);
    let in_progress = final_path.with_extension("in-progress");
    info!(?in_progress, %reason, in_flight, "Writing checkpoint");

    let written = (|| -> Result<usize, CheckpointError> {
        let mut file = BufWriter::new(File::create(&in_progress)?);
        let pending = {
            let out: &mut dyn Write = &mut file;
            let mut writer = VarWriter::new(out);
            writer.write_line(&format!("{HEADER_PREFIX} ({reason}) **"))?;
            writer.write_line(&format!("{in_flight}{IN_FLIGHT_SUFFIX}"))?;
            database.write_objects(&mut writer)?;
            finalizers.persist(&mut writer)?
        };
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(pending)
    })();
    let pending = match written {
        Ok(pending) => pending,
        Err(e) => {
            error!(?e, ?in_progress, "Checkpoint failed");
            let _ = fs::remove_file(&in_progress);
            return Err(e);
        }
    };
    fs::rename(&in_progress, &final_path)?;
    info!(?final_path, pending, "Checkpoint written.");
    Ok(final_path)
}

/// The newest complete checkpoint in `dir`.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut newest: Option<PathBuf> = None;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("checkpoint-") || !name.ends_with(".db") {
            continue;
        }
        if newest.as_ref().is_none_or(|n| path > *n) {
            newest = Some(path);
        }
    }
    Ok(newest)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestoreSummary {
    /// Background threads that were running when the checkpoint was taken.
    pub in_flight: usize,
    pub pending_finalization: usize,
}

pub fn load_checkpoint(
    path: &Path,
    database: &mut dyn Database,
    finalizers: &Arc<FinalizationQueue>,
) -> Result<RestoreSummary, CheckpointError> {
    let decoding = |source| CheckpointError::Decoding {
        path: path.to_path_buf(),
        source,
    };
    let mut file = BufReader::new(File::open(path)?);
    let input: &mut dyn BufRead = &mut file;
    let mut reader = VarReader::new(input, finalizers.sink());

    let header = reader.read_line().map_err(decoding)?;
    if !header.starts_with(HEADER_PREFIX) {
        return Err(CheckpointError::BadHeader(path.to_path_buf()));
    }
    let in_flight: usize = reader
        .read_line()
        .map_err(decoding)?
        .strip_suffix(IN_FLIGHT_SUFFIX)
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| CheckpointError::BadHeader(path.to_path_buf()))?;
    database.read_objects(&mut reader).map_err(decoding)?;
    let pending_finalization = finalizers.restore(&mut reader).map_err(decoding)?;

    if in_flight > 0 {
        warn!(
            in_flight,
            "Checkpoint was taken with background threads running; their tasks are not restored"
        );
    }
    info!(?path, pending_finalization, "Checkpoint restored");
    Ok(RestoreSummary {
        in_flight,
        pending_finalization,
    })
}
