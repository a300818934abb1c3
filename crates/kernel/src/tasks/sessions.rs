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

//! Network sessions, and the guard that keeps one open while background work still needs it.
//!
//! Each session carries an activity count. Any background operation that will touch the
//! session's transport after the current scheduler tick takes a `SessionGuard`, which holds the
//! count up until it is dropped. Transports are only ever closed through `try_close`, which
//! refuses (and leaves the close to a later sweep) while anyone else holds the session.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ahash::AHashMap;
use minstant::Instant;
use stunt_var::Obj;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;

pub type SessionId = u64;

/// The connection-level I/O a session needs.
pub trait Transport: Send {
    fn send(&mut self, line: &str) -> Result<(), std::io::Error>;
    fn peer_name(&self) -> String;
    fn close(&mut self);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    Disconnected,
    Timeout,
    Shutdown,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Disconnected => f.write_str("DISCONNECTED"),
            CloseReason::Timeout => f.write_str("TIMEOUT"),
            CloseReason::Shutdown => f.write_str("SHUTDOWN"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseOutcome {
    Closed,
    /// Someone still holds the session; try again on a later sweep.
    Deferred,
    NotFound,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionHandle {
    id: SessionId,
    connection_name: String,
    player: Mutex<Option<Obj>>,
    activity: AtomicUsize,
    disconnect_requested: AtomicBool,
    last_activity: Mutex<Instant>,
    input: Mutex<VecDeque<String>>,
    transport: Mutex<Option<Box<dyn Transport>>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn player(&self) -> Option<Obj> {
        *locked(&self.player)
    }

    /// Outstanding guards.
    pub fn activity(&self) -> usize {
        self.activity.load(Ordering::Acquire)
    }

    pub fn is_disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        locked(&self.transport).is_some()
    }

    /// The transport's idea of who is on the other end, if it's still open.
    pub fn peer_name(&self) -> Option<String> {
        locked(&self.transport).as_ref().map(|t| t.peer_name())
    }

    pub fn send(&self, line: &str) -> Result<(), std::io::Error> {
        match locked(&self.transport).as_mut() {
            Some(transport) => transport.send(line),
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    fn idle(&self) -> Duration {
        locked(&self.last_activity).elapsed()
    }
}

/// Holds a session's activity count up for as long as it lives.
pub struct SessionGuard {
    handle: Arc<SessionHandle>,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Deref for SessionGuard {
    type Target = SessionHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let prev = self.handle.activity.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "session guard released more than acquired");
    }
}

pub struct SessionRegistry {
    sessions: Mutex<AHashMap<SessionId, Arc<SessionHandle>>>,
    next_id: AtomicU64,
    connect_timeout: Duration,
    input_suspended: AtomicBool,
}

impl SessionRegistry {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            sessions: Mutex::new(AHashMap::new()),
            next_id: AtomicU64::new(1),
            connect_timeout: config.connect_timeout,
            input_suspended: AtomicBool::new(false),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, AHashMap<SessionId, Arc<SessionHandle>>> {
        locked(&self.sessions)
    }

    pub fn open(&self, transport: Box<dyn Transport>) -> Arc<SessionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(SessionHandle {
            id,
            connection_name: transport.peer_name(),
            player: Mutex::new(None),
            activity: AtomicUsize::new(0),
            disconnect_requested: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            input: Mutex::new(VecDeque::new()),
            transport: Mutex::new(Some(transport)),
        });
        info!(session = id, connection = %handle.connection_name, "New connection");
        self.sessions().insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions().get(&id).cloned()
    }

    /// Keep `id` open until the returned guard is dropped.
    pub fn acquire(&self, id: SessionId) -> Option<SessionGuard> {
        let sessions = self.sessions();
        let handle = sessions.get(&id)?;
        handle.activity.fetch_add(1, Ordering::AcqRel);
        Some(SessionGuard {
            handle: handle.clone(),
        })
    }

    pub fn login(&self, id: SessionId, player: Obj) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        *locked(&handle.player) = Some(player);
        info!(session = id, %player, "Connection logged in");
        true
    }

    pub fn request_disconnect(&self, id: SessionId) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        handle.disconnect_requested.store(true, Ordering::Release);
        true
    }

    pub fn send(&self, id: SessionId, line: &str) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        match handle.send(line) {
            Ok(()) => true,
            Err(e) => {
                warn!(session = id, ?e, "Could not send to connection");
                false
            }
        }
    }

    pub fn broadcast(&self, line: &str) {
        let handles: Vec<_> = self.sessions().values().cloned().collect();
        for handle in handles {
            let _ = handle.send(line);
        }
    }

    /// Queue a line read from the network.
    pub fn push_input(&self, id: SessionId, line: String) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        *locked(&handle.last_activity) = Instant::now();
        locked(&handle.input).push_back(line);
        true
    }

    /// At most one pending line from each session. Nothing while input is suspended.
    pub fn take_input(&self) -> Vec<(SessionId, String)> {
        if self.input_suspended.load(Ordering::Acquire) {
            return vec![];
        }
        let handles: Vec<_> = self.sessions().values().cloned().collect();
        let mut lines = vec![];
        for handle in handles {
            if handle.is_disconnect_requested() {
                continue;
            }
            if let Some(line) = locked(&handle.input).pop_front() {
                lines.push((handle.id, line));
            }
        }
        lines.sort_by_key(|(id, _)| *id);
        lines
    }

    pub fn set_input_suspended(&self, suspended: bool) -> bool {
        self.input_suspended.swap(suspended, Ordering::AcqRel)
    }

    /// Close `id` unless someone other than us holds it.
    pub fn try_close(&self, id: SessionId, reason: CloseReason) -> CloseOutcome {
        let mut sessions = self.sessions();
        Self::try_close_locked(&mut sessions, id, reason)
    }

    fn try_close_locked(
        sessions: &mut AHashMap<SessionId, Arc<SessionHandle>>,
        id: SessionId,
        reason: CloseReason,
    ) -> CloseOutcome {
        let Some(handle) = sessions.get(&id) else {
            return CloseOutcome::NotFound;
        };
        // Our own transient hold; anything above it belongs to somebody else.
        let held = handle.activity.fetch_add(1, Ordering::AcqRel) + 1;
        if held > 1 {
            handle.activity.fetch_sub(1, Ordering::AcqRel);
            debug!(session = id, holders = held - 1, "Connection still in use; deferring close");
            return CloseOutcome::Deferred;
        }
        if let Some(mut transport) = locked(&handle.transport).take() {
            transport.close();
        }
        handle.activity.fetch_sub(1, Ordering::AcqRel);
        info!(
            session = id,
            connection = %handle.connection_name,
            %reason,
            "Connection closed"
        );
        sessions.remove(&id);
        CloseOutcome::Closed
    }

    /// The periodic connection sweep: close what asked to be closed, and what never logged in
    /// within the connect timeout.
    pub fn sweep(&self) -> Vec<(SessionId, CloseReason)> {
        let mut sessions = self.sessions();
        let candidates: Vec<_> = sessions
            .values()
            .filter_map(|h| {
                if h.is_disconnect_requested() {
                    Some((h.id, CloseReason::Disconnected))
                } else if h.player().is_none() && h.idle() > self.connect_timeout {
                    Some((h.id, CloseReason::Timeout))
                } else {
                    None
                }
            })
            .collect();
        candidates
            .into_iter()
            .filter(|(id, reason)| {
                Self::try_close_locked(&mut sessions, *id, *reason) == CloseOutcome::Closed
            })
            .collect()
    }

    /// Close everything that can be closed. Returns how many sessions were still held.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let mut sessions = self.sessions();
        let ids: Vec<_> = sessions.keys().copied().collect();
        ids.into_iter()
            .filter(|id| {
                Self::try_close_locked(&mut sessions, *id, reason) == CloseOutcome::Deferred
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use pretty_assertions::assert_eq;
    use stunt_var::SYSTEM_OBJECT;

    fn registry(connect_timeout: Duration) -> SessionRegistry {
        SessionRegistry::new(&NetworkConfig {
            connect_timeout,
            ..Default::default()
        })
    }

    #[test]
    fn test_try_close_defers_while_held() {
        let reg = registry(Duration::from_secs(300));
        let (transport, probe) = MockTransport::new("10.0.0.1:4000");
        let id = reg.open(Box::new(transport)).id();

        let guard = reg.acquire(id).unwrap();
        assert_eq!(guard.activity(), 1);
        assert_eq!(reg.try_close(id, CloseReason::Disconnected), CloseOutcome::Deferred);
        assert!(!probe.is_closed());
        assert_eq!(reg.get(id).unwrap().activity(), 1);

        drop(guard);
        assert_eq!(reg.try_close(id, CloseReason::Disconnected), CloseOutcome::Closed);
        assert!(probe.is_closed());
        assert_eq!(reg.try_close(id, CloseReason::Disconnected), CloseOutcome::NotFound);
    }

    #[test]
    fn test_guard_released_on_another_thread() {
        let reg = registry(Duration::from_secs(300));
        let (transport, probe) = MockTransport::new("peer");
        let id = reg.open(Box::new(transport)).id();
        let guard = reg.acquire(id).unwrap();
        let name = std::thread::spawn(move || guard.peer_name()).join().unwrap();
        assert_eq!(name.as_deref(), Some("peer"));
        assert_eq!(reg.try_close(id, CloseReason::Shutdown), CloseOutcome::Closed);
        assert!(probe.is_closed());
    }

    #[test]
    fn test_sweep_closes_disconnect_requests_when_free() {
        let reg = registry(Duration::from_secs(300));
        let (transport, probe) = MockTransport::new("peer");
        let id = reg.open(Box::new(transport)).id();
        reg.request_disconnect(id);
        let guard = reg.acquire(id).unwrap();
        assert!(reg.sweep().is_empty());
        drop(guard);
        assert_eq!(reg.sweep(), vec![(id, CloseReason::Disconnected)]);
        assert!(probe.is_closed());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_sweep_times_out_unlogged_connections() {
        let reg = registry(Duration::ZERO);
        let (anon, _) = MockTransport::new("anon");
        let (player, _) = MockTransport::new("player");
        let anon = reg.open(Box::new(anon)).id();
        let player = reg.open(Box::new(player)).id();
        reg.login(player, SYSTEM_OBJECT);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(reg.sweep(), vec![(anon, CloseReason::Timeout)]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_input_suspension() {
        let reg = registry(Duration::from_secs(300));
        let (transport, probe) = MockTransport::new("peer");
        let id = reg.open(Box::new(transport)).id();
        reg.push_input(id, "one".into());
        reg.push_input(id, "two".into());
        reg.set_input_suspended(true);
        assert!(reg.take_input().is_empty());
        reg.set_input_suspended(false);
        assert_eq!(reg.take_input(), vec![(id, "one".to_string())]);
        assert_eq!(reg.take_input(), vec![(id, "two".to_string())]);
        assert!(reg.send(id, "hi"));
        assert_eq!(probe.sent(), vec!["hi".to_string()]);
    }

    #[test]
    fn test_close_all_reports_held() {
        let reg = registry(Duration::from_secs(300));
        let (a, _) = MockTransport::new("a");
        let (b, _) = MockTransport::new("b");
        let a = reg.open(Box::new(a)).id();
        reg.open(Box::new(b));
        let _guard = reg.acquire(a).unwrap();
        assert_eq!(reg.close_all(CloseReason::Shutdown), 1);
        assert_eq!(reg.len(), 1);
    }
}
