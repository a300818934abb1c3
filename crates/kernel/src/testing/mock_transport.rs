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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::tasks::sessions::Transport;

#[derive(Default)]
struct TransportState {
    sent: Vec<String>,
    closed: bool,
}

/// What a test can see of a `MockTransport` after handing it to the registry.
#[derive(Clone, Default)]
pub struct TransportProbe {
    state: Arc<Mutex<TransportState>>,
}

impl TransportProbe {
    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sent(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// Records what is sent to it, and whether it was closed.
pub struct MockTransport {
    peer: String,
    probe: TransportProbe,
}

impl MockTransport {
    pub fn new(peer: &str) -> (Self, TransportProbe) {
        let probe = TransportProbe::default();
        let transport = Self {
            peer: peer.to_string(),
            probe: probe.clone(),
        };
        (transport, probe)
    }
}

impl Transport for MockTransport {
    fn send(&mut self, line: &str) -> Result<(), std::io::Error> {
        let mut state = self.probe.state();
        if state.closed {
            return Err(std::io::ErrorKind::NotConnected.into());
        }
        state.sent.push(line.to_string());
        Ok(())
    }

    fn peer_name(&self) -> String {
        self.peer.clone()
    }

    fn close(&mut self) {
        self.probe.state().closed = true;
    }
}
