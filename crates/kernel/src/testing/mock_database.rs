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

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stunt_var::{
    DecodingError, Obj, Pinned, SYSTEM_OBJECT, Var, VarReader, VarWriter, Variant, v_none,
};

use crate::db::Database;
use crate::tasks::task::{TaskBody, TaskContext, TaskInput, TaskResponse};

/// What finalizable values' finalizers do.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FinalizerBehavior {
    /// No finalizer at all.
    None,
    Succeed,
    /// The finalizer aborts with this message.
    Raise(String),
}

#[derive(Default)]
struct DatabaseState {
    finalized: Vec<u64>,
    destroyed: Vec<u64>,
    restored_objects: Option<usize>,
}

#[derive(Clone, Default)]
pub struct DatabaseProbe {
    state: Arc<Mutex<DatabaseState>>,
}

impl DatabaseProbe {
    fn state(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids of the values whose finalizers have run, in order.
    pub fn finalized(&self) -> Vec<u64> {
        self.state().finalized.clone()
    }

    pub fn destroyed(&self) -> Vec<u64> {
        self.state().destroyed.clone()
    }

    /// How many objects the last checkpoint restore read.
    pub fn restored_objects(&self) -> Option<usize> {
        self.state().restored_objects
    }
}

/// A database of `objects` placeholder objects, numbered from 1. The system object and anything
/// passed to `with_wizards` are wizards.
pub struct MockDatabase {
    behavior: FinalizerBehavior,
    objects: usize,
    wizards: Vec<Obj>,
    probe: DatabaseProbe,
}

impl MockDatabase {
    pub fn new(behavior: FinalizerBehavior) -> (Self, DatabaseProbe) {
        let probe = DatabaseProbe::default();
        let db = Self {
            behavior,
            objects: 0,
            wizards: vec![],
            probe: probe.clone(),
        };
        (db, probe)
    }

    pub fn with_objects(mut self, objects: usize) -> Self {
        self.objects = objects;
        self
    }

    pub fn with_wizards(mut self, wizards: Vec<Obj>) -> Self {
        self.wizards = wizards;
        self
    }
}

fn finalizable_id(value: &Var) -> Option<u64> {
    match value.variant() {
        Variant::Anon(anon) => Some(anon.id()),
        Variant::Waif(waif) => Some(waif.id()),
        _ => None,
    }
}

impl Database for MockDatabase {
    fn write_objects(&self, writer: &mut VarWriter<&mut dyn Write>) -> Result<(), std::io::Error> {
        writer.write_line(&format!("{} objects", self.objects))?;
        for i in 1..=self.objects {
            writer.write_line(&format!("#{i}"))?;
        }
        Ok(())
    }

    fn read_objects(
        &mut self,
        reader: &mut VarReader<&mut dyn BufRead>,
    ) -> Result<(), DecodingError> {
        let header = reader.read_line()?;
        let line = reader.line();
        let count = header
            .strip_suffix(" objects")
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| DecodingError::Parse {
                line,
                message: format!("expected an object count, got {header:?}"),
            })?;
        for _ in 0..count {
            reader.read_line()?;
        }
        self.objects = count;
        self.probe.state().restored_objects = Some(count);
        Ok(())
    }

    fn finalizer(&mut self, value: Var) -> Option<Box<dyn TaskBody>> {
        if self.behavior == FinalizerBehavior::None {
            return None;
        }
        Some(Box::new(FinalizerTask {
            value: Some(value),
            behavior: self.behavior.clone(),
            probe: self.probe.clone(),
        }))
    }

    fn destroy(&mut self, value: &Pinned) {
        self.probe.state().destroyed.push(value.id());
    }

    fn is_wizard(&self, player: Obj) -> bool {
        player == SYSTEM_OBJECT || self.wizards.contains(&player)
    }

    fn max_object_id(&self) -> u64 {
        self.objects as u64
    }
}

/// Plays the part of a `recycle` verb.
struct FinalizerTask {
    value: Option<Var>,
    behavior: FinalizerBehavior,
    probe: DatabaseProbe,
}

impl TaskBody for FinalizerTask {
    fn step(&mut self, _input: TaskInput, _ctx: &mut TaskContext) -> TaskResponse {
        // Dropping our reference at the end of the call, as the verb's frame would.
        let Some(value) = self.value.take() else {
            return TaskResponse::Complete(v_none());
        };
        if let Some(id) = finalizable_id(&value) {
            self.probe.state().finalized.push(id);
        }
        match &self.behavior {
            FinalizerBehavior::Raise(message) => TaskResponse::Abort(message.clone()),
            _ => TaskResponse::Complete(v_none()),
        }
    }

    fn describe(&self) -> String {
        "finalizer".to_string()
    }
}
