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

//! Values whose destruction is observable from MOO code: anonymous objects and waifs.
//!
//! When the last ordinary reference to one of these goes away it is not freed. Instead it is
//! handed, still allocated, to the `FinalizeSink` it was created with so the server can run its
//! `recycle` verb first. The sink holds it as a `Pinned` value: the memory stays alive but no
//! logical reference is held, so the count the sink observes is the count MOO code holds.

use crate::heap::{HeapCell, HeapPayload, Ref};
use crate::{Obj, Var};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Where dead finalizable values go.
pub trait FinalizeSink: Send + Sync {
    fn enqueue(&self, value: Pinned);
}

pub type SinkRef = Option<Weak<dyn FinalizeSink>>;

pub struct AnonObject {
    id: u64,
    parent: Obj,
    sink: SinkRef,
}

impl AnonObject {
    pub fn new(id: u64, parent: Obj, sink: SinkRef) -> Self {
        Self { id, parent, sink }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent(&self) -> Obj {
        self.parent
    }
}

impl Debug for AnonObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "*anonymous {} (parent {})*", self.id, self.parent)
    }
}

impl HeapPayload for AnonObject {
    const MAY_CYCLE: bool = true;

    fn on_last_release(cell: &Arc<HeapCell<Self>>) {
        hand_off(&cell.payload().sink, cell.header(), || {
            Pinned::Anon(cell.clone())
        });
    }
}

/// A lightweight, unnumbered object: a class, an owner, and a vector of property values.
pub struct Waif {
    id: u64,
    class: Obj,
    owner: Obj,
    propvals: Vec<Var>,
    sink: SinkRef,
}

impl Waif {
    pub fn new(id: u64, class: Obj, owner: Obj, propvals: Vec<Var>, sink: SinkRef) -> Self {
        Self {
            id,
            class,
            owner,
            propvals,
            sink,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> Obj {
        self.class
    }

    pub fn owner(&self) -> Obj {
        self.owner
    }

    pub fn propvals(&self) -> &[Var] {
        &self.propvals
    }
}

impl Debug for Waif {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[[class = {}, owner = {}]]", self.class, self.owner)
    }
}

impl HeapPayload for Waif {
    const MAY_CYCLE: bool = true;

    fn on_last_release(cell: &Arc<HeapCell<Self>>) {
        hand_off(&cell.payload().sink, cell.header(), || {
            Pinned::Waif(cell.clone())
        });
    }
}

fn hand_off(sink: &SinkRef, header: &crate::heap::Header, pin: impl FnOnce() -> Pinned) {
    // No sink (or the sink is gone): nobody can run a finalizer, so just let it be freed.
    let Some(sink) = sink.as_ref() else {
        return;
    };
    let Some(sink) = sink.upgrade() else {
        debug!("Finalization sink is gone; freeing without finalizer");
        return;
    };
    // Already queued (by the collector, or a previous release after revival): the queue entry
    // owns the memory and will free it once it sees the count at zero.
    if !header.mark_queued() {
        return;
    }
    sink.enqueue(pin());
}

/// A finalizable value held alive without a logical reference.
#[derive(Clone)]
pub enum Pinned {
    Anon(Arc<HeapCell<AnonObject>>),
    Waif(Arc<HeapCell<Waif>>),
}

impl Pinned {
    pub fn refcount(&self) -> usize {
        match self {
            Pinned::Anon(c) => c.header().refcount(),
            Pinned::Waif(c) => c.header().refcount(),
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Pinned::Anon(c) => c.payload().id,
            Pinned::Waif(c) => c.payload().id,
        }
    }

    pub fn is_queued(&self) -> bool {
        match self {
            Pinned::Anon(c) => c.header().is_queued(),
            Pinned::Waif(c) => c.header().is_queued(),
        }
    }

    /// Take a new ordinary reference to the value, e.g. to pass it as `this` to its finalizer.
    pub fn revive(&self) -> Var {
        match self {
            Pinned::Anon(c) => Var::from_anon(Ref::revive(c)),
            Pinned::Waif(c) => Var::from_waif(Ref::revive(c)),
        }
    }

    pub fn ptr_eq(&self, other: &Pinned) -> bool {
        match (self, other) {
            (Pinned::Anon(a), Pinned::Anon(b)) => Arc::ptr_eq(a, b),
            (Pinned::Waif(a), Pinned::Waif(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Debug for Pinned {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Pinned::Anon(c) => c.payload().fmt(f),
            Pinned::Waif(c) => c.payload().fmt(f),
        }
    }
}
