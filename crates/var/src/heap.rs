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

//! Heap cells for composite values.
//!
//! Every composite payload lives in a `HeapCell` which pairs the payload with a `Header` holding
//! the logical (MOO-visible) reference count, the cycle collector's color, and the bookkeeping
//! bits the finalization machinery needs. Memory itself is owned by an `Arc`; the logical count
//! is what decides when a value is "dead" as far as the interpreter is concerned, which is not
//! always the same moment its memory goes away (see `HeapPayload::on_last_release`).

use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use strum::FromRepr;

/// Tri-color (plus extras) marks used by the synchronous cycle collector.
///
/// Acyclic payloads (strings) are born and stay `Green`. Everything else starts `Black` (in
/// use), and is marked `Purple` (a possible root of a garbage cycle) whenever its count is
/// decremented without reaching zero.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromRepr)]
pub enum GcColor {
    Green = 0,
    Yellow = 1,
    Black = 2,
    Gray = 3,
    White = 4,
    Purple = 5,
    Pink = 6,
}

pub struct Header {
    refs: AtomicUsize,
    color: AtomicU8,
    buffered: AtomicBool,
    queued: AtomicBool,
}

impl Header {
    fn new(may_cycle: bool) -> Self {
        let color = if may_cycle {
            GcColor::Black
        } else {
            GcColor::Green
        };
        Self {
            refs: AtomicUsize::new(1),
            color: AtomicU8::new(color as u8),
            buffered: AtomicBool::new(false),
            queued: AtomicBool::new(false),
        }
    }

    pub fn refcount(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn color(&self) -> GcColor {
        GcColor::from_repr(self.color.load(Ordering::Relaxed)).unwrap_or(GcColor::Black)
    }

    pub fn set_color(&self, color: GcColor) {
        self.color.store(color as u8, Ordering::Relaxed);
    }

    /// Whether the collector has this cell in its possible-roots buffer.
    pub fn is_buffered(&self) -> bool {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Returns the previous value.
    pub fn set_buffered(&self, buffered: bool) -> bool {
        self.buffered.swap(buffered, Ordering::AcqRel)
    }

    /// Claim the one-and-only slot this value gets in a finalization queue. Returns false if
    /// some other producer already claimed it.
    pub fn mark_queued(&self) -> bool {
        self.queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }
}

impl Debug for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("refs", &self.refcount())
            .field("color", &self.color())
            .field("buffered", &self.is_buffered())
            .field("queued", &self.is_queued())
            .finish()
    }
}

pub struct HeapCell<T> {
    header: Header,
    payload: T,
}

impl<T> HeapCell<T> {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }
}

/// Something that can live behind a `Ref`.
pub trait HeapPayload: Send + Sync + Sized + 'static {
    /// Whether values of this kind can (transitively) contain themselves.
    const MAY_CYCLE: bool = false;

    /// Called when the logical count goes from 1 to 0, while `cell` is still alive.
    /// The default does nothing, so the memory is reclaimed as soon as the last `Arc` goes.
    /// Kinds that need a finalizer use this to hand themselves to a queue instead.
    fn on_last_release(_cell: &Arc<HeapCell<Self>>) {}
}

/// A counted reference to a heap payload. `Clone` is `share`, `Drop` is `release`.
pub struct Ref<T: HeapPayload> {
    cell: Arc<HeapCell<T>>,
}

impl<T: HeapPayload> Ref<T> {
    pub fn new(payload: T) -> Self {
        Self {
            cell: Arc::new(HeapCell {
                header: Header::new(T::MAY_CYCLE),
                payload,
            }),
        }
    }

    /// Take a fresh logical reference to a cell that is being kept alive by other means (a
    /// finalization queue entry).
    pub fn revive(cell: &Arc<HeapCell<T>>) -> Self {
        cell.header.refs.fetch_add(1, Ordering::AcqRel);
        Self { cell: cell.clone() }
    }

    pub fn refcount(&self) -> usize {
        self.cell.header.refcount()
    }

    pub fn header(&self) -> &Header {
        &self.cell.header
    }

    pub fn cell(&self) -> &Arc<HeapCell<T>> {
        &self.cell
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: HeapPayload> Clone for Ref<T> {
    fn clone(&self) -> Self {
        self.cell.header.refs.fetch_add(1, Ordering::Relaxed);
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: HeapPayload> Drop for Ref<T> {
    fn drop(&mut self) {
        let prev = self.cell.header.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "over-release of heap value");
        if prev == 1 {
            T::on_last_release(&self.cell);
        } else if T::MAY_CYCLE {
            self.cell.header.set_color(GcColor::Purple);
        }
    }
}

impl<T: HeapPayload> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.cell.payload
    }
}

impl<T: HeapPayload + Debug> Debug for Ref<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.cell.payload.fmt(f)
    }
}

impl HeapPayload for String {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    pub(crate) struct Tracked {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl HeapPayload for Tracked {
        const MAY_CYCLE: bool = true;
    }

    fn tracked() -> (Ref<Tracked>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        (
            Ref::new(Tracked {
                drops: drops.clone(),
            }),
            drops,
        )
    }

    #[test]
    fn test_share_release_counts() {
        let (r, drops) = tracked();
        assert_eq!(r.refcount(), 1);
        let r2 = r.clone();
        assert_eq!(r.refcount(), 2);
        assert!(r.ptr_eq(&r2));
        drop(r2);
        assert_eq!(r.refcount(), 1);
        assert_eq!(r.header().color(), GcColor::Purple);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(r);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acyclic_stays_green() {
        let s = Ref::new("hello".to_string());
        let s2 = s.clone();
        drop(s2);
        assert_eq!(s.header().color(), GcColor::Green);
    }

    #[test]
    fn test_mark_queued_once() {
        let (r, _) = tracked();
        assert!(r.header().mark_queued());
        assert!(!r.header().mark_queued());
        assert!(r.header().is_queued());
    }

    proptest! {
        /// Any interleaving of shares and releases over a pool of references frees the payload
        /// exactly once, and only when the last one goes.
        #[test]
        fn prop_freed_exactly_once(ops in proptest::collection::vec(any::<(bool, usize)>(), 0..200)) {
            let (root, drops) = tracked();
            let mut live = vec![root];
            for (share, pick) in ops {
                if live.is_empty() {
                    break;
                }
                let idx = pick % live.len();
                if share {
                    let copy = live[idx].clone();
                    live.push(copy);
                } else {
                    live.swap_remove(idx);
                }
                prop_assert_eq!(drops.load(Ordering::SeqCst), usize::from(live.is_empty()));
                if let Some(any) = live.first() {
                    prop_assert_eq!(any.refcount(), live.len());
                }
            }
            drop(live);
            prop_assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
    }
}

#[cfg(test)]
mod shuttle_tests {
    use super::*;
    use shuttle::{check_random, thread};
    use std::sync::atomic::AtomicUsize;

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl HeapPayload for Counted {}

    #[test]
    fn shuttle_cross_thread_share_release() {
        check_random(
            || {
                let drops = Arc::new(AtomicUsize::new(0));
                let root = Ref::new(Counted(drops.clone()));
                let mut handles = vec![];
                for i in 0..3 {
                    let mine = root.clone();
                    handles.push(thread::spawn(move || {
                        let extra: Vec<_> = (0..i).map(|_| mine.clone()).collect();
                        thread::yield_now();
                        drop(extra);
                        drop(mine);
                    }));
                }
                drop(root);
                for h in handles {
                    h.join().unwrap();
                }
                assert_eq!(drops.load(Ordering::SeqCst), 1);
            },
            500,
        );
    }
}
