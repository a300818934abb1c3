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

//! Values waiting for their `recycle` finalizer, and for their final release afterwards.
//!
//! Entries arrive here from two producers: an anonymous object or waif whose last reference was
//! just released (via the `FinalizeSink` impl), and `enqueue`, used by the cycle collector for
//! garbage it has proven unreachable. A value can be queued only once; the claim lives in the
//! value's heap header.
//!
//! The queue holds each value pinned: alive, but not counted. Draining runs the finalizer for
//! each new entry, marks it finalized, and frees finalized entries whose count is back at zero.
//! Finalizers run without the queue locked, since they may well release more finalizable values.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use stunt_var::{
    DecodingError, FinalizeError, FinalizeSink, Pinned, SinkRef, Var, VarReader, VarWriter,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FinalizerError {
    #[error("Finalizer aborted: {0}")]
    Aborted(String),
}

/// How the queue calls back into the rest of the server.
pub trait FinalizerDispatch {
    /// Run the value's finalizer. `value` is a fresh ordinary reference.
    fn finalize(&mut self, value: Var) -> Result<(), FinalizerError>;
    /// Called once, just before the queue lets go of a finalized value for good.
    fn destroy(&mut self, value: &Pinned);
}

struct PendingEntry {
    value: Pinned,
    finalized: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DrainStats {
    pub finalized: usize,
    pub failed: usize,
    pub freed: usize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FinalizationStats {
    pub queued: usize,
    pub awaiting_finalizer: usize,
    pub awaiting_release: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntrySummary {
    pub id: u64,
    pub finalized: bool,
    pub refcount: usize,
}

#[derive(Default)]
pub struct FinalizationQueue {
    entries: Mutex<Vec<PendingEntry>>,
}

const PENDING_SUFFIX: &str = " values pending finalization";

impl FinalizationQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entries(&self) -> MutexGuard<'_, Vec<PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// What new finalizable values should be created with.
    pub fn sink(self: &Arc<Self>) -> SinkRef {
        let sink: Arc<dyn FinalizeSink> = self.clone();
        let weak: Weak<dyn FinalizeSink> = Arc::downgrade(&sink);
        Some(weak)
    }

    /// Queue a still-referenced value (cycle collector path).
    pub fn enqueue(&self, value: &Var) -> Result<(), FinalizeError> {
        let pinned = value.claim_for_finalization()?;
        self.push(pinned, false);
        Ok(())
    }

    fn push(&self, value: Pinned, finalized: bool) {
        let mut entries = self.entries();
        debug_assert!(
            !entries.iter().any(|e| e.value.ptr_eq(&value)),
            "value queued for finalization twice"
        );
        entries.push(PendingEntry { value, finalized });
    }

    /// One pass: run finalizers for new entries, then free what is finished.
    pub fn drain_once(&self, dispatch: &mut dyn FinalizerDispatch) -> DrainStats {
        let mut stats = DrainStats::default();

        let to_finalize: Vec<Pinned> = {
            let mut entries = self.entries();
            entries
                .iter_mut()
                .filter(|e| !e.finalized)
                .map(|e| {
                    e.finalized = true;
                    e.value.clone()
                })
                .collect()
        };
        for pinned in to_finalize {
            stats.finalized += 1;
            if let Err(e) = dispatch.finalize(pinned.revive()) {
                // The entry stays finalized; it'll be freed like any other once released.
                warn!(value = ?pinned, ?e, "Finalizer failed");
                stats.failed += 1;
            }
        }

        let released: Vec<Pinned> = {
            let mut entries = self.entries();
            let mut released = vec![];
            entries.retain(|e| {
                if e.finalized && e.value.refcount() == 0 {
                    released.push(e.value.clone());
                    false
                } else {
                    true
                }
            });
            released
        };
        for pinned in released {
            debug!(value = ?pinned, "Freeing finalized value");
            dispatch.destroy(&pinned);
            stats.freed += 1;
            // Last pin; dropping it may release further values back into this queue.
            drop(pinned);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FinalizationStats {
        let entries = self.entries();
        let awaiting_finalizer = entries.iter().filter(|e| !e.finalized).count();
        FinalizationStats {
            queued: entries.len(),
            awaiting_finalizer,
            awaiting_release: entries.len() - awaiting_finalizer,
        }
    }

    pub fn summary(&self) -> Vec<EntrySummary> {
        self.entries()
            .iter()
            .map(|e| EntrySummary {
                id: e.value.id(),
                finalized: e.finalized,
                refcount: e.value.refcount(),
            })
            .collect()
    }

    /// Write every pending entry, finalized or not.
    pub fn persist<W: Write>(&self, writer: &mut VarWriter<W>) -> Result<usize, std::io::Error> {
        let snapshot: Vec<(Pinned, bool)> = self
            .entries()
            .iter()
            .map(|e| (e.value.clone(), e.finalized))
            .collect();
        writer.write_line(&format!("{}{PENDING_SUFFIX}", snapshot.len()))?;
        for (value, finalized) in &snapshot {
            writer.write_line(if *finalized { "1" } else { "0" })?;
            writer.write_pinned(value)?;
        }
        Ok(snapshot.len())
    }

    /// Read back what `persist` wrote, appending to this queue with each entry's flag intact.
    /// `reader` should have been created with this queue's `sink()`.
    pub fn restore<R: BufRead>(&self, reader: &mut VarReader<R>) -> Result<usize, DecodingError> {
        let header = reader.read_line()?;
        let count: usize = header
            .strip_suffix(PENDING_SUFFIX)
            .and_then(|n| n.trim().parse().ok())
            .ok_or_else(|| DecodingError::Parse {
                line: reader.line(),
                message: format!("expected pending finalization count, got {header:?}"),
            })?;
        for _ in 0..count {
            let finalized = match reader.read_num()? {
                0 => false,
                1 => true,
                n => {
                    return Err(DecodingError::Parse {
                        line: reader.line(),
                        message: format!("bad finalized flag {n}"),
                    });
                }
            };
            let value = reader.read_pinned()?;
            self.push(value, finalized);
        }
        Ok(count)
    }
}

impl FinalizeSink for FinalizationQueue {
    fn enqueue(&self, value: Pinned) {
        self.push(value, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use stunt_var::{AnonObject, Obj, SYSTEM_OBJECT, Waif, v_anon, v_int, v_str, v_waif};

    #[derive(Default)]
    struct Recorder {
        finalized: Vec<u64>,
        destroyed: Vec<u64>,
        keep: Vec<Var>,
        fail: bool,
        keep_alive: bool,
    }

    impl FinalizerDispatch for Recorder {
        fn finalize(&mut self, value: Var) -> Result<(), FinalizerError> {
            let pinned = value.claim_for_finalization().err();
            assert_eq!(pinned, Some(FinalizeError::AlreadyQueued));
            self.finalized.push(match value.variant() {
                stunt_var::Variant::Anon(a) => a.id(),
                stunt_var::Variant::Waif(w) => w.id(),
                _ => unreachable!(),
            });
            if self.keep_alive {
                self.keep.push(value);
            }
            if self.fail {
                return Err(FinalizerError::Aborted("E_PERM".into()));
            }
            Ok(())
        }

        fn destroy(&mut self, value: &Pinned) {
            self.destroyed.push(value.id());
        }
    }

    fn anon(queue: &Arc<FinalizationQueue>, id: u64) -> Var {
        v_anon(AnonObject::new(id, SYSTEM_OBJECT, queue.sink()))
    }

    #[test]
    fn test_release_enqueues_then_drain_frees() {
        let q = FinalizationQueue::new();
        let a = anon(&q, 1);
        drop(a);
        assert_eq!(q.stats().awaiting_finalizer, 1);

        let mut r = Recorder::default();
        let stats = q.drain_once(&mut r);
        assert_eq!(
            stats,
            DrainStats {
                finalized: 1,
                failed: 0,
                freed: 1
            }
        );
        assert_eq!(r.finalized, vec![1]);
        assert_eq!(r.destroyed, vec![1]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_failed_finalizer_is_not_rerun() {
        let q = FinalizationQueue::new();
        drop(anon(&q, 9));
        let mut r = Recorder {
            fail: true,
            keep_alive: true,
            ..Default::default()
        };
        let stats = q.drain_once(&mut r);
        assert_eq!(stats.failed, 1);
        assert_eq!(
            q.summary(),
            vec![EntrySummary {
                id: 9,
                finalized: true,
                refcount: 1
            }]
        );

        // Still referenced: nothing happens.
        assert_eq!(q.drain_once(&mut r), DrainStats::default());

        r.keep.clear();
        let stats = q.drain_once(&mut r);
        assert_eq!(stats.finalized, 0);
        assert_eq!(stats.freed, 1);
        assert_eq!(r.finalized, vec![9]);
        assert_eq!(r.destroyed, vec![9]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let q = FinalizationQueue::new();
        let a = anon(&q, 2);
        q.enqueue(&a).unwrap();
        assert_eq!(q.enqueue(&a), Err(FinalizeError::AlreadyQueued));
        assert_eq!(q.enqueue(&v_int(1)), Err(FinalizeError::NotFinalizable));
        // The last release doesn't add a second entry.
        drop(a);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_finalizer_releasing_more_values() {
        let q = FinalizationQueue::new();
        let inner = anon(&q, 11);
        let outer = v_waif(Waif::new(10, SYSTEM_OBJECT, SYSTEM_OBJECT, vec![inner], q.sink()));
        drop(outer);

        let mut r = Recorder::default();
        q.drain_once(&mut r);
        // Freeing the waif released the anonymous object it held.
        assert_eq!(q.summary().iter().map(|e| e.id).collect::<Vec<_>>(), vec![11]);
        q.drain_once(&mut r);
        assert_eq!(r.finalized, vec![10, 11]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_persist_restore_round_trip() {
        let q = FinalizationQueue::new();
        drop(anon(&q, 1));
        let mut r = Recorder {
            keep_alive: true,
            ..Default::default()
        };
        q.drain_once(&mut r);
        drop(v_waif(Waif::new(
            2,
            Obj::mk_id(5),
            Obj::mk_id(3),
            vec![v_str("prop"), v_int(4)],
            q.sink(),
        )));
        drop(anon(&q, 3));

        let mut w = VarWriter::new(vec![]);
        assert_eq!(q.persist(&mut w).unwrap(), 3);
        let text = String::from_utf8(w.into_inner()).unwrap();
        assert!(text.starts_with("3 values pending finalization\n1\n12\n1\n"));

        let restored = FinalizationQueue::new();
        let mut reader = VarReader::new(Cursor::new(text), restored.sink());
        assert_eq!(restored.restore(&mut reader).unwrap(), 3);
        let flags: Vec<_> = restored
            .summary()
            .iter()
            .map(|e| (e.id, e.finalized, e.refcount))
            .collect();
        assert_eq!(flags, vec![(1, true, 0), (2, false, 0), (3, false, 0)]);

        // Only the not-yet-finalized entries get their finalizers run after restore.
        let mut after = Recorder::default();
        restored.drain_once(&mut after);
        assert_eq!(after.finalized, vec![2, 3]);
        assert_eq!(after.destroyed, vec![1, 2, 3]);
    }
}
