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

mod common;

#[cfg(test)]
mod test {
    use crate::common::{run_until, test_config, test_scheduler};
    use pretty_assertions::assert_eq;
    use stunt_kernel::builtins::BuiltinTask;
    use stunt_kernel::tasks::finalization::FinalizationStats;
    use stunt_kernel::testing::FinalizerBehavior;
    use stunt_var::{AnonObject, SYSTEM_OBJECT, v_anon, v_obj};

    #[test]
    fn test_raising_finalizer_is_not_rerun() {
        let (mut scheduler, probe) = test_scheduler(
            test_config(20, None),
            FinalizerBehavior::Raise("E_INVARG: recycle failed".to_string()),
        );
        let anon = v_anon(AnonObject::new(
            7,
            SYSTEM_OBJECT,
            scheduler.finalizers().sink(),
        ));
        // Found by the collector while still referenced.
        scheduler.finalizers().enqueue(&anon).unwrap();

        scheduler.run_once();
        assert_eq!(probe.finalized(), vec![7]);
        assert!(probe.destroyed().is_empty());
        assert_eq!(
            scheduler.finalizers().stats(),
            FinalizationStats {
                queued: 1,
                awaiting_finalizer: 0,
                awaiting_release: 1,
            }
        );
        assert_eq!(scheduler.stats().aborted, 1);

        drop(anon);
        scheduler.run_once();
        scheduler.run_once();
        assert_eq!(probe.finalized(), vec![7]);
        assert_eq!(probe.destroyed(), vec![7]);
        assert!(scheduler.finalizers().is_empty());
    }

    #[test]
    fn test_waif_finalized_on_last_release() {
        let (mut scheduler, probe) =
            test_scheduler(test_config(20, None), FinalizerBehavior::Succeed);
        let task = BuiltinTask::new("new_waif", vec![v_obj(SYSTEM_OBJECT)]).unwrap();
        let handle = scheduler
            .submit_task(SYSTEM_OBJECT, None, Box::new(task))
            .unwrap();
        scheduler.run_once();
        let waif = handle.receiver().try_recv().unwrap().unwrap();
        assert_eq!(waif.refcount(), Some(1));
        assert!(scheduler.finalizers().is_empty());

        let shared = waif.share();
        waif.release();
        assert!(scheduler.finalizers().is_empty());
        shared.release();
        assert_eq!(scheduler.finalizers().len(), 1);

        run_until(&mut scheduler, |s| s.finalizers().is_empty());
        assert_eq!(probe.finalized(), vec![1]);
        assert_eq!(probe.destroyed(), vec![1]);
    }

    #[test]
    fn test_values_without_finalizer_are_freed() {
        let (mut scheduler, probe) =
            test_scheduler(test_config(20, None), FinalizerBehavior::None);
        let anon = v_anon(AnonObject::new(3, SYSTEM_OBJECT, scheduler.finalizers().sink()));
        drop(anon);
        assert_eq!(scheduler.finalizers().len(), 1);
        scheduler.run_once();
        assert!(probe.finalized().is_empty());
        assert_eq!(probe.destroyed(), vec![3]);
        assert!(scheduler.finalizers().is_empty());
    }
}
