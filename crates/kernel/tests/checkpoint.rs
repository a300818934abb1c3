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
    use crate::common::{run_until, test_config, test_scheduler, wait_for_threads};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use stunt_common::tasks::{CheckpointReason, SchedulerError};
    use stunt_kernel::tasks::checkpoint::latest_checkpoint;
    use stunt_kernel::testing::{FinalizerBehavior, MockDatabase, MockTransport, ScriptedTask};
    use stunt_kernel::Scheduler;
    use stunt_var::{AnonObject, SYSTEM_OBJECT, v_anon, v_int};

    #[test]
    fn test_checkpoint_and_restore_pending_finalizers() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(20, Some(dir.path()));
        let (database, _) = MockDatabase::new(FinalizerBehavior::Succeed);
        let mut scheduler = Scheduler::new(config.clone(), Box::new(database.with_objects(3)));

        let anon = v_anon(AnonObject::new(42, SYSTEM_OBJECT, scheduler.finalizers().sink()));
        scheduler.finalizers().enqueue(&anon).unwrap();

        // The checkpoint is written before this tick's drain, so the entry goes out unfinalized.
        let done = scheduler
            .coordinator()
            .request_and_wait(CheckpointReason::Explicit);
        scheduler.run_once();
        assert_eq!(done.recv().unwrap(), Ok(()));
        assert_eq!(scheduler.stats().checkpoints, 1);

        let path = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(path.extension().unwrap(), "db");
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines[0], "** stunt checkpoint (explicit) **");
        assert_eq!(lines[1], "0 background threads in flight");
        assert_eq!(lines[2], "3 objects");
        assert!(contents.contains("1 values pending finalization"));
        drop(scheduler);
        drop(anon);

        // A fresh process runs the finalizer the checkpoint had not seen run.
        let (database, probe) = MockDatabase::new(FinalizerBehavior::Succeed);
        let mut restored = Scheduler::new(config, Box::new(database));
        let summary = restored.restore_latest().unwrap().unwrap();
        assert_eq!(summary.pending_finalization, 1);
        assert_eq!(summary.in_flight, 0);
        assert_eq!(probe.restored_objects(), Some(3));
        assert_eq!(restored.finalizers().stats().awaiting_finalizer, 1);

        run_until(&mut restored, |s| s.finalizers().is_empty());
        assert_eq!(probe.finalized(), vec![42]);
        assert_eq!(probe.destroyed(), vec![42]);
    }

    #[test]
    fn test_checkpoint_without_directory_fails() {
        let (mut scheduler, _) = test_scheduler(test_config(20, None), FinalizerBehavior::None);
        let done = scheduler
            .coordinator()
            .request_and_wait(CheckpointReason::Explicit);
        scheduler.run_once();
        assert!(matches!(
            done.recv().unwrap(),
            Err(SchedulerError::CheckpointFailed(_))
        ));
        assert_eq!(scheduler.stats().checkpoint_failures, 1);
    }

    #[test]
    fn test_shutdown_waits_for_background_threads() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _) =
            test_scheduler(test_config(20, Some(dir.path())), FinalizerBehavior::None);
        let (transport, probe) = MockTransport::new("peer");
        scheduler.sessions().open(Box::new(transport));

        let (release, gate) = flume::unbounded::<()>();
        let (task, resumes) = ScriptedTask::background("slow", v_int(5), move |arg, _waiter| {
            let _ = gate.recv();
            arg
        });
        let handle = scheduler
            .submit_task(SYSTEM_OBJECT, None, Box::new(task))
            .unwrap();
        scheduler.run_once();
        assert_eq!(scheduler.gateway().live_waiters(), 1);

        scheduler.coordinator().request_shutdown(Some("going down".to_string()));
        assert!(!scheduler.run_once());
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = release.send(());
        });

        let report = scheduler.shutdown();
        assert!(!report.timed_out);
        assert_eq!(report.outstanding_threads, 0);
        assert_eq!(report.resumed_during_drain, 1);
        assert_eq!(report.sessions_held, 0);
        assert_eq!(resumes.resumes(), vec![v_int(5)]);
        assert_eq!(handle.receiver().try_recv().unwrap(), Ok(v_int(5)));
        assert!(probe.is_closed());
        assert_eq!(probe.sent(), vec!["*** Shutting down: going down ***".to_string()]);

        let path = report.final_checkpoint.unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.starts_with("** stunt checkpoint (shutdown) **\n0 background threads"));
    }

    #[test]
    fn test_shutdown_gives_up_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(20, Some(dir.path()));
        config.runtime.shutdown_drain_timeout = Duration::from_millis(100);
        let (mut scheduler, _) = test_scheduler(config, FinalizerBehavior::None);

        let (release, gate) = flume::unbounded::<()>();
        let (task, resumes) = ScriptedTask::background("stuck", v_int(1), move |arg, _waiter| {
            let _ = gate.recv();
            arg
        });
        let handle = scheduler
            .submit_task(SYSTEM_OBJECT, None, Box::new(task))
            .unwrap();
        scheduler.run_once();
        let gateway = scheduler.gateway().clone();
        scheduler.coordinator().request_shutdown(None);

        let report = scheduler.shutdown();
        assert!(report.timed_out);
        assert_eq!(report.outstanding_threads, 1);
        assert!(resumes.resumes().is_empty());
        assert_eq!(
            handle.receiver().try_recv().unwrap(),
            Err(SchedulerError::ShuttingDown)
        );
        // The stuck thread was counted in the final checkpoint.
        let path = report.final_checkpoint.unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("\n1 background threads in flight\n"));

        // It still finishes on its own; nobody is listening any more.
        release.send(()).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while gateway.live_waiters() > 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_no_new_work_once_shutting_down() {
        let (mut scheduler, _) = test_scheduler(test_config(20, None), FinalizerBehavior::None);
        scheduler.coordinator().request_shutdown(None);
        let (task, _) = ScriptedTask::background("late", v_int(1), |arg, _| arg);
        assert!(matches!(
            scheduler.submit_task(SYSTEM_OBJECT, None, Box::new(task)),
            Err(SchedulerError::ShuttingDown)
        ));
        wait_for_threads(&scheduler, 0);
    }
}
