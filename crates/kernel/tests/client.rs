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
    use crate::common::{test_config, test_scheduler};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use stunt_common::tasks::SchedulerError;
    use stunt_kernel::builtins::BuiltinTask;
    use stunt_kernel::tasks::finalization::FinalizationStats;
    use stunt_kernel::tasks::checkpoint::latest_checkpoint;
    use stunt_kernel::testing::{FinalizerBehavior, ScriptedTask};
    use stunt_var::{SYSTEM_OBJECT, v_int, v_str};

    #[test]
    fn test_client_drives_running_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) =
            test_scheduler(test_config(20, Some(dir.path())), FinalizerBehavior::None);
        let client = scheduler.client();
        let scheduler_thread = std::thread::spawn(move || scheduler.run());

        let task = BuiltinTask::new("string_hash", vec![v_str("abc")]).unwrap();
        let handle = client
            .submit_task(SYSTEM_OBJECT, None, Box::new(task))
            .unwrap();
        let digest = handle
            .receiver()
            .recv_timeout(Duration::from_secs(10))
            .unwrap()
            .unwrap();
        assert_eq!(
            digest.as_str(),
            Some("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD")
        );

        // Parked on a thread that only finishes once killed.
        let (task, resumes) = ScriptedTask::background("parked", v_int(1), |arg, waiter| {
            while waiter.is_active() {
                std::thread::sleep(Duration::from_millis(5));
            }
            arg
        });
        let handle = client
            .submit_task(SYSTEM_OBJECT, None, Box::new(task))
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let threads = loop {
            let threads = client.background_threads().unwrap();
            if !threads.is_empty() {
                break threads;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(threads[0].task_id, handle.task_id());
        assert_eq!(threads[0].title, "parked");

        client.request_checkpoint().unwrap();
        assert!(latest_checkpoint(dir.path()).unwrap().is_some());

        client.kill_task(handle.task_id()).unwrap();
        assert_eq!(
            handle.receiver().recv_timeout(Duration::from_secs(10)).unwrap(),
            Err(SchedulerError::TaskAbortedCancelled)
        );
        assert_eq!(
            client.kill_task(handle.task_id()),
            Err(SchedulerError::TaskNotFound(handle.task_id()))
        );
        assert_eq!(
            client.finalization_stats().unwrap(),
            FinalizationStats::default()
        );

        client.submit_shutdown(Some("test over")).unwrap();
        let report = scheduler_thread.join().unwrap();
        assert!(!report.timed_out);
        assert_eq!(report.outstanding_threads, 0);
        assert!(report.final_checkpoint.is_some());
        assert!(resumes.resumes().is_empty());
        assert!(client.background_threads().is_err());
    }
}
