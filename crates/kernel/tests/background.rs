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
    use stunt_common::tasks::SchedulerError;
    use stunt_kernel::builtins::BuiltinTask;
    use stunt_kernel::tasks::TaskHandle;
    use stunt_kernel::tasks::background::{BackgroundRequest, TaskEnumAction};
    use stunt_kernel::tasks::sessions::SessionGuard;
    use stunt_kernel::tasks::task::{TaskInput, TaskResponse};
    use stunt_kernel::testing::{FinalizerBehavior, MockTransport, ScriptedTask};
    use stunt_var::{E_QUOTA, SYSTEM_OBJECT, v_int, v_none, v_str, v_string};

    fn gated(gate: &flume::Receiver<()>, argument: i64) -> (ScriptedTask, stunt_kernel::testing::ResumeProbe) {
        let gate = gate.clone();
        ScriptedTask::background("gated", v_int(argument), move |arg, _waiter| {
            let _ = gate.recv();
            arg
        })
    }

    fn finished(handle: &TaskHandle) -> Option<Result<stunt_var::Var, SchedulerError>> {
        handle.receiver().try_recv().ok()
    }

    #[test]
    fn test_cap_of_twenty_with_twenty_five_requests() {
        let (mut scheduler, _) = test_scheduler(test_config(20, None), FinalizerBehavior::None);
        let (release, gate) = flume::unbounded();

        let handles: Vec<_> = (0..25)
            .map(|i| {
                let (task, _) = gated(&gate, i);
                scheduler
                    .submit_task(SYSTEM_OBJECT, None, Box::new(task))
                    .unwrap()
            })
            .collect();
        scheduler.run_once();

        assert_eq!(scheduler.gateway().live_waiters(), 20);
        for handle in &handles[..20] {
            assert!(finished(handle).is_none());
        }
        // The rest were refused before any thread started, and resumed with the error.
        for handle in &handles[20..] {
            let result = finished(handle).unwrap().unwrap();
            assert_eq!(result.error_map_code(), Some(E_QUOTA));
        }

        // One finishes, which makes room for one more.
        release.send(()).unwrap();
        wait_for_threads(&scheduler, 19);
        let (task, _) = gated(&gate, 100);
        let extra = scheduler
            .submit_task(SYSTEM_OBJECT, None, Box::new(task))
            .unwrap();
        scheduler.run_once();
        assert_eq!(scheduler.gateway().live_waiters(), 20);
        assert!(finished(&extra).is_none());

        for _ in 0..20 {
            release.send(()).unwrap();
        }
        let mut results = vec![];
        let mut pending: Vec<_> = handles[..20].iter().chain([&extra]).collect();
        run_until(&mut scheduler, |_| {
            pending.retain(|h| match finished(h) {
                Some(result) => {
                    results.push(result.unwrap().as_int().unwrap());
                    false
                }
                None => true,
            });
            pending.is_empty()
        });
        results.sort();
        let mut expected: Vec<i64> = (0..20).collect();
        expected.push(100);
        assert_eq!(results, expected);
        assert_eq!(scheduler.stats().resumed, 21);
    }

    #[test]
    fn test_killed_before_completion_is_never_resumed() {
        let (mut scheduler, _) = test_scheduler(test_config(20, None), FinalizerBehavior::None);
        let (release, gate) = flume::unbounded();
        let (task, resumes) = gated(&gate, 1);
        let handle = scheduler
            .submit_task(SYSTEM_OBJECT, None, Box::new(task))
            .unwrap();
        scheduler.run_once();
        assert_eq!(scheduler.gateway().live_waiters(), 1);

        scheduler.kill_task(handle.task_id()).unwrap();
        assert_eq!(
            finished(&handle),
            Some(Err(SchedulerError::TaskAbortedCancelled))
        );

        release.send(()).unwrap();
        wait_for_threads(&scheduler, 0);
        for _ in 0..5 {
            scheduler.run_once();
        }
        assert!(resumes.resumes().is_empty());
        let stats = scheduler.stats();
        assert_eq!(stats.resumed, 0);
        assert_eq!(stats.killed, 1);
        // The worker saw its waiter inactive and never sent the result.
        assert_eq!(stats.discarded, 0);
    }

    #[test]
    fn test_killed_after_completion_discards_result_once() {
        let (mut scheduler, _) = test_scheduler(test_config(20, None), FinalizerBehavior::None);
        let (task, resumes) =
            ScriptedTask::background("quick", v_str("done"), |arg, _waiter| arg);
        let handle = scheduler
            .submit_task(SYSTEM_OBJECT, None, Box::new(task))
            .unwrap();
        scheduler.run_once();

        // The result is sitting in the channel, not yet seen by the scheduler.
        wait_for_threads(&scheduler, 0);
        scheduler.kill_task(handle.task_id()).unwrap();
        for _ in 0..5 {
            scheduler.run_once();
        }
        assert!(resumes.resumes().is_empty());
        assert_eq!(scheduler.stats().discarded, 1);
        assert_eq!(scheduler.stats().resumed, 0);
    }

    #[test]
    fn test_kill_matching_waiting_tasks() {
        let (mut scheduler, _) = test_scheduler(test_config(20, None), FinalizerBehavior::None);
        let (release, gate) = flume::unbounded();
        let (task, _) = gated(&gate, 1);
        let handle = scheduler
            .submit_task(SYSTEM_OBJECT, None, Box::new(task))
            .unwrap();
        scheduler.run_once();

        let tasks = scheduler.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, "waiting on thread 1");

        let killed = scheduler.kill_matching(|task_id, _status| {
            if task_id == handle.task_id() {
                TaskEnumAction::Kill
            } else {
                TaskEnumAction::Continue
            }
        });
        assert_eq!(killed, 1);
        assert!(scheduler.tasks().is_empty());
        release.send(()).unwrap();
        wait_for_threads(&scheduler, 0);
    }

    #[test]
    fn test_inline_mode_runs_on_scheduler_thread() {
        let (mut scheduler, _) = test_scheduler(test_config(20, None), FinalizerBehavior::None);
        scheduler.gateway().set_threading(false);
        let task = BuiltinTask::new("string_hash", vec![v_str("abc")]).unwrap();
        let handle = scheduler
            .submit_task(SYSTEM_OBJECT, None, Box::new(task))
            .unwrap();
        scheduler.run_once();
        assert_eq!(
            finished(&handle).unwrap().unwrap(),
            v_str("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD")
        );
        assert_eq!(scheduler.stats().resumed, 0);
    }

    #[test]
    fn test_command_from_connection() {
        let (mut scheduler, _) = test_scheduler(test_config(20, None), FinalizerBehavior::None);
        let (transport, probe) = MockTransport::new("10.1.2.3:5555");
        let session = scheduler.sessions().open(Box::new(transport));
        scheduler
            .sessions()
            .push_input(session.id(), "connection_name_lookup()".to_string());
        run_until(&mut scheduler, |_| !probe.sent().is_empty());
        assert_eq!(probe.sent(), vec![r#"=> "10.1.2.3:5555""#.to_string()]);
        assert_eq!(session.activity(), 0);

        scheduler
            .sessions()
            .push_input(session.id(), "no_such_thing(1)".to_string());
        run_until(&mut scheduler, |_| probe.sent().len() == 2);
        assert_eq!(probe.sent()[1], "!! Unknown built-in function: no_such_thing");
    }

    #[test]
    fn test_held_connection_is_not_swept_until_released() {
        let (mut scheduler, _) = test_scheduler(test_config(20, None), FinalizerBehavior::None);
        let (transport, probe) = MockTransport::new("10.0.0.1");
        let session = scheduler.sessions().open(Box::new(transport)).id();
        let (release, gate) = flume::unbounded::<()>();

        let mut gate = Some(gate);
        let task = ScriptedTask::new("lookup", move |input, ctx| match input {
            TaskInput::Start => {
                let guard = ctx
                    .session
                    .and_then(|s| ctx.sessions.acquire(s))
                    .unwrap();
                let Some(gate) = gate.take() else {
                    return TaskResponse::Abort("started twice".to_string());
                };
                let request = BackgroundRequest::new("lookup", v_none(), move |_, waiter| {
                    let _ = gate.recv();
                    let name = waiter.extra::<SessionGuard>().and_then(|g| g.peer_name());
                    name.map(v_string).unwrap_or_else(v_none)
                })
                .with_extra(guard);
                TaskResponse::Background(request)
            }
            TaskInput::Resume(value) => TaskResponse::Complete(value),
        });
        scheduler
            .submit_task(SYSTEM_OBJECT, Some(session), Box::new(task))
            .unwrap();
        scheduler.run_once();
        scheduler.sessions().request_disconnect(session);

        for _ in 0..5 {
            scheduler.run_once();
        }
        assert!(!probe.is_closed());
        assert_eq!(scheduler.sessions().get(session).unwrap().activity(), 1);

        release.send(()).unwrap();
        run_until(&mut scheduler, |s| s.sessions().get(session).is_none());
        assert!(probe.is_closed());
        assert_eq!(probe.sent(), vec![r#"=> "10.0.0.1""#.to_string()]);
    }
}
