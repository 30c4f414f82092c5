mod common;

use common::{SCRATCH, call, hosted, poll_events, recording, run_next, spawn, syscall};
use kernel::{KernelError, RunState, Schedule, Trap, TrapExit};
use kernel_syscall::{ABI_SYSTEM_V, EventType, Observation, Sysno, ThreadFlags, WAIT_INFINITE};

#[test]
fn timer_rotates_threads_in_fifo_order() {
    let (kernel, switch) = recording(1);
    let a = spawn(&kernel, ThreadFlags::new());
    let b = spawn(&kernel, ThreadFlags::new());
    let c = spawn(&kernel, ThreadFlags::new());

    assert_eq!(run_next(&kernel, 0).id(), a.id());
    for _ in 0..3 {
        let exit = kernel.trap(0, Trap::Timer).unwrap();
        assert!(matches!(exit, TrapExit::Rescheduled(Schedule::Running(_))));
    }

    let order: Vec<u64> = switch.switches.lock().unwrap().iter().map(|&(_, id)| id).collect();
    assert_eq!(order, [a.id(), b.id(), c.id(), a.id()]);
    assert_eq!(a.state(), RunState::Running);
    assert_eq!(b.state(), RunState::Runnable);
    assert_eq!(kernel.now(), 3 * kernel.config().tick_ns);
}

#[test]
fn yield_goes_behind_waiting_threads() {
    let kernel = hosted(1);
    let a = spawn(&kernel, ThreadFlags::new());
    let b = spawn(&kernel, ThreadFlags::new());
    run_next(&kernel, 0);

    let (exit, frame) = syscall(&kernel, 0, Sysno::Yield, &[]);
    let TrapExit::Rescheduled(Schedule::Running(next)) = exit else {
        panic!("yield did not reschedule: {exit:?}");
    };
    assert_eq!(next.id(), b.id());
    assert_eq!(frame.error(), Some(kernel_syscall::Error::None));
    assert_eq!(a.state(), RunState::Runnable);
    assert_eq!(kernel.scheduler().queued(), 1);
}

#[test]
fn idle_cpu_and_unknown_cpu() {
    let (kernel, switch) = recording(2);
    assert!(matches!(kernel.trap(1, Trap::Timer).unwrap(), TrapExit::Rescheduled(Schedule::Idle)));
    assert_eq!(*switch.idles.lock().unwrap(), 1);
    assert!(matches!(kernel.trap(2, Trap::Timer), Err(KernelError::NoSuchCpu(2))));
}

#[test]
fn exit_hands_the_cpu_on() {
    let kernel = hosted(1);
    let a = spawn(&kernel, ThreadFlags::new());
    let b = spawn(&kernel, ThreadFlags::new());
    run_next(&kernel, 0);

    let (exit, _) = syscall(&kernel, 0, Sysno::ExitThisThread, &[]);
    assert!(matches!(exit, TrapExit::Rescheduled(Schedule::Running(ref t)) if t.id() == b.id()));
    assert_eq!(a.state(), RunState::Exited);

    // an exited thread is never queued again
    assert!(!kernel.scheduler().enqueue(&a));
}

#[test]
fn stopped_thread_is_observed_and_resumed() {
    let kernel = hosted(2);
    spawn(&kernel, ThreadFlags::new());
    run_next(&kernel, 0);

    let (hub, _) = call(&kernel, 0, Sysno::CreateEventHub, &[]);
    let stopped = ThreadFlags::new().with_stopped(true).into_bits();
    let (child, _) = call(
        &kernel,
        0,
        Sysno::CreateThread,
        &[0, 0, 0, ABI_SYSTEM_V, 0x40_1000, 0x1000_1000, u64::from(stopped)],
    );
    assert_eq!(kernel.scheduler().queued(), 0, "stopped threads are not queued");

    let (observe_id, _) = call(&kernel, 0, Sysno::SubmitObserve, &[child, hub, 7, 8]);
    call(&kernel, 0, Sysno::Resume, &[child]);
    let child_thread = run_next(&kernel, 1);

    // a general protection fault stops it and tells the observer
    let exit = kernel.trap(1, Trap::GeneralProtection).unwrap();
    assert!(matches!(exit, TrapExit::Rescheduled(Schedule::Idle)));
    assert_eq!(child_thread.state(), RunState::Fault);
    assert_eq!(child_thread.last_fault(), Some(Trap::GeneralProtection));

    let events = poll_events(&kernel, 0, hub);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Observe);
    assert_eq!(events[0].async_id.cast_unsigned(), observe_id);
    assert_eq!(events[0].msg_request, Observation::GeneralFault as i64);
    assert_eq!((events[0].submit_function, events[0].submit_object), (7, 8));

    // resume it, then watch it exit
    call(&kernel, 0, Sysno::SubmitObserve, &[child, hub, 0, 0]);
    call(&kernel, 0, Sysno::Resume, &[child]);
    assert_eq!(run_next(&kernel, 1).id(), child_thread.id());
    syscall(&kernel, 1, Sysno::ExitThisThread, &[]);

    let events = poll_events(&kernel, 0, hub);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].msg_request, Observation::Exit as i64);

    // resuming a thread that is not stopped is rejected
    let (_, frame) = syscall(&kernel, 0, Sysno::Resume, &[child]);
    assert_eq!(frame.error(), Some(kernel_syscall::Error::IllegalArgs));
}

#[test]
fn fatal_traps_kill_the_thread() {
    let kernel = hosted(1);
    let fatal = spawn(&kernel, ThreadFlags::new().with_traps_are_fatal(true));
    run_next(&kernel, 0);

    kernel.trap(0, Trap::DivideByZero).unwrap();
    assert_eq!(fatal.state(), RunState::Exited);
    assert_eq!(fatal.last_fault(), None);
}

#[test]
fn debug_traps_continue() {
    let kernel = hosted(1);
    let t = spawn(&kernel, ThreadFlags::new().with_traps_are_fatal(true));
    run_next(&kernel, 0);

    assert!(matches!(kernel.trap(0, Trap::Debug).unwrap(), TrapExit::Continue));
    assert_eq!(t.state(), RunState::Running);
}

#[test]
#[should_panic(expected = "double fault")]
fn double_fault_panics() {
    let kernel = hosted(1);
    let _ = kernel.trap(0, Trap::DoubleFault);
}

#[test]
fn an_early_wakeup_leaves_later_waits_untimed() {
    let kernel = hosted(1);
    let t = spawn(&kernel, ThreadFlags::new());
    run_next(&kernel, 0);

    let (hub, _) = call(&kernel, 0, Sysno::CreateEventHub, &[]);
    let (irq, _) = call(&kernel, 0, Sysno::AccessIrq, &[3]);
    call(&kernel, 0, Sysno::SubmitWaitForIrq, &[irq, hub, 0, 0]);

    // a 25 ms wait satisfied right away by the interrupt
    let wait = |timeout: u64| syscall(&kernel, 0, Sysno::WaitForEvents, &[hub, SCRATCH.as_u64(), 4, timeout]).0;
    assert!(matches!(wait(25_000_000), TrapExit::Rescheduled(Schedule::Idle)));
    kernel.trap(0, Trap::Irq(3)).unwrap();
    assert_eq!(t.image().out0(), 1);
    assert_eq!(run_next(&kernel, 0).id(), t.id());

    // the old deadline passes while the thread waits forever
    call(&kernel, 0, Sysno::SubmitWaitForIrq, &[irq, hub, 0, 0]);
    assert!(matches!(wait(WAIT_INFINITE.cast_unsigned()), TrapExit::Rescheduled(Schedule::Idle)));
    for _ in 0..5 {
        kernel.trap(0, Trap::Timer).unwrap();
        assert_eq!(t.state(), RunState::Blocked);
    }

    assert!(kernel.now() > 25_000_000);

    // only an event ends it
    kernel.trap(0, Trap::Irq(3)).unwrap();
    assert_eq!(t.state(), RunState::Runnable);
    assert_eq!(t.image().out0(), 1);
}
