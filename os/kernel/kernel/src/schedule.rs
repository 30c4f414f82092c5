//! # Scheduler
//!
//! One FIFO run queue shared by all CPUs, no priorities. A thread is picked by
//! [`Scheduler::do_schedule`] when the running thread blocks, yields, faults,
//! exits or is preempted by the timer.
//!
//! The queue lock is never held across the context switch: the next thread is
//! popped and recorded as the CPU's current thread first, then the
//! [`ContextSwitch`] hook runs.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::SpinLock;

use crate::thread::{RunState, Thread};

/// Loads a thread's register image and address space onto a CPU.
pub trait ContextSwitch: Send + Sync {
    fn switch_to(&self, cpu: usize, thread: &Thread);

    /// Nothing is runnable; halt until the next interrupt.
    fn idle(&self, _cpu: usize) {}
}

/// Hosted stand-in: the caller drives threads through traps itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContextSwitch;

impl ContextSwitch for NoContextSwitch {
    fn switch_to(&self, _cpu: usize, _thread: &Thread) {}
}

/// Result of a scheduling decision.
#[derive(Debug, Clone)]
pub enum Schedule {
    Running(Arc<Thread>),
    Idle,
}

/// Per-CPU scheduling state.
pub struct Cpu {
    index: usize,
    current: SpinLock<Option<Arc<Thread>>>,
}

impl Cpu {
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<Thread>> {
        self.current.with_lock_irq(|c| c.clone())
    }
}

pub struct Scheduler {
    queue: SpinLock<VecDeque<Arc<Thread>>>,
    cpus: Vec<Cpu>,
    switcher: Arc<dyn ContextSwitch>,
}

impl Scheduler {
    #[must_use]
    pub fn new(cpus: usize, switcher: Arc<dyn ContextSwitch>) -> Self {
        Self {
            queue: SpinLock::new(VecDeque::new()),
            cpus: (0..cpus.max(1))
                .map(|index| Cpu {
                    index,
                    current: SpinLock::new(None),
                })
                .collect(),
            switcher,
        }
    }

    #[inline]
    #[must_use]
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    #[must_use]
    pub fn cpu(&self, index: usize) -> Option<&Cpu> {
        self.cpus.get(index)
    }

    /// The thread running on CPU `cpu`.
    #[must_use]
    pub fn current(&self, cpu: usize) -> Option<Arc<Thread>> {
        self.cpus.get(cpu).and_then(Cpu::current)
    }

    /// Append `thread` to the run queue.
    ///
    /// Only running or runnable threads are queued, and never twice.
    pub fn enqueue(&self, thread: &Arc<Thread>) -> bool {
        self.queue.with_lock_irq(|q| {
            if q.iter().any(|t| Arc::ptr_eq(t, thread)) || !thread.make_runnable() {
                return false;
            }
            q.push_back(Arc::clone(thread));
            true
        })
    }

    /// Number of queued threads.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.with_lock_irq(|q| q.len())
    }

    /// Run the head of the queue on `cpu`, or idle it.
    ///
    /// The previously running thread is not requeued; callers that want it to
    /// run again enqueue it first.
    ///
    /// # Panics
    /// If `cpu` does not exist.
    pub fn do_schedule(&self, cpu: usize) -> Schedule {
        let next = self.queue.with_lock_irq(|q| {
            while let Some(t) = q.pop_front() {
                if t.state() == RunState::Runnable {
                    t.set_state(RunState::Running);
                    return Some(t);
                }
            }
            None
        });
        self.cpus[cpu].current.with_lock_irq(|c| c.clone_from(&next));

        match next {
            Some(thread) => {
                log::trace!("cpu {cpu}: switching to thread {}", thread.id());
                self.switcher.switch_to(cpu, &thread);
                Schedule::Running(thread)
            }
            None => {
                log::trace!("cpu {cpu}: idle");
                self.switcher.idle(cpu);
                Schedule::Idle
            }
        }
    }

    /// Timer preemption: requeue the running thread and pick the next one.
    pub fn preempt(&self, cpu: usize) -> Schedule {
        if let Some(current) = self.current(cpu) {
            self.enqueue(&current);
        }
        self.do_schedule(cpu)
    }
}
