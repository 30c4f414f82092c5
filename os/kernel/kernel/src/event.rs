//! # Event hubs
//!
//! Every asynchronous operation is submitted with a hub, a submit function and
//! a submit object, and is handed an async id. Completing it pushes an
//! [`Event`] carrying all four into the hub, where `WaitForEvents` picks it up.
//!
//! Hubs never run user-memory copies or scheduler calls under their own lock:
//! [`EventHub::raise`] takes the first waiter and the events it will consume
//! while locked, then delivers after unlocking.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_syscall::{EVENT_SIZE, Error, Event, EventType};

use crate::schedule::Scheduler;
use crate::thread::Thread;

/// A submitted operation waiting for its completion.
pub struct AsyncOp {
    hub: Arc<EventHub>,
    async_id: i64,
    function: u64,
    object: u64,
}

impl AsyncOp {
    #[must_use]
    pub const fn new(hub: Arc<EventHub>, async_id: i64, function: u64, object: u64) -> Self {
        Self {
            hub,
            async_id,
            function,
            object,
        }
    }

    #[inline]
    #[must_use]
    pub const fn async_id(&self) -> i64 {
        self.async_id
    }

    /// Stamp the submission data into `event` and raise it.
    pub fn complete(self, mut event: Event) {
        event.async_id = self.async_id;
        event.submit_function = self.function;
        event.submit_object = self.object;
        self.hub.raise(event);
    }

    /// Complete with nothing but an error.
    pub fn fail(self, event_type: EventType, error: Error) {
        self.complete(Event {
            event_type,
            error,
            ..Event::default()
        });
    }
}

impl core::fmt::Debug for AsyncOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncOp").field("async_id", &self.async_id).finish_non_exhaustive()
    }
}

/// How a blocked thread consumes events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// `WaitForEvents`: up to `max` records copied to `buffer`.
    Events { buffer: VirtualAddress, max: usize },
    /// A blocking syscall finishing with the first event's error and length.
    Single,
}

impl WaitKind {
    const fn capacity(self) -> usize {
        match self {
            Self::Events { max, .. } => max,
            Self::Single => 1,
        }
    }
}

/// Outcome of [`EventHub::wait`].
#[derive(Debug)]
pub enum Wait {
    Ready(Vec<Event>),
    /// Parked under a wait id unique to this hub.
    Blocked(u64),
}

struct Waiter {
    id: u64,
    thread: Arc<Thread>,
    kind: WaitKind,
}

#[derive(Default)]
struct HubInner {
    events: VecDeque<Event>,
    waiters: VecDeque<Waiter>,
    next_wait: u64,
}

pub struct EventHub {
    scheduler: Arc<Scheduler>,
    inner: SpinLock<HubInner>,
}

impl EventHub {
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            inner: SpinLock::new(HubInner::default()),
        }
    }

    /// Queue `event`, waking the first waiter if there is one.
    pub fn raise(&self, event: Event) {
        let woken = self.inner.with_lock_irq(|hub| {
            hub.events.push_back(event);
            let waiter = hub.waiters.pop_front()?;
            let n = waiter.kind.capacity().min(hub.events.len());
            let events: Vec<Event> = hub.events.drain(..n).collect();
            Some((waiter, events))
        });
        if let Some((waiter, events)) = woken {
            self.finish(&waiter, &events);
        }
    }

    /// Number of undelivered events.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.with_lock_irq(|hub| hub.events.len())
    }

    /// Take up to `max` events without blocking.
    #[must_use]
    pub fn poll(&self, max: usize) -> Vec<Event> {
        self.inner.with_lock_irq(|hub| {
            let n = max.min(hub.events.len());
            hub.events.drain(..n).collect()
        })
    }

    /// Take queued events, or block `thread` until one arrives.
    pub fn wait(&self, thread: &Arc<Thread>, kind: WaitKind) -> Wait {
        self.inner.with_lock_irq(|hub| {
            if hub.events.is_empty() {
                thread.set_state(crate::RunState::Blocked);
                hub.next_wait += 1;
                let id = hub.next_wait;
                hub.waiters.push_back(Waiter {
                    id,
                    thread: Arc::clone(thread),
                    kind,
                });
                Wait::Blocked(id)
            } else {
                let n = kind.capacity().min(hub.events.len());
                Wait::Ready(hub.events.drain(..n).collect())
            }
        })
    }

    /// End the wait `wait` with zero events. Returns `false` if that wait
    /// already finished.
    pub fn cancel_wait(&self, wait: u64) -> bool {
        let waiter = self.inner.with_lock_irq(|hub| {
            let pos = hub.waiters.iter().position(|w| w.id == wait)?;
            hub.waiters.remove(pos)
        });
        waiter.is_some_and(|w| {
            self.finish(&w, &[]);
            true
        })
    }

    fn finish(&self, waiter: &Waiter, events: &[Event]) {
        let (error, out0) = deliver(&waiter.thread, waiter.kind, events);
        waiter.thread.with_image(|tf| tf.set_result(error, out0, 0));
        if waiter.thread.wake() {
            self.scheduler.enqueue(&waiter.thread);
        }
    }
}

/// Hand `events` to `thread` the way `kind` asks and compute the syscall
/// result.
pub(crate) fn deliver(thread: &Thread, kind: WaitKind, events: &[Event]) -> (Error, u64) {
    match kind {
        WaitKind::Events { buffer, .. } => {
            for (i, event) in events.iter().enumerate() {
                let at = buffer.as_u64() + (i * EVENT_SIZE) as u64;
                if let Err(e) = thread.space().copy_to_user(VirtualAddress::new(at), &event.to_bytes()) {
                    log::warn!("thread {}: dropping events: {e}", thread.id());
                    return (Error::Fault, 0);
                }
            }
            (Error::None, events.len() as u64)
        }
        WaitKind::Single => events
            .first()
            .map_or((Error::None, 0), |e| (e.error, e.length)),
    }
}

struct Timeout {
    deadline: u64,
    hub: Arc<EventHub>,
    wait: u64,
}

/// Deadlines of timed `WaitForEvents` calls, checked on every timer tick.
#[derive(Default)]
pub struct Timeouts {
    entries: SpinLock<Vec<Timeout>>,
}

impl Timeouts {
    /// Time out wait `wait` on `hub` at `deadline`.
    pub fn add(&self, deadline: u64, hub: Arc<EventHub>, wait: u64) {
        self.entries.with_lock_irq(|e| e.push(Timeout { deadline, hub, wait }));
    }

    /// Cancel every wait whose deadline is at or before `now`. Waits that
    /// finished early are skipped.
    pub fn expire(&self, now: u64) -> usize {
        let expired: Vec<Timeout> = self.entries.with_lock_irq(|e| {
            let (due, keep): (Vec<Timeout>, Vec<Timeout>) =
                core::mem::take(e).into_iter().partition(|t| t.deadline <= now);
            *e = keep;
            due
        });
        expired
            .into_iter()
            .filter(|t| t.hub.cancel_wait(t.wait))
            .count()
    }
}
