//! # Threads
//!
//! A thread is a saved [`TrapFrame`] plus the three things it executes
//! against: an address space, a universe and a resource directory root.
//!
//! ```text
//!            enqueue            do_schedule
//!  Runnable ─────────► (queue) ────────────► Running
//!     ▲  ▲                                    │ │ │
//!     │  └──────────── preempt / yield ───────┘ │ │
//!     │ wake                                    │ │ fault
//!  Blocked ◄─────────── wait ───────────────────┘ ▼
//!                                               Fault ──resume──► Runnable
//!  Exited  ◄─────────── exit / fatal trap ──────────┘
//! ```

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_syscall::{Event, EventType, Observation, ThreadFlags, TrapFrame};
use kernel_vmem::AddressSpace;

use crate::event::{AsyncOp, EventHub};
use crate::interrupts::Trap;
use crate::rd::RdFolder;
use crate::universe::Universe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Runnable,
    Running,
    Blocked,
    /// Stopped after an unresolved trap until someone calls `Resume`.
    Fault,
    Exited,
}

/// Everything needed to create a thread.
pub struct ThreadInit {
    pub flags: ThreadFlags,
    pub universe: Arc<Universe>,
    pub space: Arc<AddressSpace>,
    pub directory: Arc<RdFolder>,
    pub ip: VirtualAddress,
    pub sp: VirtualAddress,
}

pub struct Thread {
    id: u64,
    flags: ThreadFlags,
    universe: Arc<Universe>,
    space: Arc<AddressSpace>,
    directory: Arc<RdFolder>,
    /// Completion target of the blocking `SendString`/`RecvString` calls.
    sync_hub: Arc<EventHub>,
    inner: SpinLock<ThreadInner>,
}

struct ThreadInner {
    state: RunState,
    /// Created with `stopped`; only `Resume` makes it runnable.
    stopped: bool,
    image: TrapFrame,
    last_fault: Option<Trap>,
    observers: Vec<AsyncOp>,
    all_ports: bool,
    ports: BTreeSet<u16>,
}

impl Thread {
    #[must_use]
    pub fn new(id: u64, init: ThreadInit, sync_hub: Arc<EventHub>) -> Arc<Self> {
        let stopped = init.flags.stopped();
        Arc::new(Self {
            id,
            flags: init.flags,
            universe: init.universe,
            space: init.space,
            directory: init.directory,
            sync_hub,
            inner: SpinLock::new(ThreadInner {
                state: if stopped { RunState::Blocked } else { RunState::Runnable },
                stopped,
                image: TrapFrame::user(init.ip.as_u64(), init.sp.as_u64()),
                last_fault: None,
                observers: Vec::new(),
                all_ports: false,
                ports: BTreeSet::new(),
            }),
        })
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> ThreadFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn universe(&self) -> &Arc<Universe> {
        &self.universe
    }

    #[inline]
    #[must_use]
    pub const fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    #[inline]
    #[must_use]
    pub const fn directory(&self) -> &Arc<RdFolder> {
        &self.directory
    }

    #[inline]
    #[must_use]
    pub const fn sync_hub(&self) -> &Arc<EventHub> {
        &self.sync_hub
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.inner.with_lock_irq(|t| t.state)
    }

    /// Copy of the saved register image.
    #[must_use]
    pub fn image(&self) -> TrapFrame {
        self.inner.with_lock_irq(|t| t.image)
    }

    /// Edit the saved register image.
    pub fn with_image<R>(&self, f: impl FnOnce(&mut TrapFrame) -> R) -> R {
        self.inner.with_lock_irq(|t| f(&mut t.image))
    }

    /// The trap that stopped the thread, while it is in [`RunState::Fault`].
    #[must_use]
    pub fn last_fault(&self) -> Option<Trap> {
        self.inner.with_lock_irq(|t| t.last_fault)
    }

    pub(crate) fn set_state(&self, state: RunState) {
        self.inner.with_lock_irq(|t| t.state = state);
    }

    /// Running or Runnable → Runnable. Returns `false` for any other state.
    pub(crate) fn make_runnable(&self) -> bool {
        self.inner.with_lock_irq(|t| match t.state {
            RunState::Running | RunState::Runnable => {
                t.state = RunState::Runnable;
                true
            }
            _ => false,
        })
    }

    /// Blocked (in a wait) → Runnable.
    pub(crate) fn wake(&self) -> bool {
        self.inner.with_lock_irq(|t| {
            if t.state == RunState::Blocked && !t.stopped {
                t.state = RunState::Runnable;
                true
            } else {
                false
            }
        })
    }

    /// Fault or created-stopped → Runnable.
    pub(crate) fn resume(&self) -> bool {
        self.inner.with_lock_irq(|t| {
            let resumable = t.state == RunState::Fault || (t.state == RunState::Blocked && t.stopped);
            if resumable {
                t.state = RunState::Runnable;
                t.stopped = false;
                t.last_fault = None;
            }
            resumable
        })
    }

    /// Stop after `trap` and tell every observer.
    pub(crate) fn enter_fault(&self, trap: Trap) {
        let observers = self.inner.with_lock_irq(|t| {
            t.state = RunState::Fault;
            t.last_fault = Some(trap);
            core::mem::take(&mut t.observers)
        });
        notify(observers, trap.observation());
    }

    /// Terminate and tell every observer. Idempotent.
    pub(crate) fn exit(&self) {
        let observers = self.inner.with_lock_irq(|t| {
            if t.state == RunState::Exited {
                return Vec::new();
            }
            t.state = RunState::Exited;
            core::mem::take(&mut t.observers)
        });
        if !observers.is_empty() {
            notify(observers, Observation::Exit);
        }
        log::debug!("thread {} exited", self.id);
    }

    /// Queue `op` for the next stop; an exited thread completes it at once.
    pub(crate) fn observe(&self, op: AsyncOp) {
        let immediate = self.inner.with_lock_irq(|t| {
            if t.state == RunState::Exited {
                Some(op)
            } else {
                t.observers.push(op);
                None
            }
        });
        if let Some(op) = immediate {
            notify(alloc::vec![op], Observation::Exit);
        }
    }

    pub(crate) fn grant_ports(&self, ports: &[u16]) {
        self.inner.with_lock_irq(|t| t.ports.extend(ports.iter().copied()));
    }

    pub(crate) fn grant_all_ports(&self) {
        self.inner.with_lock_irq(|t| t.all_ports = true);
    }

    /// Whether `in`/`out` on `port` would be allowed in user mode.
    #[must_use]
    pub fn may_access_port(&self, port: u16) -> bool {
        self.inner.with_lock_irq(|t| t.all_ports || t.ports.contains(&port))
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn notify(observers: Vec<AsyncOp>, observation: Observation) {
    for op in observers {
        op.complete(Event {
            event_type: EventType::Observe,
            msg_request: observation as i64,
            ..Event::default()
        });
    }
}
