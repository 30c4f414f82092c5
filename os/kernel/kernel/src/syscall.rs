//! # Syscall dispatch
//!
//! [`dispatch`] decodes the opcode and arguments from the calling thread's
//! saved [`TrapFrame`](kernel_syscall::TrapFrame), runs the operation against
//! the caller's universe and writes the error word and up to two outputs back
//! into the frame.
//!
//! Handlers return `Result<Reply, KernelError>`; the conversion to the ABI
//! error word happens here and nowhere else. A [`Reply::Blocked`] call leaves
//! the frame untouched: whoever wakes the thread writes the result.

mod directory;
mod hardware;
mod ipc;
mod memory;
mod thread;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_syscall::{DEBUG_MEMORY, Error, Handle, NULL_HANDLE, SUBSYSTEM_DEBUG, Sysno};
use kernel_vmem::{AddressSpace, MemoryObject};

use crate::error::KernelError;
use crate::event::{AsyncOp, EventHub, Wait, WaitKind, deliver};
use crate::io::IoSpace;
use crate::ipc::{ClientEndpoint, PipeEndpoint, RingBuffer, ServerEndpoint};
use crate::irq::IrqRelay;
use crate::kernel::Kernel;
use crate::rd::RdFolder;
use crate::thread::Thread;
use crate::universe::{AnyDescriptor, Universe};

/// Largest single user buffer the kernel copies in one syscall.
pub const MAX_USER_COPY: u64 = 1 << 20;

/// What the trap handler does after a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Result written; return to the caller.
    Return,
    /// The caller waits; run something else.
    Block,
    /// Requeue the caller and reschedule.
    Yield,
    /// The caller is gone.
    Exit,
}

pub(crate) enum Reply {
    Values(u64, u64),
    Blocked,
    Yield,
    Exit,
}

impl Reply {
    const fn none() -> Self {
        Self::Values(0, 0)
    }

    const fn one(v: u64) -> Self {
        Self::Values(v, 0)
    }
}

/// Run the syscall in `thread`'s saved frame.
pub fn dispatch(kernel: &Kernel, thread: &Arc<Thread>) -> Outcome {
    let frame = thread.image();
    let number = frame.number();
    let cx = Ctx { kernel, thread };
    let result = match Sysno::try_from(number) {
        Ok(sysno) => handle(&cx, sysno, frame.args()),
        Err(n) => Err(KernelError::IllegalSyscall(n)),
    };

    match result {
        Ok(Reply::Values(out0, out1)) => {
            thread.with_image(|tf| tf.set_result(Error::None, out0, out1));
            Outcome::Return
        }
        Ok(Reply::Blocked) => Outcome::Block,
        Ok(Reply::Yield) => {
            thread.with_image(|tf| tf.set_result(Error::None, 0, 0));
            Outcome::Yield
        }
        Ok(Reply::Exit) => Outcome::Exit,
        Err(e) => {
            log::debug!("thread {}: syscall {number} failed: {e}", thread.id());
            thread.with_image(|tf| tf.set_result(e.into(), 0, 0));
            Outcome::Return
        }
    }
}

fn handle(cx: &Ctx<'_>, sysno: Sysno, a: [u64; 9]) -> Result<Reply, KernelError> {
    match sysno {
        Sysno::Log => cx.log(a[0], a[1]),
        Sysno::Panic => cx.panic(a[0], a[1]),
        Sysno::DescriptorInfo => Ok(Reply::one(cx.descriptor(a[0])?.kind() as u64)),
        Sysno::CloseDescriptor => {
            // the last reference may close a pipe; drop it outside the table lock
            drop(cx.thread.universe().detach(a[0])?);
            Ok(Reply::none())
        }

        Sysno::AllocateMemory => memory::allocate(cx, a[0], a[1]),
        Sysno::AccessPhysical => memory::access_physical(cx, a[0], a[1]),
        Sysno::CreateSpace => memory::create_space(cx),
        Sysno::ForkSpace => memory::fork_space(cx, a[0]),
        Sysno::MapMemory => memory::map(cx, a[0], a[1], a[2], a[3], a[4], a[5]),
        Sysno::UnmapMemory => memory::unmap(cx, a[0], a[1], a[2]),
        Sysno::PointerPhysical => memory::pointer_physical(cx, a[0]),
        Sysno::MemoryInfo => Ok(Reply::one(cx.memory(a[0])?.length())),

        Sysno::CreateUniverse => thread::create_universe(cx),
        Sysno::CreateThread => thread::create(cx, a),
        Sysno::Yield => Ok(Reply::Yield),
        Sysno::SubmitObserve => thread::submit_observe(cx, a[0], a[1], a[2], a[3]),
        Sysno::Resume => thread::resume(cx, a[0]),
        Sysno::ExitThisThread => Ok(Reply::Exit),
        Sysno::WriteFsBase => {
            cx.thread.with_image(|tf| tf.fs_base = a[0]);
            Ok(Reply::none())
        }
        Sysno::GetClock => Ok(Reply::one(cx.kernel.now())),

        Sysno::CreateEventHub => ipc::create_event_hub(cx),
        Sysno::WaitForEvents => ipc::wait_for_events(cx, a[0], a[1], a[2], a[3]),
        Sysno::CreateRing => ipc::create_ring(cx, a[0]),
        Sysno::SubmitRing => ipc::submit_ring(cx, a),
        Sysno::CreateFullPipe => ipc::create_full_pipe(cx),
        Sysno::SubmitSendString => ipc::submit_send_string(cx, a),
        Sysno::SubmitSendDescriptor => ipc::submit_send_descriptor(cx, a),
        Sysno::SubmitRecvDescriptor => ipc::submit_recv_descriptor(cx, a),
        Sysno::SubmitRecvString => ipc::submit_recv_string(cx, a),
        Sysno::SubmitRecvStringToRing => ipc::submit_recv_string_to_ring(cx, a),
        Sysno::SendString => ipc::send_string(cx, a),
        Sysno::RecvString => ipc::recv_string(cx, a),
        Sysno::CreateServer => ipc::create_server(cx),
        Sysno::SubmitAccept => ipc::submit_accept(cx, a[0], a[1], a[2], a[3]),
        Sysno::SubmitConnect => ipc::submit_connect(cx, a[0], a[1], a[2], a[3]),

        Sysno::CreateRd => directory::create(cx),
        Sysno::RdMount => directory::mount(cx, a[0], a[1], a[2], a[3]),
        Sysno::RdPublish => directory::publish(cx, a[0], a[1], a[2], a[3]),
        Sysno::RdOpen => directory::open(cx, a[0], a[1]),

        Sysno::AccessIrq => hardware::access_irq(cx, a[0]),
        Sysno::SetupIrq => hardware::setup_irq(cx, a[0], a[1]),
        Sysno::AcknowledgeIrq => hardware::acknowledge_irq(cx, a[0]),
        Sysno::SubmitWaitForIrq => hardware::submit_wait_for_irq(cx, a[0], a[1], a[2], a[3]),
        Sysno::AccessIo => hardware::access_io(cx, a[0], a[1]),
        Sysno::EnableIo => hardware::enable_io(cx, a[0]),
        Sysno::EnableFullIo => hardware::enable_full_io(cx),

        Sysno::ControlKernel => cx.control_kernel(a[0], a[1]),
    }
}

/// The calling thread and the kernel it runs on.
pub(crate) struct Ctx<'a> {
    pub kernel: &'a Kernel,
    pub thread: &'a Arc<Thread>,
}

/// `fn name(&self, handle) -> Result<Arc<T>, KernelError>` for one descriptor kind.
macro_rules! typed_descriptor {
    ($(#[$m:meta])* $name:ident, $variant:ident, $ty:ty) => {
        $(#[$m])*
        pub fn $name(&self, handle: Handle) -> Result<$ty, KernelError> {
            match self.descriptor(handle)? {
                AnyDescriptor::$variant(d) => Ok(d),
                _ => Err(KernelError::BadDescriptor),
            }
        }
    };
}

impl Ctx<'_> {
    pub fn descriptor(&self, handle: Handle) -> Result<AnyDescriptor, KernelError> {
        Ok(self.thread.universe().get(handle)?)
    }

    pub fn attach(&self, descriptor: AnyDescriptor) -> Result<Handle, KernelError> {
        Ok(self.thread.universe().attach(descriptor)?)
    }

    typed_descriptor!(memory, Memory, Arc<MemoryObject>);
    typed_descriptor!(hub, EventHub, Arc<EventHub>);
    typed_descriptor!(ring, Ring, Arc<RingBuffer>);
    typed_descriptor!(pipe, Pipe, PipeEndpoint);
    typed_descriptor!(server, Server, ServerEndpoint);
    typed_descriptor!(client, Client, ClientEndpoint);
    typed_descriptor!(target_thread, Thread, Arc<Thread>);
    typed_descriptor!(irq, Irq, Arc<IrqRelay>);
    typed_descriptor!(io, Io, Arc<IoSpace>);

    /// An address space handle; [`NULL_HANDLE`] is the caller's own.
    pub fn space(&self, handle: Handle) -> Result<Arc<AddressSpace>, KernelError> {
        if handle == NULL_HANDLE {
            return Ok(Arc::clone(self.thread.space()));
        }
        match self.descriptor(handle)? {
            AnyDescriptor::AddressSpace(s) => Ok(s),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    /// A universe handle; [`NULL_HANDLE`] is the caller's own.
    pub fn universe(&self, handle: Handle) -> Result<Arc<Universe>, KernelError> {
        if handle == NULL_HANDLE {
            return Ok(Arc::clone(self.thread.universe()));
        }
        match self.descriptor(handle)? {
            AnyDescriptor::Universe(u) => Ok(u),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    /// A directory handle; [`NULL_HANDLE`] is the caller's root.
    pub fn folder(&self, handle: Handle) -> Result<Arc<RdFolder>, KernelError> {
        if handle == NULL_HANDLE {
            return Ok(Arc::clone(self.thread.directory()));
        }
        match self.descriptor(handle)? {
            AnyDescriptor::RdFolder(f) => Ok(f),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    /// Package a submission for completion on hub `hub`.
    pub fn submit(&self, hub: Handle, function: u64, object: u64) -> Result<AsyncOp, KernelError> {
        Ok(AsyncOp::new(self.hub(hub)?, self.kernel.next_async_id(), function, object))
    }

    /// A submission on the caller's private hub, for the blocking IPC calls.
    pub fn submit_sync(&self) -> AsyncOp {
        AsyncOp::new(Arc::clone(self.thread.sync_hub()), self.kernel.next_async_id(), 0, 0)
    }

    /// Wait for the single completion of a blocking call.
    pub fn block_on_sync(&self) -> Result<Reply, KernelError> {
        match self.thread.sync_hub().wait(self.thread, WaitKind::Single) {
            Wait::Ready(events) => match deliver(self.thread, WaitKind::Single, &events) {
                (Error::None, length) => Ok(Reply::one(length)),
                (e, _) => Err(KernelError::Abi(e)),
            },
            Wait::Blocked(_) => Ok(Reply::Blocked),
        }
    }

    /// Copy `len` bytes from the caller's memory.
    pub fn read_user(&self, ptr: u64, len: u64) -> Result<Vec<u8>, KernelError> {
        if len > MAX_USER_COPY {
            return Err(KernelError::IllegalArgs("buffer too large"));
        }
        let len = usize::try_from(len).map_err(|_| KernelError::IllegalArgs("buffer too large"))?;
        let mut buf = vec![0u8; len];
        self.thread.space().copy_from_user(VirtualAddress::new(ptr), &mut buf)?;
        Ok(buf)
    }

    /// A UTF-8 string from the caller's memory.
    pub fn read_str(&self, ptr: u64, len: u64) -> Result<String, KernelError> {
        String::from_utf8(self.read_user(ptr, len)?).map_err(|_| KernelError::IllegalArgs("name is not UTF-8"))
    }

    fn log(&self, ptr: u64, len: u64) -> Result<Reply, KernelError> {
        let bytes = self.read_user(ptr, len)?;
        log::info!(target: "user", "{}", String::from_utf8_lossy(&bytes));
        Ok(Reply::none())
    }

    fn panic(&self, ptr: u64, len: u64) -> Result<Reply, KernelError> {
        let bytes = self.read_user(ptr, len).unwrap_or_default();
        log::error!(target: "user", "thread {} panicked: {}", self.thread.id(), String::from_utf8_lossy(&bytes));
        Ok(Reply::Exit)
    }

    fn control_kernel(&self, subsystem: u64, interface: u64) -> Result<Reply, KernelError> {
        if (subsystem, interface) != (SUBSYSTEM_DEBUG, DEBUG_MEMORY) {
            return Err(KernelError::IllegalArgs("unknown kernel control interface"));
        }
        let pmm = self.kernel.allocator();
        let (used, free) = (pmm.num_used_pages() as u64, pmm.num_free_pages() as u64);
        log::info!("physical memory: {used} pages used, {free} pages free");
        Ok(Reply::Values(used, free))
    }
}
