/// Syscall opcode numbers.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sysno {
    /// `(ptr, len)`: write a string to the kernel log.
    Log = 1,
    /// `(ptr, len)`: log a string and kill the calling thread.
    Panic = 2,

    DescriptorInfo = 10,
    CloseDescriptor = 11,

    /// `(size, flags) -> handle`
    AllocateMemory = 20,
    /// `(physical, size) -> handle`
    AccessPhysical = 21,
    CreateSpace = 22,
    ForkSpace = 23,
    /// `(memory, space, hint, offset, length, flags) -> address`
    MapMemory = 24,
    /// `(space, address, length)`
    UnmapMemory = 25,
    PointerPhysical = 26,
    MemoryInfo = 27,

    CreateUniverse = 40,
    /// `(universe, space, directory, abi, ip, sp, flags) -> handle`
    CreateThread = 41,
    Yield = 42,
    /// `(thread, hub, function, object) -> async id`
    SubmitObserve = 43,
    Resume = 44,
    ExitThisThread = 45,
    WriteFsBase = 46,
    GetClock = 47,

    CreateEventHub = 60,
    /// `(hub, events, max, timeout) -> count`
    WaitForEvents = 61,

    CreateRing = 70,
    /// `(ring, hub, buffer, size, function, object) -> async id`
    SubmitRing = 71,

    CreateFullPipe = 80,
    /// `(pipe, hub, ptr, len, request, sequence, function, object, flags) -> async id`
    SubmitSendString = 81,
    /// `(pipe, hub, handle, request, sequence, function, object, flags) -> async id`
    SubmitSendDescriptor = 82,
    /// `(pipe, hub, request, sequence, function, object, flags) -> async id`
    SubmitRecvDescriptor = 83,
    /// `(pipe, hub, ptr, max, request, sequence, function, object, flags) -> async id`
    SubmitRecvString = 84,
    /// `(pipe, ring, hub, request, sequence, function, object, flags) -> async id`
    SubmitRecvStringToRing = 85,
    /// `(pipe, ptr, len, request, sequence, flags)`; blocks until delivered.
    SendString = 86,
    /// `(pipe, ptr, max, request, sequence, flags) -> length`; blocks until received.
    RecvString = 87,

    CreateServer = 90,
    SubmitAccept = 91,
    SubmitConnect = 92,

    CreateRd = 100,
    RdMount = 101,
    RdPublish = 102,
    RdOpen = 103,

    AccessIrq = 110,
    SetupIrq = 111,
    AcknowledgeIrq = 112,
    SubmitWaitForIrq = 113,

    AccessIo = 120,
    EnableIo = 121,
    EnableFullIo = 122,

    ControlKernel = 130,
}

impl TryFrom<u64> for Sysno {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Log,
            2 => Self::Panic,
            10 => Self::DescriptorInfo,
            11 => Self::CloseDescriptor,
            20 => Self::AllocateMemory,
            21 => Self::AccessPhysical,
            22 => Self::CreateSpace,
            23 => Self::ForkSpace,
            24 => Self::MapMemory,
            25 => Self::UnmapMemory,
            26 => Self::PointerPhysical,
            27 => Self::MemoryInfo,
            40 => Self::CreateUniverse,
            41 => Self::CreateThread,
            42 => Self::Yield,
            43 => Self::SubmitObserve,
            44 => Self::Resume,
            45 => Self::ExitThisThread,
            46 => Self::WriteFsBase,
            47 => Self::GetClock,
            60 => Self::CreateEventHub,
            61 => Self::WaitForEvents,
            70 => Self::CreateRing,
            71 => Self::SubmitRing,
            80 => Self::CreateFullPipe,
            81 => Self::SubmitSendString,
            82 => Self::SubmitSendDescriptor,
            83 => Self::SubmitRecvDescriptor,
            84 => Self::SubmitRecvString,
            85 => Self::SubmitRecvStringToRing,
            86 => Self::SendString,
            87 => Self::RecvString,
            90 => Self::CreateServer,
            91 => Self::SubmitAccept,
            92 => Self::SubmitConnect,
            100 => Self::CreateRd,
            101 => Self::RdMount,
            102 => Self::RdPublish,
            103 => Self::RdOpen,
            110 => Self::AccessIrq,
            111 => Self::SetupIrq,
            112 => Self::AcknowledgeIrq,
            113 => Self::SubmitWaitForIrq,
            120 => Self::AccessIo,
            121 => Self::EnableIo,
            122 => Self::EnableFullIo,
            130 => Self::ControlKernel,
            other => return Err(other),
        })
    }
}
