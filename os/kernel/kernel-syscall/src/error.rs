/// The error word returned by every syscall and carried by every event.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, thiserror::Error)]
pub enum Error {
    #[default]
    #[error("success")]
    None = 0,
    #[error("illegal syscall")]
    IllegalSyscall = 1,
    #[error("illegal arguments")]
    IllegalArgs = 2,
    #[error("no such descriptor")]
    NoDescriptor = 3,
    #[error("descriptor has the wrong type")]
    BadDescriptor = 4,
    #[error("closed remotely")]
    ClosedRemotely = 5,
    #[error("buffer too small")]
    BufferTooSmall = 6,
    #[error("out of memory")]
    NoMemory = 7,
    #[error("unresolvable fault in user memory")]
    Fault = 8,
    #[error("descriptor table is full")]
    NoDescriptorSlots = 9,
    #[error("no such path")]
    NoSuchPath = 10,
    #[error("name already exists")]
    AlreadyExists = 11,
    #[error("address range is in use")]
    AlreadyMapped = 12,
}

impl Error {
    #[inline]
    #[must_use]
    pub const fn code(self) -> u64 {
        self as u64
    }

    #[must_use]
    pub const fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            1 => Self::IllegalSyscall,
            2 => Self::IllegalArgs,
            3 => Self::NoDescriptor,
            4 => Self::BadDescriptor,
            5 => Self::ClosedRemotely,
            6 => Self::BufferTooSmall,
            7 => Self::NoMemory,
            8 => Self::Fault,
            9 => Self::NoDescriptorSlots,
            10 => Self::NoSuchPath,
            11 => Self::AlreadyExists,
            12 => Self::AlreadyMapped,
            _ => return None,
        })
    }

    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::None)
    }
}
