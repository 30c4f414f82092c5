use crate::Error;

/// Size of one [`Event`] record in user memory.
pub const EVENT_SIZE: usize = 72;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventType {
    #[default]
    None = 0,
    RecvString = 1,
    RecvStringToRing = 2,
    RecvDescriptor = 3,
    SendString = 4,
    SendDescriptor = 5,
    Accept = 6,
    Connect = 7,
    Irq = 8,
    Observe = 9,
    /// A ring buffer was retired.
    Ring = 10,
}

/// Why an observed thread stopped; carried in `msg_request` of an
/// [`EventType::Observe`] event.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    PageFault = 1,
    GeneralFault = 2,
    Breakpoint = 3,
    IllegalInstruction = 4,
    DivideByZero = 5,
    NoFpu = 6,
    Exit = 7,
}

/// A completion record.
///
/// Little-endian layout:
///
/// | Offset | Field |
/// |-------:|-------|
/// | 0 | `event_type: u32` |
/// | 4 | `error: u32` |
/// | 8 | `async_id: i64` |
/// | 16 | `submit_function: u64` |
/// | 24 | `submit_object: u64` |
/// | 32 | `msg_request: i64` |
/// | 40 | `msg_sequence: i64` |
/// | 48 | `offset: u64` |
/// | 56 | `length: u64` |
/// | 64 | `handle: u64` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Event {
    pub event_type: EventType,
    pub error: Error,
    pub async_id: i64,
    pub submit_function: u64,
    pub submit_object: u64,
    pub msg_request: i64,
    pub msg_sequence: i64,
    pub offset: u64,
    pub length: u64,
    pub handle: u64,
}

impl Event {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; EVENT_SIZE] {
        let mut b = [0u8; EVENT_SIZE];
        b[0..4].copy_from_slice(&(self.event_type as u32).to_le_bytes());
        b[4..8].copy_from_slice(&(self.error as u32).to_le_bytes());
        b[8..16].copy_from_slice(&self.async_id.to_le_bytes());
        b[16..24].copy_from_slice(&self.submit_function.to_le_bytes());
        b[24..32].copy_from_slice(&self.submit_object.to_le_bytes());
        b[32..40].copy_from_slice(&self.msg_request.to_le_bytes());
        b[40..48].copy_from_slice(&self.msg_sequence.to_le_bytes());
        b[48..56].copy_from_slice(&self.offset.to_le_bytes());
        b[56..64].copy_from_slice(&self.length.to_le_bytes());
        b[64..72].copy_from_slice(&self.handle.to_le_bytes());
        b
    }

    /// Decode a record; `None` if the type or error word is unknown.
    #[must_use]
    pub fn from_bytes(b: &[u8; EVENT_SIZE]) -> Option<Self> {
        let u32_at = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
        let u64_at = |o: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[o..o + 8]);
            u64::from_le_bytes(w)
        };
        let event_type = match u32_at(0) {
            0 => EventType::None,
            1 => EventType::RecvString,
            2 => EventType::RecvStringToRing,
            3 => EventType::RecvDescriptor,
            4 => EventType::SendString,
            5 => EventType::SendDescriptor,
            6 => EventType::Accept,
            7 => EventType::Connect,
            8 => EventType::Irq,
            9 => EventType::Observe,
            10 => EventType::Ring,
            _ => return None,
        };
        Some(Self {
            event_type,
            error: Error::from_code(u64::from(u32_at(4)))?,
            async_id: u64_at(8).cast_signed(),
            submit_function: u64_at(16),
            submit_object: u64_at(24),
            msg_request: u64_at(32).cast_signed(),
            msg_sequence: u64_at(40).cast_signed(),
            offset: u64_at(48),
            length: u64_at(56),
            handle: u64_at(64),
        })
    }
}
