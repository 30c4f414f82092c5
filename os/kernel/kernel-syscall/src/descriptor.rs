/// Tag reported by `DescriptorInfo`.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Memory = 1,
    AddressSpace = 2,
    Thread = 3,
    Universe = 4,
    EventHub = 5,
    Ring = 6,
    Pipe = 7,
    Server = 8,
    Client = 9,
    RdFolder = 10,
    Irq = 11,
    Io = 12,
}
