//! # I/O port grants
//!
//! An [`IoSpace`] names a set of x86 I/O ports. `EnableIo` adds them to the
//! calling thread's permission set (on bare metal, its TSS I/O bitmap);
//! `EnableFullIo` opens every port.

use alloc::vec::Vec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoSpace {
    ports: Vec<u16>,
}

impl IoSpace {
    #[must_use]
    pub fn new(mut ports: Vec<u16>) -> Self {
        ports.sort_unstable();
        ports.dedup();
        Self { ports }
    }

    #[must_use]
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

/// Decode a little-endian `u16` port list as passed to `AccessIo`.
#[must_use]
pub fn parse_ports(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_normalized() {
        let io = IoSpace::new(parse_ports(&[0x61, 0, 0x60, 0, 0x61, 0]));
        assert_eq!(io.ports(), &[0x60, 0x61]);
    }
}
