//! # ELF64 images
//!
//! Zero-copy view over an executable: header checks plus an iterator over
//! program headers. Only little-endian x86-64 `ET_EXEC` images are accepted.

use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("image is shorter than an ELF header")]
    TooShort,
    #[error("bad ELF magic")]
    BadMagic,
    #[error("not a 64-bit image")]
    BadClass,
    #[error("not little endian")]
    BadEndian,
    #[error("not an ET_EXEC image (type {0})")]
    BadType(u16),
    #[error("not an x86-64 image (machine {0})")]
    BadMachine(u16),
    #[error("malformed header")]
    BadHeader,
    #[error("program header or segment outside the image")]
    OutOfBounds,
    #[error("segment flags {0:?} are neither R|W nor R|X")]
    IllegalPermissions(PFlags),
    #[error("unsupported segment type {0:#x}")]
    UnsupportedSegment(u32),
}

/// `Elf64_Phdr.p_flags`: bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PFlags {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(29)]
    __: u32,
}

impl PFlags {
    pub const RW: Self = Self::new().with_read(true).with_write(true);
    pub const RX: Self = Self::new().with_read(true).with_execute(true);
}

pub const PT_LOAD: u32 = 1;
pub const PT_GNU_EH_FRAME: u32 = 0x6474_e550;
pub const PT_GNU_STACK: u32 = 0x6474_e551;

const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: PFlags,
    pub p_offset: u64,
    pub p_vaddr: VirtualAddress,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

impl ProgramHeader {
    /// The bytes backed by the file (`p_filesz` may be below `p_memsz`).
    ///
    /// # Errors
    /// [`ElfError::OutOfBounds`] if the range leaves the image.
    pub fn file_bytes<'a>(&self, image: &'a [u8]) -> Result<&'a [u8], ElfError> {
        let off = usize::try_from(self.p_offset).map_err(|_| ElfError::OutOfBounds)?;
        let len = usize::try_from(self.p_filesz).map_err(|_| ElfError::OutOfBounds)?;
        let end = off.checked_add(len).ok_or(ElfError::OutOfBounds)?;
        image.get(off..end).ok_or(ElfError::OutOfBounds)
    }
}

#[inline]
fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}

#[inline]
fn le64(x: &[u8]) -> u64 {
    u64::from_le_bytes([x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7]])
}

pub struct ElfView<'a> {
    bytes: &'a [u8],
    entry: VirtualAddress,
    phoff: usize,
    phnum: usize,
}

impl<'a> ElfView<'a> {
    /// Validate the header of `bytes`.
    ///
    /// # Errors
    /// The first header check that fails.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if bytes.len() < EHDR_SIZE {
            return Err(ElfError::TooShort);
        }
        if &bytes[0..4] != b"\x7FELF" {
            return Err(ElfError::BadMagic);
        }
        if bytes[4] != 2 {
            return Err(ElfError::BadClass);
        }
        if bytes[5] != 1 {
            return Err(ElfError::BadEndian);
        }

        let e_type = le16(&bytes[16..18]);
        if e_type != ET_EXEC {
            return Err(ElfError::BadType(e_type));
        }
        let e_machine = le16(&bytes[18..20]);
        if e_machine != EM_X86_64 {
            return Err(ElfError::BadMachine(e_machine));
        }
        if le32(&bytes[20..24]) != 1 || usize::from(le16(&bytes[54..56])) != PHDR_SIZE {
            return Err(ElfError::BadHeader);
        }

        let phoff = usize::try_from(le64(&bytes[32..40])).map_err(|_| ElfError::OutOfBounds)?;
        let phnum = usize::from(le16(&bytes[56..58]));
        let end = phnum
            .checked_mul(PHDR_SIZE)
            .and_then(|n| n.checked_add(phoff))
            .ok_or(ElfError::OutOfBounds)?;
        if end > bytes.len() {
            return Err(ElfError::OutOfBounds);
        }

        Ok(Self {
            bytes,
            entry: VirtualAddress::new(le64(&bytes[24..32])),
            phoff,
            phnum,
        })
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.entry
    }

    #[inline]
    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// All program headers in file order.
    pub fn program_headers(&self) -> impl ExactSizeIterator<Item = ProgramHeader> + '_ {
        (0..self.phnum).map(move |i| {
            let s = &self.bytes[self.phoff + i * PHDR_SIZE..][..PHDR_SIZE];
            ProgramHeader {
                p_type: le32(&s[0..4]),
                p_flags: PFlags::from_bits(le32(&s[4..8])),
                p_offset: le64(&s[8..16]),
                p_vaddr: VirtualAddress::new(le64(&s[16..24])),
                p_filesz: le64(&s[32..40]),
                p_memsz: le64(&s[40..48]),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> [u8; 64] {
        let mut h = [0u8; 64];
        h[0..4].copy_from_slice(b"\x7FELF");
        h[4] = 2;
        h[5] = 1;
        h[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        h[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        h[20..24].copy_from_slice(&1u32.to_le_bytes());
        h[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes());
        h[32..40].copy_from_slice(&64u64.to_le_bytes());
        h[54..56].copy_from_slice(&56u16.to_le_bytes());
        h
    }

    #[test]
    fn header_checks() {
        let h = header();
        assert_eq!(ElfView::parse(&h).unwrap().entry(), VirtualAddress::new(0x40_1000));
        assert_eq!(ElfView::parse(&h[..10]).err(), Some(ElfError::TooShort));

        let mut bad = h;
        bad[0] = 0;
        assert_eq!(ElfView::parse(&bad).err(), Some(ElfError::BadMagic));

        let mut dyn_image = h;
        dyn_image[16] = 3;
        assert_eq!(ElfView::parse(&dyn_image).err(), Some(ElfError::BadType(3)));

        let mut too_many = h;
        too_many[56] = 1;
        assert_eq!(ElfView::parse(&too_many).err(), Some(ElfError::OutOfBounds));
    }

    #[test]
    fn flag_layout() {
        assert_eq!(PFlags::RX.into_bits(), 0b101);
        assert_eq!(PFlags::RW.into_bits(), 0b110);
    }
}
