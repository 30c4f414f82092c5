use bitfield_struct::bitfield;

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl PageFaultError {
    /// The error code a user-mode `access` would raise.
    #[must_use]
    pub const fn for_access(access: Access, present: bool) -> Self {
        Self::new()
            .with_present(present)
            .with_user(true)
            .with_write(matches!(access, Access::Write))
            .with_instruction_fetch(matches!(access, Access::Execute))
    }

    /// The kind of access that faulted.
    #[must_use]
    pub const fn access(&self) -> Access {
        if self.instruction_fetch() {
            Access::Execute
        } else if self.write() {
            Access::Write
        } else {
            Access::Read
        }
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped or not yet populated)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// A memory access as seen by the MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_round_trips_through_error_code() {
        for a in [Access::Read, Access::Write, Access::Execute] {
            assert_eq!(PageFaultError::for_access(a, false).access(), a);
        }
    }

    #[test]
    fn decodes_hardware_bits() {
        // user write to a present page
        let e = PageFaultError::from_bits(0b111);
        assert!(e.present() && e.write() && e.user());
        assert_eq!(e.explain(), "Write access to protected page");

        let e = PageFaultError::from_bits(0b1_0100);
        assert_eq!(e.access(), Access::Execute);
        assert!(e.explain().starts_with("Non-present"));
    }
}
