use crate::Error;

/// Saved user register image.
///
/// The first five fields mirror what the CPU pushes on an interrupt gate
/// (`RIP, CS, RFLAGS, RSP, SS`); the rest are saved by the entry stub.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Not pushed by hardware; restored via `WRFSBASE`/MSR on switch.
    pub fs_base: u64,
}

/// RFLAGS.IF plus the always-one bit 1.
const USER_RFLAGS: u64 = 0x202;

impl TrapFrame {
    /// Initial image for a user thread entering at `ip` with stack `sp`.
    #[must_use]
    pub const fn user(ip: u64, sp: u64) -> Self {
        Self {
            rip: ip,
            cs: 0x23,
            rflags: USER_RFLAGS,
            rsp: sp,
            ss: 0x1b,
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            fs_base: 0,
        }
    }

    /// Syscall opcode (`rax`).
    #[inline]
    #[must_use]
    pub const fn number(&self) -> u64 {
        self.rax
    }

    /// Syscall arguments `in0..in8`.
    #[must_use]
    pub const fn args(&self) -> [u64; 9] {
        [
            self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9, self.r12, self.r13, self.r14,
        ]
    }

    /// Load a syscall into the image, as user space would before trapping.
    pub fn set_call(&mut self, number: u64, args: &[u64]) {
        self.rax = number;
        let mut full = [0u64; 9];
        let n = args.len().min(9);
        full[..n].copy_from_slice(&args[..n]);
        [
            self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9, self.r12, self.r13, self.r14,
        ] = full;
    }

    /// Store the result: error in `rax`, outputs in `rdi`/`rsi`.
    pub fn set_result(&mut self, error: Error, out0: u64, out1: u64) {
        self.rax = error.code();
        self.rdi = out0;
        self.rsi = out1;
    }

    #[inline]
    #[must_use]
    pub const fn error(&self) -> Option<Error> {
        Error::from_code(self.rax)
    }

    #[inline]
    #[must_use]
    pub const fn out0(&self) -> u64 {
        self.rdi
    }

    #[inline]
    #[must_use]
    pub const fn out1(&self) -> u64 {
        self.rsi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_and_results_use_distinct_registers() {
        let mut tf = TrapFrame::user(0x40_0000, 0x7FFF_0000);
        tf.set_call(24, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(tf.number(), 24);
        assert_eq!(tf.args(), [1, 2, 3, 4, 5, 6, 0, 0, 0]);
        tf.set_result(Error::None, 0xAAAA, 0xBBBB);
        assert_eq!(tf.error(), Some(Error::None));
        assert_eq!((tf.out0(), tf.out1()), (0xAAAA, 0xBBBB));
        assert_eq!(tf.rip, 0x40_0000);
    }
}
