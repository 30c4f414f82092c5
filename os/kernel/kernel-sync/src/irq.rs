//! Interrupt-flag control.
//!
//! On bare metal (`target_os = "none"`, x86-64) this issues `cli`/`sti` and
//! reads `RFLAGS.IF`. Everywhere else the flag is emulated per host thread, so
//! each test thread behaves like its own CPU.

/// RFLAGS.IF
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const RFLAGS_IF: u64 = 1 << 9;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod backend {
    use super::RFLAGS_IF;

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r & RFLAGS_IF != 0
    }
}

#[cfg(not(target_os = "none"))]
mod backend {
    use core::cell::Cell;

    std::thread_local! {
        static IF: Cell<bool> = const { Cell::new(true) };
    }

    #[inline]
    pub fn disable() {
        IF.with(|f| f.set(false));
    }

    #[inline]
    pub fn enable() {
        IF.with(|f| f.set(true));
    }

    #[inline]
    pub fn enabled() -> bool {
        IF.with(Cell::get)
    }
}

/// Disables interrupts on the current CPU (`cli`).
///
/// # Privilege
///
/// On bare metal this must run at CPL 0.
#[inline]
pub fn disable() {
    backend::disable();
}

/// Enables interrupts on the current CPU (`sti`).
#[inline]
pub fn enable() {
    backend::enable();
}

/// Whether interrupts are currently enabled on this CPU.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    backend::enabled()
}

/// Runs `f` with interrupts masked, restoring the previous state afterwards.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _g = IrqGuard::new();
    f()
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the interrupt flag. If interrupts were enabled
/// it disables them; on drop it re-enables them **only** if they were enabled
/// before, so guards nest.
///
/// ```
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// assert!(interrupts_enabled());
/// {
///     let _outer = IrqGuard::new();
///     {
///         let _inner = IrqGuard::new();
///         assert!(!interrupts_enabled());
///     }
///     assert!(!interrupts_enabled());
/// }
/// assert!(interrupts_enabled());
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            disable();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_previous_state() {
        disable();
        {
            let _g = IrqGuard::new();
            assert!(!interrupts_enabled());
        }
        assert!(!interrupts_enabled(), "must not enable what was disabled");
        enable();
    }

    #[test]
    fn without_interrupts_masks_closure() {
        let seen = without_interrupts(interrupts_enabled);
        assert!(!seen);
        assert!(interrupts_enabled());
    }
}
