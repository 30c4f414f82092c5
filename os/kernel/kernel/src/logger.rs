//! # Kernel logger
//!
//! A [`log::Log`] implementation writing `"[LEVEL] target: message"` lines to
//! a [`LogSink`]:
//!
//! - [`DebugPortSink`]: QEMU's debug console (port `0x402`, `-debugcon stdio`),
//!   bare metal with the `qemu` feature.
//! - [`MemorySink`]: captured lines, for hosted runs and tests.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};
use kernel_sync::SpinLock;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Where formatted log lines go.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: fmt::Arguments<'_>);
}

pub struct KernelLogger<S> {
    max_level: LevelFilter,
    sink: S,
}

impl<S: LogSink + 'static> KernelLogger<S> {
    #[must_use]
    pub const fn new(max_level: LevelFilter, sink: S) -> Self {
        Self { max_level, sink }
    }

    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Install as the global logger. Call once during early init.
    ///
    /// # Errors
    /// If a logger is already installed.
    pub fn install(self) -> Result<&'static Self, SetLoggerError> {
        let max_level = self.max_level;
        let logger: &'static Self = Box::leak(Box::new(self));
        log::set_logger(logger)?;
        log::set_max_level(max_level);
        Ok(logger)
    }
}

impl<S: LogSink> Log for KernelLogger<S> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.sink.write_line(format_args!(
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Keeps every line in memory.
#[derive(Default)]
pub struct MemorySink {
    lines: SpinLock<Vec<String>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.with_lock_irq(|l| l.clone())
    }

    /// Whether any captured line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.with_lock_irq(|l| l.iter().any(|line| line.contains(needle)))
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: fmt::Arguments<'_>) {
        let mut s = String::new();
        // formatting into a String cannot fail
        let _ = s.write_fmt(line);
        self.lines.with_lock_irq(|l| l.push(s));
    }
}

/// QEMU debug console.
#[cfg(all(feature = "qemu", target_arch = "x86_64", target_os = "none"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugPortSink;

#[cfg(all(feature = "qemu", target_arch = "x86_64", target_os = "none"))]
impl DebugPortSink {
    const PORT: u16 = 0x402;

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn putc(byte: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") Self::PORT,
                in("al") byte,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}

#[cfg(all(feature = "qemu", target_arch = "x86_64", target_os = "none"))]
impl Write for DebugPortSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        s.bytes().for_each(Self::putc);
        Ok(())
    }
}

#[cfg(all(feature = "qemu", target_arch = "x86_64", target_os = "none"))]
impl LogSink for DebugPortSink {
    fn write_line(&self, line: fmt::Arguments<'_>) {
        let mut port = Self;
        // best effort: the port never reports errors
        let _ = writeln!(port, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn lines_are_formatted_and_filtered() {
        let logger = KernelLogger::new(LevelFilter::Info, MemorySink::new());
        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("user")
                .args(format_args!("hello {}", 42))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .target("kernel")
                .args(format_args!("dropped"))
                .build(),
        );
        assert_eq!(logger.sink().lines(), ["[INFO] user: hello 42"]);
    }
}
