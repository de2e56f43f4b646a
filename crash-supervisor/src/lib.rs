//! [`CrashSupervisor`] writes a dump of the current process when it receives
//! a fatal signal, then lets the process die from that same signal.
//!
//! The following signals are handled, every other signal is left alone.
//!
//! ## `SIGABRT`
//!
//! Signal sent to a process to tell it to abort, i.e. to terminate. The signal
//! is usually initiated by the process itself when it calls `std::process::abort`
//! or `libc::abort`, but it can be sent to the process from outside like any
//! other signal.
//!
//! ## `SIGBUS`
//!
//! Signal sent to a process when it causes a [bus error](https://en.wikipedia.org/wiki/Bus_error).
//!
//! ## `SIGFPE`
//!
//! Signal sent to a process when it executes an erroneous arithmetic operation.
//! Though it stands for **f**loating **p**oint **e**xception this signal covers
//! integer operations as well.
//!
//! ## `SIGILL`
//!
//! Signal sent to a process when it attempts to execute an **illegal**, malformed,
//! unknown, or privileged, instruction.
//!
//! ## `SIGSEGV`
//!
//! Signal sent to a process when it makes an invalid virtual memory reference,
//! a [segmentation fault](https://en.wikipedia.org/wiki/Segmentation_fault).
//! This covers infamous `null` pointer access, out of bounds access, use after
//! free, stack overflows, etc.
//!
//! # Dumping
//!
//! Supervisors can be nested, the most recently installed one is asked first
//! whether it wants to handle a crash. The first one that does clones the
//! process into a new context that shares the crashed process's memory but
//! has its own pid, and it is that context that suspends the crashed process's
//! threads with `ptrace`, captures them with [`process_dumper`], and hands the
//! result to the [`DumpWriter`]. The crashing thread waits for the clone to
//! exit, reports the outcome to the [`CrashEvent`], then re-raises the signal
//! with the default disposition.
//!
//! Note that the alternate signal stack that allows handling of stack
//! overflows is only installed on the thread that installs the first
//! supervisor. [`std::thread`] installs one on every thread it spawns, but
//! threads created by eg. C code won't have one.

#![allow(unsafe_code)]

mod descriptor;
mod error;

pub use descriptor::DumpDescriptor;
pub use error::Error;

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

pub use crash_context::CrashContext;
pub use process_dumper::ProcessSnapshot;

/// User implemented trait for deciding whether a crash is handled, and being
/// notified of the outcome of the dump.
///
/// # Safety
///
/// Both filters are run inside the signal handler, on the crashing thread,
/// in a compromised context. Only a small subset of libc functions are
/// [async signal safe](https://man7.org/linux/man-pages/man7/signal-safety.7.html)
/// and calling non-safe ones can have undefined behavior, including such common
/// ones as `malloc` (especially if using a multi-threaded allocator). The same
/// applies to [`Self::on_dump_complete`], which runs after the dump has been
/// written but still on the crashing thread.
pub unsafe trait CrashEvent: Send + Sync {
    /// Invoked before any capture work is done, returning false declines the
    /// crash, which is then offered to the next supervisor
    #[inline]
    fn should_handle(&self) -> bool {
        true
    }

    /// Invoked once the [`CrashContext`] has been captured, allowing a final
    /// veto with the full details of the crash
    #[inline]
    fn should_handle_context(&self, _context: &CrashContext) -> bool {
        true
    }

    /// Invoked after the dump has been attempted with whether it succeeded.
    ///
    /// Returning true claims the crash, no other supervisors will be asked to
    /// handle it.
    fn on_dump_complete(&self, descriptor: &DumpDescriptor, succeeded: bool) -> bool;
}

/// Creates a [`CrashEvent`] that handles every crash, using the supplied
/// closure as the [`CrashEvent::on_dump_complete`] implementation.
///
/// # Safety
///
/// See the [`CrashEvent`] Safety section for information on why this is `unsafe`.
#[inline]
pub unsafe fn make_crash_event<F>(closure: F) -> Box<dyn CrashEvent>
where
    F: Send + Sync + Fn(&DumpDescriptor, bool) -> bool + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    unsafe impl<F> CrashEvent for Wrapper<F>
    where
        F: Send + Sync + Fn(&DumpDescriptor, bool) -> bool,
    {
        fn on_dump_complete(&self, descriptor: &DumpDescriptor, succeeded: bool) -> bool {
            (self.inner)(descriptor, succeeded)
        }
    }

    Box::new(Wrapper { inner: closure })
}

/// Serializes a captured process to disk.
///
/// The writer is invoked in the dumping context, a clone of the crashed
/// process with its own pid, so unlike [`CrashEvent`] it is not running in a
/// signal handler and may do I/O and allocate. It does however share memory
/// with the crashed process, so any state the crash corrupted is visible.
pub trait DumpWriter: Send + Sync {
    /// Writes the dump to `path`, returning true if it was written.
    ///
    /// `context` is a byte for byte copy of the [`CrashContext`] captured on
    /// the crashing thread, see [`CrashContext::from_bytes`].
    fn write_dump(
        &self,
        path: &std::path::Path,
        pid: process_dumper::Pid,
        context: &[u8],
        snapshot: &ProcessSnapshot,
    ) -> bool;
}

/// Creates a [`DumpWriter`] using the supplied closure as the implementation
#[inline]
pub fn make_dump_writer<F>(closure: F) -> Box<dyn DumpWriter>
where
    F: Send
        + Sync
        + Fn(&std::path::Path, process_dumper::Pid, &[u8], &ProcessSnapshot) -> bool
        + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    impl<F> DumpWriter for Wrapper<F>
    where
        F: Send + Sync + Fn(&std::path::Path, process_dumper::Pid, &[u8], &ProcessSnapshot) -> bool,
    {
        fn write_dump(
            &self,
            path: &std::path::Path,
            pid: process_dumper::Pid,
            context: &[u8],
            snapshot: &ProcessSnapshot,
        ) -> bool {
            (self.inner)(path, pid, context, snapshot)
        }
    }

    Box::new(Wrapper { inner: closure })
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::{CrashSupervisor, Signal};
    } else {
        compile_error!("crash-supervisor only supports Linux and Android");
    }
}
