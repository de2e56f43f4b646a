//! Hands a crash off from the crashing thread to a cloned dumping context

use super::{Signal, state};
use crate::{CrashContext, Error, write_stderr};
use process_dumper::{Pid, ProcessDumper};
use std::{cell::Cell, ptr};

/// The size of the stack the dumping context runs on.
///
/// Unlike the signal handler the dumping context walks `/proc`, ptraces every
/// thread, and runs the user's dump writer, so it needs a real stack.
pub(crate) const CHILD_STACK_SIZE: usize = 256 * 1024;

/// Memory reserved at install time for use while handling a crash, so that
/// the crashing thread never needs to go through the general allocator.
///
/// The memory is preceded by an inaccessible guard page, and allocations are
/// made from the low end upward, so a stack carved from the first allocation
/// that overflows faults instead of corrupting other memory.
pub(crate) struct StackArena {
    mapping: *mut libc::c_void,
    guard_size: usize,
    size: usize,
    used: Cell<usize>,
}

// SAFETY: the arena is only touched with the registry locked
unsafe impl Send for StackArena {}

impl StackArena {
    pub(crate) fn new(size: usize) -> Result<Self, Error> {
        // SAFETY: syscalls
        unsafe {
            let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let alloc_size = guard_size + size;

            let mapping = libc::mmap(
                ptr::null_mut(),
                alloc_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(Error::OutOfMemory);
            }

            if libc::mprotect(
                mapping.cast::<u8>().add(guard_size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = std::io::Error::last_os_error();
                libc::munmap(mapping, alloc_size);
                return Err(err.into());
            }

            Ok(Self {
                mapping,
                guard_size,
                size,
                used: Cell::new(0),
            })
        }
    }

    /// Allocates a 16 byte aligned region of `len` bytes, or `None` if the
    /// arena doesn't have enough space left
    pub(crate) fn alloc(&self, len: usize) -> Option<*mut u8> {
        let offset = self.used.get().checked_add(15)? & !15;
        let end = offset.checked_add(len)?;
        if end > self.size {
            return None;
        }

        self.used.set(end);
        // SAFETY: offset is within the usable portion of the mapping
        Some(unsafe { self.mapping.cast::<u8>().add(self.guard_size + offset) })
    }

    /// Releases every allocation
    #[inline]
    pub(crate) fn reset(&self) {
        self.used.set(0);
    }
}

impl Drop for StackArena {
    fn drop(&mut self) {
        // SAFETY: syscall
        unsafe {
            let r = libc::munmap(self.mapping, self.guard_size + self.size);
            debug_assert_eq!(r, 0, "munmap failed for the dump stack arena");
        }
    }
}

/// Everything the dumping context needs, it lives on the crashing thread's
/// stack which is kept alive by that thread waiting for the child to exit
struct ChildArgs<'ctx> {
    inner: &'ctx state::HandlerInner,
    context: &'ctx CrashContext,
    pid: Pid,
    read_fd: i32,
    write_fd: i32,
}

/// Clones a dumping context and waits for it to exit, returning true if it
/// wrote the dump
///
/// # Safety
///
/// Must only be called from the signal handler, with the registry locked
pub(super) unsafe fn generate_dump(inner: &state::HandlerInner, context: &CrashContext) -> bool {
    unsafe {
        inner.arena.reset();
        let Some(stack) = inner.arena.alloc(CHILD_STACK_SIZE) else {
            write_stderr("crash-supervisor: dump stack arena is exhausted\n");
            return false;
        };

        // The child blocks on this pipe until we've allowed it to ptrace us
        let mut fds = [-1; 2];
        if libc::pipe(fds.as_mut_ptr()) == -1 {
            write_stderr("crash-supervisor: failed to create the dump pipe\n");
            return false;
        }

        let mut args = ChildArgs {
            inner,
            context,
            pid: context.pid,
            read_fd: fds[0],
            write_fd: fds[1],
        };

        // Stacks grow down, so the child starts at the top of the allocation
        let stack_top = stack.add(CHILD_STACK_SIZE);

        let child = libc::clone(
            child_entry,
            stack_top.cast(),
            libc::CLONE_VM | libc::CLONE_FS | libc::CLONE_UNTRACED,
            (&raw mut args).cast(),
        );

        if child == -1 {
            libc::close(fds[0]);
            libc::close(fds[1]);
            write_stderr("crash-supervisor: failed to clone the dumping context\n");
            return false;
        }

        debug_print!("cloned dumping context");

        libc::close(fds[0]);

        // Allow the child to ptrace us, and only then let it continue
        let _set_dumpable = SetDumpable::new(child);
        if !send_continue(fds[1]) {
            write_stderr("crash-supervisor: the dumping context exited before it was signaled\n");
        }
        libc::close(fds[1]);

        let mut status = 0;
        let waited = loop {
            let r = libc::waitpid(child, &mut status, libc::__WALL);
            if r != -1 {
                break true;
            }

            if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                break false;
            }
        };

        if !waited {
            write_stderr("crash-supervisor: waitpid failed for the dumping context\n");
            return false;
        }

        debug_print!("dumping context exited");

        libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
    }
}

/// Lets the dumping context continue, returning false if it has already
/// exited.
///
/// Writing to a pipe without a reader raises `SIGPIPE`, which must not kill
/// the process in place of the signal being handled, so it's blocked for the
/// duration of the write and any instance we raised is discarded.
unsafe fn send_continue(fd: i32) -> bool {
    let byte = 0u8;
    unsafe {
        let mut pipe_mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut pipe_mask);
        libc::sigaddset(&mut pipe_mask, libc::SIGPIPE);

        let mut old_mask: libc::sigset_t = std::mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, &pipe_mask, &mut old_mask);

        let sent = loop {
            match libc::write(fd, (&raw const byte).cast(), 1) {
                1 => break true,
                -1 if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) => {}
                _ => break false,
            }
        };

        // If SIGPIPE was already blocked any pending instance isn't ours to consume
        if !sent && libc::sigismember(&old_mask, libc::SIGPIPE) == 0 {
            let no_wait = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            libc::sigtimedwait(&pipe_mask, ptr::null_mut(), &no_wait);
        }

        libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, ptr::null_mut());
        sent
    }
}

unsafe fn wait_for_continue(fd: i32) -> bool {
    let mut byte = 0u8;
    unsafe {
        loop {
            match libc::read(fd, (&raw mut byte).cast(), 1) {
                1 => return true,
                -1 if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) => {}
                _ => return false,
            }
        }
    }
}

/// The entry point of the dumping context.
///
/// The child has its own pid but shares our memory, and its signal
/// dispositions and mask are copies of the crashing thread's at the time of
/// the clone.
extern "C" fn child_entry(arg: *mut libc::c_void) -> i32 {
    // SAFETY: the parent doesn't return from generate_dump until we've exited
    let args = unsafe { &*arg.cast::<ChildArgs<'_>>() };

    // SAFETY: syscalls
    unsafe {
        libc::close(args.write_fd);

        // If the dump itself crashes it should just kill this child rather
        // than re-entering our handler
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        for sig in Signal::ALL {
            state::install_default_handler(sig);
            libc::sigaddset(&mut mask, sig as i32);
        }
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &mask, ptr::null_mut());

        let ready = wait_for_continue(args.read_fd);
        libc::close(args.read_fd);

        if !ready {
            write_stderr("crash-supervisor: the crashing thread never signaled the dumping context\n");
            return 1;
        }
    }

    let snapshot = match ProcessDumper::new(args.pid).capture(Some(args.context)) {
        Ok(snapshot) => snapshot,
        Err(_err) => {
            write_stderr("crash-supervisor: failed to capture the crashed process\n");
            return 1;
        }
    };

    let written = args.inner.writer.write_dump(
        args.inner.descriptor.path(),
        args.pid,
        args.context.as_bytes(),
        &snapshot,
    );

    i32::from(!written)
}

/// We define these constans ourselves rather than use libc as they are missing
/// from eg. Android
const PR_GET_DUMPABLE: i32 = 3;
const PR_SET_DUMPABLE: i32 = 4;
const PR_SET_PTRACER: i32 = 0x59616d61;

/// Marks the process as dumpable and names the dumping context as its
/// ptracer, restoring both when dropped.
///
/// Naming the ptracer is only needed if `/proc/sys/kernel/yama/ptrace_scope`
/// is 1 "restricted ptrace", but has no negative impact in other modes. See
/// <https://www.kernel.org/doc/Documentation/security/Yama.txt>
struct SetDumpable {
    was_dumpable: bool,
}

impl SetDumpable {
    unsafe fn new(ptracer: Pid) -> Self {
        unsafe {
            let is_dumpable = libc::syscall(libc::SYS_prctl, PR_GET_DUMPABLE, 0, 0, 0, 0);
            let was_dumpable = is_dumpable > 0;

            if !was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 1, 0, 0, 0);
            }

            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, ptracer, 0, 0, 0);

            Self { was_dumpable }
        }
    }
}

impl Drop for SetDumpable {
    fn drop(&mut self) {
        unsafe {
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, 0, 0, 0, 0);

            if !self.was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 0, 0, 0, 0);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arena_bounds() {
        let arena = StackArena::new(4096).unwrap();

        let a = arena.alloc(100).unwrap();
        assert_eq!(a as usize % 16, 0);

        // The next allocation is aligned after the first
        let b = arena.alloc(16).unwrap();
        assert_eq!(b as usize - a as usize, 112);

        assert!(arena.alloc(4096).is_none());

        arena.reset();
        let c = arena.alloc(4096).unwrap();
        assert_eq!(c, a);

        // The whole region is usable
        unsafe {
            ptr::write_bytes(c, 0xaa, 4096);
            assert_eq!(*c.add(4095), 0xaa);
        }
    }

    #[test]
    fn continue_handshake() {
        unsafe {
            let mut fds = [-1; 2];
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);

            assert!(send_continue(fds[1]));
            libc::close(fds[1]);

            assert!(wait_for_continue(fds[0]));
            // The writer is gone, so there is nothing more to wait for
            assert!(!wait_for_continue(fds[0]));
            libc::close(fds[0]);
        }
    }

    #[test]
    fn continue_without_reader() {
        unsafe {
            let mut fds = [-1; 2];
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            libc::close(fds[0]);

            // The test harness ignores SIGPIPE, use the default action that
            // terminates the process
            let ignored = libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            let sent = send_continue(fds[1]);
            libc::signal(libc::SIGPIPE, ignored);
            libc::close(fds[1]);

            assert!(!sent);

            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &mut mask);
            assert_eq!(libc::sigismember(&mask, libc::SIGPIPE), 0);

            let mut pending: libc::sigset_t = std::mem::zeroed();
            libc::sigpending(&mut pending);
            assert_eq!(libc::sigismember(&pending, libc::SIGPIPE), 0);
        }
    }
}
