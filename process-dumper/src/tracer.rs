//! The `ptrace` requests the dumper relies on

#![allow(unsafe_code)]

use crate::{Error, Pid, ThreadRegisters};
use libc::c_void;
use std::{io, ptr};

/// Debugger style access to the threads of another process.
///
/// All requests other than [`Self::attach`] are only valid for threads that
/// are currently attached.
pub trait Tracer {
    /// Attaches to the thread and waits until it is stopped
    fn attach(&self, tid: Pid) -> Result<(), Error>;
    /// Detaches from the thread, letting it run again
    fn detach(&self, tid: Pid) -> Result<(), Error>;
    /// Reads a single machine word from the thread's address space
    fn peek_word(&self, tid: Pid, address: usize) -> Result<usize, Error>;
    /// Reads the full register set of the thread
    fn registers(&self, tid: Pid) -> Result<ThreadRegisters, Error>;
}

/// [`Tracer`] implemented with the `ptrace` syscall
#[derive(Copy, Clone, Default)]
pub struct Ptrace;

#[inline]
fn ptrace_error(request: &'static str, tid: Pid) -> Error {
    Error::Ptrace {
        request,
        tid,
        source: io::Error::last_os_error(),
    }
}

/// `PTRACE_PEEK*` requests return the data, so errors can only be told apart
/// from a legitimate `-1` by checking `errno`
#[inline]
unsafe fn clear_errno() {
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                *libc::__errno() = 0;
            } else {
                *libc::__errno_location() = 0;
            }
        }
    }
}

unsafe fn peek(
    request: &'static str,
    kind: libc::c_uint,
    tid: Pid,
    address: usize,
) -> Result<usize, Error> {
    unsafe {
        clear_errno();
        let word = libc::ptrace(kind as _, tid, address as *mut c_void, ptr::null_mut::<c_void>());
        if word == -1 && io::Error::last_os_error().raw_os_error() != Some(0) {
            return Err(ptrace_error(request, tid));
        }

        Ok(word as usize)
    }
}

impl Tracer for Ptrace {
    fn attach(&self, tid: Pid) -> Result<(), Error> {
        unsafe {
            let null = ptr::null_mut::<c_void>();
            // This will fail if the thread has already exited or is being
            // traced by something else
            if libc::ptrace(libc::PTRACE_ATTACH, tid, null, null) == -1 {
                return Err(ptrace_error("PTRACE_ATTACH", tid));
            }

            loop {
                let mut status = 0;
                if libc::waitpid(tid, &mut status, libc::__WALL) == -1 {
                    let source = io::Error::last_os_error();
                    if source.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }

                    let _ = self.detach(tid);
                    return Err(Error::WaitPid { tid, source });
                }

                if !libc::WIFSTOPPED(status) {
                    return Err(Error::ThreadExited(tid));
                }

                let signal = libc::WSTOPSIG(status);
                if signal == libc::SIGSTOP {
                    break;
                }

                // Any signal stops a traced thread, anything but our own
                // SIGSTOP needs to be delivered or it is lost
                if libc::ptrace(libc::PTRACE_CONT, tid, null, signal as usize as *mut c_void) == -1
                {
                    let err = ptrace_error("PTRACE_CONT", tid);
                    let _ = self.detach(tid);
                    return Err(err);
                }
            }

            Ok(())
        }
    }

    fn detach(&self, tid: Pid) -> Result<(), Error> {
        unsafe {
            let null = ptr::null_mut::<c_void>();
            if libc::ptrace(libc::PTRACE_DETACH, tid, null, null) == -1 {
                // The thread no longer exists, which is as detached as it gets
                if io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
                    return Ok(());
                }

                return Err(ptrace_error("PTRACE_DETACH", tid));
            }

            Ok(())
        }
    }

    fn peek_word(&self, tid: Pid, address: usize) -> Result<usize, Error> {
        unsafe { peek("PTRACE_PEEKDATA", libc::PTRACE_PEEKDATA as _, tid, address) }
    }

    fn registers(&self, tid: Pid) -> Result<ThreadRegisters, Error> {
        let mut regs = ThreadRegisters::zeroed();

        unsafe {
            cfg_if::cfg_if! {
                if #[cfg(target_arch = "x86_64")] {
                    let null = ptr::null_mut::<c_void>();

                    if libc::ptrace(libc::PTRACE_GETREGS, tid, null, (&mut regs.regs as *mut libc::user_regs_struct).cast::<c_void>()) == -1 {
                        return Err(ptrace_error("PTRACE_GETREGS", tid));
                    }

                    if libc::ptrace(libc::PTRACE_GETFPREGS, tid, null, (&mut regs.fpregs as *mut libc::user_fpregs_struct).cast::<c_void>()) == -1 {
                        return Err(ptrace_error("PTRACE_GETFPREGS", tid));
                    }

                    let debug_offset = std::mem::offset_of!(libc::user, u_debugreg);
                    for (i, dr) in regs.debug_regs.iter_mut().enumerate() {
                        *dr = peek(
                            "PTRACE_PEEKUSER",
                            libc::PTRACE_PEEKUSER as _,
                            tid,
                            debug_offset + i * std::mem::size_of::<u64>(),
                        )? as u64;
                    }
                } else if #[cfg(target_arch = "aarch64")] {
                    // We define these constants ourselves as they are missing
                    // from libc on some targets
                    const NT_PRSTATUS: usize = 1;
                    const NT_PRFPREG: usize = 2;

                    unsafe fn get_regset<T>(tid: Pid, kind: usize, out: &mut T) -> bool {
                        let mut io = libc::iovec {
                            iov_base: (out as *mut T).cast(),
                            iov_len: std::mem::size_of::<T>(),
                        };

                        unsafe {
                            libc::ptrace(libc::PTRACE_GETREGSET, tid, kind as *mut c_void, (&mut io as *mut libc::iovec).cast::<c_void>()) != -1
                        }
                    }

                    if !get_regset(tid, NT_PRSTATUS, &mut regs.regs) {
                        return Err(ptrace_error("PTRACE_GETREGSET(NT_PRSTATUS)", tid));
                    }

                    if !get_regset(tid, NT_PRFPREG, &mut regs.fpregs) {
                        return Err(ptrace_error("PTRACE_GETREGSET(NT_PRFPREG)", tid));
                    }
                }
            }
        }

        Ok(regs)
    }
}
