use super::{
    Signal,
    dispatch::{self, CHILD_STACK_SIZE, StackArena},
    registry::{EntryId, Registry},
};
use crate::{CrashEvent, DumpDescriptor, DumpWriter, Error};
use std::{mem, ptr};

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 16 * 1024 {
        libc::SIGSTKSZ
    } else {
        16 * 1024
    }
}

/// The size of the alternate stack the signal handler runs on.
///
/// The handler itself keeps the [`crate::CrashContext`] in static memory and
/// the dumping context has its own stack, so this only needs to fit the
/// handler's own frames
const SIG_STACK_SIZE: usize = get_stack_size();

struct StackSave {
    old: Option<libc::stack_t>,
    new: libc::stack_t,
}

unsafe impl Send for StackSave {}

static STACK_SAVE: parking_lot::Mutex<Option<StackSave>> = parking_lot::const_mutex(None);

/// Create an alternative stack to run the signal handlers on. This is done since
/// the signal might have been caused by a stack overflow.
unsafe fn install_sigaltstack() -> Result<(), Error> {
    unsafe {
        // Check to see if the existing sigaltstack, and if it exists, is it big
        // enough. If so we don't need to allocate our own.
        let mut old_stack = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) == -1 {
            return Err(std::io::Error::last_os_error().into());
        }

        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
            return Ok(());
        }

        // ... but failing that we need to allocate our own, so do all that
        // here.
        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let alloc_size = guard_size + SIG_STACK_SIZE;

        let ptr = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }

        // Prepare the stack with readable/writable memory and then register it
        // with `sigaltstack`.
        let stack_ptr = (ptr as usize + guard_size) as *mut libc::c_void;
        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: SIG_STACK_SIZE,
        };

        if libc::mprotect(stack_ptr, SIG_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) == -1
            || libc::sigaltstack(&new_stack, ptr::null_mut()) == -1
        {
            let err = std::io::Error::last_os_error();
            libc::munmap(ptr, alloc_size);
            return Err(err.into());
        }

        *STACK_SAVE.lock() = Some(StackSave {
            old: (old_stack.ss_flags & libc::SS_DISABLE == 0).then_some(old_stack),
            new: new_stack,
        });

        Ok(())
    }
}

/// Unregisters and frees the alternate stack installed by
/// [`install_sigaltstack`].
///
/// `sigaltstack` only affects the calling thread, so if this is not the
/// thread that installed the stack it is left registered and mapped. It is
/// released by a later restore on the installing thread, or leaked if the
/// next install happens on another thread.
unsafe fn restore_sigaltstack() {
    let mut ssl = STACK_SAVE.lock();

    if let Some(ss) = &mut *ssl {
        unsafe {
            let mut current_stack = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current_stack) == -1 {
                return;
            }

            if current_stack.ss_flags & libc::SS_DISABLE != 0
                || current_stack.ss_sp != ss.new.ss_sp
            {
                return;
            }

            if let Some(old) = ss.old {
                // Restore the old alt stack if there was one
                if libc::sigaltstack(&old, ptr::null_mut()) == -1 {
                    return;
                }
            } else {
                // Restore to the default alt stack otherwise
                let mut disable: libc::stack_t = mem::zeroed();
                disable.ss_flags = libc::SS_DISABLE;
                if libc::sigaltstack(&disable, ptr::null_mut()) == -1 {
                    return;
                }
            }

            let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let r = libc::munmap(
                ss.new.ss_sp.cast::<u8>().sub(guard_size).cast(),
                guard_size + ss.new.ss_size,
            );
            debug_assert_eq!(r, 0, "munmap failed for the alternate signal stack");
            *ssl = None;
        }
    }
}

/// Restores the signal handler for the specified signal back to its default
/// handler, which _should_ perform the default signal action as seen in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
pub(super) unsafe fn install_default_handler(sig: Signal) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones. There is a bug in these functions where a request to set the handler
    // to SIG_DFL is ignored. In that case, an infinite loop is entered as the
    // signal is repeatedly sent to our signal handler.
    // To work around this, directly call the system's sigaction.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig as i32,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig as i32, libc::SIG_DFL);
            }
        }
    }
}

/// The dispositions that were in place before a supervisor was installed, in
/// the same order as [`Signal::ALL`]
pub(super) type Dispositions = [libc::sigaction; Signal::ALL.len()];

/// Restores each signal's disposition, in installation order, falling back
/// to the default disposition if the previous one is refused
unsafe fn restore_handlers(previous: &Dispositions) {
    unsafe {
        for (sig, action) in Signal::ALL.into_iter().zip(previous.iter()) {
            if libc::sigaction(sig as i32, action, ptr::null_mut()) == -1 {
                install_default_handler(sig);
            }
        }
    }
}

#[inline]
fn handler_action() -> libc::sigaction {
    // SAFETY: sigaction is a plain C struct
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all fatal signals when we're handling one of them.
        for sig in Signal::ALL {
            libc::sigaddset(&mut sa.sa_mask, sig as i32);
        }

        sa.sa_sigaction = signal_handler as *const () as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;
        sa
    }
}

/// Installs our handler for every fatal signal, returning the dispositions
/// that were replaced.
///
/// If any signal can't be installed, every signal that was already swapped
/// is reverted before the error is returned.
unsafe fn install_handlers() -> Result<Dispositions, Error> {
    install_handlers_with(|sig, action, old| unsafe {
        libc::sigaction(
            sig as i32,
            action,
            old.map_or(ptr::null_mut(), ptr::from_mut),
        ) == 0
    })
}

/// [`install_handlers`], with `sigaction` swapping a single disposition and
/// returning false if it was refused
fn install_handlers_with(
    mut sigaction: impl FnMut(Signal, &libc::sigaction, Option<&mut libc::sigaction>) -> bool,
) -> Result<Dispositions, Error> {
    let sa = handler_action();
    // SAFETY: sigaction is a plain C struct
    let mut previous: Dispositions = unsafe { mem::zeroed() };

    for (i, sig) in Signal::ALL.into_iter().enumerate() {
        if !sigaction(sig, &sa, Some(&mut previous[i])) {
            let err = std::io::Error::last_os_error();

            for (sig, action) in Signal::ALL[..i].iter().zip(previous.iter()) {
                if !sigaction(*sig, action, None) {
                    // SAFETY: syscall
                    unsafe { install_default_handler(*sig) };
                }
            }

            return Err(err.into());
        }
    }

    Ok(previous)
}

/// One installed supervisor
pub(crate) struct HandlerInner {
    pub(super) event: Box<dyn CrashEvent>,
    pub(super) writer: Box<dyn DumpWriter>,
    pub(super) descriptor: DumpDescriptor,
    /// The dispositions to restore when this supervisor is uninstalled
    previous: Dispositions,
    pub(super) arena: StackArena,
}

impl HandlerInner {
    fn new(
        descriptor: DumpDescriptor,
        event: Box<dyn CrashEvent>,
        writer: Box<dyn DumpWriter>,
    ) -> Result<Self, Error> {
        Ok(Self {
            event,
            writer,
            descriptor,
            // SAFETY: sigaction is a plain C struct
            previous: unsafe { mem::zeroed() },
            arena: StackArena::new(CHILD_STACK_SIZE)?,
        })
    }

    unsafe fn handle_signal(&self, info: &libc::siginfo_t, uc: &libc::c_void) -> bool {
        unsafe {
            // The siginfo_t in libc is lowest common denominator, but this code is
            // specifically targeting linux/android, which contains the si_pid field
            // that we require
            let nix_info = &*((info as *const libc::siginfo_t).cast::<libc::signalfd_siginfo>());

            debug_print!("acquired siginfo");

            let mut cc = CRASH_CONTEXT.lock();

            {
                use std::ops::DerefMut;
                #[allow(clippy::explicit_deref_methods)]
                ptr::write_bytes(cc.deref_mut(), 0, 1);
                debug_print!("zeroed crashctx");

                ptr::copy_nonoverlapping(nix_info, &mut cc.siginfo, 1);
                debug_print!("copied siginfo");

                let uc_ptr = &*(uc as *const libc::c_void).cast::<crash_context::ucontext_t>();
                ptr::copy_nonoverlapping(uc_ptr, &mut cc.context, 1);
                debug_print!("copied context");

                cfg_if::cfg_if! {
                    if #[cfg(target_arch = "aarch64")] {
                        let fp_ptr = uc_ptr.uc_mcontext.__reserved.as_ptr().cast::<crash_context::fpsimd_context>();

                        if (*fp_ptr).head.magic == crash_context::FPSIMD_MAGIC {
                            ptr::copy_nonoverlapping(fp_ptr, &mut cc.float_state, 1);
                        }
                    } else {
                        if !uc_ptr.uc_mcontext.fpregs.is_null() {
                            ptr::copy_nonoverlapping(uc_ptr.uc_mcontext.fpregs, &mut cc.float_state, 1);
                        }
                    }
                }

                cc.pid = libc::getpid();
                cc.tid = libc::syscall(libc::SYS_gettid) as i32;
            }

            if !self.event.should_handle_context(&cc) {
                debug_print!("crash declined with context");
                return false;
            }

            let succeeded = dispatch::generate_dump(self, &cc);
            self.event.on_dump_complete(&self.descriptor, succeeded)
        }
    }
}

/// The size of `CrashContext` can be too big w.r.t the size of alternatate stack
/// for `signal_handler`. Keep the crash context as a .bss field.
static CRASH_CONTEXT: parking_lot::Mutex<crash_context::CrashContext> =
    parking_lot::const_mutex(crash_context::CrashContext::zeroed());

/// Every installed supervisor, the most recently installed on top
static REGISTRY: parking_lot::Mutex<Registry<HandlerInner>> =
    parking_lot::const_mutex(Registry::new());

/// Serializes installs and uninstalls so that the registry lock itself is
/// only ever held for a push or removal
static INSTALL_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Offers the crash to each supervisor, most recently installed first, until
/// one of them claims it
fn arbitrate(
    registry: &Registry<HandlerInner>,
    mut dispatch: impl FnMut(&HandlerInner) -> bool,
) -> bool {
    registry.walk_from_top(|inner| inner.event.should_handle() && dispatch(inner))
}

pub(super) fn install(
    descriptor: DumpDescriptor,
    event: Box<dyn CrashEvent>,
    writer: Box<dyn DumpWriter>,
) -> Result<EntryId, Error> {
    let _installing = INSTALL_LOCK.lock();

    let mut inner = HandlerInner::new(descriptor, event, writer)?;
    let first = REGISTRY.lock().is_empty();

    // SAFETY: syscalls
    unsafe {
        if first {
            install_sigaltstack()?;
        }

        inner.previous = match install_handlers() {
            Ok(previous) => previous,
            Err(err) => {
                if first {
                    restore_sigaltstack();
                }
                return Err(err);
            }
        };
    }

    let path = inner.descriptor.path().to_owned();
    let (id, count) = {
        let mut registry = REGISTRY.lock();
        (registry.push(inner), registry.len())
    };

    log::debug!(
        "installed crash supervisor writing to '{}', {count} installed",
        path.display()
    );

    Ok(id)
}

/// Removes the supervisor, restoring the dispositions it replaced if it is
/// the most recently installed one, otherwise handing them to the supervisor
/// installed directly after it
pub(super) fn uninstall(id: EntryId) {
    let _installing = INSTALL_LOCK.lock();

    let (removed, was_top, now_empty) = {
        let mut registry = REGISTRY.lock();
        let Some((removed, next)) = registry.remove(id) else {
            return;
        };

        let was_top = match next {
            Some(next) => {
                next.previous = removed.previous;
                false
            }
            None => true,
        };

        (removed, was_top, registry.is_empty())
    };

    // SAFETY: syscalls
    unsafe {
        if was_top {
            restore_handlers(&removed.previous);
        }

        if now_empty {
            restore_sigaltstack();
        }
    }

    log::debug!(
        "uninstalled crash supervisor writing to '{}'",
        removed.descriptor.path().display()
    );
}

/// This is the actual function installed for each signal we support, invoked
/// by the kernel
unsafe extern "C" fn signal_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        // We might run inside a process where some other buggy code saves and
        // restores signal handlers temporarily with `signal` instead of `sigaction`.
        // This loses the `SA_SIGINFO` flag associated with this function. As a
        // consequence, the values of `info` and `uc` become totally bogus,
        // generally inducing a crash.
        //
        // The following code tries to detect this case. When it does, it
        // resets the signal handlers with `sigaction` & `SA_SIGINFO` and returns.
        // This forces the signal to be thrown again, but this time the kernel
        // will call the function with the right arguments.
        {
            let mut cur_handler: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig, ptr::null_mut(), &mut cur_handler) == 0
                && cur_handler.sa_sigaction == signal_handler as *const () as usize
                && cur_handler.sa_flags & libc::SA_SIGINFO == 0
            {
                // Reset signal handler with the correct flags.
                let sa = handler_action();

                if libc::sigaction(sig, &sa, ptr::null_mut()) == -1 {
                    // When resetting the handler fails, try to reset the
                    // default one to avoid an infinite loop here.
                    if let Some(signal) = Signal::from_raw(sig) {
                        install_default_handler(signal);
                    }
                }

                // exit the handler as we should be called again soon
                return;
            }
        }

        {
            let registry = REGISTRY.lock();
            let info = &*info;
            let uc = &*uc;

            if arbitrate(&registry, |inner| inner.handle_signal(info, uc)) {
                debug_print!("crash claimed");
            } else {
                debug_print!("crash not claimed");
            }
        }

        // Regardless of whether the crash was claimed the process dies with
        // the signal it received, on the thread that received it. For a
        // hardware fault the signal is pending until we return and unblock it.
        if let Some(signal) = Signal::from_raw(sig) {
            install_default_handler(signal);
        }

        debug_print!("re-raising signal");

        let tid = libc::syscall(libc::SYS_gettid) as i32;
        if libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, sig) < 0 {
            // If we failed to kill ourselves (e.g. because a sandbox disallows us
            // to do so), we instead resort to terminating our process. This will
            // result in an incorrect exit code.
            libc::_exit(1);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::CrashContext;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        accepts: bool,
        claims: bool,
        log: Log,
    }

    unsafe impl CrashEvent for Recorder {
        fn should_handle(&self) -> bool {
            self.log.lock().unwrap().push(format!("{}: filter", self.name));
            self.accepts
        }

        fn should_handle_context(&self, _context: &CrashContext) -> bool {
            unreachable!("the context filter is part of the dispatch")
        }

        fn on_dump_complete(&self, descriptor: &DumpDescriptor, succeeded: bool) -> bool {
            assert!(succeeded);
            assert_eq!(descriptor.id(), self.name);
            self.log.lock().unwrap().push(format!("{}: complete", self.name));
            self.claims
        }
    }

    fn registry(recorders: &[(&'static str, bool, bool)], log: &Log) -> Registry<HandlerInner> {
        let mut registry = Registry::new();

        for (name, accepts, claims) in recorders.iter().copied() {
            let inner = HandlerInner::new(
                DumpDescriptor::with_id("/tmp", name),
                Box::new(Recorder {
                    name,
                    accepts,
                    claims,
                    log: log.clone(),
                }),
                crate::make_dump_writer(|_path, _pid, _ctx, _snapshot| unreachable!()),
            )
            .unwrap();

            registry.push(inner);
        }

        registry
    }

    /// Stands in for the clone and capture
    fn dispatch(inner: &HandlerInner) -> bool {
        inner.event.on_dump_complete(&inner.descriptor, true)
    }

    #[test]
    fn first_claim_wins() {
        let log = Log::default();
        let registry = registry(
            &[("a", true, true), ("b", true, true), ("c", true, false)],
            &log,
        );

        assert!(arbitrate(&registry, dispatch));
        assert_eq!(
            *log.lock().unwrap(),
            ["c: filter", "c: complete", "b: filter", "b: complete"]
        );
    }

    #[test]
    fn unclaimed_consults_all_once() {
        let log = Log::default();
        let registry = registry(
            &[("a", true, false), ("b", false, true), ("c", true, false)],
            &log,
        );

        assert!(!arbitrate(&registry, dispatch));
        assert_eq!(
            *log.lock().unwrap(),
            ["c: filter", "c: complete", "b: filter", "a: filter", "a: complete"]
        );
    }

    #[test]
    fn rejecting_filter_skips_dispatch() {
        let log = Log::default();
        let registry = registry(&[("a", true, true), ("b", false, true)], &log);

        assert!(arbitrate(&registry, dispatch));
        assert_eq!(
            *log.lock().unwrap(),
            ["b: filter", "a: filter", "a: complete"]
        );
    }

    #[test]
    fn empty_registry() {
        let registry = Registry::<HandlerInner>::new();
        assert!(!arbitrate(&registry, |_| unreachable!()));
    }

    /// Fails installing over `refused`, recording every swap made
    fn failing_install(
        refused: Signal,
        table: &mut [usize; Signal::ALL.len()],
        swaps: &mut Vec<(Signal, usize)>,
    ) -> Result<Dispositions, Error> {
        let ours = signal_handler as *const () as usize;

        install_handlers_with(|sig, action, old| {
            if sig == refused && action.sa_sigaction == ours {
                return false;
            }

            let slot = &mut table[Signal::ALL.iter().position(|s| *s == sig).unwrap()];
            if let Some(old) = old {
                old.sa_sigaction = *slot;
            }
            *slot = action.sa_sigaction;
            swaps.push((sig, action.sa_sigaction));
            true
        })
    }

    #[test]
    fn failed_install_reverts() {
        let original = [0x100, 0x200, 0x300, 0x400, 0x500];
        let mut table = original;
        let mut swaps = Vec::new();

        assert!(failing_install(Signal::Illegal, &mut table, &mut swaps).is_err());

        // Every disposition that was swapped is put back, nothing after the
        // refused signal is touched
        assert_eq!(table, original);

        let ours = signal_handler as *const () as usize;
        assert_eq!(
            swaps,
            [
                (Signal::Segv, ours),
                (Signal::Abort, ours),
                (Signal::Segv, 0x100),
                (Signal::Abort, 0x200),
            ]
        );
    }

    #[test]
    fn install_returns_replaced() {
        let original = [0x100, 0x200, 0x300, 0x400, 0x500];
        let mut table = original;
        let mut swaps = Vec::new();

        let previous = install_handlers_with(|sig, action, old| {
            let slot = &mut table[Signal::ALL.iter().position(|s| *s == sig).unwrap()];
            if let Some(old) = old {
                old.sa_sigaction = *slot;
            }
            *slot = action.sa_sigaction;
            swaps.push(sig);
            true
        })
        .unwrap();

        assert_eq!(swaps, Signal::ALL);
        assert_eq!(previous.map(|sa| sa.sa_sigaction), original);
        assert!(table.iter().all(|sa| *sa == signal_handler as *const () as usize));
    }
}
