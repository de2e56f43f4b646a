mod dispatch;
mod registry;
mod state;

use crate::{CrashEvent, DumpDescriptor, DumpWriter, Error};

/// The fatal signals that are handled
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    Segv = libc::SIGSEGV,
    Abort = libc::SIGABRT,
    Illegal = libc::SIGILL,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
}

impl Signal {
    /// Every handled signal, in the order their dispositions are installed
    /// and restored
    pub const ALL: [Self; 5] = [Self::Segv, Self::Abort, Self::Illegal, Self::Bus, Self::Fpe];

    #[inline]
    pub fn from_raw(sig: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| *s as i32 == sig)
    }
}

/// A Linux/Android crash supervisor.
///
/// Any number of supervisors can be installed at the same time, a crash is
/// offered to each of them in turn, most recently installed first, until one
/// claims it.
pub struct CrashSupervisor {
    id: registry::EntryId,
    descriptor: DumpDescriptor,
}

impl CrashSupervisor {
    /// Installs a supervisor for every [`Signal`].
    ///
    /// When a crash occurs the `event` is asked whether it wants to handle it,
    /// and if so the process is captured and `writer` is invoked to write the
    /// dump to [`DumpDescriptor::path`].
    ///
    /// The first supervisor installed also installs an alternate signal stack
    /// on the calling thread so that stack overflows can be handled.
    ///
    /// If installation fails no signal dispositions are changed.
    pub fn install(
        descriptor: DumpDescriptor,
        event: Box<dyn CrashEvent>,
        writer: Box<dyn DumpWriter>,
    ) -> Result<Self, Error> {
        let id = state::install(descriptor.clone(), event, writer)?;
        Ok(Self { id, descriptor })
    }

    /// Where the dump is written if this supervisor handles a crash
    #[inline]
    pub fn descriptor(&self) -> &DumpDescriptor {
        &self.descriptor
    }

    /// Uninstalls the supervisor.
    ///
    /// This is done automatically when this [`CrashSupervisor`] is dropped.
    #[inline]
    pub fn uninstall(self) {
        drop(self);
    }
}

impl Drop for CrashSupervisor {
    fn drop(&mut self) {
        state::uninstall(self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn raw_signals() {
        for sig in Signal::ALL {
            assert_eq!(Signal::from_raw(sig as i32), Some(sig));
        }

        // Signals outside the fatal set are left alone
        assert_eq!(Signal::from_raw(libc::SIGTRAP), None);
        assert_eq!(Signal::from_raw(libc::SIGTERM), None);
    }

    fn current(sig: Signal) -> (usize, i32) {
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            assert_eq!(libc::sigaction(sig as i32, std::ptr::null(), &mut sa), 0);
            (sa.sa_sigaction, sa.sa_flags & libc::SA_SIGINFO)
        }
    }

    fn supervisor(id: &str) -> CrashSupervisor {
        unsafe {
            CrashSupervisor::install(
                DumpDescriptor::with_id("/tmp", id),
                crate::make_crash_event(|_dd, _succeeded| true),
                crate::make_dump_writer(|_path, _pid, _ctx, _snapshot| true),
            )
            .unwrap()
        }
    }

    /// This is the only test in the crate that installs supervisors, as
    /// they are process wide
    #[test]
    fn restores_dispositions() {
        let before: Vec<_> = Signal::ALL.into_iter().map(current).collect();

        let a = supervisor("a");
        let ours: Vec<_> = Signal::ALL.into_iter().map(current).collect();
        assert!(ours.iter().all(|(_, siginfo)| *siginfo != 0));
        assert_ne!(ours, before);

        let b = supervisor("b");
        assert_eq!(b.descriptor().id(), "b");

        // Removing the bottom supervisor leaves ours in place, but hands the
        // original dispositions to the top one
        a.uninstall();
        assert_eq!(Signal::ALL.into_iter().map(current).collect::<Vec<_>>(), ours);

        drop(b);
        assert_eq!(Signal::ALL.into_iter().map(current).collect::<Vec<_>>(), before);
    }
}
