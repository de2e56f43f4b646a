#[repr(C)]
#[derive(Clone)]
pub struct sigset_t {
    #[cfg(target_pointer_width = "32")]
    __val: [u32; 32],
    #[cfg(target_pointer_width = "64")]
    __val: [u64; 16],
}

#[repr(C)]
#[derive(Clone)]
pub struct stack_t {
    pub ss_sp: *mut std::ffi::c_void,
    pub ss_flags: i32,
    pub ss_size: usize,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Index of the stack pointer in [`mcontext_t::gregs`]
        pub const REG_RSP: usize = 15;
        /// Index of the instruction pointer in [`mcontext_t::gregs`]
        pub const REG_RIP: usize = 16;

        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_mcontext: mcontext_t,
            pub uc_sigmask: sigset_t,
            __private: [u8; 512],
            /// Shadow stack state, only present in glibc's layout
            #[cfg(not(target_env = "musl"))]
            __ssp: [u64; 4],
        }

        #[repr(C)]
        #[derive(Clone)]
        pub struct mcontext_t {
            pub gregs: [i64; 23],
            pub fpregs: *mut fpregset_t,
            __reserved: [u64; 8],
        }

        /// The `fxsave` area, which also holds the SSE registers
        #[repr(C)]
        #[derive(Clone)]
        pub struct fpregset_t {
            pub cwd: u16,
            pub swd: u16,
            pub ftw: u16,
            pub fop: u16,
            pub rip: u64,
            pub rdp: u64,
            pub mxcsr: u32,
            pub mxcr_mask: u32,
            pub st_space: [u32; 32],
            pub xmm_space: [u32; 64],
            __padding: [u64; 12],
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Magic value identifying a [`fpsimd_context`] record in
        /// [`mcontext_t::__reserved`]
        pub const FPSIMD_MAGIC: u32 = 0x4650_8001;

        #[repr(C)]
        #[derive(Clone)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_sigmask: sigset_t,
            pub uc_mcontext: mcontext_t,
        }

        #[repr(C, align(16))]
        #[derive(Clone)]
        pub struct mcontext_t {
            pub fault_address: u64,
            pub regs: [u64; 31],
            pub sp: u64,
            pub pc: u64,
            pub pstate: u64,
            pub __reserved: [u8; 4096],
        }

        #[repr(C)]
        #[derive(Clone)]
        pub struct _aarch64_ctx {
            pub magic: u32,
            pub size: u32,
        }

        #[repr(C)]
        #[derive(Clone)]
        pub struct fpsimd_context {
            pub head: _aarch64_ctx,
            pub fpsr: u32,
            pub fpcr: u32,
            pub vregs: [u128; 32],
        }

        /// On aarch64 the floating point state is not part of the user ABI
        /// of the `ucontext_t` but a tagged record in its reserved space
        pub type fpregset_t = fpsimd_context;
    } else {
        compile_error!("crash-context only supports x86_64 and aarch64");
    }
}

/// The full context for a Linux/Android crash, captured on the crashing thread
/// inside the signal handler.
///
/// Every field is a plain value, there are no pointers to follow other than
/// the ones embedded in the kernel supplied `ucontext_t`, which are never
/// dereferenced by consumers of this type.
#[repr(C)]
#[derive(Clone)]
pub struct CrashContext {
    /// Crashing thread context.
    ///
    /// Note that we use [`crate::ucontext_t`] instead of `libc::ucontext_t`
    /// as libc's differs between glibc and musl <https://github.com/rust-lang/libc/pull/1646>
    /// even though the ucontext_t received from a signal will be the same
    /// regardless of the libc implementation used as it is only arch specific
    /// not libc specific
    pub context: ucontext_t,
    /// State of the floating point registers, copied out of the context so
    /// that it doesn't rely on the `fpregs` pointer
    pub float_state: fpregset_t,
    /// The signal info for the crash
    pub siginfo: libc::signalfd_siginfo,
    /// The process id of the crashing process
    pub pid: libc::pid_t,
    /// The id of the crashing thread
    pub tid: libc::pid_t,
}

unsafe impl Send for CrashContext {}

impl CrashContext {
    /// Creates an all zero context, the state of the static slot the signal
    /// handler writes into
    #[inline]
    pub const fn zeroed() -> Self {
        // SAFETY: every field is plain old data for which all zeroes is valid,
        // including the null raw pointers
        unsafe { std::mem::zeroed() }
    }

    /// The signal number that caused the crash
    #[inline]
    pub fn signal(&self) -> i32 {
        self.siginfo.ssi_signo as i32
    }

    /// The stack pointer of the crashing thread at the moment of the crash
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                self.context.uc_mcontext.gregs[REG_RSP] as usize
            } else if #[cfg(target_arch = "aarch64")] {
                self.context.uc_mcontext.sp as usize
            }
        }
    }

    /// The instruction pointer of the crashing thread at the moment of the crash
    #[inline]
    pub fn instruction_pointer(&self) -> usize {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                self.context.uc_mcontext.gregs[REG_RIP] as usize
            } else if #[cfg(target_arch = "aarch64")] {
                self.context.uc_mcontext.pc as usize
            }
        }
    }

    /// Views the context as the raw bytes handed to a dump writer
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            let size = std::mem::size_of_val(self);
            let ptr = (self as *const Self).cast();
            std::slice::from_raw_parts(ptr, size)
        }
    }

    /// Reconstructs a context from bytes produced by [`Self::as_bytes`],
    /// returning `None` if the length doesn't match
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != std::mem::size_of::<Self>() {
            return None;
        }

        // The slice has no alignment guarantees
        unsafe { Some(std::ptr::read_unaligned(bytes.as_ptr().cast::<Self>())) }
    }
}

#[cfg(test)]
mod test {
    use super::CrashContext;

    // Musl doesn't contain fpregs in libc because reasons https://github.com/rust-lang/libc/pull/1646
    #[cfg(all(target_arch = "x86_64", not(target_env = "musl")))]
    #[test]
    fn matches_libc() {
        assert_eq!(
            std::mem::size_of::<libc::ucontext_t>(),
            std::mem::size_of::<super::ucontext_t>()
        );
    }

    #[test]
    fn bytes_are_exact() {
        let mut cc = CrashContext::zeroed();
        cc.pid = 1234;
        cc.tid = 1235;
        cc.siginfo.ssi_signo = libc::SIGSEGV as u32;

        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                cc.context.uc_mcontext.gregs[super::REG_RSP] = 0x7ffd_0000_1ff8;
                cc.context.uc_mcontext.gregs[super::REG_RIP] = 0x5555_0000_1000;
            } else if #[cfg(target_arch = "aarch64")] {
                cc.context.uc_mcontext.sp = 0x7ffd_0000_1ff8;
                cc.context.uc_mcontext.pc = 0x5555_0000_1000;
            }
        }

        let bytes = cc.as_bytes();
        assert_eq!(bytes.len(), std::mem::size_of::<CrashContext>());

        let copy = CrashContext::from_bytes(bytes).expect("length matches");
        assert_eq!(copy.signal(), libc::SIGSEGV);
        assert_eq!(copy.stack_pointer(), 0x7ffd_0000_1ff8);
        assert_eq!(copy.instruction_pointer(), 0x5555_0000_1000);
        assert_eq!((copy.pid, copy.tid), (1234, 1235));

        assert!(CrashContext::from_bytes(&bytes[1..]).is_none());
    }
}
