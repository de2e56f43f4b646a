//! The per-architecture register set of a thread as read through `ptrace`

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Number of hardware debug registers (`dr0`-`dr7`)
        pub const NUM_DEBUG_REGISTERS: usize = 8;

        #[derive(Clone)]
        pub struct ThreadRegisters {
            /// General purpose registers
            pub regs: libc::user_regs_struct,
            /// x87 and SSE state
            pub fpregs: libc::user_fpregs_struct,
            pub debug_regs: [u64; NUM_DEBUG_REGISTERS],
        }

        impl ThreadRegisters {
            #[inline]
            pub fn stack_pointer(&self) -> usize {
                self.regs.rsp as usize
            }

            #[inline]
            pub fn instruction_pointer(&self) -> usize {
                self.regs.rip as usize
            }

            #[cfg(test)]
            pub(crate) fn set_stack_pointer(&mut self, sp: usize) {
                self.regs.rsp = sp as u64;
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Layout of the `NT_PRFPREG` register set
        #[repr(C)]
        #[derive(Copy, Clone)]
        pub struct FpsimdRegisters {
            pub vregs: [u128; 32],
            pub fpsr: u32,
            pub fpcr: u32,
        }

        #[derive(Clone)]
        pub struct ThreadRegisters {
            /// General purpose registers, `sp`, `pc` and `pstate`
            pub regs: libc::user_regs_struct,
            /// Floating point and SIMD state
            pub fpregs: FpsimdRegisters,
        }

        impl ThreadRegisters {
            #[inline]
            pub fn stack_pointer(&self) -> usize {
                self.regs.sp as usize
            }

            #[inline]
            pub fn instruction_pointer(&self) -> usize {
                self.regs.pc as usize
            }

            #[cfg(test)]
            pub(crate) fn set_stack_pointer(&mut self, sp: usize) {
                self.regs.sp = sp as u64;
            }
        }
    } else {
        compile_error!("process-dumper only supports x86_64 and aarch64");
    }
}

impl ThreadRegisters {
    /// An all zero register set, filled in by [`crate::Tracer::registers`]
    #[allow(unsafe_code)]
    #[inline]
    pub fn zeroed() -> Self {
        // SAFETY: the register structs are plain integers and arrays of integers
        unsafe { std::mem::zeroed() }
    }
}
