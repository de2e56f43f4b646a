//! Reliable ways of making a Linux process receive each of the fatal signals.
//!
//! Every function here is expected to never return, the signal terminates
//! the process unless a handler intercepts it.

use std::arch::asm;

/// The ways a process can be made sad
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SadnessFlavor {
    /// `SIGABRT`
    Abort,
    /// `SIGSEGV` via a read of [`SEGFAULT_ADDRESS`]
    Segfault,
    /// `SIGSEGV` via running off the end of the thread's stack, the signal
    /// can only be handled if an alternate signal stack is installed
    StackOverflow,
    /// `SIGBUS` via a read past the end of a file mapping, the file is created
    /// in the specified directory
    Bus(&'static str),
    /// `SIGFPE` via an integer division by zero on `x86_64`, `aarch64` just
    /// produces 0 instead of trapping so the signal is sent directly
    DivideByZero,
    /// `SIGILL`
    Illegal,
}

impl SadnessFlavor {
    /// The signal the flavor raises
    pub fn signal(self) -> i32 {
        match self {
            Self::Abort => libc::SIGABRT,
            Self::Segfault | Self::StackOverflow => libc::SIGSEGV,
            Self::Bus(_) => libc::SIGBUS,
            Self::DivideByZero => libc::SIGFPE,
            Self::Illegal => libc::SIGILL,
        }
    }

    /// Raises the signal
    pub fn make_sad(self) -> ! {
        match self {
            Self::Abort => raise_abort(),
            Self::Segfault => raise_segfault(),
            Self::StackOverflow => raise_stack_overflow(),
            Self::Bus(dir) => raise_bus(dir),
            Self::DivideByZero => raise_floating_point_exception(),
            Self::Illegal => raise_illegal_instruction(),
        }
    }
}

/// Raises `SIGABRT`
pub fn raise_abort() -> ! {
    std::process::abort()
}

/// The address [`raise_segfault`] reads from. It is above the 4 GiB boundary
/// so it can't be confused with a truncated 32-bit pointer, and is never
/// mapped in practice.
pub const SEGFAULT_ADDRESS: usize = u32::MAX as usize + 0x42;

/// Raises `SIGSEGV`
pub fn raise_segfault() -> ! {
    let bad_ptr: *const u8 = std::ptr::without_provenance(SEGFAULT_ADDRESS);
    // Null derefs are checked in debug builds and panic rather than fault
    let s = unsafe { std::ptr::read_volatile(bad_ptr) };

    println!("we are crashing by reading an unmapped address: {s}");
    unreachable!("reading {SEGFAULT_ADDRESS:#x} didn't segfault");
}

/// Raises `SIGSEGV` by using a stack frame larger than any default thread
/// stack, the stack probes hit the guard page below the stack
pub fn raise_stack_overflow() -> ! {
    let mut big_boi = [0u8; 9 * 1024 * 1024];
    big_boi[big_boi.len() - 1] = 1;

    println!("{:?}", &std::hint::black_box(&big_boi)[big_boi.len() - 20..]);
    unreachable!("a 9 MiB stack frame didn't overflow the stack");
}

/// Raises `SIGFPE`
#[cfg(target_arch = "x86_64")]
pub fn raise_floating_point_exception() -> ! {
    let ohno = unsafe {
        let mut divisor: u32;
        asm!(
            "mov eax, 1",
            "cdq",
            "mov {div:e}, 0",
            "idiv {div:e}",
            div = out(reg) divisor,
            out("eax") _,
            out("edx") _,
        );
        divisor
    };

    println!("we are crashing by dividing by zero: {ohno}");
    unreachable!("an integer division by zero didn't trap");
}

/// `aarch64` doesn't trap on integer division by zero, so the signal is
/// sent instead
#[cfg(not(target_arch = "x86_64"))]
pub fn raise_floating_point_exception() -> ! {
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as i32;
        libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, libc::SIGFPE);
    }
    unreachable!("SIGFPE was ignored");
}

/// Raises `SIGILL`
pub fn raise_illegal_instruction() -> ! {
    unsafe {
        #[cfg(target_arch = "x86_64")]
        asm!("ud2");
        // Permanently undefined in the A64 encoding space
        #[cfg(target_arch = "aarch64")]
        asm!("udf #0");
    }
    unreachable!("an undefined instruction executed");
}

/// Raises `SIGBUS` by reading from a shared mapping of an empty file in the
/// specified directory
pub fn raise_bus(dir: &str) -> ! {
    let path = format!("{dir}/sadness-bus\0");

    unsafe {
        let bus_fd = libc::open(
            path.as_ptr().cast(),
            libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
            0o666,
        );
        assert!(bus_fd != -1, "failed to create {path}");

        let mapping = std::slice::from_raw_parts_mut(
            libc::mmap(
                std::ptr::null_mut(),
                128,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                bus_fd,
                0,
            )
            .cast::<u8>(),
            128,
        );

        println!("{}", std::ptr::read_volatile(&mapping[1]));
    }
    unreachable!("reading beyond the end of a file didn't raise SIGBUS");
}
