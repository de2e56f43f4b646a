//! Provides the [`CrashContext`] captured by a signal handler on the crashing
//! thread.
//!
//! The context is a plain `#[repr(C)]` value with no pointers into the heap,
//! which means it can be copied byte for byte into another execution context
//! (eg. a process created with `clone`) and reconstructed there with
//! [`CrashContext::from_bytes`].

// crate-specific exceptions:
#![allow(unsafe_code, nonstandard_style)]

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;
        pub use linux::*;
    } else {
        compile_error!("crash-context only supports Linux and Android");
    }
}
