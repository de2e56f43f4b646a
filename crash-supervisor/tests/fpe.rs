//! `aarch64` doesn't trap on an integer division by zero, so there the signal
//! is sent to the thread instead, which the supervisor handles the same way

mod shared;

#[test]
fn handles_fpe() {
    shared::handles_crash("handles_fpe", shared::SadnessFlavor::DivideByZero);
}
