//! The overflow happens on the thread the supervisor was installed on, so the
//! handler runs on the alternate signal stack installed with it

mod shared;

#[test]
fn handles_stack_overflow() {
    shared::handles_crash(
        "handles_stack_overflow",
        shared::SadnessFlavor::StackOverflow,
    );
}
