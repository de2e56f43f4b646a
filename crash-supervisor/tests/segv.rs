mod shared;

#[test]
fn handles_segv() {
    shared::handles_crash("handles_segv", shared::SadnessFlavor::Segfault);
}
