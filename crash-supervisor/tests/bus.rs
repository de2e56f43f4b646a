mod shared;

#[test]
fn handles_bus() {
    shared::handles_crash("handles_bus", shared::SadnessFlavor::Bus(""));
}
