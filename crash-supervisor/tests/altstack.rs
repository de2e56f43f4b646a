use crash_supervisor::{self as cs, DumpDescriptor};
use std::{mem, ptr};

fn current_altstack() -> libc::stack_t {
    unsafe {
        let mut ss: libc::stack_t = mem::zeroed();
        assert_eq!(libc::sigaltstack(ptr::null(), &mut ss), 0);
        ss
    }
}

fn is_mapped(ss: &libc::stack_t) -> bool {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let start = ss.ss_sp as usize & !(page - 1);
    let len = ss.ss_sp as usize + ss.ss_size - start;

    let mut residency = vec![0u8; len.div_ceil(page)];
    // Fails with ENOMEM if any page in the range is unmapped
    unsafe { libc::mincore(start as *mut _, len, residency.as_mut_ptr()) == 0 }
}

fn install() -> cs::CrashSupervisor {
    unsafe {
        cs::CrashSupervisor::install(
            DumpDescriptor::with_id("/tmp", "altstack"),
            cs::make_crash_event(|_dd, _succeeded| true),
            cs::make_dump_writer(|_path, _pid, _ctx, _snapshot| true),
        )
        .unwrap()
    }
}

/// The alternate stack belongs to the installing thread, dropping the last
/// supervisor on another thread must not free it from under that thread
#[test]
fn uninstall_on_another_thread() {
    let original = current_altstack();

    let supervisor = install();
    let ours = current_altstack();
    assert_eq!(ours.ss_flags & libc::SS_DISABLE, 0);
    assert!(is_mapped(&ours));

    std::thread::spawn(move || drop(supervisor))
        .join()
        .unwrap();

    let after = current_altstack();
    assert_eq!(after.ss_flags & libc::SS_DISABLE, 0);
    assert_eq!(after.ss_sp, ours.ss_sp);
    assert!(is_mapped(&after), "the alternate stack was unmapped");

    // Installing again on this thread reuses the stack, and uninstalling
    // here releases it
    let supervisor = install();
    assert_eq!(current_altstack().ss_sp, ours.ss_sp);
    drop(supervisor);

    let restored = current_altstack();
    assert_eq!(
        (restored.ss_sp, restored.ss_flags & libc::SS_DISABLE),
        (original.ss_sp, original.ss_flags & libc::SS_DISABLE)
    );
    if restored.ss_flags & libc::SS_DISABLE == 0 {
        assert!(is_mapped(&restored));
    }
}
