#![allow(dead_code)]

use crash_supervisor::{self as cs, CrashContext, DumpDescriptor};
pub use sadness_generator::SadnessFlavor;
use std::{
    io::Write,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Command,
};

/// Set when the test binary is re-run as the crashing child, holding the
/// scratch directory the child writes into
const SCRATCH_DIR: &str = "CRASH_SUPERVISOR_SCRATCH";
/// The file each callback invocation is appended to
const EVENTS: &str = "events";
/// The id of the dump written by the supervisor in the crashing child
pub const DUMP_ID: &str = "crash";

/// What the parent observed of the crashed child
pub struct Crashed {
    pub pid: i32,
    pub events: Vec<String>,
    pub scratch: tempfile::TempDir,
}

impl Crashed {
    pub fn dump_path(&self) -> PathBuf {
        self.scratch.path().join(format!("{DUMP_ID}.dmp"))
    }
}

/// Appends an event line, used from inside the crash callbacks
pub fn record(scratch: &Path, event: &str) {
    let mut events = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(scratch.join(EVENTS))
        .unwrap();
    writeln!(events, "{event}").unwrap();
}

/// Returns the scratch directory if this is the crashing child
pub fn child_scratch() -> Option<PathBuf> {
    std::env::var_os(SCRATCH_DIR).map(PathBuf::from)
}

/// Raises the signal, making sure we don't spend time writing a core file
pub fn make_sad(flavor: SadnessFlavor, scratch: &Path) -> ! {
    unsafe {
        let no_core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        libc::setrlimit(libc::RLIMIT_CORE, &no_core);
    }

    let flavor = match flavor {
        SadnessFlavor::Bus(_) => SadnessFlavor::Bus(Box::leak(
            scratch.to_str().unwrap().to_owned().into_boxed_str(),
        )),
        other => other,
    };

    flavor.make_sad()
}

/// A dump writer that writes the raw crash context, succeeding only if the
/// crashing thread was captured with the stack it crashed on
pub fn context_writer() -> Box<dyn cs::DumpWriter> {
    cs::make_dump_writer(|path, pid, context, snapshot| {
        let Some(cc) = CrashContext::from_bytes(context) else {
            return false;
        };

        let crashed = snapshot
            .threads
            .iter()
            .find(|t| Some(t.tid) == snapshot.crashing_tid);

        let captured = snapshot.pid == pid
            && cc.pid == pid
            && snapshot.crashing_tid == Some(cc.tid)
            && crashed.is_some_and(|t| {
                t.stack.start <= cc.stack_pointer() && cc.stack_pointer() < t.stack.end()
            });

        captured && std::fs::write(path, context).is_ok()
    })
}

/// Re-runs the current test in a child process with [`SCRATCH_DIR`] set and
/// waits for it to die
pub fn run_child(test_name: &str) -> (std::process::ExitStatus, Crashed) {
    let scratch = tempfile::tempdir().unwrap();

    let mut child = Command::new(std::env::current_exe().unwrap())
        .args([test_name, "--exact", "--nocapture", "--test-threads", "1"])
        .env(SCRATCH_DIR, scratch.path())
        .spawn()
        .expect("failed to spawn child");

    let pid = child.id() as i32;
    let status = child.wait().unwrap();

    let events = std::fs::read_to_string(scratch.path().join(EVENTS))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect();

    (
        status,
        Crashed {
            pid,
            events,
            scratch,
        },
    )
}

/// Installs a supervisor that claims every crash then raises the flavor's
/// signal, verifying that the process dies from that same signal and that the
/// dump, if ptrace was allowed, holds the crash context.
pub fn handles_crash(test_name: &str, flavor: SadnessFlavor) {
    if let Some(scratch) = child_scratch() {
        let in_handler = scratch.clone();

        let _supervisor = unsafe {
            cs::CrashSupervisor::install(
                DumpDescriptor::with_id(&scratch, DUMP_ID),
                cs::make_crash_event(move |dd, succeeded| {
                    assert_eq!(dd.id(), DUMP_ID);
                    record(&in_handler, &format!("complete {succeeded}"));
                    true
                }),
                context_writer(),
            )
            .unwrap()
        };

        make_sad(flavor, &scratch);
    }

    let (status, crashed) = run_child(test_name);

    assert_eq!(
        status.signal(),
        Some(flavor.signal()),
        "child didn't die from the expected signal: {status:?}"
    );

    assert_eq!(crashed.events.len(), 1, "{:?}", crashed.events);
    match crashed.events[0].as_str() {
        "complete true" => {
            let bytes = std::fs::read(crashed.dump_path()).unwrap();
            let cc = CrashContext::from_bytes(&bytes).unwrap();

            assert_eq!(cc.signal(), flavor.signal());
            assert_eq!(cc.pid, crashed.pid);
        }
        "complete false" => {
            // The environment doesn't allow ptrace, eg. a container without
            // CAP_SYS_PTRACE, so only the signal handling can be checked
            eprintln!("the dump was not written, skipping dump verification");
        }
        other => panic!("unexpected event '{other}'"),
    }
}
