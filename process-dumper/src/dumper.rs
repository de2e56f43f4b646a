use crate::{
    Auxv, Error, MAX_STACK_CAPTURE, MemoryMapping, Pid, ProcSource, Ptrace, SpecialMappings,
    StackCapture, SysProc, ThreadSnapshot, Tracer, maps, thread,
};
use crash_context::CrashContext;
use std::path::PathBuf;

struct Thread {
    tid: Pid,
    /// Whether we successfully attached to the thread during the current
    /// suspension
    attached: bool,
}

/// Everything captured about a process, handed to the dump writer
pub struct ProcessSnapshot {
    pub pid: Pid,
    /// The thread that received the fatal signal, if the capture was done
    /// in response to one
    pub crashing_tid: Option<Pid>,
    pub auxv: Auxv,
    pub mappings: Vec<MemoryMapping>,
    /// Threads that could be suspended and read, threads that exited or
    /// could not be attached to are missing
    pub threads: Vec<ThreadSnapshot>,
}

/// Captures threads, mappings, registers, and memory of a target process.
///
/// The dumper must be [initialized](Self::init) before the threads can be
/// [suspended](Self::suspend_threads), and threads must be suspended for any
/// of their state to be read. Suspended threads are always resumed when the
/// dumper is dropped.
pub struct ProcessDumper<P: ProcSource = SysProc, T: Tracer = Ptrace> {
    pid: Pid,
    proc: P,
    tracer: T,
    page_size: usize,
    threads: Vec<Thread>,
    mappings: Vec<MemoryMapping>,
    auxv: Auxv,
    suspended: bool,
}

impl ProcessDumper {
    /// Creates a dumper for the specified process using `/proc` and `ptrace`.
    ///
    /// No system calls are made until [`Self::init`] is called.
    pub fn new(pid: Pid) -> Self {
        Self::with_backends(pid, SysProc, Ptrace)
    }
}

impl<P: ProcSource, T: Tracer> ProcessDumper<P, T> {
    pub fn with_backends(pid: Pid, proc: P, tracer: T) -> Self {
        Self {
            pid,
            proc,
            tracer,
            page_size: 0,
            threads: Vec::new(),
            mappings: Vec::new(),
            auxv: Auxv::default(),
            suspended: false,
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The thread ids found by [`Self::enumerate_threads`]
    #[inline]
    pub fn threads(&self) -> impl ExactSizeIterator<Item = Pid> + '_ {
        self.threads.iter().map(|t| t.tid)
    }

    /// The mappings found by [`Self::enumerate_mappings`], in address order
    #[inline]
    pub fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }

    #[inline]
    pub fn auxv(&self) -> &Auxv {
        &self.auxv
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    #[inline]
    fn proc_path(&self, rest: impl std::fmt::Display) -> PathBuf {
        PathBuf::from(format!("/proc/{}/{rest}", self.pid))
    }

    /// Enumerates the threads and mappings of the process
    pub fn init(&mut self) -> Result<(), Error> {
        self.enumerate_threads()?;
        self.enumerate_mappings()?;
        Ok(())
    }

    /// Retrieves the ids of every thread in the process.
    ///
    /// Entries that aren't thread ids are skipped, as are consecutive
    /// duplicates, which can show up if a thread exits and its slot is
    /// reused while the directory is being read.
    pub fn enumerate_threads(&mut self) -> Result<(), Error> {
        let task_path = self.proc_path("task");
        let entries = self
            .proc
            .dir_entries(&task_path)
            .map_err(|err| Error::proc(task_path, err))?;

        self.threads.clear();
        let mut last = None;

        for entry in entries {
            let Some(tid) = entry.to_str().and_then(|name| name.parse::<Pid>().ok()) else {
                continue;
            };

            if last == Some(tid) {
                continue;
            }

            last = Some(tid);
            self.threads.push(Thread {
                tid,
                attached: false,
            });
        }

        Ok(())
    }

    /// Retrieves every memory mapping of the process.
    ///
    /// The auxiliary vector is read first so that the vdso, which has no
    /// backing file, can be given a name.
    pub fn enumerate_mappings(&mut self) -> Result<(), Error> {
        let auxv_path = self.proc_path("auxv");
        self.auxv = match self.proc.bytes(&auxv_path) {
            Ok(raw) => Auxv::parse(&raw),
            Err(err) => {
                log::debug!("unable to read '{}': {err}", auxv_path.display());
                Auxv::default()
            }
        };

        self.page_size = self.auxv.page_size().unwrap_or_else(system_page_size);

        let special = SpecialMappings::from_auxv(&self.auxv);

        let maps_path = self.proc_path("maps");
        let lines = self
            .proc
            .lines(&maps_path)
            .map_err(|err| Error::proc(maps_path.clone(), err))?;

        self.mappings.clear();
        for line in lines {
            let line = line.map_err(|err| Error::proc(maps_path.clone(), err))?;

            match maps::parse_line(&line, &special) {
                Some(mapping) => self.mappings.push(mapping),
                None => log::debug!("skipping malformed maps line '{line}'"),
            }
        }

        if self.mappings.is_empty() {
            return Err(Error::NoMappings(self.pid));
        }

        Ok(())
    }

    /// Stops every enumerated thread by attaching to it.
    ///
    /// Threads that can't be attached to, eg. because they've exited or are
    /// already being traced, are skipped, but cause `false` to be returned.
    /// Suspending while already suspended does nothing and returns `true`.
    pub fn suspend_threads(&mut self) -> bool {
        if self.suspended {
            return true;
        }

        let mut good = true;
        for thread in &mut self.threads {
            match self.tracer.attach(thread.tid) {
                Ok(()) => thread.attached = true,
                Err(err) => {
                    log::warn!("unable to suspend thread {}: {err}", thread.tid);
                    good = false;
                }
            }
        }

        self.suspended = true;
        good
    }

    /// Resumes every thread stopped by [`Self::suspend_threads`].
    ///
    /// Returns `false` without doing anything if the threads are not
    /// suspended, or if any thread failed to detach.
    pub fn resume_threads(&mut self) -> bool {
        if !self.suspended {
            return false;
        }

        let mut good = true;
        for thread in self.threads.iter_mut().filter(|t| t.attached) {
            if let Err(err) = self.tracer.detach(thread.tid) {
                log::warn!("unable to resume thread {}: {err}", thread.tid);
                good = false;
            }
            thread.attached = false;
        }

        self.suspended = false;
        good
    }

    /// Finds the first mapping that contains the address
    #[inline]
    pub fn find_mapping(&self, address: usize) -> Option<&MemoryMapping> {
        self.mappings.iter().find(|m| m.contains(address))
    }

    /// Captures the ids, registers, and stack of a suspended thread
    pub fn thread_info(&self, tid: Pid) -> Result<ThreadSnapshot, Error> {
        self.thread_info_at(tid, None)
    }

    fn thread_info_at(
        &self,
        tid: Pid,
        stack_pointer: Option<usize>,
    ) -> Result<ThreadSnapshot, Error> {
        if !self.suspended || !self.threads.iter().any(|t| t.tid == tid && t.attached) {
            return Err(Error::NotSuspended(tid));
        }

        let status_path = self.proc_path(format_args!("task/{tid}/status"));
        let lines = self
            .proc
            .lines(&status_path)
            .map_err(|err| Error::proc(status_path, err))?;
        let (tgid, ppid) = thread::parse_status(tid, lines)?;

        let registers = self.tracer.registers(tid)?;
        let stack = self.capture_stack(
            tid,
            stack_pointer.unwrap_or_else(|| registers.stack_pointer()),
        )?;

        Ok(ThreadSnapshot {
            tid,
            ppid,
            tgid,
            registers,
            stack,
        })
    }

    /// Copies the memory above the stack pointer, starting at the beginning
    /// of the page the stack pointer is in, up to the end of the mapping that
    /// contains it or [`MAX_STACK_CAPTURE`] bytes, whichever is less.
    pub fn capture_stack(&self, tid: Pid, stack_pointer: usize) -> Result<StackCapture, Error> {
        let page_size = if self.page_size == 0 {
            system_page_size()
        } else {
            self.page_size
        };

        let start = stack_pointer & !(page_size - 1);
        let mapping = self
            .find_mapping(start)
            .ok_or(Error::NoStackMapping(stack_pointer))?;

        // Stacks grow down on every supported architecture, so the live part
        // of the stack is between the pointer and the end of the mapping
        let len = (mapping.end() - start).min(MAX_STACK_CAPTURE);

        let mut bytes = vec![0u8; len];
        self.copy_from_process(tid, &mut bytes, start);

        Ok(StackCapture { start, bytes })
    }

    /// Fills `dest` with the memory of the process starting at `src`.
    ///
    /// The copy is done a word at a time, and any word that cannot be read is
    /// written as zeroes rather than failing the entire copy. A dump with
    /// holes is still useful, a missing one is not.
    pub fn copy_from_process(&self, tid: Pid, dest: &mut [u8], src: usize) {
        const WORD: usize = std::mem::size_of::<usize>();

        let mut unreadable = 0;
        for (i, chunk) in dest.chunks_mut(WORD).enumerate() {
            let address = src.wrapping_add(i * WORD);
            let word = self.tracer.peek_word(tid, address).unwrap_or_else(|_err| {
                unreadable += 1;
                0
            });

            chunk.copy_from_slice(&word.to_ne_bytes()[..chunk.len()]);
        }

        if unreadable > 0 {
            log::debug!(
                "{unreadable} word(s) in {src:#x}..{:#x} of thread {tid} were unreadable",
                src.wrapping_add(dest.len())
            );
        }
    }

    /// Performs a full capture of the process: enumeration, suspension, every
    /// thread's state, and resumption.
    ///
    /// If a crash context is supplied, the crashing thread's stack is captured
    /// from the stack pointer at the time of the crash rather than its current
    /// one, which points into the signal handler.
    pub fn capture(mut self, crash: Option<&CrashContext>) -> Result<ProcessSnapshot, Error> {
        self.init()?;

        if !self.suspend_threads() {
            log::warn!("not every thread of process {} could be suspended", self.pid);
        }

        let attached: Vec<_> = self
            .threads
            .iter()
            .filter_map(|t| t.attached.then_some(t.tid))
            .collect();

        let mut threads = Vec::with_capacity(attached.len());
        for tid in attached {
            let stack_pointer = crash
                .filter(|cc| cc.tid == tid)
                .map(CrashContext::stack_pointer);

            match self.thread_info_at(tid, stack_pointer) {
                Ok(snapshot) => threads.push(snapshot),
                Err(err) => log::warn!("unable to capture thread {tid}: {err}"),
            }
        }

        if !self.resume_threads() {
            log::warn!("not every thread of process {} could be resumed", self.pid);
        }

        Ok(ProcessSnapshot {
            pid: self.pid,
            crashing_tid: crash.map(|cc| cc.tid),
            auxv: std::mem::take(&mut self.auxv),
            mappings: std::mem::take(&mut self.mappings),
            threads,
        })
    }
}

impl<P: ProcSource, T: Tracer> Drop for ProcessDumper<P, T> {
    fn drop(&mut self) {
        // Leaving threads attached would keep them frozen forever
        if self.suspended {
            self.resume_threads();
        }
    }
}

#[allow(unsafe_code)]
fn system_page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}
