use crate::Pid;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read '{path}'")]
    Proc {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no memory mappings were found for process {0}")]
    NoMappings(Pid),
    #[error("the status of thread {tid} is missing the '{field}' field")]
    MissingStatusField { tid: Pid, field: &'static str },
    #[error("ptrace {request} failed for thread {tid}")]
    Ptrace {
        request: &'static str,
        tid: Pid,
        #[source]
        source: std::io::Error,
    },
    #[error("waitpid failed for thread {tid}")]
    WaitPid {
        tid: Pid,
        #[source]
        source: std::io::Error,
    },
    #[error("thread {0} exited before it could be stopped")]
    ThreadExited(Pid),
    #[error("no mapping contains the stack pointer {0:#x}")]
    NoStackMapping(usize),
    #[error("threads must be suspended to read thread {0}")]
    NotSuspended(Pid),
}

impl Error {
    #[inline]
    pub(crate) fn proc(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Proc {
            path: path.into(),
            source,
        }
    }
}
