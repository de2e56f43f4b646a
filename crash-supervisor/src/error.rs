use std::fmt;

/// An error that can occur when installing a [`crate::CrashSupervisor`]
#[derive(Debug)]
pub enum Error {
    /// Unable to `mmap` memory for the alternate signal stack or the stack of
    /// the dumping context
    OutOfMemory,
    /// A syscall failed, eg. `sigaction` refused one of the fatal signals
    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            Self::OutOfMemory => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("unable to allocate memory"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
