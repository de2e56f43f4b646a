//! Access to the `/proc` pseudo filesystem.
//!
//! The dumper only ever needs three shapes of data out of `/proc`: the entries
//! of a directory, the lines of a text file, and the raw bytes of a binary
//! file. Abstracting those lets the parsers be driven by canned data in tests.

use std::{
    ffi::OsString,
    io::{self, BufRead},
    path::Path,
};

/// Lines of a text file, read lazily
pub type Lines<'src> = Box<dyn Iterator<Item = io::Result<String>> + 'src>;

/// Source of `/proc` style data for a [`crate::ProcessDumper`]
pub trait ProcSource {
    /// Retrieves the names of the entries of the specified directory, in the
    /// order the OS returns them
    fn dir_entries(&self, path: &Path) -> io::Result<Vec<OsString>>;
    /// Opens the specified text file for line by line reading
    fn lines(&self, path: &Path) -> io::Result<Lines<'_>>;
    /// Reads the entire contents of the specified binary file
    fn bytes(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// [`ProcSource`] backed by the real filesystem
#[derive(Copy, Clone, Default)]
pub struct SysProc;

impl ProcSource for SysProc {
    fn dir_entries(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            match entry {
                Ok(entry) => names.push(entry.file_name()),
                // The entry disappeared between the directory being read and
                // being stat'ed, eg. a thread that exited mid scan
                Err(err) => log::debug!("skipping entry in '{}': {err}", path.display()),
            }
        }

        Ok(names)
    }

    fn lines(&self, path: &Path) -> io::Result<Lines<'_>> {
        let file = std::fs::File::open(path)?;
        Ok(Box::new(io::BufReader::new(file).lines()))
    }

    fn bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}
