use std::path::{Path, PathBuf};

/// The extension of every dump file
pub const DUMP_EXTENSION: &str = "dmp";

/// Where the dump for a crash will be written.
///
/// The path is computed when the descriptor is created, long before any
/// crash, so that no formatting or allocation is needed in the signal
/// handler and so the path is known even if the dump fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpDescriptor {
    directory: PathBuf,
    id: String,
    path: PathBuf,
}

impl DumpDescriptor {
    /// Creates a descriptor for a dump in `directory`, named by a random
    /// (v4) uuid
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_id(directory, uuid::Uuid::new_v4().to_string())
    }

    /// Creates a descriptor for a dump in `directory` with the specified id,
    /// which should be unique to avoid overwriting other dumps
    pub fn with_id(directory: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        let directory = directory.into();
        let id = id.into();
        let path = directory.join(format!("{id}.{DUMP_EXTENSION}"));

        Self {
            directory,
            id,
            path,
        }
    }

    #[inline]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The full path of the dump, `<directory>/<id>.dmp`
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn computes_path() {
        let dd = DumpDescriptor::with_id("/var/crashes", "the-id");
        assert_eq!(dd.directory(), Path::new("/var/crashes"));
        assert_eq!(dd.id(), "the-id");
        assert_eq!(dd.path(), Path::new("/var/crashes/the-id.dmp"));
    }

    #[test]
    fn unique_ids() {
        let a = DumpDescriptor::new("/tmp");
        let b = DumpDescriptor::new("/tmp");

        assert_ne!(a.id(), b.id());
        assert!(uuid::Uuid::parse_str(a.id()).is_ok());
        assert_eq!(a.path().extension().unwrap(), DUMP_EXTENSION);
    }
}
