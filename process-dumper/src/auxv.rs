//! Parsing of `/proc/<pid>/auxv`

const AT_NULL: usize = 0;
/// The auxiliary vector entry holding the system page size
pub const AT_PAGESZ: usize = 6;
/// The auxiliary vector entry holding the load address of the vdso
pub const AT_SYSINFO_EHDR: usize = 33;

const WORD: usize = std::mem::size_of::<usize>();

/// The auxiliary vector of a process, a list of `(type, value)` pairs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Auxv {
    entries: Vec<(usize, usize)>,
}

impl Auxv {
    /// Parses the raw contents of an auxv file, which is a sequence of native
    /// word sized pairs terminated by an `AT_NULL` entry. A trailing partial
    /// pair is ignored.
    pub fn parse(raw: &[u8]) -> Self {
        let read_word = |chunk: &[u8]| {
            let mut word = [0u8; WORD];
            word.copy_from_slice(chunk);
            usize::from_ne_bytes(word)
        };

        let entries = raw
            .chunks_exact(WORD * 2)
            .map(|pair| (read_word(&pair[..WORD]), read_word(&pair[WORD..])))
            .take_while(|(kind, _)| *kind != AT_NULL)
            .collect();

        Self { entries }
    }

    /// Gets the value of the first entry of the specified type
    #[inline]
    pub fn get(&self, kind: usize) -> Option<usize> {
        self.entries
            .iter()
            .find_map(|(k, value)| (*k == kind).then_some(*value))
    }

    #[inline]
    pub fn page_size(&self) -> Option<usize> {
        self.get(AT_PAGESZ).filter(|size| size.is_power_of_two())
    }

    /// The address the kernel mapped the vdso at, if any
    #[inline]
    pub fn vdso_address(&self) -> Option<usize> {
        self.get(AT_SYSINFO_EHDR).filter(|addr| *addr != 0)
    }

    #[inline]
    pub fn entries(&self) -> &[(usize, usize)] {
        &self.entries
    }
}

#[cfg(test)]
pub(crate) fn encode(entries: &[(usize, usize)]) -> Vec<u8> {
    let mut raw = Vec::new();
    for (kind, value) in entries.iter().chain(std::iter::once(&(AT_NULL, 0))) {
        raw.extend_from_slice(&kind.to_ne_bytes());
        raw.extend_from_slice(&value.to_ne_bytes());
    }
    raw
}
