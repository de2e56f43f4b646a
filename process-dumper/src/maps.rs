//! Parsing of `/proc/<pid>/maps`
//!
//! Lines are scanned by hand rather than through `str::parse`/`split` so that
//! a line is only ever walked once and the path, which can contain spaces, is
//! taken verbatim.

use crate::Auxv;

/// The name given to the kernel's vdso mapping, which has no backing file
pub const LINUX_GATE_LIBRARY_NAME: &str = "linux-gate.so";

/// One contiguous range of a process's virtual address space
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryMapping {
    /// The first address of the mapping
    pub start: usize,
    /// The size of the mapping in bytes
    pub size: usize,
    /// The offset into the backing file the mapping starts at
    pub offset: usize,
    /// The path of the backing file, [`LINUX_GATE_LIBRARY_NAME`] for the vdso,
    /// or empty for anonymous and other pseudo mappings
    pub name: String,
}

impl MemoryMapping {
    /// One past the last address of the mapping
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end()
    }

    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

/// Rule for recognizing mappings that have no backing file but still need to
/// be identified by name.
///
/// Currently this is only the vdso, located via the `AT_SYSINFO_EHDR`
/// auxiliary vector entry. Kernels and architectures differ in what other
/// special mappings they expose (`[vsyscall]`, `[vvar]`, ...), and those are
/// deliberately left anonymous.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpecialMappings {
    linux_gate: Option<usize>,
}

impl SpecialMappings {
    #[inline]
    pub fn from_auxv(auxv: &Auxv) -> Self {
        Self {
            linux_gate: auxv.vdso_address(),
        }
    }

    #[inline]
    pub fn with_linux_gate(address: usize) -> Self {
        Self {
            linux_gate: Some(address),
        }
    }

    /// Retrieves the synthetic name for a mapping starting at the specified
    /// address, if it is a special mapping
    #[inline]
    pub fn name_for(&self, start: usize) -> Option<&'static str> {
        (self.linux_gate == Some(start)).then_some(LINUX_GATE_LIBRARY_NAME)
    }
}

/// Reads a hexadecimal number from the beginning of `s`, returning it and the
/// remainder of the input. Fails if there are no hex digits or the value
/// overflows.
fn read_hex(s: &[u8]) -> Option<(usize, &[u8])> {
    let mut value = 0usize;
    let mut consumed = 0;

    for &c in s {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => break,
        };

        value = value.checked_mul(16)?.checked_add(digit as usize)?;
        consumed += 1;
    }

    (consumed > 0).then(|| (value, &s[consumed..]))
}

#[inline]
fn expect(s: &[u8], c: u8) -> Option<&[u8]> {
    match s.split_first() {
        Some((first, rest)) if *first == c => Some(rest),
        _ => None,
    }
}

/// Parses a single line of a maps file in the form
/// `start-end perms offset dev inode [pathname]`.
///
/// Returns `None` if the line is malformed.
pub(crate) fn parse_line(line: &str, special: &SpecialMappings) -> Option<MemoryMapping> {
    let bytes = line.as_bytes();

    let (start, rest) = read_hex(bytes)?;
    let rest = expect(rest, b'-')?;
    let (end, rest) = read_hex(rest)?;
    let rest = expect(rest, b' ')?;

    // Skip the permissions
    let perms_len = rest.iter().position(|c| *c == b' ')?;
    let rest = &rest[perms_len + 1..];

    let (mut offset, rest) = read_hex(rest)?;
    expect(rest, b' ')?;

    if end < start {
        return None;
    }

    let name = if let Some(slash) = rest.iter().position(|c| *c == b'/') {
        // The path starts at the first slash, anything before it is the
        // device and inode. Everything after it, including spaces, is part of
        // the path
        let path_start = bytes.len() - rest.len() + slash;
        line[path_start..].to_owned()
    } else if let Some(name) = special.name_for(start) {
        offset = 0;
        name.to_owned()
    } else {
        String::new()
    };

    Some(MemoryMapping {
        start,
        size: end - start,
        offset,
        name,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex() {
        assert_eq!(read_hex(b"7ffd1234-"), Some((0x7ffd_1234, &b"-"[..])));
        assert_eq!(read_hex(b"DEADbeef"), Some((0xdead_beef, &b""[..])));
        assert_eq!(read_hex(b"-1"), None);
        assert_eq!(read_hex(b"fffffffffffffffff"), None);
    }

    #[test]
    fn file_backed() {
        let mapping = parse_line(
            "7f2b0c000000-7f2b0c021000 r-xp 0001c000 08:01 1835135     /usr/lib/libfoo bar.so (deleted)",
            &SpecialMappings::default(),
        )
        .unwrap();

        assert_eq!(
            mapping,
            MemoryMapping {
                start: 0x7f2b_0c00_0000,
                size: 0x21000,
                offset: 0x1c000,
                name: "/usr/lib/libfoo bar.so (deleted)".to_owned(),
            }
        );
        assert!(mapping.contains(0x7f2b_0c00_0000));
        assert!(!mapping.contains(mapping.end()));
    }

    #[test]
    fn anonymous_and_pseudo() {
        let special = SpecialMappings::default();

        let anon = parse_line("01c8d000-01cae000 rw-p 00000000 00:00 0", &special).unwrap();
        assert!(anon.is_anonymous());
        assert_eq!(anon.size, 0x21000);

        let stack = parse_line(
            "7ffc8c7e4000-7ffc8c805000 rw-p 00000000 00:00 0                          [stack]",
            &special,
        )
        .unwrap();
        assert!(stack.is_anonymous());
    }

    #[test]
    fn vdso_is_named() {
        let special = SpecialMappings::with_linux_gate(0x7ffc_8c9f_4000);

        let vdso = parse_line(
            "7ffc8c9f4000-7ffc8c9f6000 r-xp 00002000 00:00 0                          [vdso]",
            &special,
        )
        .unwrap();
        assert_eq!(vdso.name, LINUX_GATE_LIBRARY_NAME);
        assert_eq!(vdso.offset, 0);

        // Only the exact start address is special
        let other = parse_line("7ffc8c9f6000-7ffc8c9f8000 r--p 00001000 00:00 0", &special).unwrap();
        assert!(other.is_anonymous());
        assert_eq!(other.offset, 0x1000);
    }

    #[test]
    fn malformed() {
        let special = SpecialMappings::default();
        for line in [
            "",
            "7ffc8c9f4000",
            "7ffc8c9f4000-",
            "7ffc8c9f4000-7ffc8c9f6000",
            "7ffc8c9f4000-7ffc8c9f6000 r-xp",
            "7ffc8c9f4000-7ffc8c9f6000 r-xp zz 00:00 0",
            "7ffc8c9f6000-7ffc8c9f4000 r-xp 00000000 00:00 0",
        ] {
            assert!(parse_line(line, &special).is_none(), "{line}");
        }
    }
}
