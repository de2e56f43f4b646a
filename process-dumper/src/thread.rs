use crate::{Error, Pid, ThreadRegisters};

/// A copy of the memory around a thread's stack pointer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackCapture {
    /// The (page aligned) address the copy starts at
    pub start: usize,
    /// The copied bytes, never more than [`crate::MAX_STACK_CAPTURE`]
    pub bytes: Vec<u8>,
}

impl StackCapture {
    /// One past the last captured address
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.bytes.len()
    }
}

/// Everything captured about a single suspended thread
#[derive(Clone)]
pub struct ThreadSnapshot {
    pub tid: Pid,
    /// The parent process id
    pub ppid: Pid,
    /// The thread group id, ie the process id
    pub tgid: Pid,
    pub registers: ThreadRegisters,
    pub stack: StackCapture,
}

/// Retrieves the thread group and parent process ids from the lines of a
/// `/proc/<pid>/task/<tid>/status` file, both are required
pub(crate) fn parse_status(
    tid: Pid,
    lines: impl Iterator<Item = std::io::Result<String>>,
) -> Result<(Pid, Pid), Error> {
    let mut tgid = None;
    let mut ppid = None;

    for line in lines {
        let Ok(line) = line else {
            break;
        };

        let (target, value) = if let Some(value) = line.strip_prefix("Tgid:") {
            (&mut tgid, value)
        } else if let Some(value) = line.strip_prefix("PPid:") {
            (&mut ppid, value)
        } else {
            continue;
        };

        *target = value.trim().parse::<Pid>().ok();

        if tgid.is_some() && ppid.is_some() {
            break;
        }
    }

    let tgid = tgid.ok_or(Error::MissingStatusField { tid, field: "Tgid" })?;
    let ppid = ppid.ok_or(Error::MissingStatusField { tid, field: "PPid" })?;

    Ok((tgid, ppid))
}

#[cfg(test)]
mod test {
    use super::*;

    fn lines(s: &'static str) -> impl Iterator<Item = std::io::Result<String>> {
        s.lines().map(|l| Ok::<_, std::io::Error>(l.to_owned()))
    }

    #[test]
    fn reads_ids() {
        let status = "Name:\tcat\nUmask:\t0022\nState:\tR (running)\nTgid:\t4242\nNgid:\t0\nPid:\t4243\nPPid:\t17\nTracerPid:\t0\n";
        assert_eq!(parse_status(4243, lines(status)).unwrap(), (4242, 17));
    }

    #[test]
    fn requires_both() {
        let missing_ppid = "Name:\tcat\nTgid:\t4242\nPid:\t4243\n";
        assert!(matches!(
            parse_status(4243, lines(missing_ppid)),
            Err(Error::MissingStatusField { field: "PPid", .. })
        ));

        let bad_tgid = "Tgid:\tnope\nPPid:\t1\n";
        assert!(matches!(
            parse_status(4243, lines(bad_tgid)),
            Err(Error::MissingStatusField { field: "Tgid", .. })
        ));
    }
}
