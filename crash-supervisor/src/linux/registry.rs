//! The process wide stack of installed supervisors

/// Identifies an entry in a [`Registry`], never reused
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct EntryId(u64);

/// A last-in first-out collection of entries.
///
/// The registry is shared between normal code and the signal handler, so
/// every operation is a bounded in-memory operation, nothing here blocks or
/// does I/O.
pub(crate) struct Registry<T> {
    entries: Vec<(EntryId, T)>,
    next_id: u64,
}

impl<T> Registry<T> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Pushes a new entry onto the top of the stack
    pub(crate) fn push(&mut self, entry: T) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, entry));
        id
    }

    /// Removes the entry, returning it along with the entry that was pushed
    /// directly after it, which is `None` if the removed entry was the top
    pub(crate) fn remove(&mut self, id: EntryId) -> Option<(T, Option<&mut T>)> {
        let index = self.entries.iter().position(|(eid, _)| *eid == id)?;
        let (_, removed) = self.entries.remove(index);
        Some((removed, self.entries.get_mut(index).map(|(_, next)| next)))
    }

    /// Visits each entry from the most recently pushed to the least recently
    /// pushed, stopping at the first one for which `visit` returns true.
    ///
    /// Returns true if an entry stopped the walk.
    pub(crate) fn walk_from_top(&self, mut visit: impl FnMut(&T) -> bool) -> bool {
        self.entries.iter().rev().any(|(_, entry)| visit(entry))
    }
}
