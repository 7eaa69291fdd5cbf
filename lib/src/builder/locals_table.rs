/// Metadata of one local variable live range
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct LocalEntry {
    pub start_bci: usize,

    /// `None` while the declaring scope is open
    pub end_bci: Option<usize>,
    pub local_index: u16,
    pub frame_index: u16,

    /// Constant pool index of the name (or `-1`)
    pub name: i32,

    /// Constant pool index of the info (or `-1`)
    pub info: i32,
}

/// Ints per flattened entry with block scoping
pub const SCOPED_LOCAL_ENTRY_LENGTH: usize = 6;

/// Ints per flattened entry without block scoping
pub const LOCAL_ENTRY_LENGTH: usize = 2;

/// Locals table under construction
#[derive(Default)]
pub(crate) struct LocalsTable {
    entries: Vec<LocalEntry>,
}

impl LocalsTable {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: usize) -> &LocalEntry {
        &self.entries[index]
    }

    /// Add an entry that is open from `start_bci` on, returning its index
    pub fn open(
        &mut self,
        start_bci: usize,
        local_index: u16,
        frame_index: u16,
        name: i32,
        info: i32,
    ) -> usize {
        self.entries.push(LocalEntry {
            start_bci,
            end_bci: None,
            local_index,
            frame_index,
            name,
            info,
        });
        self.entries.len() - 1
    }

    pub fn close(&mut self, index: usize, end_bci: usize) {
        debug_assert!(self.entries[index].end_bci.is_none());
        self.entries[index].end_bci = Some(end_bci);
    }

    /// Continue a closed range at `start_bci`, returning the index of the open entry
    ///
    /// If nothing was emitted since the range was closed, the old entry is simply reopened.
    pub fn reopen(&mut self, index: usize, start_bci: usize) -> usize {
        let entry = self.entries[index];
        if entry.end_bci == Some(start_bci) {
            self.entries[index].end_bci = None;
            return index;
        }
        self.open(
            start_bci,
            entry.local_index,
            entry.frame_index,
            entry.name,
            entry.info,
        )
    }

    /// Pull start bcis inside `(from, to]` back to `from`
    pub fn clamp_starts(&mut self, from: usize, to: usize) {
        for entry in &mut self.entries {
            if entry.start_bci > from && entry.start_bci <= to {
                entry.start_bci = from;
            }
        }
    }

    /// Flatten the table, closing any range still open at `end_bci`
    pub fn to_flat(&self, block_scoping: bool, end_bci: usize) -> Vec<i32> {
        if block_scoping {
            let mut flat = Vec::with_capacity(self.entries.len() * SCOPED_LOCAL_ENTRY_LENGTH);
            for entry in &self.entries {
                flat.extend_from_slice(&[
                    entry.start_bci as i32,
                    entry.end_bci.unwrap_or(end_bci) as i32,
                    entry.local_index as i32,
                    entry.frame_index as i32,
                    entry.name,
                    entry.info,
                ]);
            }
            flat
        } else {
            let mut flat = Vec::with_capacity(self.entries.len() * LOCAL_ENTRY_LENGTH);
            for entry in &self.entries {
                flat.extend_from_slice(&[entry.name, entry.info]);
            }
            flat
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reopen_at_close_bci_is_a_no_op() {
        let mut table = LocalsTable::default();
        let local = table.open(0, 0, 0, 3, -1);
        table.close(local, 8);
        assert_eq!(table.reopen(local, 8), local);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(local).end_bci, None);
    }

    #[test]
    fn reopen_later_splits_the_range() {
        let mut table = LocalsTable::default();
        let local = table.open(0, 0, 2, 3, -1);
        table.close(local, 8);
        let reopened = table.reopen(local, 14);
        assert_ne!(reopened, local);
        table.close(reopened, 20);
        assert_eq!(
            table.to_flat(true, 30),
            vec![0, 8, 0, 2, 3, -1, 14, 20, 0, 2, 3, -1]
        );
    }

    #[test]
    fn flat_layout_without_block_scoping() {
        let mut table = LocalsTable::default();
        table.open(0, 0, 0, 1, 2);
        table.open(0, 1, 1, -1, -1);
        assert_eq!(table.to_flat(false, 10), vec![1, 2, -1, -1]);
    }
}
