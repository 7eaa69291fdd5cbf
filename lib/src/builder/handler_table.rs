use crate::Error;

/// Kind of an exception handler entry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    /// Handler code of a `TryCatch`, `TryFinally`, or `TryCatchOtherwise`
    Custom = 0,

    /// Exceptional exit from a `Tag` (the handler field holds the tag node)
    TagExceptional = 1,
}

impl HandlerKind {
    pub fn from_i32(value: i32) -> Option<HandlerKind> {
        match value {
            0 => Some(HandlerKind::Custom),
            1 => Some(HandlerKind::TagExceptional),
            _ => None,
        }
    }
}

/// Where an exception handler entry jumps to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandlerTarget {
    Resolved(i32),

    /// Handler code not emitted yet, identified by its handler id
    Pending(u32),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct HandlerEntry {
    pub start_bci: usize,
    pub end_bci: usize,
    pub kind: HandlerKind,
    pub target: HandlerTarget,
    pub stack_height: i32,
}

/// Number of ints per flattened entry
pub const HANDLER_ENTRY_LENGTH: usize = 5;

/// Exception handler table under construction
#[derive(Default)]
pub(crate) struct HandlerTable {
    entries: Vec<HandlerEntry>,
}

impl HandlerTable {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record that `[start_bci, end_bci)` is covered by a handler
    ///
    /// Empty ranges are dropped. A range starting where the last entry ends, with the same kind,
    /// target, and stack height, extends that entry instead of adding a new one.
    pub fn add(
        &mut self,
        start_bci: usize,
        end_bci: usize,
        kind: HandlerKind,
        target: HandlerTarget,
        stack_height: i32,
    ) {
        debug_assert!(start_bci <= end_bci);
        if start_bci >= end_bci {
            return;
        }

        if let Some(last) = self.entries.last_mut() {
            if last.kind == kind
                && last.target == target
                && last.stack_height == stack_height
                && last.end_bci == start_bci
            {
                last.end_bci = end_bci;
                return;
            }
        }

        self.entries.push(HandlerEntry {
            start_bci,
            end_bci,
            kind,
            target,
            stack_height,
        });
    }

    /// Point every entry waiting on `handler_id` at `handler_bci`
    pub fn resolve(&mut self, handler_id: u32, handler_bci: usize) {
        for entry in &mut self.entries {
            if entry.target == HandlerTarget::Pending(handler_id) {
                entry.target = HandlerTarget::Resolved(handler_bci as i32);
            }
        }
    }

    /// Flatten into `HANDLER_ENTRY_LENGTH` ints per entry
    pub fn to_flat(&self) -> Result<Vec<i32>, Error> {
        let mut flat = Vec::with_capacity(self.entries.len() * HANDLER_ENTRY_LENGTH);
        for entry in &self.entries {
            let handler = match entry.target {
                HandlerTarget::Resolved(handler) => handler,
                HandlerTarget::Pending(id) => {
                    return Err(Error::internal(format!(
                        "exception handler {} was never emitted",
                        id
                    )))
                }
            };
            flat.extend_from_slice(&[
                entry.start_bci as i32,
                entry.end_bci as i32,
                entry.kind as i32,
                handler,
                entry.stack_height,
            ]);
        }
        Ok(flat)
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[HandlerEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn contiguous_ranges_coalesce() {
        let mut table = HandlerTable::default();
        table.add(0, 10, HandlerKind::Custom, HandlerTarget::Pending(1), 0);
        table.add(10, 14, HandlerKind::Custom, HandlerTarget::Pending(1), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.entries()[0].end_bci, 14);
    }

    #[test]
    fn zero_length_ranges_are_dropped() {
        let mut table = HandlerTable::default();
        table.add(6, 6, HandlerKind::Custom, HandlerTarget::Resolved(20), 0);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn gaps_and_different_handlers_do_not_coalesce() {
        let mut table = HandlerTable::default();
        table.add(0, 10, HandlerKind::Custom, HandlerTarget::Pending(1), 0);
        table.add(12, 14, HandlerKind::Custom, HandlerTarget::Pending(1), 0);
        table.add(14, 16, HandlerKind::Custom, HandlerTarget::Pending(2), 0);
        table.add(16, 18, HandlerKind::TagExceptional, HandlerTarget::Pending(2), 0);
        table.add(18, 20, HandlerKind::TagExceptional, HandlerTarget::Pending(2), 1);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn pending_handlers_are_resolved_by_id() {
        let mut table = HandlerTable::default();
        table.add(0, 4, HandlerKind::Custom, HandlerTarget::Pending(0), 1);
        table.add(4, 8, HandlerKind::Custom, HandlerTarget::Pending(1), 0);
        assert!(table.to_flat().is_err());

        table.resolve(0, 30);
        table.resolve(1, 40);
        assert_eq!(
            table.to_flat().unwrap(),
            vec![0, 4, 0, 30, 1, 4, 8, 0, 40, 0]
        );
    }
}
