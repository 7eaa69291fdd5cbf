/// Source position covered by a bytecode range
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SourceSpan {
    Known { start: i32, length: i32 },

    /// Start is known but the length is only provided when the section ends
    Pending { start: i32 },
}

impl SourceSpan {
    /// Span for a section whose position is not available
    pub const UNAVAILABLE: SourceSpan = SourceSpan::Known {
        start: -1,
        length: -1,
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct SourceEntry {
    pub start_bci: usize,
    pub end_bci: usize,
    pub source_index: u32,
    pub span: SourceSpan,
}

/// Number of ints per flattened entry
pub const SOURCE_ENTRY_LENGTH: usize = 5;

/// Source info table under construction
#[derive(Default)]
pub(crate) struct SourceTable {
    entries: Vec<SourceEntry>,
}

impl SourceTable {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record that `[start_bci, end_bci)` was generated from `span`
    ///
    /// Returns the index of the entry covering the range, which is `None` for empty ranges. An
    /// entry identical to the last one is skipped and one continuing the last one (same source
    /// and span) is merged into it.
    pub fn add(
        &mut self,
        start_bci: usize,
        end_bci: usize,
        source_index: u32,
        span: SourceSpan,
    ) -> Option<usize> {
        if start_bci >= end_bci {
            return None;
        }

        if let Some(last) = self.entries.last_mut() {
            if last.source_index == source_index && last.span == span {
                if last.start_bci == start_bci && last.end_bci == end_bci {
                    return Some(self.entries.len() - 1);
                }
                if last.end_bci == start_bci {
                    last.end_bci = end_bci;
                    return Some(self.entries.len() - 1);
                }
            }
        }

        self.entries.push(SourceEntry {
            start_bci,
            end_bci,
            source_index,
            span,
        });
        Some(self.entries.len() - 1)
    }

    /// Fill in the length of entries recorded while it was still pending
    pub fn patch_length(&mut self, indices: &[usize], length: i32) {
        for index in indices {
            let entry = &mut self.entries[*index];
            if let SourceSpan::Pending { start } = entry.span {
                entry.span = SourceSpan::Known { start, length };
            }
        }
    }

    /// Pull start bcis inside `(from, to]` back to `from`
    pub fn clamp_starts(&mut self, from: usize, to: usize) {
        for entry in &mut self.entries {
            if entry.start_bci > from && entry.start_bci <= to {
                entry.start_bci = from;
            }
        }
    }

    pub fn to_flat(&self) -> Vec<i32> {
        let mut flat = Vec::with_capacity(self.entries.len() * SOURCE_ENTRY_LENGTH);
        for entry in &self.entries {
            let (start, length) = match entry.span {
                SourceSpan::Known { start, length } => (start, length),
                SourceSpan::Pending { start } => (start, -1),
            };
            flat.extend_from_slice(&[
                entry.start_bci as i32,
                entry.end_bci as i32,
                entry.source_index as i32,
                start,
                length,
            ]);
        }
        flat
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SPAN: SourceSpan = SourceSpan::Known {
        start: 3,
        length: 4,
    };

    #[test]
    fn duplicates_and_contiguous_ranges_compact() {
        let mut table = SourceTable::default();
        assert_eq!(table.add(0, 4, 0, SPAN), Some(0));
        assert_eq!(table.add(0, 4, 0, SPAN), Some(0));
        assert_eq!(table.add(4, 9, 0, SPAN), Some(0));
        assert_eq!(table.len(), 1);
        assert_eq!(table.to_flat(), vec![0, 9, 0, 3, 4]);

        assert_eq!(table.add(9, 12, 1, SPAN), Some(1));
        assert_eq!(table.add(12, 12, 1, SPAN), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn pending_lengths_are_patched() {
        let mut table = SourceTable::default();
        let first = table.add(0, 4, 0, SourceSpan::Pending { start: 10 }).unwrap();
        table.add(4, 6, 0, SPAN);
        let second = table.add(8, 10, 0, SourceSpan::Pending { start: 10 }).unwrap();
        table.patch_length(&[first, second], 7);
        assert_eq!(
            table.to_flat(),
            vec![0, 4, 0, 10, 7, 4, 6, 0, 3, 4, 8, 10, 0, 10, 7]
        );
    }

    #[test]
    fn unavailable_sections() {
        let mut table = SourceTable::default();
        table.add(0, 2, 0, SourceSpan::UNAVAILABLE);
        assert_eq!(table.to_flat(), vec![0, 2, 0, -1, -1]);
    }
}
