use super::bytecode_buffer::BytecodeBuffer;
use smallvec::SmallVec;
use std::fmt;

/// Opaque label handed out by [`super::OperationBuilder::create_label`]
///
/// A label belongs to the root it was created in and to the `Block` (or `Root`) operation that
/// was innermost at the time.
#[derive(Copy, Clone, Hash, Eq, PartialEq)]
pub struct BytecodeLabel {
    /// Root index, or the context id for handles of a serializer
    pub(crate) root: u32,
    pub(crate) index: u32,
}

impl BytecodeLabel {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for BytecodeLabel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("l{}.{}", self.root, self.index))
    }
}

/// Builder-side state of a label
pub(crate) struct LabelData {
    /// Set once the label has been emitted
    pub bci: Option<usize>,

    /// Sequence number of the declaring operation
    pub declaring_sequence: u32,

    /// Stack height of the declaring operation's children
    pub stack_height: i32,

    /// Offsets of branch target fields waiting for this label
    pub unresolved: SmallVec<[usize; 2]>,
}

impl LabelData {
    pub fn new(declaring_sequence: u32, stack_height: i32) -> LabelData {
        LabelData {
            bci: None,
            declaring_sequence,
            stack_height,
            unresolved: SmallVec::new(),
        }
    }

    /// Fix the label at `bci`, patching every branch registered so far
    pub fn resolve(&mut self, bci: usize, bytecode: &mut BytecodeBuffer) {
        debug_assert!(self.bci.is_none());
        self.bci = Some(bci);
        for site in self.unresolved.drain(..) {
            bytecode.patch_int(site, bci as i32);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{ImmediateKind, InstructionId, InstructionInfo, StackEffect};

    fn branches_then_resolve(count: usize) -> (LabelData, BytecodeBuffer) {
        let branch = InstructionInfo::new(
            InstructionId::BRANCH,
            "branch",
            vec![ImmediateKind::BranchTarget],
            StackEffect::Fixed(0),
        );
        let mut buffer = BytecodeBuffer::default();
        let mut label = LabelData::new(0, 0);
        for _ in 0..count {
            let bci = buffer.write_instruction(&branch, &[-1]).unwrap();
            label.unresolved.push(bci + 2);
        }
        assert_eq!(label.unresolved.spilled(), count > 2);
        let target = buffer.bci();
        label.resolve(target, &mut buffer);
        (label, buffer)
    }

    #[test]
    fn resolving_patches_every_site() {
        for count in [0, 1, 2, 5] {
            let (label, buffer) = branches_then_resolve(count);
            let target = buffer.bci();
            assert_eq!(label.bci, Some(target));
            assert!(label.unresolved.is_empty());
            for index in 0..count {
                let info = InstructionInfo::new(
                    InstructionId::BRANCH,
                    "branch",
                    vec![ImmediateKind::BranchTarget],
                    StackEffect::Fixed(0),
                );
                assert_eq!(
                    buffer.read_immediates(index * 6, &info),
                    vec![target as i32]
                );
            }
        }
    }
}
