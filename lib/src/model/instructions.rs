use std::fmt;

/// Kind of a fixed-width immediate following an opcode
///
/// The kind decides the width of the field and how the disassembler renders it. Branch targets
/// are the only immediates the builder patches after the fact.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImmediateKind {
    BranchTarget,
    BranchProfile,
    Constant,
    Integer,
    Node,
    TagNode,
    Continuation,
    Short,
    FrameIndex,
    LocalIndex,
    LocalRoot,
    StackPointer,
    Count,
}

impl ImmediateKind {
    /// Width of the immediate in bytes
    pub fn width(self) -> usize {
        match self {
            ImmediateKind::BranchTarget
            | ImmediateKind::BranchProfile
            | ImmediateKind::Constant
            | ImmediateKind::Integer
            | ImmediateKind::Node
            | ImmediateKind::TagNode
            | ImmediateKind::Continuation => 4,
            ImmediateKind::Short
            | ImmediateKind::FrameIndex
            | ImmediateKind::LocalIndex
            | ImmediateKind::LocalRoot
            | ImmediateKind::StackPointer
            | ImmediateKind::Count => 2,
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            ImmediateKind::BranchTarget => "target",
            ImmediateKind::BranchProfile => "profile",
            ImmediateKind::Constant => "const",
            ImmediateKind::Integer => "int",
            ImmediateKind::Node => "node",
            ImmediateKind::TagNode => "tag",
            ImmediateKind::Continuation => "cont",
            ImmediateKind::Short => "short",
            ImmediateKind::FrameIndex => "frame",
            ImmediateKind::LocalIndex => "local",
            ImmediateKind::LocalRoot => "root",
            ImmediateKind::StackPointer => "sp",
            ImmediateKind::Count => "count",
        }
    }
}

/// Width of every opcode in bytes
pub const OPCODE_WIDTH: usize = 2;

/// Opcode of an instruction in a [`crate::Model`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionId(pub u16);

impl InstructionId {
    pub const POP: InstructionId = InstructionId(0);
    pub const DUP: InstructionId = InstructionId(1);
    pub const RETURN: InstructionId = InstructionId(2);
    pub const BRANCH: InstructionId = InstructionId(3);
    pub const BRANCH_BACKWARD: InstructionId = InstructionId(4);
    pub const BRANCH_FALSE: InstructionId = InstructionId(5);
    pub const STORE_LOCAL: InstructionId = InstructionId(6);
    pub const LOAD_LOCAL: InstructionId = InstructionId(7);
    pub const CLEAR_LOCAL: InstructionId = InstructionId(8);
    pub const LOAD_LOCAL_MAT: InstructionId = InstructionId(9);
    pub const STORE_LOCAL_MAT: InstructionId = InstructionId(10);
    pub const LOAD_CONSTANT: InstructionId = InstructionId(11);
    pub const LOAD_NULL: InstructionId = InstructionId(12);
    pub const LOAD_ARGUMENT: InstructionId = InstructionId(13);
    pub const LOAD_EXCEPTION: InstructionId = InstructionId(14);
    pub const THROW: InstructionId = InstructionId(15);
    pub const TAG_ENTER: InstructionId = InstructionId(16);
    pub const TAG_LEAVE: InstructionId = InstructionId(17);
    pub const TAG_LEAVE_VOID: InstructionId = InstructionId(18);
    pub const LOAD_VARIADIC: InstructionId = InstructionId(19);
    pub const MERGE_VARIADIC: InstructionId = InstructionId(20);

    /// Number of built-in instructions (custom instructions are numbered after these)
    pub const BUILTIN_COUNT: u16 = 21;
}

/// How an instruction changes the operand stack height
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackEffect {
    Fixed(i32),

    /// Pops as many values as its `Count` immediate says and pushes one
    Collect,
}

/// Static description of one instruction
#[derive(Clone, Debug)]
pub struct InstructionInfo {
    pub id: InstructionId,
    pub name: String,
    pub immediates: Vec<ImmediateKind>,
    pub stack_effect: StackEffect,
}

impl InstructionInfo {
    pub fn new(
        id: InstructionId,
        name: impl Into<String>,
        immediates: Vec<ImmediateKind>,
        stack_effect: StackEffect,
    ) -> InstructionInfo {
        InstructionInfo {
            id,
            name: name.into(),
            immediates,
            stack_effect,
        }
    }

    /// Total length (opcode and immediates) in bytes
    pub fn length(&self) -> usize {
        OPCODE_WIDTH + self.immediates.iter().map(|kind| kind.width()).sum::<usize>()
    }

    /// Offset of the `index`-th immediate, relative to the start of the instruction
    pub fn immediate_offset(&self, index: usize) -> usize {
        OPCODE_WIDTH
            + self.immediates[..index]
                .iter()
                .map(|kind| kind.width())
                .sum::<usize>()
    }

    /// Index of the branch target immediate, if the instruction has one
    pub fn branch_target_index(&self) -> Option<usize> {
        self.immediates
            .iter()
            .position(|kind| *kind == ImmediateKind::BranchTarget)
    }

    /// Stack effect once the immediates are known
    pub fn stack_effect_of(&self, immediates: &[i32]) -> i32 {
        match self.stack_effect {
            StackEffect::Fixed(effect) => effect,
            StackEffect::Collect => {
                let count = self
                    .immediates
                    .iter()
                    .position(|kind| *kind == ImmediateKind::Count)
                    .and_then(|index| immediates.get(index))
                    .copied()
                    .unwrap_or(0);
                1 - count
            }
        }
    }
}

/// Built-in instructions, indexed by their [`InstructionId`]
pub(crate) fn builtin_instructions() -> Vec<InstructionInfo> {
    use ImmediateKind::*;
    let fixed = StackEffect::Fixed;

    let table: Vec<(&str, Vec<ImmediateKind>, StackEffect)> = vec![
        ("pop", vec![], fixed(-1)),
        ("dup", vec![], fixed(1)),
        ("return", vec![], fixed(-1)),
        ("branch", vec![BranchTarget], fixed(0)),
        ("branch.backward", vec![BranchTarget], fixed(0)),
        ("branch.false", vec![BranchTarget, BranchProfile], fixed(-1)),
        ("store.local", vec![FrameIndex, LocalIndex], fixed(-1)),
        ("load.local", vec![FrameIndex, LocalIndex], fixed(1)),
        ("clear.local", vec![FrameIndex], fixed(0)),
        ("load.local.mat", vec![FrameIndex, LocalRoot, LocalIndex], fixed(0)),
        ("store.local.mat", vec![FrameIndex, LocalRoot, LocalIndex], fixed(-2)),
        ("load.constant", vec![Constant], fixed(1)),
        ("load.null", vec![], fixed(1)),
        ("load.argument", vec![Short], fixed(1)),
        ("load.exception", vec![StackPointer], fixed(1)),
        ("throw", vec![], fixed(-1)),
        ("tag.enter", vec![TagNode], fixed(0)),
        ("tag.leave", vec![TagNode], fixed(0)),
        ("tag.leave.void", vec![TagNode], fixed(0)),
        ("load.variadic", vec![Count], StackEffect::Collect),
        ("merge.variadic", vec![Count], StackEffect::Collect),
    ];
    debug_assert_eq!(table.len(), InstructionId::BUILTIN_COUNT as usize);

    table
        .into_iter()
        .enumerate()
        .map(|(index, (name, immediates, effect))| {
            InstructionInfo::new(InstructionId(index as u16), name, immediates, effect)
        })
        .collect()
}

/// One decoded instruction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub bci: usize,
    pub id: InstructionId,
    pub immediates: Vec<i32>,
}

impl Instruction {
    /// Render the instruction with the names from its description
    pub fn display<'a>(&'a self, info: &'a InstructionInfo) -> impl fmt::Display + 'a {
        DisplayInstruction {
            instruction: self,
            info,
        }
    }
}

struct DisplayInstruction<'a> {
    instruction: &'a Instruction,
    info: &'a InstructionInfo,
}

impl fmt::Display for DisplayInstruction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04} {}", self.instruction.bci, self.info.name)?;
        for (kind, value) in self
            .info
            .immediates
            .iter()
            .zip(self.instruction.immediates.iter())
        {
            write!(f, " {}={}", kind.short_name(), value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builtin_ids_match_table_order() {
        let builtins = builtin_instructions();
        assert_eq!(builtins[InstructionId::BRANCH_FALSE.0 as usize].name, "branch.false");
        assert_eq!(builtins[InstructionId::MERGE_VARIADIC.0 as usize].name, "merge.variadic");
        assert_eq!(builtins[InstructionId::LOAD_EXCEPTION.0 as usize].name, "load.exception");
    }

    #[test]
    fn lengths_and_offsets() {
        let builtins = builtin_instructions();
        let branch_false = &builtins[InstructionId::BRANCH_FALSE.0 as usize];
        assert_eq!(branch_false.length(), 10);
        assert_eq!(branch_false.immediate_offset(0), 2);
        assert_eq!(branch_false.immediate_offset(1), 6);
        assert_eq!(branch_false.branch_target_index(), Some(0));

        let load_mat = &builtins[InstructionId::LOAD_LOCAL_MAT.0 as usize];
        assert_eq!(load_mat.length(), 8);
        assert_eq!(load_mat.branch_target_index(), None);
    }

    #[test]
    fn collecting_stack_effect() {
        let builtins = builtin_instructions();
        let load_variadic = &builtins[InstructionId::LOAD_VARIADIC.0 as usize];
        assert_eq!(load_variadic.stack_effect_of(&[8]), -7);
        assert_eq!(load_variadic.stack_effect_of(&[0]), 1);
    }
}
