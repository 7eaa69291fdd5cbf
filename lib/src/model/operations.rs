use super::instructions::{ImmediateKind, InstructionId};
use crate::builder::Argument;
use crate::Error;

/// Closed set of operation kinds understood by the builder
///
/// Built-in kinds map one-to-one onto the first [`OperationId`]s of every model. The four custom
/// kinds are shared by all user-declared operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Root,
    Block,
    IfThen,
    IfThenElse,
    Conditional,
    While,
    TryCatch,
    TryFinally,
    TryCatchOtherwise,
    FinallyHandler,
    Label,
    Branch,
    LoadConstant,
    LoadNull,
    LoadArgument,
    LoadException,
    LoadLocal,
    LoadLocalMaterialized,
    StoreLocal,
    StoreLocalMaterialized,
    ClearLocal,
    Return,
    Source,
    SourceSection,
    SourceSectionPrefix,
    Tag,
    Custom,
    CustomShortCircuit,
    CustomYield,
    CustomInstrumentation,
}

impl OperationKind {
    /// Built-in kinds, in [`OperationId`] order
    pub const BUILTINS: [OperationKind; 26] = [
        OperationKind::Root,
        OperationKind::Block,
        OperationKind::IfThen,
        OperationKind::IfThenElse,
        OperationKind::Conditional,
        OperationKind::While,
        OperationKind::TryCatch,
        OperationKind::TryFinally,
        OperationKind::TryCatchOtherwise,
        OperationKind::FinallyHandler,
        OperationKind::Label,
        OperationKind::Branch,
        OperationKind::LoadConstant,
        OperationKind::LoadNull,
        OperationKind::LoadArgument,
        OperationKind::LoadException,
        OperationKind::LoadLocal,
        OperationKind::LoadLocalMaterialized,
        OperationKind::StoreLocal,
        OperationKind::StoreLocalMaterialized,
        OperationKind::ClearLocal,
        OperationKind::Return,
        OperationKind::Source,
        OperationKind::SourceSection,
        OperationKind::SourceSectionPrefix,
        OperationKind::Tag,
    ];

    /// Name used for built-in operations in errors and disassembly
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Root => "Root",
            OperationKind::Block => "Block",
            OperationKind::IfThen => "IfThen",
            OperationKind::IfThenElse => "IfThenElse",
            OperationKind::Conditional => "Conditional",
            OperationKind::While => "While",
            OperationKind::TryCatch => "TryCatch",
            OperationKind::TryFinally => "TryFinally",
            OperationKind::TryCatchOtherwise => "TryCatchOtherwise",
            OperationKind::FinallyHandler => "FinallyHandler",
            OperationKind::Label => "Label",
            OperationKind::Branch => "Branch",
            OperationKind::LoadConstant => "LoadConstant",
            OperationKind::LoadNull => "LoadNull",
            OperationKind::LoadArgument => "LoadArgument",
            OperationKind::LoadException => "LoadException",
            OperationKind::LoadLocal => "LoadLocal",
            OperationKind::LoadLocalMaterialized => "LoadLocalMaterialized",
            OperationKind::StoreLocal => "StoreLocal",
            OperationKind::StoreLocalMaterialized => "StoreLocalMaterialized",
            OperationKind::ClearLocal => "ClearLocal",
            OperationKind::Return => "Return",
            OperationKind::Source => "Source",
            OperationKind::SourceSection => "SourceSection",
            OperationKind::SourceSectionPrefix => "SourceSectionPrefix",
            OperationKind::Tag => "Tag",
            OperationKind::Custom => "Custom",
            OperationKind::CustomShortCircuit => "CustomShortCircuit",
            OperationKind::CustomYield => "CustomYield",
            OperationKind::CustomInstrumentation => "CustomInstrumentation",
        }
    }

    /// Does this operation store reachability for its children?
    pub(crate) fn bears_reachability(self) -> bool {
        matches!(
            self,
            OperationKind::Root
                | OperationKind::IfThen
                | OperationKind::IfThenElse
                | OperationKind::Conditional
                | OperationKind::While
                | OperationKind::TryCatch
                | OperationKind::TryFinally
                | OperationKind::TryCatchOtherwise
                | OperationKind::FinallyHandler
        )
    }
}

/// Index of an operation in a [`crate::Model`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u16);

impl OperationId {
    pub const ROOT: OperationId = OperationId(0);
    pub const BLOCK: OperationId = OperationId(1);
    pub const IF_THEN: OperationId = OperationId(2);
    pub const IF_THEN_ELSE: OperationId = OperationId(3);
    pub const CONDITIONAL: OperationId = OperationId(4);
    pub const WHILE: OperationId = OperationId(5);
    pub const TRY_CATCH: OperationId = OperationId(6);
    pub const TRY_FINALLY: OperationId = OperationId(7);
    pub const TRY_CATCH_OTHERWISE: OperationId = OperationId(8);
    pub const FINALLY_HANDLER: OperationId = OperationId(9);
    pub const LABEL: OperationId = OperationId(10);
    pub const BRANCH: OperationId = OperationId(11);
    pub const LOAD_CONSTANT: OperationId = OperationId(12);
    pub const LOAD_NULL: OperationId = OperationId(13);
    pub const LOAD_ARGUMENT: OperationId = OperationId(14);
    pub const LOAD_EXCEPTION: OperationId = OperationId(15);
    pub const LOAD_LOCAL: OperationId = OperationId(16);
    pub const LOAD_LOCAL_MATERIALIZED: OperationId = OperationId(17);
    pub const STORE_LOCAL: OperationId = OperationId(18);
    pub const STORE_LOCAL_MATERIALIZED: OperationId = OperationId(19);
    pub const CLEAR_LOCAL: OperationId = OperationId(20);
    pub const RETURN: OperationId = OperationId(21);
    pub const SOURCE: OperationId = OperationId(22);
    pub const SOURCE_SECTION: OperationId = OperationId(23);
    pub const SOURCE_SECTION_PREFIX: OperationId = OperationId(24);
    pub const TAG: OperationId = OperationId(25);
}

/// Shape of an argument passed to `begin`, `end`, or `emit`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArgumentKind {
    Local,
    LocalArray,
    Label,
    Tags,
    Short,
    Integer,
    Constant,
    FinallyGenerator,
}

impl ArgumentKind {
    /// Immediates a custom instruction carries for one of its constant operands
    pub(crate) fn immediates(self) -> Option<&'static [ImmediateKind]> {
        match self {
            ArgumentKind::Local => Some(&[ImmediateKind::FrameIndex, ImmediateKind::LocalIndex]),
            ArgumentKind::LocalArray | ArgumentKind::Constant => Some(&[ImmediateKind::Constant]),
            ArgumentKind::Short => Some(&[ImmediateKind::Short]),
            ArgumentKind::Integer => Some(&[ImmediateKind::Integer]),
            ArgumentKind::Label | ArgumentKind::Tags | ArgumentKind::FinallyGenerator => None,
        }
    }
}

/// Which of `begin`, `end`, `emit` is being called
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Begin,
    End,
    Emit,
}

/// Static description of one operation
#[derive(Clone, Debug)]
pub struct OperationInfo {
    pub id: OperationId,
    pub name: String,
    pub kind: OperationKind,

    /// Arguments expected by `begin` (or `emit` for leaves)
    pub begin_arguments: Vec<ArgumentKind>,

    /// Arguments expected by `end`
    pub end_arguments: Vec<ArgumentKind>,

    /// Leaf operations are only ever `emit`-ed
    pub is_leaf: bool,

    /// Index into the custom or short circuit operations of the model
    pub(crate) custom_index: Option<usize>,
}

impl OperationInfo {
    pub(crate) fn builtin(kind: OperationKind, id: OperationId) -> OperationInfo {
        use ArgumentKind::*;
        let (is_leaf, begin_arguments, end_arguments) = match kind {
            OperationKind::Label | OperationKind::Branch => (true, vec![Label], vec![]),
            OperationKind::LoadConstant => (true, vec![Constant], vec![]),
            OperationKind::LoadNull | OperationKind::LoadException => (true, vec![], vec![]),
            OperationKind::LoadArgument => (true, vec![Short], vec![]),
            OperationKind::LoadLocal | OperationKind::ClearLocal => (true, vec![Local], vec![]),
            OperationKind::LoadLocalMaterialized
            | OperationKind::StoreLocal
            | OperationKind::StoreLocalMaterialized => (false, vec![Local], vec![]),
            OperationKind::TryFinally | OperationKind::TryCatchOtherwise => {
                (false, vec![FinallyGenerator], vec![])
            }
            OperationKind::Source => (false, vec![Constant], vec![]),
            OperationKind::SourceSection => (false, vec![Integer, Integer], vec![]),
            OperationKind::SourceSectionPrefix => (false, vec![Integer], vec![Integer]),
            OperationKind::Tag => (false, vec![Tags], vec![Tags]),
            _ => (false, vec![], vec![]),
        };
        OperationInfo {
            id,
            name: kind.name().to_owned(),
            kind,
            begin_arguments,
            end_arguments,
            is_leaf,
            custom_index: None,
        }
    }

    /// Check that the arguments have the shape this operation expects for the given phase
    pub fn check_arguments(&self, phase: Phase, arguments: &[Argument]) -> Result<(), Error> {
        let expected: &[ArgumentKind] = match (phase, self.is_leaf) {
            (Phase::Emit, true) | (Phase::Begin, false) => &self.begin_arguments,
            (Phase::End, false) => &self.end_arguments,
            (Phase::Emit, false) => {
                return Err(Error::IllegalArgument(format!(
                    "{} has children and must be begun and ended, not emitted",
                    self.name
                )))
            }
            (_, true) => {
                return Err(Error::IllegalArgument(format!(
                    "{} is a leaf operation and must be emitted",
                    self.name
                )))
            }
        };

        if expected.len() != arguments.len() {
            return Err(Error::IllegalArgument(format!(
                "{} expects {} argument(s) but got {}",
                self.name,
                expected.len(),
                arguments.len()
            )));
        }
        for (index, (kind, argument)) in expected.iter().zip(arguments).enumerate() {
            if *kind != argument.kind() {
                return Err(Error::IllegalArgument(format!(
                    "argument {} of {} should be {:?} but got {:?}",
                    index,
                    self.name,
                    kind,
                    argument.kind()
                )));
            }
        }
        Ok(())
    }
}

/// Flavour of a custom operation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CustomKind {
    Regular,

    /// Suspends execution; every emitted copy gets a continuation entry
    Yield,

    /// Only emitted when enabled in [`crate::BuilderConfig::instrumentations`]
    Instrumentation,
}

/// Dynamic operand of a custom operation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandKind {
    /// Child must produce a value
    Value,

    /// Child may be void; a produced value is discarded
    VoidAllowed,
}

/// Declaration of a user-defined operation
#[derive(Clone, Debug)]
pub struct CustomOperation {
    pub name: String,
    pub kind: CustomKind,
    pub operands: Vec<OperandKind>,

    /// The last operand accepts any number of children
    pub variadic: bool,
    pub returns_value: bool,
    pub begin_constants: Vec<ArgumentKind>,
    pub end_constants: Vec<ArgumentKind>,
}

impl CustomOperation {
    pub fn new(name: impl Into<String>) -> CustomOperation {
        CustomOperation {
            name: name.into(),
            kind: CustomKind::Regular,
            operands: vec![],
            variadic: false,
            returns_value: false,
            begin_constants: vec![],
            end_constants: vec![],
        }
    }

    pub fn kind(mut self, kind: CustomKind) -> CustomOperation {
        self.kind = kind;
        self
    }

    /// Add `count` value operands
    pub fn operands(mut self, count: usize) -> CustomOperation {
        self.operands
            .extend(std::iter::repeat(OperandKind::Value).take(count));
        self
    }

    pub fn operand(mut self, operand: OperandKind) -> CustomOperation {
        self.operands.push(operand);
        self
    }

    /// Mark the last operand as variadic
    pub fn variadic(mut self) -> CustomOperation {
        self.variadic = true;
        self
    }

    pub fn returns_value(mut self) -> CustomOperation {
        self.returns_value = true;
        self
    }

    pub fn begin_constants(mut self, constants: &[ArgumentKind]) -> CustomOperation {
        self.begin_constants.extend_from_slice(constants);
        self
    }

    pub fn end_constants(mut self, constants: &[ArgumentKind]) -> CustomOperation {
        self.end_constants.extend_from_slice(constants);
        self
    }

    /// Operand kind expected for the child at `index`
    ///
    /// Fixed operands match exactly, the variadic operand matches every index at or past it.
    pub fn operand_at(&self, index: usize) -> Option<OperandKind> {
        match self.operands.len() {
            0 => None,
            len if self.variadic && index >= len - 1 => Some(self.operands[len - 1]),
            _ => self.operands.get(index).copied(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.operands.is_empty()
    }
}

/// Boolean connective of a short circuit operation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShortCircuitOperator {
    And,
    Or,
}

/// Declaration of a short circuiting boolean operation
#[derive(Clone, Debug)]
pub struct ShortCircuitOperation {
    pub name: String,
    pub operator: ShortCircuitOperator,

    /// Name of a regular custom operation converting a value to a boolean
    pub converter: Option<String>,

    /// Produce the converted boolean rather than the original operand value
    pub returns_converted: bool,
}

impl ShortCircuitOperation {
    pub fn and(name: impl Into<String>) -> ShortCircuitOperation {
        ShortCircuitOperation {
            name: name.into(),
            operator: ShortCircuitOperator::And,
            converter: None,
            returns_converted: false,
        }
    }

    pub fn or(name: impl Into<String>) -> ShortCircuitOperation {
        ShortCircuitOperation {
            name: name.into(),
            operator: ShortCircuitOperator::Or,
            converter: None,
            returns_converted: false,
        }
    }

    pub fn converter(mut self, converter: impl Into<String>) -> ShortCircuitOperation {
        self.converter = Some(converter.into());
        self
    }

    pub fn returns_converted(mut self) -> ShortCircuitOperation {
        self.returns_converted = true;
        self
    }
}

/// A custom operation once the model has assigned it an instruction
#[derive(Clone, Debug)]
pub(crate) struct CustomOperationInfo {
    pub declaration: CustomOperation,
    pub instruction: InstructionId,

    /// Bit in [`crate::BuilderConfig::instrumentations`] (instrumentation operations only)
    pub instrumentation_index: Option<u32>,
}

/// A short circuit operation once the model has assigned it instructions
#[derive(Clone, Debug)]
pub(crate) struct ShortCircuitInfo {
    pub declaration: ShortCircuitOperation,
    pub instruction: InstructionId,
    pub converter: Option<InstructionId>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builtin_ids_follow_kind_order() {
        for (index, kind) in OperationKind::BUILTINS.iter().enumerate() {
            let info = OperationInfo::builtin(*kind, OperationId(index as u16));
            assert_eq!(info.kind, *kind);
        }
        assert_eq!(OperationKind::BUILTINS[OperationId::TAG.0 as usize], OperationKind::Tag);
        assert_eq!(
            OperationKind::BUILTINS[OperationId::CLEAR_LOCAL.0 as usize],
            OperationKind::ClearLocal
        );
    }

    #[test]
    fn variadic_operand_matches_trailing_children() {
        let call = CustomOperation::new("Call")
            .operand(OperandKind::Value)
            .operand(OperandKind::VoidAllowed)
            .variadic();
        assert_eq!(call.operand_at(0), Some(OperandKind::Value));
        assert_eq!(call.operand_at(1), Some(OperandKind::VoidAllowed));
        assert_eq!(call.operand_at(9), Some(OperandKind::VoidAllowed));

        let add = CustomOperation::new("Add").operands(2);
        assert_eq!(add.operand_at(1), Some(OperandKind::Value));
        assert_eq!(add.operand_at(2), None);
    }

    #[test]
    fn argument_shapes_are_checked() {
        let info = OperationInfo::builtin(OperationKind::LoadArgument, OperationId::LOAD_ARGUMENT);
        assert!(info.check_arguments(Phase::Emit, &[Argument::Short(0)]).is_ok());
        assert!(matches!(
            info.check_arguments(Phase::Emit, &[Argument::Integer(0)]),
            Err(Error::IllegalArgument(_))
        ));
        assert!(matches!(
            info.check_arguments(Phase::Begin, &[Argument::Short(0)]),
            Err(Error::IllegalArgument(_))
        ));
    }
}
